//! Candidate screening against a selection rubric.
//!
//! A batch is a criteria document, a CSV with one row per candidate and a
//! ZIP of resumes. Each row is judged by one model call; a failure on one
//! row is recorded on that row and the rest of the batch continues.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::brain::LlmProvider;
use crate::config::EvaluationConfig;
use crate::documents::{self, ArchiveLimits, DocumentKind};
use crate::error::{DocumentError, EvaluationError, LlmError};
use crate::structured::StructuredReply;
use crate::types::{CompletionRequest, Message};

/// Column naming each candidate's resume inside the archive.
pub const RESUME_COLUMN: &str = "resume_filename";

const TRUNCATION_MARKER: &str = "\n...[truncated]";

const RUBRIC_PROMPT: &str = "You are an assistant helping a hiring panel evaluate candidates. \
Carefully read the selection criteria and the candidate information. \
Decide if the candidate meets ALL minimum requirements. \
Return a JSON object with keys: 'meets_requirements' (true/false), \
'reasoning' (short explanation), 'missing_criteria' (array of strings describing any gaps), \
and 'codeforces_rating' (numeric rating if found, otherwise null).";

/// The model's judgement of one candidate.
///
/// When the reply is not valid JSON, `meets_requirements` is `None` and the
/// raw reply doubles as the reasoning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateVerdict {
    #[serde(default)]
    pub meets_requirements: Option<bool>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub reasoning: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub missing_criteria: Vec<String>,
    #[serde(default)]
    pub codeforces_rating: Option<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub raw_response: String,
}

/// Reads a JSON `null` as the type's default.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

impl CandidateVerdict {
    fn from_reply(reply: &str) -> Self {
        match StructuredReply::<CandidateVerdict>::decode(reply) {
            StructuredReply::Parsed(mut verdict) => {
                if verdict.raw_response.is_empty() {
                    verdict.raw_response = reply.to_string();
                }
                verdict
            }
            StructuredReply::Unparsed { error, .. } => {
                debug!(error = %error, "Evaluation reply was not JSON");
                Self {
                    meets_requirements: None,
                    reasoning: reply.to_string(),
                    missing_criteria: Vec::new(),
                    codeforces_rating: None,
                    raw_response: reply.to_string(),
                }
            }
        }
    }

    pub fn passed(&self) -> bool {
        self.meets_requirements == Some(true)
    }
}

/// Outcome for one CSV row: either an evaluation or an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateResult {
    pub candidate_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<CandidateVerdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CandidateResult {
    fn evaluated(candidate_id: String, verdict: CandidateVerdict) -> Self {
        Self {
            candidate_id,
            evaluation: Some(verdict),
            error: None,
        }
    }

    fn failed(candidate_id: String, error: impl Into<String>) -> Self {
        Self {
            candidate_id,
            evaluation: None,
            error: Some(error.into()),
        }
    }

    pub fn passed(&self) -> bool {
        self.evaluation.as_ref().is_some_and(CandidateVerdict::passed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub evaluated_candidates: Vec<CandidateResult>,
    pub passed: usize,
    pub total: usize,
}

impl EvaluationReport {
    pub fn from_results(results: Vec<CandidateResult>) -> Self {
        let passed = results.iter().filter(|r| r.passed()).count();
        Self {
            total: results.len(),
            passed,
            evaluated_candidates: results,
        }
    }

    /// Closing line streamed after the per-candidate marks.
    pub fn summary_line(&self) -> String {
        format!(
            "\n\n---\n**Summary:** {}/{} candidates meet requirements.",
            self.passed, self.total
        )
    }
}

/// The three files a batch needs, picked out of an upload by extension.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationInputs {
    pub criteria: PathBuf,
    pub csv: PathBuf,
    pub archive: PathBuf,
}

impl EvaluationInputs {
    /// The first text-bearing file is the criteria; the last CSV and ZIP win.
    pub fn classify(files: &[PathBuf]) -> Result<Self, EvaluationError> {
        let mut criteria = None;
        let mut csv = None;
        let mut archive = None;
        for path in files {
            match DocumentKind::from_path(path) {
                Some(kind) if kind.is_text_bearing() => {
                    if criteria.is_none() {
                        criteria = Some(path.clone());
                    }
                }
                Some(DocumentKind::Csv) => csv = Some(path.clone()),
                Some(DocumentKind::Zip) => archive = Some(path.clone()),
                _ => {}
            }
        }

        match (criteria, csv, archive) {
            (Some(criteria), Some(csv), Some(archive)) => Ok(Self {
                criteria,
                csv,
                archive,
            }),
            (criteria, csv, archive) => {
                let mut missing = Vec::new();
                if criteria.is_none() {
                    missing.push("criteria document (PDF/TXT)".to_string());
                }
                if csv.is_none() {
                    missing.push("candidates CSV".to_string());
                }
                if archive.is_none() {
                    missing.push("resumes ZIP archive".to_string());
                }
                Err(EvaluationError::MissingInputs { missing })
            }
        }
    }
}

/// One CSV row with its 1-based position.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateRow {
    pub position: usize,
    pub fields: Map<String, Value>,
}

impl CandidateRow {
    fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn candidate_id(&self) -> String {
        ["candidate_id", "id", "name"]
            .iter()
            .find_map(|key| self.field(key))
            .map(str::to_string)
            .unwrap_or_else(|| format!("Candidate {}", self.position))
    }

    pub fn resume_filename(&self) -> &str {
        self.field(RESUME_COLUMN).map(str::trim).unwrap_or_default()
    }
}

/// Read the candidate table. A leading UTF-8 BOM is ignored.
pub async fn load_candidates(path: &Path) -> Result<Vec<CandidateRow>, EvaluationError> {
    let bytes = tokio::fs::read(path).await.map_err(DocumentError::from)?;
    parse_candidates(&bytes)
}

fn parse_candidates(bytes: &[u8]) -> Result<Vec<CandidateRow>, EvaluationError> {
    let body = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(body);

    let headers = reader
        .headers()
        .map_err(|e| DocumentError::Csv {
            message: e.to_string(),
        })?
        .clone();
    if !headers.iter().any(|h| h == RESUME_COLUMN) {
        return Err(EvaluationError::MissingColumn {
            column: RESUME_COLUMN.to_string(),
        });
    }

    let mut rows = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record.map_err(|e| DocumentError::Csv {
            message: e.to_string(),
        })?;
        let fields = headers
            .iter()
            .zip(record.iter())
            .map(|(h, v)| (h.to_string(), Value::String(v.to_string())))
            .collect();
        rows.push(CandidateRow {
            position: idx + 1,
            fields,
        });
    }

    if rows.is_empty() {
        return Err(EvaluationError::NoCandidates);
    }
    Ok(rows)
}

/// Trim and cap resume text at `limit` characters.
pub fn truncate_resume(text: &str, limit: usize) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}{TRUNCATION_MARKER}", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

/// Resumes in formats we cannot parse are read as lossy UTF-8.
async fn resume_text(path: &Path) -> Result<String, DocumentError> {
    match documents::extract_text(path).await {
        Err(DocumentError::Unsupported { .. }) => {
            let bytes = tokio::fs::read(path).await?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
        other => other,
    }
}

/// Everything needed to judge the rows of one batch.
#[derive(Debug)]
pub struct PreparedBatch {
    pub criteria: String,
    pub resumes: HashMap<String, PathBuf>,
    pub candidates: Vec<CandidateRow>,
}

/// Runs rubric prompts against the chat model.
pub struct CandidateEvaluator {
    provider: Arc<dyn LlmProvider>,
    temperature: f32,
    max_resume_chars: usize,
    archive_limits: ArchiveLimits,
}

impl CandidateEvaluator {
    pub fn new(provider: Arc<dyn LlmProvider>, config: &EvaluationConfig) -> Self {
        Self {
            provider,
            temperature: 0.5,
            max_resume_chars: config.max_resume_chars,
            archive_limits: ArchiveLimits {
                max_entry_bytes: config.max_archive_entry_bytes,
                max_total_bytes: config.max_archive_bytes,
            },
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Extract the criteria, unpack resumes under `work_dir/resumes` and
    /// read the candidate table. Fails before any model call.
    pub async fn prepare(
        &self,
        inputs: &EvaluationInputs,
        work_dir: &Path,
    ) -> Result<PreparedBatch, EvaluationError> {
        let criteria = documents::extract_text(&inputs.criteria).await?;

        let resumes_dir = work_dir.join("resumes");
        let unpacked = documents::unpack_zip(&inputs.archive, &resumes_dir, self.archive_limits).await?;
        let resumes = documents::file_lookup(&resumes_dir);
        debug!(unpacked, indexed = resumes.len(), "Unpacked resume archive");

        let candidates = load_candidates(&inputs.csv).await?;
        Ok(PreparedBatch {
            criteria,
            resumes,
            candidates,
        })
    }

    /// Judge a single candidate from their row and resume text.
    pub async fn evaluate(
        &self,
        criteria: &str,
        row: &CandidateRow,
        resume: &str,
    ) -> Result<CandidateVerdict, LlmError> {
        let row_json = serde_json::to_string(&row.fields).map_err(|e| LlmError::ApiRequest {
            message: e.to_string(),
        })?;
        let human = format!(
            "Selection Criteria:\n{}\n\nCandidate Record (CSV Row as JSON):\n{row_json}\n\n\
             Resume Extract:\n{}\n\nRespond with only the JSON object.",
            criteria.trim(),
            truncate_resume(resume, self.max_resume_chars),
        );
        let request = CompletionRequest {
            messages: vec![Message::system(RUBRIC_PROMPT), Message::user(human)],
            temperature: self.temperature,
            ..Default::default()
        };
        let response = self.provider.complete(request).await?;
        Ok(CandidateVerdict::from_reply(
            &response.message.content.joined_text(),
        ))
    }

    /// Resolve a row's resume and judge it. Never fails; problems land on the result.
    pub async fn evaluate_row(&self, batch: &PreparedBatch, row: &CandidateRow) -> CandidateResult {
        let candidate_id = row.candidate_id();
        let resume_name = row.resume_filename();
        if resume_name.is_empty() {
            return CandidateResult::failed(candidate_id, "Missing resume_filename");
        }
        let Some(path) = batch.resumes.get(&resume_name.to_lowercase()) else {
            return CandidateResult::failed(
                candidate_id,
                format!("Resume '{resume_name}' not found"),
            );
        };

        let resume = match resume_text(path).await {
            Ok(text) => text,
            Err(e) => return CandidateResult::failed(candidate_id, e.to_string()),
        };
        match self.evaluate(&batch.criteria, row, &resume).await {
            Ok(verdict) => CandidateResult::evaluated(candidate_id, verdict),
            Err(e) => {
                warn!(candidate = %candidate_id, error = %e, "Candidate evaluation failed");
                CandidateResult::failed(candidate_id, e.to_string())
            }
        }
    }

    /// Run a whole batch and collect the report.
    pub async fn run(
        &self,
        inputs: &EvaluationInputs,
        work_dir: &Path,
    ) -> Result<EvaluationReport, EvaluationError> {
        let batch = self.prepare(inputs, work_dir).await?;
        let mut results = Vec::with_capacity(batch.candidates.len());
        for row in &batch.candidates {
            results.push(self.evaluate_row(&batch, row).await);
        }
        let report = EvaluationReport::from_results(results);
        info!(passed = report.passed, total = report.total, "Candidate evaluation finished");
        Ok(report)
    }
}
