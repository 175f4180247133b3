//! Intent routing for `/agent` requests.
//!
//! A keyword heuristic answers the clear cases without touching the model;
//! everything else is classified by the model at temperature 0. Routing never
//! fails: a model or parse failure falls back to chat.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::brain::LlmProvider;
use crate::structured::StructuredReply;
use crate::types::{CompletionRequest, Message};

/// What a request wants done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Chat,
    Ingest,
    Evaluate,
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Intent::Chat => write!(f, "chat"),
            Intent::Ingest => write!(f, "ingest"),
            Intent::Evaluate => write!(f, "evaluate"),
        }
    }
}

/// A routing decision with its confidence in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentClassification {
    pub intent: Intent,
    pub confidence: f64,
    pub reasoning: String,
}

impl IntentClassification {
    pub fn new(intent: Intent, confidence: f64, reasoning: impl Into<String>) -> Self {
        Self {
            intent,
            confidence: confidence.clamp(0.0, 1.0),
            reasoning: reasoning.into(),
        }
    }
}

/// Heuristic results at or above this confidence skip the model.
pub const HEURISTIC_THRESHOLD: f64 = 0.85;

const EVALUATE_KEYWORDS: &[&str] = &[
    "evaluate", "screen", "assess", "candidate", "resume", "hiring", "recruit",
];

const INGEST_KEYWORDS: &[&str] = &[
    "ingest",
    "add to database",
    "add to the database",
    "add this to the database",
    "add to knowledge",
    "add to the knowledge",
    "store permanently",
    "upload to system",
    "add this document",
    "save to database",
    "save to the database",
];

const CHAT_KEYWORDS: &[&str] = &["what", "how", "why", "explain", "tell me", "summarize", "?"];

fn has_extension(files: &[String], ext: &str) -> bool {
    files.iter().any(|f| f.to_lowercase().ends_with(ext))
}

/// Keyword and attachment heuristic. First matching rule wins; `None` defers.
pub fn detect_intent_heuristic(message: &str, files: &[String]) -> Option<IntentClassification> {
    let lowered = message.to_lowercase();
    let mentions = |keywords: &[&str]| keywords.iter().any(|kw| lowered.contains(kw));

    if has_extension(files, ".csv") && has_extension(files, ".zip") && mentions(EVALUATE_KEYWORDS) {
        return Some(IntentClassification::new(
            Intent::Evaluate,
            0.95,
            "CSV + ZIP files with evaluation keywords detected",
        ));
    }

    if mentions(INGEST_KEYWORDS) {
        return Some(IntentClassification::new(
            Intent::Ingest,
            0.90,
            "Explicit ingest keywords detected",
        ));
    }

    if files.len() <= 1 && mentions(CHAT_KEYWORDS) {
        return Some(IntentClassification::new(
            Intent::Chat,
            0.85,
            "Question/chat pattern detected",
        ));
    }

    None
}

/// Shape the model is asked to reply with.
#[derive(Debug, Deserialize)]
struct ModelVerdict {
    intent: Intent,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    reasoning: Option<String>,
}

/// Build the classification prompt for a message and its attachment names.
pub fn classification_prompt(message: &str, files: &[String]) -> String {
    let files_desc = if files.is_empty() {
        "None".to_string()
    } else {
        files.join(", ")
    };
    format!(
        r#"You classify requests sent to a document intelligence assistant.

Look at the user's message and the files attached to it, and pick exactly one intent:

1. "chat": the user asks a question, wants to talk, or wants information from the knowledge base or from an attached document. Use this when unsure.

2. "ingest": the user explicitly wants the attached documents added to the permanent shared knowledge base, e.g. "Add this to the database", "Ingest this document", "Store this in the knowledge base".

3. "evaluate": the user wants candidates checked against selection criteria. This usually comes with a criteria document (PDF/TXT), a CSV of candidates and a ZIP of resumes, e.g. "Evaluate these candidates", "Screen these resumes".

User message: {message}

Attached files: {files_desc}

Reply with only a JSON object of this form:
{{"intent": "chat" | "ingest" | "evaluate", "confidence": <number between 0 and 1>, "reasoning": "<one short sentence>"}}"#
    )
}

/// Two-stage intent router.
pub struct IntentRouter {
    provider: Arc<dyn LlmProvider>,
    temperature: f32,
}

impl IntentRouter {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            temperature: 0.0,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Ask the model. Any failure yields chat at 0.5.
    pub async fn classify_with_model(&self, message: &str, files: &[String]) -> IntentClassification {
        let request = CompletionRequest {
            messages: vec![Message::user(classification_prompt(message, files))],
            temperature: self.temperature,
            ..Default::default()
        };

        let outcome = match self.provider.complete(request).await {
            Ok(response) => {
                let reply = response.message.content.joined_text();
                StructuredReply::<ModelVerdict>::decode(&reply).into_result()
            }
            Err(e) => Err(e.to_string()),
        };

        match outcome {
            Ok(verdict) => IntentClassification::new(
                verdict.intent,
                verdict.confidence.unwrap_or(0.8),
                verdict.reasoning.unwrap_or_default(),
            ),
            Err(e) => {
                warn!(error = %e, "Intent classification failed");
                IntentClassification::new(
                    Intent::Chat,
                    0.5,
                    format!("Classification failed, defaulting to chat: {e}"),
                )
            }
        }
    }

    /// Heuristic first, model when the heuristic defers.
    pub async fn route(&self, message: &str, files: &[String]) -> IntentClassification {
        let heuristic = detect_intent_heuristic(message, files);
        if let Some(result) = heuristic
            .as_ref()
            .filter(|h| h.confidence >= HEURISTIC_THRESHOLD)
        {
            debug!(intent = %result.intent, confidence = result.confidence, "Heuristic routed request");
            return result.clone();
        }

        let classified = self.classify_with_model(message, files).await;
        debug!(
            heuristic = ?heuristic,
            intent = %classified.intent,
            confidence = classified.confidence,
            "Model routed request"
        );
        if let Some(h) = &heuristic
            && h.intent != classified.intent
        {
            info!(
                heuristic_intent = %h.intent,
                model_intent = %classified.intent,
                "Heuristic and model disagree; using model"
            );
        }
        classified
    }
}
