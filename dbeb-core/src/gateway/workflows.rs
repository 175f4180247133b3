//! Producers behind the streaming routes.
//!
//! Each function writes frames into a [`FrameSink`] and returns as soon as
//! the sink reports the client gone. None of them return errors: failures are
//! reported to the client as frames.

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::server::AppState;
use super::sse::{Frame, FrameSink};
use super::uploads::{SavedFile, UploadForm};
use crate::agent::AgentEvent;
use crate::dispatch::ToolContext;
use crate::documents::{self, DocumentKind};
use crate::error::{AgentError, EvaluationError};
use crate::evaluator::{EvaluationInputs, EvaluationReport};
use crate::knowledge::Collection;
use crate::router::{Intent, IntentClassification};
use crate::splitter::{DocumentChunk, TextSplitter};

/// Prefix the user's question with extracted document text.
pub(crate) fn compose_message(message: &str, context: Option<&str>) -> String {
    match context {
        Some(context) => {
            format!("Context from uploaded document:\n{context}\n\nUser question: {message}")
        }
        None => message.to_string(),
    }
}

/// Stream one agent turn as `token` frames followed by `done`.
///
/// Failures end the stream with a frame named `error_event`.
pub(crate) async fn chat(
    state: &AppState,
    sink: &FrameSink,
    thread_id: &str,
    text: &str,
    error_event: &str,
) {
    let (tx, mut rx) = mpsc::channel::<AgentEvent>(64);
    let ctx = ToolContext::for_session(thread_id);
    let agent = &state.agent;

    let turn = async move {
        let result = agent.run_turn(&ctx, thread_id, text, &tx).await;
        drop(tx);
        result
    };
    // Dropping `rx` is what tells the graph the client is gone.
    let forward = async move {
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(AgentEvent::Token(token)) => {
                        if !sink.emit(Frame::token(token)).await {
                            break;
                        }
                    }
                    Some(_) => {}
                    None => break,
                },
                _ = sink.closed() => break,
            }
        }
    };
    let (result, ()) = tokio::join!(turn, forward);

    match result {
        Ok(outcome) => {
            debug!(thread_id, hops = outcome.hops, "Chat turn streamed");
            sink.emit(Frame::done()).await;
        }
        Err(AgentError::Disconnected) => {
            debug!(thread_id, "Client disconnected during chat turn");
        }
        Err(e) => {
            warn!(thread_id, error = %e, "Chat turn failed");
            sink.emit(Frame::failure(error_event, &e.to_string())).await;
        }
    }
}

/// Extract and split every text-bearing file, reporting chunk counts.
///
/// Returns `None` once the client is gone.
async fn split_uploads(
    splitter: &TextSplitter,
    files: &[SavedFile],
    sink: &FrameSink,
) -> Option<Result<Vec<DocumentChunk>, String>> {
    let mut chunks = Vec::new();
    for file in files {
        if !DocumentKind::from_path(&file.path).is_some_and(DocumentKind::is_text_bearing) {
            debug!(file = %file.name, "Skipping file that cannot be ingested");
            continue;
        }
        let document = match documents::load_document(&file.path).await {
            Ok(document) => document,
            Err(e) => return Some(Err(e.to_string())),
        };
        let split = splitter.split_document(&document);
        let progress = json!({"file": file.name, "chunks": split.len()});
        if !sink.emit(Frame::json("progress", &progress)).await {
            return None;
        }
        chunks.extend(split);
    }
    Some(Ok(chunks))
}

/// Write chunks to the global collection in batches, one `progress` frame
/// per batch. Returns `Ok(false)` if the client went away.
async fn store_batches(
    state: &AppState,
    chunks: &[DocumentChunk],
    sink: &FrameSink,
) -> Result<bool, String> {
    let total = chunks.len();
    let batch_size = state.config.ingest.batch_size.max(1);
    let mut current = 0;
    for batch in chunks.chunks(batch_size) {
        state
            .knowledge
            .add(Collection::Global, batch)
            .await
            .map_err(|e| e.to_string())?;
        current += batch.len();
        let progress = json!({"current": current, "total": total});
        if !sink.emit(Frame::json("progress", &progress)).await {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Ingest uploaded documents into the global collection.
pub(crate) async fn ingest(state: &AppState, files: &[SavedFile], sink: &FrameSink) {
    let starting = json!({"type": "ingest", "status": "starting"});
    if !sink.emit(Frame::json("status", &starting)).await {
        return;
    }

    let splitter = TextSplitter::from_config(&state.config.ingest);
    let chunks = match split_uploads(&splitter, files, sink).await {
        None => return,
        Some(Ok(chunks)) => chunks,
        Some(Err(e)) => {
            sink.emit(Frame::failure("error", &e)).await;
            return;
        }
    };
    if chunks.is_empty() {
        sink.emit(Frame::new("error", "No documents to ingest")).await;
        return;
    }

    let total = chunks.len();
    let ingesting = json!({"status": "ingesting", "total_chunks": total});
    if !sink.emit(Frame::json("status", &ingesting)).await {
        return;
    }
    match store_batches(state, &chunks, sink).await {
        Ok(true) => {}
        Ok(false) => return,
        Err(e) => {
            warn!(error = %e, "Ingest failed");
            sink.emit(Frame::failure("error", &e)).await;
            return;
        }
    }

    info!(files = files.len(), chunks = total, "Ingested documents");
    let summary = format!(
        "✅ Successfully ingested {} document(s) with {total} chunks into the knowledge base.",
        files.len()
    );
    if sink.emit(Frame::token(summary)).await {
        sink.emit(Frame::done()).await;
    }
}

/// Run a candidate evaluation batch, streaming a mark per candidate.
pub(crate) async fn evaluate(state: &AppState, form: &UploadForm, sink: &FrameSink) {
    let starting = json!({"type": "evaluate", "status": "starting"});
    if !sink.emit(Frame::json("status", &starting)).await {
        return;
    }

    let outcome = match EvaluationInputs::classify(&form.paths()) {
        Ok(inputs) => state.evaluator.prepare(&inputs, form.dir()).await,
        Err(e) => Err(e),
    };
    let batch = match outcome {
        Ok(batch) => batch,
        Err(
            e @ (EvaluationError::MissingInputs { .. }
            | EvaluationError::MissingColumn { .. }
            | EvaluationError::NoCandidates),
        ) => {
            if sink.emit(Frame::token(format!("❌ {e}"))).await {
                sink.emit(Frame::done()).await;
            }
            return;
        }
        Err(e) => {
            warn!(error = %e, "Evaluation setup failed");
            sink.emit(Frame::failure("error", &e.to_string())).await;
            return;
        }
    };

    let announce = format!("📋 Evaluating {} candidates...", batch.candidates.len());
    if !sink.emit(Frame::token(announce)).await {
        return;
    }

    let mut results = Vec::with_capacity(batch.candidates.len());
    for row in &batch.candidates {
        if sink.is_closed() {
            debug!("Client disconnected during evaluation");
            return;
        }
        let result = state.evaluator.evaluate_row(&batch, row).await;
        if result.evaluation.is_some() {
            let mark = if result.passed() { "✅" } else { "❌" };
            if !sink
                .emit(Frame::token(format!("{mark} {}", result.candidate_id)))
                .await
            {
                return;
            }
        }
        results.push(result);
    }

    let report = EvaluationReport::from_results(results);
    info!(passed = report.passed, total = report.total, "Streamed candidate evaluation");
    if !sink.emit(Frame::token(report.summary_line())).await {
        return;
    }
    let payload = json!({"evaluated_candidates": report.evaluated_candidates});
    if sink.emit(Frame::json("results", &payload)).await {
        sink.emit(Frame::done()).await;
    }
}

/// Everything `/agent` does after the request is parsed.
///
/// Owns the form, so its temp dir is removed when this returns, whatever
/// the exit path.
pub(crate) async fn agent_request(
    state: AppState,
    form: UploadForm,
    message: String,
    thread_id: String,
    intent: IntentClassification,
    sink: FrameSink,
) {
    if !sink.emit(Frame::json("intent", &intent)).await {
        return;
    }

    match intent.intent {
        Intent::Chat => {
            let context = match form.files().first() {
                Some(file) => documents::extract_text(&file.path).await.ok(),
                None => None,
            };
            let text = compose_message(&message, context.as_deref());
            chat(&state, &sink, &thread_id, &text, "error").await;
        }
        Intent::Ingest => ingest(&state, form.files(), &sink).await,
        Intent::Evaluate => evaluate(&state, &form, &sink).await,
    }
    debug!(thread_id = %thread_id, frames = sink.sent(), "Agent request finished");
}

/// Admin upload of one PDF into the global collection.
pub(crate) async fn admin_upload(state: AppState, form: UploadForm, sink: FrameSink) {
    let Some(file) = form.files().first() else {
        return;
    };
    let splitter = TextSplitter::from_config(&state.config.ingest);
    let chunks = match documents::load_document(&file.path).await {
        Ok(document) => splitter.split_document(&document),
        Err(e) => {
            sink.emit(Frame::json("error", &json!({"detail": e.to_string()})))
                .await;
            return;
        }
    };

    if !sink
        .emit(Frame::json("init", &json!({"total": chunks.len()})))
        .await
    {
        return;
    }
    match store_batches(&state, &chunks, &sink).await {
        Ok(true) => {
            info!(file = %file.name, chunks = chunks.len(), "Admin upload stored");
            let message = format!("Successfully processed {}", file.name);
            sink.emit(Frame::json("done", &json!({"message": message})))
                .await;
        }
        Ok(false) => {}
        Err(e) => {
            warn!(file = %file.name, error = %e, "Admin upload failed");
            sink.emit(Frame::json("error", &json!({"detail": e}))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::MockLlmProvider;
    use crate::gateway::server::testing::harness;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    async fn collect<F, Fut>(sink_producer: F) -> Vec<Frame>
    where
        F: FnOnce(FrameSink) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let (sink, mut rx) = FrameSink::channel();
        let consumer = tokio::spawn(async move {
            let mut frames = Vec::new();
            while let Some(frame) = rx.recv().await {
                frames.push(frame);
            }
            frames
        });
        sink_producer(sink).await;
        consumer.await.unwrap()
    }

    fn events(frames: &[Frame]) -> Vec<&str> {
        frames.iter().map(|f| f.event.as_str()).collect()
    }

    #[test]
    fn test_compose_message() {
        assert_eq!(compose_message("hi", None), "hi");
        assert_eq!(
            compose_message("Q?", Some("ctx")),
            "Context from uploaded document:\nctx\n\nUser question: Q?"
        );
    }

    #[tokio::test]
    async fn test_chat_streams_tokens_then_done() {
        let h = harness().await;
        h.provider
            .queue_response(MockLlmProvider::text_response("Hello there"));
        let state = h.state.clone();
        let frames = collect(move |sink| async move {
            chat(&state, &sink, "t1", "hi", "sse-error").await;
        })
        .await;

        assert_eq!(
            frames,
            vec![
                Frame::token("Hello "),
                Frame::token("there"),
                Frame::done()
            ]
        );
        assert_eq!(h.state.agent.sessions().len("t1").await, 2);
    }

    #[tokio::test]
    async fn test_chat_failure_uses_error_event() {
        let h = harness().await;
        h.provider.queue_error(crate::error::LlmError::Connection {
            message: "down\nhard".into(),
        });
        let state = h.state.clone();
        let frames = collect(move |sink| async move {
            chat(&state, &sink, "t1", "hi", "sse-error").await;
        })
        .await;

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "sse-error");
        assert!(!frames[0].data.contains('\n'));
        assert_eq!(h.state.agent.sessions().len("t1").await, 0);
    }

    #[tokio::test]
    async fn test_ingest_reports_batches() {
        let h = harness().await;
        let mut form = UploadForm::new().unwrap();
        form.save_file("notes.txt", "word ".repeat(400).as_bytes())
            .await
            .unwrap();
        form.save_file("table.csv", b"a,b\n1,2\n").await.unwrap();

        let state = h.state.clone();
        let frames = collect(move |sink| async move {
            ingest(&state, form.files(), &sink).await;
        })
        .await;

        assert_eq!(
            events(&frames),
            vec!["status", "progress", "status", "progress", "token", "done"]
        );
        let per_file: serde_json::Value = serde_json::from_str(&frames[1].data).unwrap();
        assert_eq!(per_file["file"], "notes.txt");
        let total = per_file["chunks"].as_u64().unwrap() as usize;
        assert_eq!(
            h.store.point_count(h.state.knowledge.collection_name(Collection::Global)).await,
            total
        );
        assert_eq!(
            frames[4].data,
            format!(
                "✅ Successfully ingested 2 document(s) with {total} chunks into the knowledge base."
            )
        );
    }

    #[tokio::test]
    async fn test_ingest_without_documents() {
        let h = harness().await;
        let mut form = UploadForm::new().unwrap();
        form.save_file("data.zip", b"PK").await.unwrap();
        let state = h.state.clone();
        let frames = collect(move |sink| async move {
            ingest(&state, form.files(), &sink).await;
        })
        .await;
        assert_eq!(frames.last(), Some(&Frame::new("error", "No documents to ingest")));
    }

    #[tokio::test]
    async fn test_evaluate_reports_missing_inputs() {
        let h = harness().await;
        let mut form = UploadForm::new().unwrap();
        form.save_file("candidates.csv", b"name,resume_filename\n")
            .await
            .unwrap();
        let state = h.state.clone();
        let frames = collect(move |sink| async move {
            evaluate(&state, &form, &sink).await;
        })
        .await;

        assert_eq!(
            frames[1],
            Frame::token("❌ Missing required files: criteria document (PDF/TXT), resumes ZIP archive")
        );
        assert_eq!(frames[2], Frame::done());
        assert_eq!(h.provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_evaluate_streams_marks_and_results() {
        let h = harness().await;
        let mut form = UploadForm::new().unwrap();
        form.save_file("criteria.txt", b"Must know Rust").await.unwrap();
        form.save_file("c.csv", b"candidate_id,resume_filename\nA1,a.txt\nB2,missing.txt\n")
            .await
            .unwrap();
        let mut archive = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut archive));
            zip.start_file("a.txt", zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"Rust for five years").unwrap();
            zip.finish().unwrap();
        }
        form.save_file("resumes.zip", &archive).await.unwrap();
        h.provider.queue_response(MockLlmProvider::text_response(
            r#"{"meets_requirements": true, "reasoning": "yes"}"#,
        ));

        let state = h.state.clone();
        let frames = collect(move |sink| async move {
            evaluate(&state, &form, &sink).await;
        })
        .await;

        assert_eq!(frames[1], Frame::token("📋 Evaluating 2 candidates..."));
        assert_eq!(frames[2], Frame::token("✅ A1"));
        assert_eq!(
            frames[3],
            Frame::token("\n\n---\n**Summary:** 1/2 candidates meet requirements.")
        );
        assert_eq!(frames[4].event, "results");
        let results: serde_json::Value = serde_json::from_str(&frames[4].data).unwrap();
        assert_eq!(
            results["evaluated_candidates"][1]["error"],
            "Resume 'missing.txt' not found"
        );
        assert_eq!(frames[5], Frame::done());
    }

    #[tokio::test]
    async fn test_disconnected_client_gets_nothing_and_temp_dir_is_removed() {
        let h = harness().await;
        let mut form = UploadForm::new().unwrap();
        form.save_file("notes.txt", b"some text").await.unwrap();
        let dir = form.dir().to_path_buf();
        assert!(dir.exists());

        let (sink, rx) = FrameSink::channel();
        drop(rx);
        let intent = IntentClassification::new(Intent::Chat, 0.85, "question");
        let task = tokio::spawn(agent_request(
            h.state.clone(),
            form,
            "what is this?".into(),
            "t-gone".into(),
            intent,
            sink.clone(),
        ));
        task.await.unwrap();

        assert_eq!(sink.sent(), 0);
        assert!(!dir.exists());
        assert_eq!(h.provider.call_count(), 0);
        assert_eq!(h.state.agent.sessions().len("t-gone").await, 0);
    }

    #[tokio::test]
    async fn test_disconnect_mid_turn_commits_nothing() {
        let h = harness().await;
        h.provider.queue_response(MockLlmProvider::tool_call_response(
            "search_global_knowledge",
            serde_json::json!({"query": "x"}),
        ));
        h.provider
            .queue_response(MockLlmProvider::text_response("never seen"));

        let (sink, rx) = FrameSink::channel();
        let state = h.state.clone();
        let task = tokio::spawn(async move {
            chat(&state, &sink, "t-mid", "hi", "error").await;
            sink.sent()
        });
        drop(rx);
        let sent = task.await.unwrap();

        assert_eq!(sent, 0);
        assert_eq!(h.state.agent.sessions().len("t-mid").await, 0);
        assert!(h.provider.call_count() <= 1);
    }
}
