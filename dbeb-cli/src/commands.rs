//! CLI subcommand handlers.

use crate::Commands;
use dbeb_core::agent::AgentEvent;
use dbeb_core::config::AppConfig;
use dbeb_core::dispatch::ToolContext;
use dbeb_core::embeddings::create_embedder;
use dbeb_core::evaluator::EvaluationInputs;
use dbeb_core::gateway::{self, AppState};
use dbeb_core::knowledge::KnowledgeGateway;
use dbeb_core::providers::create_provider;
use dbeb_core::store::create_store;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, config: AppConfig) -> anyhow::Result<()> {
    match command {
        Commands::Serve { .. } => handle_serve(config).await,
        Commands::Provision => handle_provision(config).await,
        Commands::Ask { text, thread } => handle_ask(config, &text, thread).await,
        Commands::Classify { message, files } => handle_classify(config, &message, &files).await,
        Commands::Evaluate { criteria, csv, zip } => {
            handle_evaluate(
                config,
                EvaluationInputs {
                    criteria,
                    csv,
                    archive: zip,
                },
            )
            .await
        }
    }
}

/// Build the shared clients once and wire them into the gateway state.
fn build_state(config: AppConfig) -> anyhow::Result<AppState> {
    let provider = create_provider(&config.llm)?;
    let embedder = create_embedder(&config.embedding);
    let store = create_store(&config.store)?;
    let knowledge = Arc::new(KnowledgeGateway::new(embedder, store, config.store.clone()));
    let tools = Arc::new(dbeb_tools::default_registry(knowledge.clone(), &config.agent)?);
    Ok(AppState::new(config, provider, knowledge, tools))
}

async fn handle_serve(config: AppConfig) -> anyhow::Result<()> {
    let state = build_state(config)?;

    // A store that is down at startup is not fatal; requests will report it.
    let report = state.knowledge.provision().await;
    if !report.is_ok() {
        warn!(failures = ?report.failures, "Collection provisioning incomplete");
    }

    info!(
        host = %state.config.gateway.host,
        port = state.config.gateway.port,
        model = %state.config.llm.model,
        "Starting DBEB gateway"
    );
    gateway::run(state).await?;
    Ok(())
}

async fn handle_provision(config: AppConfig) -> anyhow::Result<()> {
    let state = build_state(config)?;
    let report = state.knowledge.provision().await;
    for name in &report.created {
        println!("Created collection: {name}");
    }
    for name in &report.existing {
        println!("Collection exists: {name}");
    }
    if !report.is_ok() {
        anyhow::bail!("Provisioning failed: {}", report.failures.join("; "));
    }
    Ok(())
}

async fn handle_ask(config: AppConfig, text: &str, thread: Option<String>) -> anyhow::Result<()> {
    let state = build_state(config)?;
    let thread_id = thread.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let ctx = ToolContext::for_session(thread_id.clone());

    let (tx, mut rx) = mpsc::channel(256);
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(event) = rx.recv().await {
            match event {
                AgentEvent::Token(token) => {
                    print!("{token}");
                    let _ = stdout.flush();
                }
                AgentEvent::ToolStarted { name } => eprintln!("\n[{name}]"),
                AgentEvent::ToolFinished { .. } => {}
            }
        }
    });

    let outcome = state.agent.run_turn(&ctx, &thread_id, text, &tx).await;
    drop(tx);
    let _ = printer.await;
    println!();

    let outcome = outcome?;
    info!(thread_id = %thread_id, hops = outcome.hops, "Turn complete");
    Ok(())
}

async fn handle_classify(config: AppConfig, message: &str, files: &[String]) -> anyhow::Result<()> {
    let state = build_state(config)?;
    let classification = state.router.route(message, files).await;
    println!("{}", serde_json::to_string_pretty(&classification)?);
    Ok(())
}

async fn handle_evaluate(config: AppConfig, inputs: EvaluationInputs) -> anyhow::Result<()> {
    for path in [&inputs.criteria, &inputs.csv, &inputs.archive] {
        if !path.exists() {
            anyhow::bail!("File not found: {}", path.display());
        }
    }
    let state = build_state(config)?;

    let work_dir = tempfile::Builder::new().prefix("dbeb_").tempdir()?;
    let report = state.evaluator.run(&inputs, work_dir.path()).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    eprintln!("{}", report.summary_line().trim());
    Ok(())
}
