//! DBEB CLI: serves the HTTP gateway and runs one-off agent tasks from a terminal.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// DBEB: retrieval-augmented assistant backend
#[derive(Parser, Debug)]
#[command(name = "dbeb", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (searched for dbeb.toml)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Chat model to use
    #[arg(short, long)]
    model: Option<String>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        /// Bind address
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Ensure the global and session collections exist
    Provision,
    /// Run one chat turn and print the reply as it streams
    Ask {
        /// The question
        text: String,
        /// Conversation thread to continue
        #[arg(long)]
        thread: Option<String>,
    },
    /// Classify a request and print the intent as JSON
    Classify {
        /// The user message
        message: String,
        /// Attached file names
        #[arg(long = "file")]
        files: Vec<String>,
    },
    /// Evaluate candidates against a criteria document and print the report as JSON
    Evaluate {
        /// Criteria document (PDF or text)
        #[arg(long)]
        criteria: PathBuf,
        /// Candidates CSV with a resume_filename column
        #[arg(long)]
        csv: PathBuf,
        /// ZIP archive of resumes
        #[arg(long)]
        zip: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Human-readable stderr, RUST_LOG wins over -v
    let level = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let stderr_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(stderr_filter);

    // JSON file layer for structured logging
    let log_dir = directories::ProjectDirs::from("dev", "dbeb", "dbeb")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "dbeb.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let mut config = dbeb_core::config::load_config(Some(&workspace), cli.config.as_deref())
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    // CLI overrides
    if let Some(model) = &cli.model {
        config.llm.model = model.clone();
    }
    if let Commands::Serve { host, port } = &cli.command {
        if let Some(host) = host {
            config.gateway.host = host.clone();
        }
        if let Some(port) = port {
            config.gateway.port = *port;
        }
    }

    commands::handle_command(cli.command, config).await
}
