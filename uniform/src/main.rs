use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;

use uniform::events::{EventQueue, DEFAULT_RETENTION};
use uniform::logs::{ErrorLog, DEFAULT_LOG_RETENTION};
use uniform::{MemoryRepo, RegistryServer, UniformRegistry, UniformRepo};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address the HTTP surface listens on
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: String,

    /// Directory for the integrations.json snapshot (in-memory only when omitted)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Number of pending events kept for polling distributors
    #[arg(long, default_value_t = DEFAULT_RETENTION)]
    event_retention: usize,

    /// Number of error log entries kept
    #[arg(long, default_value_t = DEFAULT_LOG_RETENTION)]
    log_retention: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let repo: Arc<dyn UniformRepo> = match &args.data_dir {
        Some(dir) => {
            tracing::info!("Registry snapshot directory: {}", dir.display());
            Arc::new(
                MemoryRepo::with_snapshot(dir)
                    .map_err(|e| anyhow::anyhow!("Failed to open registry snapshot: {}", e))?,
            )
        }
        None => Arc::new(MemoryRepo::new()),
    };

    let registry = UniformRegistry::new(repo);
    let events = Arc::new(EventQueue::new(args.event_retention));
    let logs = Arc::new(ErrorLog::new(args.log_retention));
    let server = RegistryServer::with_error_log(registry, events, logs);

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down uniform registry");
            shutdown.cancel();
        }
    });

    let listener = TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("Failed to bind {}", args.bind))?;
    server.serve(listener).await.context("HTTP server error")?;

    Ok(())
}
