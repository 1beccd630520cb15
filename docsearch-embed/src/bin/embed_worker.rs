//! Embedding worker process.
//!
//! Speaks the pool protocol on stdin/stdout. Logs go to stderr, filtered by
//! `RUST_LOG` (default `info`).
use docsearch_embed::WorkerServer;
use std::process;
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let server = WorkerServer::new().with_memory_reporting(true);
    if let Err(e) = server
        .serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await
    {
        tracing::error!("Embedding worker failed: {}", e);
        process::exit(1);
    }
}
