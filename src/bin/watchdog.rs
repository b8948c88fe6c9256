//! # `localmind-watchdog`
//!
//! Supervises a model-server process on behalf of the app. Launched with
//! the server's pid as its only argument; the app writes heartbeat bytes
//! to this process's stdin. When they stop, the server is killed.
//!
//! ```bash
//! localmind-watchdog 48211
//! ```

use clap::Parser;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use localmind::watchdog::{kill_process, run_watchdog, TIMEOUT_ENV};

const DEFAULT_TIMEOUT_MS: u64 = 60_000;

#[derive(Parser)]
#[command(
    name = "localmind-watchdog",
    about = "Kill a model server when its parent app stops sending heartbeats",
    version
)]
struct Cli {
    /// Process id of the model server to supervise.
    pid: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("localmind=info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let timeout = std::env::var(TIMEOUT_ENV)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_millis(DEFAULT_TIMEOUT_MS));

    tracing::info!(pid = cli.pid, timeout_ms = timeout.as_millis() as u64, "watching model server");

    let pid = cli.pid;
    let outcome = run_watchdog(tokio::io::stdin(), timeout, move || kill_process(pid)).await?;
    tracing::info!(pid, ?outcome, "model server terminated");
    Ok(())
}
