//! agentry daemon
//!
//! Opens the store, fails runs orphaned by a previous process, builds the
//! orchestrator and runs until Ctrl-C.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use agentry_core::config::load_config;
use agentry_core::tracing_init::{default_filter, init_tracing};
use agentry_daemon::Orchestrator;
use agentry_daemon::storage::Database;

#[derive(Parser, Debug)]
#[command(name = "agentry-daemon")]
#[command(version, about = "agentry daemon - coding agents in isolated git worktrees")]
struct Args {
    /// Repository whose `.agentry/settings.json` is layered over global config
    #[arg(long, env = "AGENTRY_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    /// Database file path
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Scratch root for run worktrees
    #[arg(long)]
    worktree_dir: Option<PathBuf>,

    /// Directory for per-run NDJSON output logs
    #[arg(long, env = "AGENTRY_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Path to the `claude` CLI binary
    #[arg(long)]
    claude_bin: Option<PathBuf>,

    /// Path to the `codex` CLI binary
    #[arg(long)]
    codex_bin: Option<PathBuf>,

    /// Seconds between graceful termination and force kill
    #[arg(long)]
    stop_grace_secs: Option<u64>,

    /// Log level for agentry crates (e.g. "info", "debug")
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON
    #[arg(long, env = "AGENTRY_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.project_dir.as_deref()).context("loading configuration")?;
    if let Some(path) = args.db_path {
        config.daemon.database_path = Some(path);
    }
    if let Some(dir) = args.worktree_dir {
        config.daemon.worktree_dir = Some(dir);
    }
    if let Some(dir) = args.log_dir {
        config.daemon.log_dir = Some(dir);
    }
    if let Some(bin) = args.claude_bin {
        config.runners.claude_bin = bin;
    }
    if let Some(bin) = args.codex_bin {
        config.runners.codex_bin = bin;
    }
    if let Some(secs) = args.stop_grace_secs {
        config.runners.stop_grace_secs = secs;
    }
    if let Some(level) = args.log_level {
        config.daemon.log_level = level;
    }
    config.daemon.log_json |= args.log_json;

    init_tracing(&default_filter(&config.daemon.log_level), config.daemon.log_json);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting agentry-daemon");

    let db_path = config
        .database_path()
        .context("no database path configured and no platform data directory")?;
    info!(path = %db_path.display(), "Opening database");
    let db = Database::open(&db_path).await?;

    let stale = db.fail_stale_runs().await?;
    if stale > 0 {
        warn!(count = stale, "Marked runs left running by a previous daemon as failed");
    }

    let orchestrator = Orchestrator::new(db, &config);
    for adapter in orchestrator.manager().adapters() {
        info!(
            name = %adapter.name,
            display_name = %adapter.display_name,
            supports_model = adapter.capabilities.supports_model,
            "Registered runner adapter"
        );
    }
    info!(
        worktree_dir = %config.worktree_dir().display(),
        log_dir = %config.log_dir().display(),
        "agentry-daemon ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("Shutdown requested");

    orchestrator.shutdown().await;
    Ok(())
}
