//! Built-in event bus subscribers.
//!
//! - [`spawn_run_log_writer`] appends each run's output as NDJSON to
//!   `<log_dir>/<run_id>.ndjson`.
//! - [`spawn_scope_auditor`] records paths a finished run changed outside
//!   its scope snapshot.
//!
//! Both run until the bus closes or their shutdown token fires. After the
//! token fires, events already queued are still handled before they exit.

use std::path::{Path, PathBuf};

use agentry_core::WriteScope;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::Receiver;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{EventBus, EventChannel, RunEvent};
use crate::runner::OutputEvent;
use crate::storage::{Database, DatabaseError};
use crate::worktree::{WorktreeError, changed_paths};

/// Errors from auditing a run's changes.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Worktree error: {0}")]
    Worktree(#[from] WorktreeError),

    #[error("Scope error: {0}")]
    Scope(#[from] agentry_core::Error),
}

/// NDJSON log path for a run, or `None` if the id is not a safe file name.
pub fn run_log_path(log_dir: &Path, run_id: &str) -> Option<PathBuf> {
    let safe = !run_id.is_empty()
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'));
    safe.then(|| log_dir.join(format!("{run_id}.ndjson")))
}

async fn append_line(path: &Path, event: &OutputEvent) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(event)?;
    line.push(b'\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&line).await?;
    file.flush().await
}

/// Next event for a subscriber, or `None` once it should exit.
///
/// Before shutdown this waits on the bus. After shutdown it only takes
/// what is already queued.
async fn next_event(
    rx: &mut Receiver<RunEvent>,
    shutdown: &CancellationToken,
    subscriber: &'static str,
) -> Option<RunEvent> {
    loop {
        let received = if shutdown.is_cancelled() {
            match rx.try_recv() {
                Ok(event) => Ok(event),
                Err(TryRecvError::Lagged(n)) => Err(RecvError::Lagged(n)),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        } else {
            tokio::select! {
                biased;
                received = rx.recv() => received,
                () = shutdown.cancelled() => continue,
            }
        };
        match received {
            Ok(event) => return Some(event),
            Err(RecvError::Lagged(n)) => warn!(subscriber, skipped = n, "Subscriber lagged"),
            Err(RecvError::Closed) => return None,
        }
    }
}

/// Append every `run.output` event to its run's log file.
pub fn spawn_run_log_writer(
    bus: &EventBus,
    log_dir: PathBuf,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let mut rx = bus.subscribe(EventChannel::RunOutput);
    tokio::spawn(async move {
        if let Err(e) = tokio::fs::create_dir_all(&log_dir).await {
            warn!(dir = %log_dir.display(), error = %e, "Cannot create run log directory");
            return;
        }
        while let Some(event) = next_event(&mut rx, &shutdown, "run_log_writer").await {
            let RunEvent::Output { run_id, event } = event else {
                continue;
            };
            let Some(path) = run_log_path(&log_dir, &run_id) else {
                warn!(run_id = %run_id, "Run id is not a safe log file name");
                continue;
            };
            if let Err(e) = append_line(&path, &event).await {
                warn!(run_id = %run_id, error = %e, "Failed to append run log");
            }
        }
        debug!("Run log writer stopped");
    })
}

/// Record scope violations for a run. Returns the violating paths.
///
/// Paths matched by the agent profile's default excludes are never
/// violations. A run without a worktree on disk has nothing to audit.
pub async fn audit_run(db: &Database, run_id: &str) -> Result<Vec<String>, AuditError> {
    let run = db.get_run(run_id).await?;
    let Some(worktree) = run.worktree_path.as_deref().map(Path::new) else {
        return Ok(Vec::new());
    };
    if !worktree.is_dir() {
        debug!(run_id, path = %worktree.display(), "Worktree gone, skipping audit");
        return Ok(Vec::new());
    }

    let scope = WriteScope::new(&run.scope_snapshot)?;
    let excluded = match db.get_agent_profile(&run.agent_profile_id).await {
        Ok(profile) => WriteScope::new(&profile.default_exclude)?,
        Err(DatabaseError::NotFound(_)) => WriteScope::new(Vec::<String>::new())?,
        Err(e) => return Err(e.into()),
    };

    let changed = changed_paths(worktree, run.head_sha.as_deref()).await?;
    let violations: Vec<String> = scope
        .violations(changed.iter().map(String::as_str))
        .into_iter()
        .filter(|p| !excluded.allows(p))
        .map(ToString::to_string)
        .collect();

    for path in &violations {
        db.insert_scope_violation(run_id, path).await?;
    }
    if !violations.is_empty() {
        info!(run_id, count = violations.len(), "Recorded scope violations");
    }
    Ok(violations)
}

/// Audit each run when it finishes or is cancelled.
pub fn spawn_scope_auditor(
    bus: &EventBus,
    db: Database,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let mut rx = bus.subscribe_all();
    tokio::spawn(async move {
        while let Some(event) = next_event(&mut rx, &shutdown, "scope_auditor").await {
            if let RunEvent::Finished { run_id, .. } | RunEvent::Cancelled { run_id } = event
                && let Err(e) = audit_run(&db, &run_id).await
            {
                warn!(run_id = %run_id, error = %e, "Scope audit failed");
            }
        }
        debug!("Scope auditor stopped");
    })
}
