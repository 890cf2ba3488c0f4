//! Process supervision shared by every adapter.
//!
//! One monitor task owns the child. Two reader tasks forward stdout and
//! stderr lines onto a single channel; the monitor sends `exit` only after
//! both readers have drained, so `exit` is always the last event.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{AdapterError, OutputEvent, OutputKind};

/// Per-run event channel capacity.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How long the monitor waits for readers after exit. Grandchildren that
/// inherited the pipes can keep them open indefinitely.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Concrete command line for a run.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
}

/// Handle to a live (or finished) run process. Cheap to clone.
///
/// Signals go through the monitor task that owns the child, so a signal is
/// never sent to a pid the monitor has already reaped.
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub run_id: String,
    pub process_id: Option<u32>,
    kill: Arc<Notify>,
    terminate: Arc<Notify>,
    reaped: watch::Receiver<bool>,
    exited: watch::Receiver<bool>,
}

impl RunHandle {
    /// Force-kill the process. No-op once it has exited.
    pub fn kill(&self) {
        self.kill.notify_one();
    }

    /// Whether the process itself is gone. Its output may still be draining.
    pub fn has_reaped(&self) -> bool {
        *self.reaped.borrow()
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Wait until the process has exited and its output is drained.
    pub async fn wait(&self) {
        let mut exited = self.exited.clone();
        let _ = exited.wait_for(|done| *done).await;
    }

    /// Graceful termination, wait `grace`, then force kill. Idempotent.
    pub async fn stop(&self, grace: Duration) {
        if self.has_exited() {
            debug!(run_id = %self.run_id, "stop: process already exited");
            return;
        }

        if !self.terminate() {
            debug!(run_id = %self.run_id, "stop: process reaped, waiting for output");
        }

        if tokio::time::timeout(grace, self.wait()).await.is_err() {
            warn!(run_id = %self.run_id, grace_ms = grace.as_millis(), "Grace period expired, killing");
            self.kill();
            self.wait().await;
        }
    }

    /// Ask the monitor for graceful termination. Returns `false` when the
    /// process has already been reaped and there is nothing to signal.
    fn terminate(&self) -> bool {
        if self.has_reaped() {
            return false;
        }
        self.terminate.notify_one();
        true
    }
}

/// Graceful termination of a child the caller still owns.
#[cfg(unix)]
fn send_terminate(child: &mut tokio::process::Child, run_id: &str) {
    // `id()` is `None` once the child has been polled to completion.
    let Some(pid) = child.id() else {
        return;
    };
    // SAFETY: the child is not yet reaped and only this task can reap it,
    // so the pid still names our process.
    #[allow(unsafe_code, clippy::cast_possible_wrap)]
    let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        warn!(run_id, pid, error = %err, "Failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut tokio::process::Child, run_id: &str) {
    if let Err(e) = child.start_kill() {
        warn!(run_id, error = %e, "Failed to terminate run process");
    }
}

/// A started process: its handle and its ordered output stream.
#[derive(Debug)]
pub struct StartedRun {
    pub handle: RunHandle,
    pub events: mpsc::Receiver<OutputEvent>,
}

/// Spawn `spec` and start supervising it. Returns without waiting for output.
pub fn spawn(run_id: &str, spec: ProcessSpec) -> Result<StartedRun, AdapterError> {
    if !spec.cwd.is_dir() {
        return Err(AdapterError::MissingWorktree(spec.cwd.display().to_string()));
    }

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.cwd)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| AdapterError::Spawn {
        program: spec.program.display().to_string(),
        reason: e.to_string(),
    })?;
    let process_id = child.id();

    info!(
        run_id,
        pid = ?process_id,
        program = %spec.program.display(),
        cwd = %spec.cwd.display(),
        "Spawned run process"
    );

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (reaped_tx, reaped_rx) = watch::channel(false);
    let (exited_tx, exited_rx) = watch::channel(false);
    let kill = Arc::new(Notify::new());
    let terminate = Arc::new(Notify::new());

    let readers = [
        child
            .stdout
            .take()
            .map(|out| spawn_reader(out, tx.clone(), run_id.to_string(), OutputEvent::stdout)),
        child
            .stderr
            .take()
            .map(|err| spawn_reader(err, tx.clone(), run_id.to_string(), OutputEvent::stderr)),
    ];

    let monitor_kill = Arc::clone(&kill);
    let monitor_terminate = Arc::clone(&terminate);
    let id = run_id.to_string();
    tokio::spawn(async move {
        let status = loop {
            let force = tokio::select! {
                status = child.wait() => break status,
                () = monitor_kill.notified() => true,
                () = monitor_terminate.notified() => false,
            };
            if force {
                debug!(run_id = %id, "Force-killing run process");
                let _ = child.start_kill();
                break child.wait().await;
            }
            send_terminate(&mut child, &id);
        };
        let _ = reaped_tx.send(true);

        let code = match status {
            Ok(status) => status.code().unwrap_or(-1),
            Err(e) => {
                warn!(run_id = %id, error = %e, "Failed to wait for run process");
                -1
            }
        };

        for reader in readers.into_iter().flatten() {
            if tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await.is_err() {
                warn!(run_id = %id, "Output reader did not drain after exit");
            }
        }

        info!(run_id = %id, exit_code = code, "Run process exited");
        let _ = tx.send(OutputEvent::exit(code)).await;
        let _ = exited_tx.send(true);
    });

    Ok(StartedRun {
        handle: RunHandle {
            run_id: run_id.to_string(),
            process_id,
            kill,
            terminate,
            reaped: reaped_rx,
            exited: exited_rx,
        },
        events: rx,
    })
}

fn spawn_reader<R>(
    reader: R,
    tx: mpsc::Sender<OutputEvent>,
    run_id: String,
    make: fn(String) -> OutputEvent,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let event = make(line);
                    if event.kind == OutputKind::Stderr {
                        debug!(run_id = %run_id, line = event.data.as_deref().unwrap_or_default(), "stderr");
                    }
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "Failed to read run output");
                    break;
                }
            }
        }
    })
}
