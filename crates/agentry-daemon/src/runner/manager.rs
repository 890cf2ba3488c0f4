//! Runner manager: adapter registry, live-run handles, output routing and
//! terminal-state reconciliation.
//!
//! Every output event is routed by the run id of the router task that owns
//! the run's stream, never by any notion of "current run", so concurrent
//! runs cannot cross-talk.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::{AdapterDescriptor, AdapterError, OutputKind, RunHandle, RunnerAdapter, StartRequest};
use crate::events::{EventBus, RunEvent};
use crate::storage::{Database, DatabaseError, RunStatus};

/// Errors from the runner manager.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Unknown runner: {0}")]
    UnknownRunner(String),

    #[error("Run is not live: {0}")]
    NotRunning(String),

    #[error("Run already has a live process: {0}")]
    AlreadyRunning(String),

    #[error("Runner manager is shutting down")]
    ShuttingDown,

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

struct LiveRun {
    adapter: Arc<dyn RunnerAdapter>,
    handle: RunHandle,
}

/// Owns the adapter registry and every live run. Cloning shares state.
#[derive(Clone)]
pub struct RunnerManager {
    adapters: Arc<HashMap<String, Arc<dyn RunnerAdapter>>>,
    live: Arc<RwLock<HashMap<String, LiveRun>>>,
    db: Database,
    bus: EventBus,
    tracker: TaskTracker,
}

impl RunnerManager {
    /// Build a manager over `adapters`, keyed by each descriptor's name.
    pub fn new(db: Database, bus: EventBus, adapters: Vec<Arc<dyn RunnerAdapter>>) -> Self {
        let adapters = adapters
            .into_iter()
            .map(|a| (a.descriptor().name, a))
            .collect();
        Self {
            adapters: Arc::new(adapters),
            live: Arc::new(RwLock::new(HashMap::new())),
            db,
            bus,
            tracker: TaskTracker::new(),
        }
    }

    pub fn adapter(&self, name: &str) -> Option<Arc<dyn RunnerAdapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn descriptor(&self, name: &str) -> Option<AdapterDescriptor> {
        self.adapters.get(name).map(|a| a.descriptor())
    }

    /// Capability descriptors of every registered adapter, by name.
    pub fn adapters(&self) -> Vec<AdapterDescriptor> {
        let mut list: Vec<_> = self.adapters.values().map(|a| a.descriptor()).collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Whether `run_id` has a live process handle.
    pub async fn is_running(&self, run_id: &str) -> bool {
        self.live.read().await.contains_key(run_id)
    }

    pub async fn live_count(&self) -> usize {
        self.live.read().await.len()
    }

    /// Start a run's process through the named adapter.
    ///
    /// Records the handle, emits `run.started`, and spawns the router that
    /// forwards output and reconciles the exit into storage.
    pub async fn start(
        &self,
        runner: &str,
        request: StartRequest,
    ) -> Result<RunHandle, ManagerError> {
        if self.tracker.is_closed() {
            return Err(ManagerError::ShuttingDown);
        }
        let adapter = self
            .adapter(runner)
            .ok_or_else(|| ManagerError::UnknownRunner(runner.to_string()))?;

        let run_id = request.run_id.clone();
        if self.is_running(&run_id).await {
            return Err(ManagerError::AlreadyRunning(run_id));
        }

        let started = adapter.start(request).await?;
        let handle = started.handle.clone();

        self.live.write().await.insert(
            run_id.clone(),
            LiveRun {
                adapter,
                handle: handle.clone(),
            },
        );
        self.bus.publish(RunEvent::Started {
            run_id: run_id.clone(),
            runner: runner.to_string(),
        });
        info!(run_id = %run_id, runner, pid = ?handle.process_id, "Run started");

        let manager = self.clone();
        let router_run_id = run_id.clone();
        let mut events = started.events;
        self.tracker.spawn(async move {
            let run_id = router_run_id;
            let mut exit_code = None;
            while let Some(event) = events.recv().await {
                if event.kind == OutputKind::Exit {
                    exit_code = event.exit_code;
                }
                manager.bus.publish(RunEvent::Output {
                    run_id: run_id.clone(),
                    event,
                });
                if exit_code.is_some() {
                    break;
                }
            }
            manager.reconcile_exit(&run_id, exit_code.unwrap_or(-1)).await;
        });

        // Shutdown may have snapshotted the live set before this insert.
        if self.tracker.is_closed() {
            warn!(run_id = %run_id, "Run started during shutdown, stopping it");
            if let Err(e) = self.stop(&run_id).await {
                debug!(run_id = %run_id, error = %e, "Stop after late start skipped");
            }
        }

        Ok(handle)
    }

    /// Persist the terminal state of a run whose process exited on its own.
    ///
    /// If the handle is already gone, a stop owns the transition.
    async fn reconcile_exit(&self, run_id: &str, exit_code: i32) {
        if self.live.write().await.remove(run_id).is_none() {
            debug!(run_id, exit_code, "Exit after stop, leaving terminal state to stop");
            return;
        }

        match self.db.finish_run(run_id, exit_code).await {
            Ok(true) => {
                let status = RunStatus::from_exit_code(exit_code);
                info!(run_id, exit_code, %status, "Run finished");
                self.bus.publish(RunEvent::Finished {
                    run_id: run_id.to_string(),
                    status,
                    exit_code,
                });
            }
            Ok(false) => debug!(run_id, exit_code, "Run already terminal, exit ignored"),
            Err(e) => error!(run_id, exit_code, error = %e, "Failed to persist run exit"),
        }
    }

    /// Spawn work that [`Self::shutdown`] must wait for, such as a run start
    /// handed off by the lifecycle coordinator.
    pub fn spawn_tracked<F>(&self, future: F) -> tokio::task::JoinHandle<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(future)
    }

    /// Stop a live run: graceful termination, grace period, force kill,
    /// then persist `cancelled` and emit `run.cancelled`.
    ///
    /// Returns [`ManagerError::NotRunning`] when there is no live handle;
    /// the caller must then cancel the stored run directly.
    pub async fn stop(&self, run_id: &str) -> Result<bool, ManagerError> {
        self.tracker.track_future(self.stop_live(run_id)).await
    }

    async fn stop_live(&self, run_id: &str) -> Result<bool, ManagerError> {
        let live = self
            .live
            .write()
            .await
            .remove(run_id)
            .ok_or_else(|| ManagerError::NotRunning(run_id.to_string()))?;

        info!(run_id, pid = ?live.handle.process_id, "Stopping run");
        live.adapter.stop(&live.handle).await;

        let cancelled = self.db.cancel_run(run_id).await?;
        if cancelled {
            self.bus.publish(RunEvent::Cancelled {
                run_id: run_id.to_string(),
            });
        } else {
            debug!(run_id, "Run reached a terminal state before stop persisted");
        }
        Ok(cancelled)
    }

    /// Stop every live run and wait for routers and stops to finish.
    /// Further starts are refused.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.live.read().await.keys().cloned().collect();
        info!(live = ids.len(), "Runner manager shutting down");

        for id in ids {
            let manager = self.clone();
            self.tracker.spawn(async move {
                match manager.stop(&id).await {
                    Ok(_) | Err(ManagerError::NotRunning(_)) => {}
                    Err(e) => warn!(run_id = %id, error = %e, "Stop during shutdown failed"),
                }
            });
        }

        self.tracker.close();
        self.tracker.wait().await;
        info!("Runner manager drained");
    }
}
