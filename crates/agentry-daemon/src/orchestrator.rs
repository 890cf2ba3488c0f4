//! The orchestrator: one object built at process start that owns the
//! database, event bus, adapter registry, runner manager, coordinator and
//! background subscribers, with an explicit shutdown.

use std::sync::Arc;
use std::time::Duration;

use agentry_core::Config;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::events::EventBus;
use crate::lifecycle::RunLifecycleCoordinator;
use crate::runner::{ClaudeAdapter, CodexAdapter, RunnerAdapter, RunnerManager};
use crate::storage::Database;
use crate::subscribers::{spawn_run_log_writer, spawn_scope_auditor};
use crate::worktree::WorktreeProvisioner;

/// How long shutdown waits for a subscriber to work through its queue.
const SUBSCRIBER_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Orchestrator {
    db: Database,
    bus: EventBus,
    manager: RunnerManager,
    coordinator: RunLifecycleCoordinator,
    subscribers: Vec<JoinHandle<()>>,
    subscriber_shutdown: CancellationToken,
}

impl Orchestrator {
    /// Build with the Claude and Codex adapters configured from `config`.
    pub fn new(db: Database, config: &Config) -> Self {
        let grace = Duration::from_secs(config.runners.stop_grace_secs);
        let adapters: Vec<Arc<dyn RunnerAdapter>> = vec![
            Arc::new(ClaudeAdapter::new(config.runners.claude_bin.clone()).with_stop_grace(grace)),
            Arc::new(CodexAdapter::new(config.runners.codex_bin.clone()).with_stop_grace(grace)),
        ];
        Self::with_adapters(db, config, adapters)
    }

    /// Build with an explicit adapter set.
    ///
    /// Must be called inside a tokio runtime: the subscribers start here.
    pub fn with_adapters(
        db: Database,
        config: &Config,
        adapters: Vec<Arc<dyn RunnerAdapter>>,
    ) -> Self {
        let bus = EventBus::default();
        let manager = RunnerManager::new(db.clone(), bus.clone(), adapters);
        let provisioner = Arc::new(WorktreeProvisioner::new(config.worktree_dir()));
        let log_dir = config.log_dir();

        let coordinator = RunLifecycleCoordinator::new(
            db.clone(),
            provisioner,
            manager.clone(),
            config.prompt.memory_limit,
        )
        .with_log_dir(log_dir.clone());

        let subscriber_shutdown = CancellationToken::new();
        let subscribers = vec![
            spawn_run_log_writer(&bus, log_dir, subscriber_shutdown.clone()),
            spawn_scope_auditor(&bus, db.clone(), subscriber_shutdown.clone()),
        ];

        Self {
            db,
            bus,
            manager,
            coordinator,
            subscribers,
            subscriber_shutdown,
        }
    }

    pub const fn db(&self) -> &Database {
        &self.db
    }

    pub const fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub const fn manager(&self) -> &RunnerManager {
        &self.manager
    }

    pub const fn coordinator(&self) -> &RunLifecycleCoordinator {
        &self.coordinator
    }

    /// Stop every live run and wait for the runner manager to drain, then
    /// let the subscribers finish the events already queued.
    pub async fn shutdown(self) {
        self.manager.shutdown().await;
        self.subscriber_shutdown.cancel();
        for mut handle in self.subscribers {
            if tokio::time::timeout(SUBSCRIBER_DRAIN_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                warn!("Subscriber did not drain in time, aborting");
                handle.abort();
            }
        }
        info!("Orchestrator shut down");
    }
}
