//! Run lifecycle coordinator.
//!
//! start, retry and continue share one skeleton: validate, take the task's
//! admission lock, check for a running run, provision a worktree, insert the
//! run, release the lock, and hand the process start to the runner manager
//! in the background. Every precondition is checked before the first side
//! effect.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use agentry_core::WriteScope;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::error::RunError;
use super::prompt::assemble_prompt;
use crate::events::RunEvent;
use crate::runner::{ManagerError, RunnerManager, StartRequest};
use crate::status::{
    DodStatus, TaskStatus, TaskStatusView, dependency_status, derive_task_status, dod_status,
};
use crate::storage::{Database, DatabaseError, NewRun, Run, RunRole, RunStatus, Task};
use crate::worktree::{ProvisionedWorktree, WorktreeProvisioner};

/// Request to start a fresh run.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunRequest {
    pub task_id: String,
    pub agent_profile_id: String,
    #[serde(default)]
    pub role: Option<RunRole>,
}

/// Everything a launch needs, whichever operation asked for it.
struct LaunchPlan {
    task_id: String,
    agent_profile_id: String,
    role: Option<RunRole>,
    /// `None` snapshots the task's current write scope.
    scope: Option<Vec<String>>,
}

pub struct RunLifecycleCoordinator {
    db: Database,
    provisioner: Arc<WorktreeProvisioner>,
    manager: RunnerManager,
    memory_limit: u32,
    log_dir: Option<PathBuf>,
    task_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RunLifecycleCoordinator {
    pub fn new(
        db: Database,
        provisioner: Arc<WorktreeProvisioner>,
        manager: RunnerManager,
        memory_limit: u32,
    ) -> Self {
        Self {
            db,
            provisioner,
            manager,
            memory_limit,
            log_dir: None,
            task_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Record `<dir>/<run_id>.ndjson` as each new run's log reference.
    #[must_use]
    pub fn with_log_dir(mut self, dir: PathBuf) -> Self {
        self.log_dir = Some(dir);
        self
    }

    pub const fn manager(&self) -> &RunnerManager {
        &self.manager
    }

    // =========================================================================
    // Run operations
    // =========================================================================

    /// Start a fresh run for a task.
    pub async fn start(&self, request: StartRunRequest) -> Result<Run, RunError> {
        if request.task_id.trim().is_empty() {
            return Err(RunError::validation("taskId is required"));
        }
        if request.agent_profile_id.trim().is_empty() {
            return Err(RunError::validation("agentProfileId is required"));
        }

        self.launch(LaunchPlan {
            task_id: request.task_id,
            agent_profile_id: request.agent_profile_id,
            role: request.role,
            scope: None,
        })
        .await
    }

    /// Start a new run reusing an earlier run's task, profile, role and
    /// scope snapshot.
    pub async fn retry(&self, run_id: &str) -> Result<Run, RunError> {
        let original = self.db.get_run(run_id).await?;
        if original.status == RunStatus::Running {
            return Err(RunError::conflict(format!("Run {run_id} is still running")));
        }

        info!(run_id, task_id = %original.task_id, "Retrying run");
        self.launch(LaunchPlan {
            task_id: original.task_id,
            agent_profile_id: original.agent_profile_id,
            role: original.role,
            scope: Some(original.scope_snapshot),
        })
        .await
    }

    /// Like [`Self::retry`], with additional human input.
    ///
    /// The input is validated but not yet included in the prompt.
    pub async fn continue_run(&self, run_id: &str, additional_input: &str) -> Result<Run, RunError> {
        if additional_input.trim().is_empty() {
            return Err(RunError::validation("additionalInput must not be empty"));
        }
        debug!(run_id, input_len = additional_input.len(), "Continuing run");
        self.retry(run_id).await
    }

    /// Stop a running run.
    ///
    /// A run with a live process is stopped through the runner manager;
    /// otherwise the stored row is cancelled directly. A run that is not
    /// running is a conflict and nothing changes.
    pub async fn stop(&self, run_id: &str) -> Result<Run, RunError> {
        let run = self.db.get_run(run_id).await?;
        if run.status != RunStatus::Running {
            return Err(RunError::conflict(format!(
                "Run {run_id} is not running (status: {})",
                run.status
            )));
        }

        let stopped = if self.manager.is_running(run_id).await {
            match self.manager.stop(run_id).await {
                Ok(_) => true,
                Err(ManagerError::NotRunning(_)) => false,
                Err(e) => return Err(e.into()),
            }
        } else {
            false
        };

        if !stopped && self.db.cancel_run(run_id).await? {
            info!(run_id, "Cancelled run without a live process");
            self.manager.bus().publish(RunEvent::Cancelled {
                run_id: run_id.to_string(),
            });
            // The process may have registered after the check above; its
            // launcher only looks at the row once, right after registering.
            if self.manager.is_running(run_id).await
                && let Err(e) = self.manager.stop(run_id).await
            {
                debug!(run_id, error = %e, "Late stop skipped");
            }
        }

        Ok(self.db.get_run(run_id).await?)
    }

    // =========================================================================
    // Task operations
    // =========================================================================

    /// Cancel a task permanently, then best-effort stop its running runs.
    ///
    /// Holding the task's admission lock orders the cancel against any
    /// launch: a launch either sees `cancelled_at` or has already inserted
    /// its run, which is then collected and stopped here.
    pub async fn cancel_task(&self, task_id: &str) -> Result<Task, RunError> {
        self.db.get_task(task_id).await?;

        let lock = self.task_lock(task_id).await;
        let collected = {
            let _guard = lock.lock().await;
            self.mark_cancelled(task_id).await
        };
        self.release_task_lock(task_id, lock).await;
        let runs = collected?;

        for run in runs.iter().filter(|r| r.status == RunStatus::Running) {
            if let Err(e) = self.stop(&run.id).await {
                warn!(task_id, run_id = %run.id, error = %e, "Failed to stop run during task cancel");
            }
        }

        Ok(self.db.get_task(task_id).await?)
    }

    /// Set `cancelled_at` and return the task's runs as they stand.
    async fn mark_cancelled(&self, task_id: &str) -> Result<Vec<Run>, RunError> {
        if !self.db.cancel_task(task_id).await? {
            return Err(RunError::conflict(format!("Task {task_id} is already cancelled")));
        }
        info!(task_id, "Task cancelled");
        Ok(self.db.list_runs_for_task(task_id).await?)
    }

    /// Record approval of a task awaiting review. Approved tasks count as
    /// `done` for their dependents.
    pub async fn approve_task(&self, task_id: &str) -> Result<Task, RunError> {
        let view = self.task_status(task_id).await?;
        match view.status {
            TaskStatus::NeedsReview => {}
            TaskStatus::Cancelled => {
                return Err(RunError::conflict(format!("Task {task_id} is cancelled")));
            }
            other => {
                return Err(RunError::precondition(format!(
                    "Task {task_id} is not awaiting review (status: {other})"
                )));
            }
        }

        if self.db.approve_task(task_id).await? {
            info!(task_id, "Task approved");
        }
        Ok(self.db.get_task(task_id).await?)
    }

    /// Derive a task's status from current data.
    pub async fn task_status(&self, task_id: &str) -> Result<TaskStatusView, RunError> {
        let task = self.db.get_task(task_id).await?;
        let runs = self.db.list_runs_for_task(task_id).await?;
        let dependencies = self.dependency_statuses(task_id).await?;

        let (status, reasons) = derive_task_status(&task, &runs, &dependencies);
        Ok(TaskStatusView {
            task_id: task.id,
            status,
            reasons,
        })
    }

    /// Definition-of-done summary for a run, from its recorded checks.
    pub async fn dod_status(&self, run_id: &str) -> Result<DodStatus, RunError> {
        self.db.get_run(run_id).await?;
        let checks = self.db.list_checks(run_id).await?;
        Ok(dod_status(&checks))
    }

    /// Statuses of the tasks `task_id` depends on. Only approval makes a
    /// dependency `done`, so a dependency's own dependencies are not needed.
    async fn dependency_statuses(&self, task_id: &str) -> Result<Vec<TaskStatus>, DatabaseError> {
        let mut statuses = Vec::new();
        for dep in self.db.list_dependencies(task_id).await? {
            let runs = self.db.list_runs_for_task(&dep.id).await?;
            statuses.push(dependency_status(&dep, &runs, &[]));
        }
        Ok(statuses)
    }

    // =========================================================================
    // Shared launch path
    // =========================================================================

    async fn task_lock(&self, task_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.task_locks.lock().await;
        Arc::clone(locks.entry(task_id.to_string()).or_default())
    }

    /// Drop the map entry once the last user lets go of it.
    async fn release_task_lock(&self, task_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.task_locks.lock().await;
        // One reference in the map, one held here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(task_id);
        }
    }

    #[cfg(test)]
    async fn task_lock_count(&self) -> usize {
        self.task_locks.lock().await.len()
    }

    /// The part of a launch that runs under the task's admission lock.
    /// Cancellation is re-read here so a concurrent `cancel_task` is either
    /// seen or sees the inserted run.
    async fn admit(
        &self,
        task_id: &str,
        repo_path: &str,
        agent_profile_id: &str,
        scope: Vec<String>,
        role: Option<RunRole>,
    ) -> Result<(Run, ProvisionedWorktree), RunError> {
        if self.db.get_task(task_id).await?.cancelled_at.is_some() {
            return Err(RunError::conflict(format!("Task {task_id} is cancelled")));
        }
        if let Some(running) = self.db.running_run_for_task(task_id).await? {
            return Err(RunError::conflict(format!(
                "Task {task_id} already has a running run ({})",
                running.id
            )));
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let repo_path = Path::new(repo_path);
        let worktree = self.provisioner.provision(repo_path, task_id, &run_id).await?;

        let log_ref = self
            .log_dir
            .as_ref()
            .map(|dir| dir.join(format!("{run_id}.ndjson")).to_string_lossy().into_owned());

        let inserted = self
            .db
            .insert_run(NewRun {
                id: run_id.clone(),
                task_id: task_id.to_string(),
                agent_profile_id: agent_profile_id.to_string(),
                branch_name: worktree.branch_name.clone(),
                worktree_path: worktree.path.to_string_lossy().into_owned(),
                head_sha: worktree.head_sha.clone(),
                scope_snapshot: scope,
                role,
                log_ref,
            })
            .await;

        match inserted {
            Ok(run) => Ok((run, worktree)),
            Err(e) => {
                warn!(task_id, run_id = %run_id, error = %e, "Run insert failed, removing worktree");
                self.provisioner.remove(repo_path, &worktree).await;
                Err(e.into())
            }
        }
    }

    async fn launch(&self, plan: LaunchPlan) -> Result<Run, RunError> {
        let task = self.db.get_task(&plan.task_id).await?;
        if task.cancelled_at.is_some() {
            return Err(RunError::conflict(format!("Task {} is cancelled", task.id)));
        }

        let scope = plan.scope.unwrap_or_else(|| task.write_scope.clone());
        if scope.is_empty() {
            return Err(RunError::precondition(format!(
                "Task {} has an empty write scope",
                task.id
            )));
        }
        WriteScope::new(&scope).map_err(|e| RunError::validation(e.to_string()))?;

        let profile = self.db.get_agent_profile(&plan.agent_profile_id).await?;
        if profile.project_id != task.project_id {
            return Err(RunError::validation(format!(
                "Agent profile {} belongs to another project",
                profile.id
            )));
        }
        let project = self.db.get_project(&task.project_id).await?;

        let descriptor = self.manager.descriptor(&profile.runner).ok_or_else(|| {
            RunError::validation(format!("Unknown runner: {}", profile.runner))
        })?;
        let model = profile.model.clone().filter(|m| !m.is_empty());
        if let Some(model) = model.as_deref()
            && !descriptor.capabilities.accepts_model(model)
        {
            return Err(RunError::validation(format!(
                "Runner {} does not accept model {model}",
                descriptor.name
            )));
        }

        let memory = self
            .db
            .top_memory(&project.id, self.memory_limit)
            .await?;
        let prompt = assemble_prompt(&task, profile.prompt_template.as_deref(), &memory, &scope);

        let lock = self.task_lock(&task.id).await;
        let admitted = {
            let _guard = lock.lock().await;
            self.admit(&task.id, &project.repo_path, &profile.id, scope, plan.role)
                .await
        };
        self.release_task_lock(&task.id, lock).await;
        let (run, worktree) = admitted?;
        let run_id = run.id.clone();

        info!(
            run_id = %run_id,
            task_id = %task.id,
            runner = %profile.runner,
            branch = %worktree.branch_name,
            "Run admitted"
        );

        let request = StartRequest {
            run_id: run_id.clone(),
            worktree_path: worktree.path,
            prompt,
            model,
            env: HashMap::from([
                ("AGENTRY_RUN_ID".to_string(), run_id.clone()),
                ("AGENTRY_TASK_ID".to_string(), task.id.clone()),
            ]),
            config: profile.config,
        };
        let manager = self.manager.clone();
        let db = self.db.clone();
        let runner = profile.runner;
        self.manager.spawn_tracked(async move {
            if let Err(e) = manager.start(&runner, request).await {
                error!(run_id = %run_id, runner = %runner, error = %e, "Failed to start run process");
                return;
            }
            // A stop that arrived before the handle was registered cancelled
            // the row directly; the process must not outlive it.
            if let Ok(run) = db.get_run(&run_id).await
                && run.status == RunStatus::Cancelled
            {
                debug!(run_id = %run_id, "Run cancelled during start, stopping process");
                if let Err(e) = manager.stop(&run_id).await {
                    debug!(run_id = %run_id, error = %e, "Late stop skipped");
                }
            }
        });

        Ok(run)
    }
}
