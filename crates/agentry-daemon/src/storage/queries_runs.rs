//! Database queries for runs and their check / scope-violation records.
//!
//! Terminal transitions are conditional on `status = 'running'`: the first
//! terminal writer wins and terminal runs are never rewritten.

use agentry_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::{Check, CheckStatus, NewRun, Run, RunStatus, ScopeViolation};

impl Database {
    // =========================================================================
    // Run queries
    // =========================================================================

    /// Insert a run with status `running`.
    ///
    /// Fails with [`DatabaseError::Conflict`] if the task already has a
    /// running run; the partial unique index makes this check atomic.
    pub async fn insert_run(&self, run: NewRun) -> Result<Run, DatabaseError> {
        let scope_snapshot = serde_json::to_string(&run.scope_snapshot)?;

        sqlx::query(
            r"
            INSERT INTO runs (
                id, task_id, agent_profile_id, status, started_at,
                branch_name, worktree_path, head_sha, scope_snapshot, role, log_ref, seq
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM runs))
            ",
        )
        .bind(&run.id)
        .bind(&run.task_id)
        .bind(&run.agent_profile_id)
        .bind(RunStatus::Running)
        .bind(unix_timestamp())
        .bind(&run.branch_name)
        .bind(&run.worktree_path)
        .bind(&run.head_sha)
        .bind(scope_snapshot)
        .bind(run.role)
        .bind(&run.log_ref)
        .execute(self.pool())
        .await?;

        self.get_run(&run.id).await
    }

    /// Get a run by ID.
    pub async fn get_run(&self, id: &str) -> Result<Run, DatabaseError> {
        sqlx::query_as::<_, Run>("SELECT * FROM runs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Run {id}")))
    }

    /// All runs for a task, oldest first.
    pub async fn list_runs_for_task(&self, task_id: &str) -> Result<Vec<Run>, DatabaseError> {
        let runs = sqlx::query_as::<_, Run>("SELECT * FROM runs WHERE task_id = ? ORDER BY seq ASC")
            .bind(task_id)
            .fetch_all(self.pool())
            .await?;

        Ok(runs)
    }

    /// The task's running run, if any.
    pub async fn running_run_for_task(&self, task_id: &str) -> Result<Option<Run>, DatabaseError> {
        let run = sqlx::query_as::<_, Run>(
            "SELECT * FROM runs WHERE task_id = ? AND status = 'running' LIMIT 1",
        )
        .bind(task_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(run)
    }

    /// Record process exit: completed on code 0, failed otherwise.
    ///
    /// Returns `false` if the run was no longer running.
    pub async fn finish_run(&self, id: &str, exit_code: i32) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            r"
            UPDATE runs SET status = ?, exit_code = ?, finished_at = ?
            WHERE id = ? AND status = 'running'
            ",
        )
        .bind(RunStatus::from_exit_code(exit_code))
        .bind(i64::from(exit_code))
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Mark a running run cancelled. Returns `false` if it was not running.
    pub async fn cancel_run(&self, id: &str) -> Result<bool, DatabaseError> {
        let now = unix_timestamp();
        let result = sqlx::query(
            r"
            UPDATE runs SET status = 'cancelled', cancelled_at = ?, finished_at = ?
            WHERE id = ? AND status = 'running'
            ",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Fail every run still marked running.
    ///
    /// Called once at daemon start: no process from a previous daemon can
    /// still be supervised, so these rows are stale.
    pub async fn fail_stale_runs(&self) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            "UPDATE runs SET status = 'failed', finished_at = ? WHERE status = 'running'",
        )
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected())
    }

    // =========================================================================
    // Check queries
    // =========================================================================

    /// Attach a check result to a run.
    pub async fn insert_check(
        &self,
        run_id: &str,
        name: &str,
        status: CheckStatus,
        output: Option<&str>,
    ) -> Result<Check, DatabaseError> {
        let id = sqlx::query(
            "INSERT INTO checks (run_id, name, status, output, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(run_id)
        .bind(name)
        .bind(status)
        .bind(output)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?
        .last_insert_rowid();

        sqlx::query_as::<_, Check>("SELECT * FROM checks WHERE id = ?")
            .bind(id)
            .fetch_one(self.pool())
            .await
            .map_err(Into::into)
    }

    /// Checks recorded for a run, oldest first.
    pub async fn list_checks(&self, run_id: &str) -> Result<Vec<Check>, DatabaseError> {
        let checks = sqlx::query_as::<_, Check>("SELECT * FROM checks WHERE run_id = ? ORDER BY id")
            .bind(run_id)
            .fetch_all(self.pool())
            .await?;

        Ok(checks)
    }

    // =========================================================================
    // Scope violation queries
    // =========================================================================

    /// Record an out-of-scope path. Duplicate paths for a run are ignored.
    pub async fn insert_scope_violation(
        &self,
        run_id: &str,
        path: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT OR IGNORE INTO scope_violations (run_id, path, created_at) VALUES (?, ?, ?)",
        )
        .bind(run_id)
        .bind(path)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Scope violations recorded for a run.
    pub async fn list_scope_violations(
        &self,
        run_id: &str,
    ) -> Result<Vec<ScopeViolation>, DatabaseError> {
        let violations = sqlx::query_as::<_, ScopeViolation>(
            "SELECT * FROM scope_violations WHERE run_id = ? ORDER BY id",
        )
        .bind(run_id)
        .fetch_all(self.pool())
        .await?;

        Ok(violations)
    }
}
