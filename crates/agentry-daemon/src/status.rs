//! Task status derivation.
//!
//! A task's status is never stored. It is recomputed on every read from the
//! task row, the statuses of the tasks it depends on, and its run history.

use serde::Serialize;

use crate::storage::{Check, CheckStatus, Run, RunStatus, Task};

/// Reason attached when a dependency has not resolved to `done`.
pub const REASON_BLOCKED_BY_DEPENDENCY: &str = "blocked_by_dependency";
/// Reason attached when every finished run failed.
pub const REASON_LAST_RUN_FAILED: &str = "last_run_failed";
/// Reason attached when a run completed and awaits approval.
pub const REASON_PENDING_REVIEW: &str = "pending_review";

/// Externally visible task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Cancelled,
    Blocked,
    Running,
    Failed,
    NeedsReview,
    Ready,
    Open,
    /// Only reachable through explicit approval; [`derive_task_status`]
    /// never returns it.
    Done,
}

impl TaskStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Blocked => "blocked",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::NeedsReview => "needs_review",
            Self::Ready => "ready",
            Self::Open => "open",
            Self::Done => "done",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status and reasons for one task, as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusView {
    pub task_id: String,
    pub status: TaskStatus,
    pub reasons: Vec<&'static str>,
}

/// Derive a task's status.
///
/// Rules apply in order and the first match wins:
/// cancelled, blocked by any dependency not `done`, running, failed with no
/// completed run, needs review, ready when there are no runs, open.
pub fn derive_task_status(
    task: &Task,
    runs: &[Run],
    dependency_statuses: &[TaskStatus],
) -> (TaskStatus, Vec<&'static str>) {
    if task.cancelled_at.is_some() {
        return (TaskStatus::Cancelled, Vec::new());
    }

    if dependency_statuses.iter().any(|s| *s != TaskStatus::Done) {
        return (TaskStatus::Blocked, vec![REASON_BLOCKED_BY_DEPENDENCY]);
    }

    let has = |status: RunStatus| runs.iter().any(|r| r.status == status);

    if has(RunStatus::Running) {
        return (TaskStatus::Running, Vec::new());
    }

    let completed = has(RunStatus::Completed);
    if has(RunStatus::Failed) && !completed {
        return (TaskStatus::Failed, vec![REASON_LAST_RUN_FAILED]);
    }
    if completed {
        return (TaskStatus::NeedsReview, vec![REASON_PENDING_REVIEW]);
    }

    if runs.is_empty() {
        (TaskStatus::Ready, Vec::new())
    } else {
        (TaskStatus::Open, Vec::new())
    }
}

/// Status of a task when seen as someone else's dependency.
///
/// Approval is the only route to `done`; otherwise the derived status is
/// used unchanged (and therefore blocks dependents).
pub fn dependency_status(task: &Task, runs: &[Run], dependency_statuses: &[TaskStatus]) -> TaskStatus {
    if task.cancelled_at.is_none() && task.approved_at.is_some() {
        return TaskStatus::Done;
    }
    derive_task_status(task, runs, dependency_statuses).0
}

/// Definition-of-done summary over a run's checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DodStatus {
    Passed,
    Failed,
    Pending,
}

/// Failed if any check failed, passed if at least one exists and all
/// passed, pending otherwise.
pub fn dod_status(checks: &[Check]) -> DodStatus {
    if checks.iter().any(|c| c.status == CheckStatus::Failed) {
        DodStatus::Failed
    } else if !checks.is_empty() && checks.iter().all(|c| c.status == CheckStatus::Passed) {
        DodStatus::Passed
    } else {
        DodStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task {
            id: "t1".into(),
            project_id: "p1".into(),
            parent_id: None,
            title: "Task".into(),
            description: String::new(),
            write_scope: vec!["src/**".into()],
            cancelled_at: None,
            approved_at: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn run(status: RunStatus) -> Run {
        Run {
            id: format!("r-{status}"),
            task_id: "t1".into(),
            agent_profile_id: "ap1".into(),
            status,
            exit_code: None,
            started_at: 0,
            finished_at: None,
            cancelled_at: None,
            branch_name: None,
            worktree_path: None,
            head_sha: None,
            scope_snapshot: Vec::new(),
            role: None,
            log_ref: None,
        }
    }

    fn check(status: CheckStatus) -> Check {
        Check {
            id: 1,
            run_id: "r1".into(),
            name: "tests".into(),
            status,
            output: None,
            created_at: 0,
        }
    }

    #[test]
    fn no_runs_is_ready() {
        assert_eq!(derive_task_status(&task(), &[], &[]), (TaskStatus::Ready, vec![]));
    }

    #[test]
    fn cancelled_wins_over_everything() {
        let mut t = task();
        t.cancelled_at = Some(1);
        let runs = [run(RunStatus::Running)];
        let (status, reasons) = derive_task_status(&t, &runs, &[TaskStatus::Blocked]);
        assert_eq!(status, TaskStatus::Cancelled);
        assert!(reasons.is_empty());
    }

    #[test]
    fn unresolved_dependency_blocks_even_when_running() {
        let runs = [run(RunStatus::Running)];
        let (status, reasons) =
            derive_task_status(&task(), &runs, &[TaskStatus::Done, TaskStatus::NeedsReview]);
        assert_eq!(status, TaskStatus::Blocked);
        assert_eq!(reasons, vec![REASON_BLOCKED_BY_DEPENDENCY]);
    }

    #[test]
    fn done_dependencies_do_not_block() {
        let (status, _) = derive_task_status(&task(), &[], &[TaskStatus::Done]);
        assert_eq!(status, TaskStatus::Ready);
    }

    #[test]
    fn running_run_reports_running() {
        let runs = [run(RunStatus::Failed), run(RunStatus::Running)];
        assert_eq!(derive_task_status(&task(), &runs, &[]).0, TaskStatus::Running);
    }

    #[test]
    fn only_failures_report_failed() {
        let runs = [run(RunStatus::Failed), run(RunStatus::Cancelled)];
        assert_eq!(
            derive_task_status(&task(), &runs, &[]),
            (TaskStatus::Failed, vec![REASON_LAST_RUN_FAILED])
        );
    }

    #[test]
    fn any_completion_needs_review() {
        let runs = [run(RunStatus::Failed), run(RunStatus::Completed)];
        assert_eq!(
            derive_task_status(&task(), &runs, &[]),
            (TaskStatus::NeedsReview, vec![REASON_PENDING_REVIEW])
        );
    }

    #[test]
    fn only_cancelled_runs_is_open() {
        let runs = [run(RunStatus::Cancelled)];
        assert_eq!(derive_task_status(&task(), &runs, &[]).0, TaskStatus::Open);
    }

    #[test]
    fn derivation_is_deterministic() {
        let runs = [run(RunStatus::Completed)];
        let deps = [TaskStatus::Done];
        assert_eq!(
            derive_task_status(&task(), &runs, &deps),
            derive_task_status(&task(), &runs, &deps)
        );
    }

    #[test]
    fn approval_makes_a_dependency_done() {
        let mut t = task();
        let runs = [run(RunStatus::Completed)];
        assert_eq!(dependency_status(&t, &runs, &[]), TaskStatus::NeedsReview);
        t.approved_at = Some(5);
        assert_eq!(dependency_status(&t, &runs, &[]), TaskStatus::Done);
        t.cancelled_at = Some(6);
        assert_eq!(dependency_status(&t, &runs, &[]), TaskStatus::Cancelled);
    }

    #[test]
    fn dod_summary() {
        assert_eq!(dod_status(&[]), DodStatus::Pending);
        assert_eq!(dod_status(&[check(CheckStatus::Passed)]), DodStatus::Passed);
        assert_eq!(
            dod_status(&[check(CheckStatus::Passed), check(CheckStatus::Pending)]),
            DodStatus::Pending
        );
        assert_eq!(
            dod_status(&[check(CheckStatus::Pending), check(CheckStatus::Failed)]),
            DodStatus::Failed
        );
    }

    #[test]
    fn status_serialises_snake_case() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::NeedsReview).unwrap_or_default(),
            "\"needs_review\""
        );
    }
}
