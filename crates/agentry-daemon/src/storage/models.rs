//! Database models for the agentry daemon.

use serde::{Deserialize, Serialize};

/// Project record: the repository runs are provisioned against.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub repo_path: String,
    pub created_at: i64,
}

/// Task record. Status is never stored; see [`crate::status`].
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub project_id: String,
    pub parent_id: Option<String>,
    pub title: String,
    pub description: String,
    /// Path globs the agent may modify.
    #[sqlx(json)]
    pub write_scope: Vec<String>,
    /// Permanent once set.
    pub cancelled_at: Option<i64>,
    /// Set by an explicit review/approval; the only route to "done".
    pub approved_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields for inserting a task.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub id: String,
    pub project_id: String,
    pub parent_id: Option<String>,
    pub title: String,
    pub description: String,
    pub write_scope: Vec<String>,
}

/// Partial task update; `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub write_scope: Option<Vec<String>>,
}

/// Reusable agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfile {
    pub id: String,
    pub project_id: String,
    pub name: String,
    /// Adapter registry key.
    pub runner: String,
    pub model: Option<String>,
    pub prompt_template: Option<String>,
    /// Adapter-specific free-form settings.
    #[sqlx(json)]
    pub config: serde_json::Value,
    #[sqlx(json)]
    pub default_exclude: Vec<String>,
    pub created_at: i64,
}

/// Stored, authoritative run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Terminal status for a process exit code.
    pub const fn from_exit_code(code: i32) -> Self {
        if code == 0 { Self::Completed } else { Self::Failed }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Role a run plays for its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum RunRole {
    Coordinator,
    Worker,
    Reviewer,
}

/// One execution attempt of an agent profile against a task.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub task_id: String,
    pub agent_profile_id: String,
    pub status: RunStatus,
    pub exit_code: Option<i64>,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub cancelled_at: Option<i64>,
    pub branch_name: Option<String>,
    pub worktree_path: Option<String>,
    pub head_sha: Option<String>,
    /// Write scope captured at launch; never updated afterwards.
    #[sqlx(json)]
    pub scope_snapshot: Vec<String>,
    pub role: Option<RunRole>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_ref: Option<String>,
}

/// Fields for inserting a run. Runs are always inserted as running.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub id: String,
    pub task_id: String,
    pub agent_profile_id: String,
    pub branch_name: String,
    pub worktree_path: String,
    pub head_sha: Option<String>,
    pub scope_snapshot: Vec<String>,
    pub role: Option<RunRole>,
    pub log_ref: Option<String>,
}

/// Outcome of a single definition-of-done check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum CheckStatus {
    Passed,
    Failed,
    Pending,
}

/// Check record attached to a run.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Check {
    pub id: i64,
    pub run_id: String,
    pub name: String,
    pub status: CheckStatus,
    pub output: Option<String>,
    pub created_at: i64,
}

/// A path a run modified outside its scope snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ScopeViolation {
    pub id: i64,
    pub run_id: String,
    pub path: String,
    pub created_at: i64,
}

/// Project memory entry surfaced in run prompts.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMemory {
    pub id: String,
    pub project_id: String,
    pub memory_type: String,
    pub content: String,
    pub relevance: f64,
    pub active: bool,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_maps_to_terminal_status() {
        assert_eq!(RunStatus::from_exit_code(0), RunStatus::Completed);
        assert_eq!(RunStatus::from_exit_code(1), RunStatus::Failed);
        assert_eq!(RunStatus::from_exit_code(-1), RunStatus::Failed);
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }
}
