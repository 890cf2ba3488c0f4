//! Structured errors returned by run lifecycle operations.

use serde::Serialize;

use crate::runner::ManagerError;
use crate::storage::DatabaseError;
use crate::worktree::WorktreeError;

/// Machine-readable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    PreconditionFailed,
    Conflict,
    NotFound,
    WorktreeError,
    Internal,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::PreconditionFailed => "PRECONDITION_FAILED",
            Self::Conflict => "CONFLICT",
            Self::NotFound => "NOT_FOUND",
            Self::WorktreeError => "WORKTREE_ERROR",
            Self::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{code, message}` failure of a synchronous lifecycle operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RunError {
    pub code: ErrorCode,
    pub message: String,
}

impl RunError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PreconditionFailed, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Conflict, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }
}

impl From<DatabaseError> for RunError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound(what) => Self::not_found(format!("{what} not found")),
            DatabaseError::Conflict(msg) => Self::conflict(msg),
            other => Self::new(ErrorCode::Internal, other.to_string()),
        }
    }
}

impl From<WorktreeError> for RunError {
    fn from(e: WorktreeError) -> Self {
        Self::new(ErrorCode::WorktreeError, e.to_string())
    }
}

impl From<ManagerError> for RunError {
    fn from(e: ManagerError) -> Self {
        match e {
            ManagerError::Database(db) => db.into(),
            ManagerError::NotRunning(id) => Self::conflict(format!("Run {id} is not running")),
            other => Self::new(ErrorCode::Internal, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialises_as_code_and_message() {
        let json = serde_json::to_value(RunError::precondition("empty scope")).unwrap_or_default();
        assert_eq!(json, serde_json::json!({"code": "PRECONDITION_FAILED", "message": "empty scope"}));
    }

    #[test]
    fn database_errors_map_to_codes() {
        assert_eq!(
            RunError::from(DatabaseError::NotFound("Task t1".into())).code,
            ErrorCode::NotFound
        );
        assert_eq!(
            RunError::from(DatabaseError::Conflict("dup".into())).code,
            ErrorCode::Conflict
        );
        assert_eq!(
            RunError::from(DatabaseError::Query("boom".into())).code,
            ErrorCode::Internal
        );
    }

    #[test]
    fn worktree_errors_are_worktree_code() {
        let e = RunError::from(WorktreeError::Git("fatal".into()));
        assert_eq!(e.code, ErrorCode::WorktreeError);
        assert_eq!(e.to_string(), "WORKTREE_ERROR: Git command failed: fatal");
    }
}
