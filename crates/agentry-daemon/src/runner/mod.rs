//! Runner adapters and the manager that supervises them.
//!
//! An adapter turns a generic [`StartRequest`] into a concrete external CLI
//! invocation and streams its output back as [`OutputEvent`]s. The
//! [`RunnerManager`] owns the adapter registry and every live run.

mod claude;
mod codex;
mod manager;
pub mod process;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use claude::ClaudeAdapter;
pub use codex::CodexAdapter;
pub use manager::{ManagerError, RunnerManager};
pub use process::{ProcessSpec, RunHandle, StartedRun};

/// Grace period between graceful termination and force kill.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Errors from adapter operations.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("Worktree path does not exist: {0}")]
    MissingWorktree(String),
}

/// What an adapter can do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub supports_model: bool,
    pub supports_non_interactive: bool,
    pub supports_prompt_file_inclusion: bool,
    /// Empty means any model name is accepted.
    pub available_models: Vec<String>,
}

impl Capabilities {
    /// Whether `model` may be requested from this adapter.
    pub fn accepts_model(&self, model: &str) -> bool {
        self.supports_model
            && (self.available_models.is_empty() || self.available_models.iter().any(|m| m == model))
    }
}

/// Capability descriptor published for each registered adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterDescriptor {
    pub name: String,
    pub display_name: String,
    pub capabilities: Capabilities,
}

/// Generic request to start an agent process.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub run_id: String,
    pub worktree_path: PathBuf,
    pub prompt: String,
    pub model: Option<String>,
    /// Layered over the daemon's environment.
    pub env: HashMap<String, String>,
    /// Adapter-specific settings; unknown keys are ignored.
    pub config: serde_json::Value,
}

/// Kind of an [`OutputEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Stdout,
    Stderr,
    Exit,
}

/// One timestamped item of a run's output stream. `exit` is always last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputEvent {
    #[serde(rename = "type")]
    pub kind: OutputKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub timestamp: DateTime<Utc>,
}

impl OutputEvent {
    pub fn stdout(line: impl Into<String>) -> Self {
        Self::line(OutputKind::Stdout, line.into())
    }

    pub fn stderr(line: impl Into<String>) -> Self {
        Self::line(OutputKind::Stderr, line.into())
    }

    pub fn exit(code: i32) -> Self {
        Self {
            kind: OutputKind::Exit,
            data: None,
            exit_code: Some(code),
            timestamp: Utc::now(),
        }
    }

    fn line(kind: OutputKind, data: String) -> Self {
        Self {
            kind,
            data: Some(data),
            exit_code: None,
            timestamp: Utc::now(),
        }
    }
}

/// Boundary between the generic run lifecycle and one external CLI tool.
#[async_trait]
pub trait RunnerAdapter: Send + Sync {
    /// Registry key, display name and capabilities.
    fn descriptor(&self) -> AdapterDescriptor;

    /// Spawn the process and return immediately with its handle and event
    /// stream.
    async fn start(&self, request: StartRequest) -> Result<StartedRun, AdapterError>;

    /// Wait between graceful termination and force kill.
    fn stop_grace(&self) -> Duration {
        DEFAULT_STOP_GRACE
    }

    /// Graceful termination, then force kill after [`Self::stop_grace`].
    /// Resolves without error on an already-exited process.
    async fn stop(&self, handle: &RunHandle) {
        handle.stop(self.stop_grace()).await;
    }
}

/// Read a string setting from adapter config.
pub(crate) fn config_str<'a>(config: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    config.get(key).and_then(serde_json::Value::as_str).filter(|s| !s.is_empty())
}

/// Read a boolean setting; anything but `true` counts as unset.
pub(crate) fn config_flag(config: &serde_json::Value, key: &str) -> bool {
    config.get(key).and_then(serde_json::Value::as_bool).unwrap_or(false)
}
