//! Configuration resolution for agentry.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (<platform config dir>/agentry/settings.json)
//! 3. Project config (<repo>/.agentry/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (applied by the binary, highest priority)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete agentry configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub runners: RunnersConfig,
    #[serde(default)]
    pub prompt: PromptConfig,
}

/// Daemon-wide paths and logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub database_path: Option<PathBuf>,
    /// Scratch root under which run worktrees are created.
    pub worktree_dir: Option<PathBuf>,
    /// Directory for per-run NDJSON output logs.
    pub log_dir: Option<PathBuf>,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            worktree_dir: None,
            log_dir: None,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

/// External runner binaries and process supervision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnersConfig {
    pub claude_bin: PathBuf,
    pub codex_bin: PathBuf,
    /// Seconds between graceful termination and force kill.
    pub stop_grace_secs: u64,
}

impl Default for RunnersConfig {
    fn default() -> Self {
        Self {
            claude_bin: PathBuf::from("claude"),
            codex_bin: PathBuf::from("codex"),
            stop_grace_secs: 5,
        }
    }
}

/// Prompt assembly settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    /// Number of project memory entries included in a run prompt.
    pub memory_limit: u32,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self { memory_limit: 10 }
    }
}

impl Config {
    /// Database path, falling back to the platform data directory.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.daemon
            .database_path
            .clone()
            .or_else(|| data_dir().map(|d| d.join("agentry.db")))
    }

    /// Worktree scratch root, falling back to the platform data directory.
    pub fn worktree_dir(&self) -> PathBuf {
        self.daemon.worktree_dir.clone().unwrap_or_else(|| {
            data_dir().map_or_else(
                || std::env::temp_dir().join("agentry-worktrees"),
                |d| d.join("worktrees"),
            )
        })
    }

    /// Run log directory, falling back to the platform data directory.
    pub fn log_dir(&self) -> PathBuf {
        self.daemon.log_dir.clone().unwrap_or_else(|| {
            data_dir().map_or_else(
                || std::env::temp_dir().join("agentry-logs"),
                |d| d.join("logs"),
            )
        })
    }
}

/// Load configuration with hierarchical resolution.
///
/// Each settings file overrides only the keys it sets; everything else
/// keeps the value from the layer below.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut layers = Vec::new();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        layers.push(global_path);
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".agentry").join("settings.json");
        if project_path.exists() {
            layers.push(project_path);
        }
    }

    let mut config = resolve_layers(&layers)?;
    apply_env_overrides(&mut config);

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("agentry").join("settings.json"))
}

fn config_dir() -> Option<PathBuf> {
    dirs::config_dir()
}

fn data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("agentry"))
}

/// Defaults with each file in `paths` merged over them in order.
fn resolve_layers(paths: &[PathBuf]) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;
    for path in paths {
        merge_json(&mut merged, read_layer(path)?);
    }
    serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Failed to resolve configuration: {e}")))
}

/// Read one settings file as raw JSON, rejecting anything that would not
/// deserialize as a [`Config`] on its own.
fn read_layer(path: &Path) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let value: serde_json::Value = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    Config::deserialize(&value).map_err(|e| {
        Error::Config(format!("Invalid config file {}: {}", path.display(), e))
    })?;
    Ok(value)
}

/// Recursive per-key merge. Objects merge; any other overlay value
/// replaces the base value.
fn merge_json(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("AGENTRY_DB_PATH") {
        config.daemon.database_path = Some(PathBuf::from(val));
    }
    if let Ok(val) = std::env::var("AGENTRY_WORKTREE_DIR") {
        config.daemon.worktree_dir = Some(PathBuf::from(val));
    }
    if let Ok(val) = std::env::var("AGENTRY_LOG_LEVEL") {
        config.daemon.log_level = val;
    }
    if let Ok(val) = std::env::var("AGENTRY_CLAUDE_BIN") {
        config.runners.claude_bin = PathBuf::from(val);
    }
    if let Ok(val) = std::env::var("AGENTRY_CODEX_BIN") {
        config.runners.codex_bin = PathBuf::from(val);
    }
    if let Ok(val) = std::env::var("AGENTRY_STOP_GRACE_SECS")
        && let Ok(n) = val.parse()
    {
        config.runners.stop_grace_secs = n;
    }
    if let Ok(val) = std::env::var("AGENTRY_MEMORY_LIMIT")
        && let Ok(n) = val.parse()
    {
        config.prompt.memory_limit = n;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_grace_is_five_seconds() {
        let config = Config::default();
        assert_eq!(config.runners.stop_grace_secs, 5);
        assert_eq!(config.prompt.memory_limit, 10);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"runners": {"claude_bin": "/opt/claude"}}"#).unwrap();
        assert_eq!(config.runners.claude_bin, PathBuf::from("/opt/claude"));
        assert_eq!(config.runners.codex_bin, PathBuf::from("codex"));
        assert_eq!(config.daemon.log_level, "info");
    }

    fn write_settings(dir: &Path, json: &str) -> PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join("settings.json");
        std::fs::write(&path, json).unwrap();
        path
    }

    #[test]
    fn project_file_overrides_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let project = write_settings(
            &tmp.path().join(".agentry"),
            r#"{"daemon": {"worktree_dir": "/scratch/wt"}, "prompt": {"memory_limit": 3}}"#,
        );

        let config = resolve_layers(&[project]).unwrap();
        assert_eq!(config.worktree_dir(), PathBuf::from("/scratch/wt"));
        assert_eq!(config.prompt.memory_limit, 3);
        assert_eq!(config.runners.stop_grace_secs, 5);
    }

    #[test]
    fn partial_project_file_keeps_global_values() {
        let tmp = tempfile::tempdir().unwrap();
        let global = write_settings(
            &tmp.path().join("global"),
            r#"{
                "daemon": {"log_level": "debug", "log_json": true},
                "runners": {"claude_bin": "/opt/claude", "stop_grace_secs": 30}
            }"#,
        );
        let project = write_settings(
            &tmp.path().join("repo/.agentry"),
            r#"{"prompt": {"memory_limit": 3}}"#,
        );

        let config = resolve_layers(&[global, project]).unwrap();
        assert_eq!(config.prompt.memory_limit, 3);
        assert_eq!(config.daemon.log_level, "debug");
        assert!(config.daemon.log_json);
        assert_eq!(config.runners.claude_bin, PathBuf::from("/opt/claude"));
        assert_eq!(config.runners.stop_grace_secs, 30);
        assert_eq!(config.runners.codex_bin, PathBuf::from("codex"));
    }

    #[test]
    fn project_value_wins_over_global_value() {
        let tmp = tempfile::tempdir().unwrap();
        let global = write_settings(
            &tmp.path().join("global"),
            r#"{"runners": {"claude_bin": "/opt/claude", "stop_grace_secs": 30}}"#,
        );
        let project = write_settings(
            &tmp.path().join("repo/.agentry"),
            r#"{"runners": {"stop_grace_secs": 2}}"#,
        );

        let config = resolve_layers(&[global, project]).unwrap();
        assert_eq!(config.runners.stop_grace_secs, 2);
        assert_eq!(config.runners.claude_bin, PathBuf::from("/opt/claude"));
    }

    #[test]
    fn malformed_file_is_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(read_layer(&path), Err(Error::Config(_))));

        std::fs::write(&path, r#"{"runners": {"stop_grace_secs": "soon"}}"#).unwrap();
        assert!(matches!(read_layer(&path), Err(Error::Config(_))));
    }
}
