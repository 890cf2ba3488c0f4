//! Codex CLI adapter.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use super::process::{self, ProcessSpec, StartedRun};
use super::{
    AdapterDescriptor, AdapterError, Capabilities, DEFAULT_STOP_GRACE, RunnerAdapter,
    StartRequest, config_flag, config_str,
};

/// Runs `codex exec` non-interactively; the prompt is the final argument.
pub struct CodexAdapter {
    bin: PathBuf,
    stop_grace: Duration,
}

impl CodexAdapter {
    pub const NAME: &'static str = "codex";

    pub fn new(bin: PathBuf) -> Self {
        Self {
            bin,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    #[must_use]
    pub const fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Recognised config keys: `sandbox`, `fullAuto`, `reasoningEffort`,
    /// `json`.
    pub fn build_args(request: &StartRequest) -> Vec<String> {
        let config = &request.config;
        let mut args: Vec<String> = ["exec", "--color", "never", "--skip-git-repo-check"]
            .into_iter()
            .map(String::from)
            .collect();

        if let Some(model) = request.model.as_deref().filter(|m| !m.is_empty()) {
            args.extend(["--model".to_string(), model.to_string()]);
        }
        if let Some(sandbox) = config_str(config, "sandbox") {
            args.extend(["--sandbox".to_string(), sandbox.to_string()]);
        }
        if config_flag(config, "fullAuto") {
            args.push("--full-auto".to_string());
        }
        if let Some(effort) = config_str(config, "reasoningEffort") {
            args.extend(["-c".to_string(), format!("model_reasoning_effort={effort}")]);
        }
        if config_flag(config, "json") {
            args.push("--json".to_string());
        }

        args.push(request.prompt.clone());
        args
    }
}

#[async_trait]
impl RunnerAdapter for CodexAdapter {
    fn descriptor(&self) -> AdapterDescriptor {
        AdapterDescriptor {
            name: Self::NAME.to_string(),
            display_name: "Codex CLI".to_string(),
            capabilities: Capabilities {
                supports_model: true,
                supports_non_interactive: true,
                supports_prompt_file_inclusion: false,
                available_models: Vec::new(),
            },
        }
    }

    async fn start(&self, request: StartRequest) -> Result<StartedRun, AdapterError> {
        let spec = ProcessSpec {
            program: self.bin.clone(),
            args: Self::build_args(&request),
            cwd: request.worktree_path.clone(),
            env: request.env.clone(),
        };
        process::spawn(&request.run_id, spec)
    }

    fn stop_grace(&self) -> Duration {
        self.stop_grace
    }
}
