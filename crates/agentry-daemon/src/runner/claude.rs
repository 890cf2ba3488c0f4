//! Claude Code CLI adapter.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use super::process::{self, ProcessSpec, StartedRun};
use super::{
    AdapterDescriptor, AdapterError, Capabilities, DEFAULT_STOP_GRACE, RunnerAdapter,
    StartRequest, config_flag, config_str,
};

/// Runs `claude -p <prompt>` headless with stream-json output.
pub struct ClaudeAdapter {
    bin: PathBuf,
    stop_grace: Duration,
}

impl ClaudeAdapter {
    pub const NAME: &'static str = "claude";

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

    /// Command-line arguments for a request.
    ///
    /// Recognised config keys: `allowedTools`, `permissionMode`,
    /// `skipPermissions`, `maxTurns`, `appendSystemPrompt`.
    pub fn build_args(request: &StartRequest) -> Vec<String> {
        let config = &request.config;
        let mut args = vec![
            "-p".to_string(),
            request.prompt.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];

        if let Some(model) = request.model.as_deref().filter(|m| !m.is_empty()) {
            args.extend(["--model".to_string(), model.to_string()]);
        }

        let tools: Vec<&str> = config
            .get("allowedTools")
            .and_then(serde_json::Value::as_array)
            .map(|list| list.iter().filter_map(serde_json::Value::as_str).collect())
            .unwrap_or_default();
        if !tools.is_empty() {
            args.extend(["--allowedTools".to_string(), tools.join(",")]);
        }

        if let Some(mode) = config_str(config, "permissionMode") {
            args.extend(["--permission-mode".to_string(), mode.to_string()]);
        }
        if config_flag(config, "skipPermissions") {
            args.push("--dangerously-skip-permissions".to_string());
        }
        if let Some(turns) = config
            .get("maxTurns")
            .and_then(serde_json::Value::as_u64)
            .filter(|n| *n > 0)
        {
            args.extend(["--max-turns".to_string(), turns.to_string()]);
        }
        if let Some(extra) = config_str(config, "appendSystemPrompt") {
            args.extend(["--append-system-prompt".to_string(), extra.to_string()]);
        }

        args
    }
}

#[async_trait]
impl RunnerAdapter for ClaudeAdapter {
    fn descriptor(&self) -> AdapterDescriptor {
        AdapterDescriptor {
            name: Self::NAME.to_string(),
            display_name: "Claude Code".to_string(),
            capabilities: Capabilities {
                supports_model: true,
                supports_non_interactive: true,
                supports_prompt_file_inclusion: true,
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

#[cfg(test)]
mod tests {
    use super::*;

    fn request(config: serde_json::Value) -> StartRequest {
        StartRequest {
            run_id: "r1".into(),
            prompt: "do it".into(),
            config,
            ..StartRequest::default()
        }
    }

    #[test]
    fn base_invocation() {
        let args = ClaudeAdapter::build_args(&request(serde_json::Value::Null));
        assert_eq!(
            args,
            vec!["-p", "do it", "--output-format", "stream-json", "--verbose"]
        );
    }

    #[test]
    fn config_translates_to_flags() {
        let mut req = request(serde_json::json!({
            "allowedTools": ["Read", "Edit"],
            "permissionMode": "acceptEdits",
            "skipPermissions": true,
            "maxTurns": 7,
            "appendSystemPrompt": "be brief",
        }));
        req.model = Some("sonnet".into());

        let args = ClaudeAdapter::build_args(&req).join(" ");
        assert!(args.contains("--model sonnet"));
        assert!(args.contains("--allowedTools Read,Edit"));
        assert!(args.contains("--permission-mode acceptEdits"));
        assert!(args.contains("--dangerously-skip-permissions"));
        assert!(args.contains("--max-turns 7"));
        assert!(args.contains("--append-system-prompt be brief"));
    }

    #[test]
    fn unknown_and_mistyped_keys_are_ignored() {
        let args = ClaudeAdapter::build_args(&request(serde_json::json!({
            "somethingNew": 1,
            "maxTurns": "many",
            "skipPermissions": "yes",
        })));
        assert_eq!(args.len(), 5);
    }

    #[test]
    fn descriptor_capabilities() {
        let d = ClaudeAdapter::new(PathBuf::from("claude")).descriptor();
        assert_eq!(d.name, "claude");
        assert!(d.capabilities.supports_model);
        assert!(d.capabilities.supports_prompt_file_inclusion);
    }
}
