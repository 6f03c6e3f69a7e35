//! Runtime configuration and the turn fuses.
//!
//! Every bound that keeps a turn finite lives in `Bounds`. Exceeding any of
//! them terminates the turn with an explicit stop reason rather than looping.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Hard ceiling on `max_llm_output_tokens`, regardless of configuration.
pub const OUTPUT_TOKENS_CEILING: usize = 8192;

/// Loop fuses. Defaults match the documented limits; `max_llm_output_tokens`
/// is clamped to [1, `OUTPUT_TOKENS_CEILING`] on construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bounds {
    pub max_plan_steps: usize,
    pub max_step_tool_calls: usize,
    pub max_replans: usize,
    pub max_llm_retries_on_transport: usize,
    pub max_history_messages: usize,
    pub max_llm_output_tokens: usize,
    /// Corrective retries when the model breaks the output protocol.
    pub max_protocol_retries: usize,
    /// Bounded retries for plan parsing before the turn degrades to ReAct.
    pub max_plan_parse_retries: usize,
}

impl Default for Bounds {
    fn default() -> Self {
        Self {
            max_plan_steps: 20,
            max_step_tool_calls: 20,
            max_replans: 3,
            max_llm_retries_on_transport: 2,
            max_history_messages: 30,
            max_llm_output_tokens: 1024,
            max_protocol_retries: 2,
            max_plan_parse_retries: 2,
        }
    }
}

impl Bounds {
    /// Clamp configured values into their legal ranges.
    pub fn normalized(mut self) -> Self {
        self.max_llm_output_tokens = self.max_llm_output_tokens.clamp(1, OUTPUT_TOKENS_CEILING);
        self.max_plan_steps = self.max_plan_steps.max(1);
        self.max_step_tool_calls = self.max_step_tool_calls.max(1);
        self
    }

    /// Upper bound on LLM calls in one turn. No execution path may exceed it.
    pub fn llm_call_budget(&self) -> usize {
        self.max_plan_steps * self.max_step_tool_calls + self.max_replans * self.max_plan_steps
    }
}

/// Confirmation policy for side-effecting tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ConfirmPolicy {
    pub confirm_write: bool,
    pub confirm_exec: bool,
}

impl Default for ConfirmPolicy {
    fn default() -> Self {
        Self {
            confirm_write: true,
            confirm_exec: true,
        }
    }
}

/// Snapshot of everything a turn needs. Cloned into tool contexts; read-only
/// for the duration of a turn.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Absolute workspace root. Tools may not touch paths outside it.
    pub workspace_root: PathBuf,
    /// Chat-completion endpoint.
    pub llm_base_url: String,
    /// Model id sent with every request.
    pub model: String,
    /// Credential injected into the HTTP auth header. Never logged.
    pub api_key: Option<String>,
    pub bounds: Bounds,
    pub confirm_policy: ConfirmPolicy,
    /// Optional allow-list for exec commands (program names). Empty = all
    /// programs allowed (deny-list still applies).
    pub exec_allow_list: Vec<String>,
    /// Wall-clock timeout for one LLM call.
    pub llm_timeout: Duration,
    /// Wall-clock timeout for one tool execution.
    pub tool_timeout: Duration,
    /// How long to wait for a user confirmation before treating it as denial.
    pub confirm_timeout: Duration,
    /// Context window size in tokens (estimate domain).
    pub max_context_tokens: usize,
    /// Tokens reserved for the model's output when budgeting the prompt.
    pub reserved_output_tokens: usize,
    /// Trim triggers above this fraction of `max_context_tokens`.
    pub utilization_threshold: f32,
    pub sampling_temperature: f32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            workspace_root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            llm_base_url: "http://127.0.0.1:8080/v1/chat/completions".to_string(),
            model: "default".to_string(),
            api_key: None,
            bounds: Bounds::default(),
            confirm_policy: ConfirmPolicy::default(),
            exec_allow_list: Vec::new(),
            llm_timeout: Duration::from_secs(120),
            tool_timeout: Duration::from_secs(120),
            confirm_timeout: Duration::from_secs(300),
            max_context_tokens: 128_000,
            reserved_output_tokens: 8_192,
            utilization_threshold: 0.7,
            sampling_temperature: 0.2,
        }
    }
}

impl CoreConfig {
    /// Build a config from the environment. Recognized variables:
    /// `API_KEY`, `WORKSPACE_ROOT`, `DEBUG`. Unknown variables are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(key) = std::env::var("API_KEY") {
            if !key.trim().is_empty() {
                config.api_key = Some(key);
            }
        }

        if let Ok(root) = std::env::var("WORKSPACE_ROOT") {
            let path = PathBuf::from(root);
            if path.is_dir() {
                config.workspace_root = path;
            } else {
                tracing::warn!(path = %path.display(), "WORKSPACE_ROOT is not a directory, keeping cwd");
            }
        }

        config.bounds = config.bounds.normalized();
        config
    }

    /// True when DEBUG is set to a truthy value.
    pub fn debug_enabled() -> bool {
        std::env::var("DEBUG")
            .map(|v| {
                let v = v.trim().to_ascii_lowercase();
                !v.is_empty() && v != "0" && v != "false"
            })
            .unwrap_or(false)
    }
}
