//! Closed error-code vocabulary shared by tools, policy, and the LLM layer.
//!
//! Tool handlers never leak raw errors to the model: every failure is
//! materialized into a `ToolError { code, message, details }` envelope and
//! fed back as a compressed tool result.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable error codes. The set is closed; new failure modes must
/// map onto one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Tool name not registered or not callable by the model.
    #[serde(rename = "E_NO_TOOL")]
    NoTool,
    /// Argument schema validation failed.
    #[serde(rename = "E_INVALID_ARGS")]
    InvalidArgs,
    /// Command on deny-list or rejected by the risk router.
    #[serde(rename = "E_POLICY_DENIED")]
    PolicyDenied,
    /// User declined confirmation.
    #[serde(rename = "E_DENIED")]
    Denied,
    /// Filesystem error from a tool.
    #[serde(rename = "E_IO")]
    Io,
    /// Tool handler exceeded its wall-clock bound.
    #[serde(rename = "E_TOOL_TIMEOUT")]
    ToolTimeout,
    /// Patch conflict or concurrent write.
    #[serde(rename = "E_CONFLICT")]
    Conflict,
    /// Verification command failed.
    #[serde(rename = "E_BUILD_FAIL")]
    BuildFail,
    /// LLM output did not conform to the protocol after retries.
    #[serde(rename = "E_MODEL")]
    Model,
    /// Generic tool exception (message sanitized).
    #[serde(rename = "E_TOOL")]
    Tool,
    /// A feature the tool depends on is disabled in this session.
    #[serde(rename = "E_RAG_DISABLED")]
    RagDisabled,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoTool => "E_NO_TOOL",
            Self::InvalidArgs => "E_INVALID_ARGS",
            Self::PolicyDenied => "E_POLICY_DENIED",
            Self::Denied => "E_DENIED",
            Self::Io => "E_IO",
            Self::ToolTimeout => "E_TOOL_TIMEOUT",
            Self::Conflict => "E_CONFLICT",
            Self::BuildFail => "E_BUILD_FAIL",
            Self::Model => "E_MODEL",
            Self::Tool => "E_TOOL",
            Self::RagDisabled => "E_RAG_DISABLED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error carried inside a `ToolResult`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ToolError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Errors raised by the LLM I/O layer.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Transport-level failure (connection refused, 5xx, DNS). Retryable.
    #[error("transport error: {0}")]
    Transport(String),
    /// Non-retryable HTTP error (4xx).
    #[error("backend rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    /// Wall-clock timeout waiting on the backend.
    #[error("LLM call timed out after {0} seconds")]
    Timeout(u64),
    /// Pathological output detected (n-gram repetition / low entropy).
    #[error("degenerate model output: {0}")]
    Degenerate(String),
    /// Model output did not conform to the protocol after bounded retries.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// Turn cancelled while the call was in flight.
    #[error("cancelled")]
    Cancelled,
}

impl LlmError {
    /// Transport errors are retried with backoff; everything else is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Errors from plan parsing and patch application.
#[derive(Debug, Error, PartialEq)]
pub enum PlanError {
    #[error("no JSON object found in plan text")]
    NoJson,
    #[error("plan JSON malformed: {0}")]
    Malformed(String),
    #[error("unknown plan type tag: {0}")]
    UnknownType(String),
    #[error("duplicate step id: {0}")]
    DuplicateStepId(String),
    #[error("step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: String, dependency: String },
    #[error("dependency cycle involving step {0}")]
    Cycle(String),
    #[error("patch references id '{id}' in more than one of remove/update/add")]
    PatchOverlap { id: String },
    #[error("patch removes or updates unknown step {0}")]
    PatchUnknownStep(String),
    #[error("patch adds step with existing id {0}")]
    PatchIdTaken(String),
    #[error("plan exceeds max_plan_steps ({0})")]
    TooManySteps(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_serialize_to_wire_names() {
        let json = serde_json::to_string(&ErrorCode::InvalidArgs).unwrap();
        assert_eq!(json, "\"E_INVALID_ARGS\"");
        let back: ErrorCode = serde_json::from_str("\"E_POLICY_DENIED\"").unwrap();
        assert_eq!(back, ErrorCode::PolicyDenied);
    }

    #[test]
    fn tool_error_display_includes_code() {
        let err = ToolError::new(ErrorCode::Io, "disk full");
        assert_eq!(err.to_string(), "E_IO: disk full");
    }

    #[test]
    fn only_transport_is_retryable() {
        assert!(LlmError::Transport("503".into()).is_retryable());
        assert!(!LlmError::Timeout(30).is_retryable());
        assert!(!LlmError::Degenerate("repetition".into()).is_retryable());
        assert!(!LlmError::Rejected {
            status: 401,
            message: "bad key".into()
        }
        .is_retryable());
    }
}
