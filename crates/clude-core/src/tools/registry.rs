//! Tool registry: the immutable table of tool specifications and the
//! runtime argument validator.
//!
//! The registry is populated once at startup and read-only afterwards.
//! `validate_args` checks raw model arguments against the declared schema
//! (types, enums, required, defaults, `additionalProperties=false`) and, on
//! failure, answers with the accepted argument names plus a best-guess
//! correction for commonly confused names.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use crate::config::CoreConfig;
use crate::error::{ErrorCode, ToolError};

use super::cache::ToolResultCache;

/// Side-effect class, used to route through policy and confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SideEffects {
    Read,
    Write,
    Exec,
    Network,
}

impl SideEffects {
    /// Write and exec results invalidate cached reads.
    pub fn invalidates_cache(self) -> bool {
        matches!(self, Self::Write | Self::Exec)
    }
}

/// Result envelope every tool handler returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
    /// Set when the result was served from the session cache.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub from_cache: bool,
}

impl ToolResult {
    pub fn success(payload: Value) -> Self {
        Self {
            ok: true,
            payload: Some(payload),
            error: None,
            from_cache: false,
        }
    }

    pub fn failure(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            payload: None,
            error: Some(ToolError::new(code, message)),
            from_cache: false,
        }
    }

    pub fn failure_with(error: ToolError) -> Self {
        Self {
            ok: false,
            payload: None,
            error: Some(error),
            from_cache: false,
        }
    }

    /// Paths this result declares as touched, for cache invalidation.
    pub fn touched_paths(&self) -> Vec<String> {
        self.payload
            .as_ref()
            .and_then(|p| p.get("touched_paths"))
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Execution context handed to tool handlers. Read-only; the cancel token is
/// observed at the handler's own suspension points.
#[derive(Clone)]
pub struct ToolCtx {
    pub workspace_root: PathBuf,
    pub config: CoreConfig,
    pub cancel: CancellationToken,
}

impl ToolCtx {
    pub fn new(config: CoreConfig, cancel: CancellationToken) -> Self {
        Self {
            workspace_root: config.workspace_root.clone(),
            config,
            cancel,
        }
    }

    /// Resolve a (possibly relative) path and enforce the workspace sandbox.
    /// Traversal components are rejected before touching the filesystem, so
    /// the check also holds for paths that do not exist yet.
    pub fn resolve_in_workspace(&self, path: &str) -> Result<PathBuf, ToolError> {
        let candidate = Path::new(path);
        let resolved = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.workspace_root.join(candidate)
        };

        for component in resolved.components() {
            if matches!(component, Component::ParentDir) {
                return Err(ToolError::new(
                    ErrorCode::PolicyDenied,
                    format!("path traversal not allowed: {}", path),
                ));
            }
        }

        if !resolved.starts_with(&self.workspace_root) {
            return Err(ToolError::new(
                ErrorCode::PolicyDenied,
                format!("path '{}' is outside the workspace", path),
            ));
        }

        Ok(resolved)
    }
}

/// Contract every tool implements.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, ctx: &ToolCtx, args: Value) -> ToolResult;
}

/// Registry entry, immutable at startup.
#[derive(Clone)]
pub struct ToolSpec {
    pub name: String,
    pub summary: String,
    pub description: String,
    pub args_schema: Value,
    pub example_args: Value,
    pub side_effects: SideEffects,
    pub visible_in_prompt: bool,
    pub callable_by_model: bool,
    /// Deterministic read results may be served from the session cache.
    pub idempotent: bool,
    pub handler: Arc<dyn ToolHandler>,
}

impl std::fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSpec")
            .field("name", &self.name)
            .field("side_effects", &self.side_effects)
            .field("idempotent", &self.idempotent)
            .finish()
    }
}

/// Commonly confused argument names and their likely corrections. Only
/// suggestions whose target actually exists on the tool are surfaced.
const KNOWN_CONFUSIONS: &[(&str, &[&str])] = &[
    ("max_depth", &["depth", "recursive"]),
    ("filename", &["path", "file_path"]),
    ("file", &["path", "file_path"]),
    ("filepath", &["path", "file_path"]),
    ("file_path", &["path"]),
    ("dir", &["path"]),
    ("directory", &["path"]),
    ("cmd", &["command"]),
    ("regex", &["pattern"]),
    ("query", &["pattern"]),
    ("max_lines", &["limit"]),
    ("count", &["limit"]),
    ("text", &["contents"]),
    ("content", &["contents"]),
];

pub struct ToolRegistry {
    tools: Vec<ToolSpec>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    /// Build the registry. Fails fast on duplicate names or example args
    /// that do not validate against their own schema.
    pub fn new(specs: Vec<ToolSpec>) -> anyhow::Result<Self> {
        let mut by_name = HashMap::with_capacity(specs.len());
        for (index, spec) in specs.iter().enumerate() {
            if by_name.insert(spec.name.clone(), index).is_some() {
                anyhow::bail!("duplicate tool name: {}", spec.name);
            }
        }

        let registry = Self {
            tools: specs,
            by_name,
        };

        for spec in &registry.tools {
            registry
                .validate_args(&spec.name, spec.example_args.clone())
                .map_err(|e| {
                    anyhow::anyhow!("example_args for tool '{}' invalid: {}", spec.name, e)
                })?;
        }

        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.by_name.get(name).map(|&i| &self.tools[i])
    }

    /// Tools rendered into the system-prompt manifest.
    pub fn list_visible(&self) -> Vec<&ToolSpec> {
        self.tools.iter().filter(|t| t.visible_in_prompt).collect()
    }

    /// All registered tool names (diagnostics).
    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    /// Render the manifest block shown to the model.
    pub fn render_manifest(&self) -> String {
        let mut out = String::new();
        for spec in self.list_visible() {
            let schema = serde_json::to_string(&spec.args_schema).unwrap_or_default();
            out.push_str(&format!(
                "- {}: {}\n  args schema: {}\n",
                spec.name, spec.summary, schema
            ));
        }
        out
    }

    /// Validate raw arguments against the tool's schema. Returns the
    /// validated (and default-filled) arguments.
    pub fn validate_args(&self, tool_name: &str, raw_args: Value) -> Result<Value, ToolError> {
        let Some(spec) = self.get(tool_name) else {
            return Err(ToolError::new(
                ErrorCode::NoTool,
                format!("unknown tool: {}", tool_name),
            ));
        };
        validate_against_schema(&spec.args_schema, raw_args)
    }

    /// Execute one validated call. The pipeline above this (risk routing,
    /// confirmation, command safety) has already run.
    pub async fn dispatch(
        &self,
        tool_name: &str,
        validated_args: Value,
        ctx: &ToolCtx,
        cache: &mut ToolResultCache,
    ) -> ToolResult {
        let Some(spec) = self.get(tool_name) else {
            return ToolResult::failure(ErrorCode::NoTool, format!("unknown tool: {}", tool_name));
        };
        if !spec.callable_by_model {
            return ToolResult::failure(
                ErrorCode::NoTool,
                format!("tool '{}' is not callable by the model", tool_name),
            );
        }

        if spec.idempotent {
            if let Some(hit) = cache.get(tool_name, &validated_args) {
                tracing::debug!(tool = tool_name, "tool cache hit");
                return hit;
            }
        }

        let timeout = ctx.config.tool_timeout;
        let result = match tokio::time::timeout(timeout, spec.handler.call(ctx, validated_args.clone()))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    tool = tool_name,
                    timeout_secs = timeout.as_secs(),
                    "tool execution timed out"
                );
                ToolResult::failure(
                    ErrorCode::ToolTimeout,
                    format!(
                        "tool '{}' timed out after {} seconds",
                        tool_name,
                        timeout.as_secs()
                    ),
                )
            }
        };

        if spec.side_effects.invalidates_cache() && result.ok {
            let touched = result.touched_paths();
            if touched.is_empty() {
                // Exec with unknown write set: drop everything.
                cache.clear();
            } else {
                cache.invalidate_paths(&touched);
            }
        }

        if spec.idempotent && result.ok {
            cache.insert(tool_name, &validated_args, &result);
        }

        result
    }
}

/// Minimal JSON-schema-shaped validation: `properties`, `required`,
/// `additionalProperties=false`, per-property `type`, `enum`, `default`.
fn validate_against_schema(schema: &Value, raw_args: Value) -> Result<Value, ToolError> {
    let properties = schema
        .get("properties")
        .and_then(|p| p.as_object())
        .cloned()
        .unwrap_or_default();
    let accepted: Vec<&str> = properties.keys().map(String::as_str).collect();

    let Value::Object(mut args) = raw_args else {
        return Err(invalid_args("arguments must be a JSON object", &accepted, None));
    };

    // additionalProperties=false: every passed key must be declared.
    for key in args.keys() {
        if !properties.contains_key(key) {
            let suggestion = suggest_correction(key, &accepted);
            return Err(invalid_args(
                &format!("unknown argument '{}'", key),
                &accepted,
                suggestion,
            ));
        }
    }

    // Fill defaults before checking required.
    for (name, prop) in &properties {
        if !args.contains_key(name) {
            if let Some(default) = prop.get("default") {
                args.insert(name.clone(), default.clone());
            }
        }
    }

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for name in required.iter().filter_map(|v| v.as_str()) {
            if !args.contains_key(name) {
                return Err(invalid_args(
                    &format!("missing required argument '{}'", name),
                    &accepted,
                    None,
                ));
            }
        }
    }

    for (name, value) in &args {
        let prop = &properties[name];
        if let Some(expected) = prop.get("type").and_then(|t| t.as_str()) {
            if !type_matches(expected, value) {
                return Err(invalid_args(
                    &format!("argument '{}' must be of type {}", name, expected),
                    &accepted,
                    None,
                ));
            }
        }
        if let Some(allowed) = prop.get("enum").and_then(|e| e.as_array()) {
            if !allowed.contains(value) {
                return Err(invalid_args(
                    &format!("argument '{}' is not one of the allowed values", name),
                    &accepted,
                    None,
                ));
            }
        }
    }

    Ok(Value::Object(args))
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

fn suggest_correction(passed: &str, accepted: &[&str]) -> Option<String> {
    for (confused, candidates) in KNOWN_CONFUSIONS {
        if *confused == passed {
            for candidate in *candidates {
                if accepted.contains(candidate) {
                    return Some((*candidate).to_string());
                }
            }
        }
    }
    None
}

fn invalid_args(message: &str, accepted: &[&str], suggestion: Option<String>) -> ToolError {
    let mut details = Map::new();
    details.insert(
        "accepted_args".to_string(),
        Value::Array(accepted.iter().map(|a| json!(a)).collect()),
    );
    if let Some(suggestion) = suggestion {
        details.insert("did_you_mean".to_string(), json!(suggestion));
    }
    ToolError::new(ErrorCode::InvalidArgs, message).with_details(Value::Object(details))
}

/// Default wall-clock bound for tool handlers, mirrored in `CoreConfig`.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);
