//! run_cmd tool - execute a shell command in the workspace.
//!
//! The lifecycle's deny/allow-list gate runs before this handler; the
//! handler itself only enforces the wall clock and the cancel token.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::error::ErrorCode;
use crate::tools::registry::{SideEffects, ToolCtx, ToolHandler, ToolResult, ToolSpec};

const OUTPUT_CAP_BYTES: usize = 64 * 1024;

pub struct RunCmdTool;

#[derive(Deserialize)]
struct Params {
    command: String,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

#[async_trait]
impl ToolHandler for RunCmdTool {
    async fn call(&self, ctx: &ToolCtx, args: Value) -> ToolResult {
        let params: Params = match serde_json::from_value(args) {
            Ok(p) => p,
            Err(e) => return ToolResult::failure(ErrorCode::InvalidArgs, e.to_string()),
        };

        let timeout = params
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(ctx.config.tool_timeout)
            .min(ctx.config.tool_timeout);

        let mut child = match Command::new("sh")
            .arg("-c")
            .arg(&params.command)
            .current_dir(&ctx.workspace_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return ToolResult::failure(ErrorCode::Io, format!("failed to spawn: {}", e))
            }
        };

        let waited = tokio::select! {
            output = child.wait_with_output() => output,
            _ = ctx.cancel.cancelled() => {
                return ToolResult::failure(ErrorCode::Tool, "command cancelled");
            }
            _ = tokio::time::sleep(timeout) => {
                return ToolResult::failure(
                    ErrorCode::ToolTimeout,
                    format!("command timed out after {} seconds", timeout.as_secs()),
                );
            }
        };

        match waited {
            Ok(output) => {
                let exit_code = output.status.code().unwrap_or(-1);
                ToolResult::success(json!({
                    "stdout": cap(&String::from_utf8_lossy(&output.stdout)),
                    "stderr": cap(&String::from_utf8_lossy(&output.stderr)),
                    "exit_code": exit_code,
                }))
            }
            Err(e) => ToolResult::failure(ErrorCode::Io, format!("command failed: {}", e)),
        }
    }
}

fn cap(text: &str) -> String {
    if text.len() <= OUTPUT_CAP_BYTES {
        return text.to_string();
    }
    let mut end = OUTPUT_CAP_BYTES;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[output capped at {} bytes]", &text[..end], OUTPUT_CAP_BYTES)
}

pub fn spec() -> ToolSpec {
    ToolSpec {
        name: "run_cmd".into(),
        summary: "Run a shell command in the workspace".into(),
        description: "Execute a shell command with the workspace root as the \
                      working directory. Output is captured and capped; commands \
                      are subject to the policy deny-list."
            .into(),
        args_schema: json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Shell command to run"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Wall-clock bound in seconds"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        }),
        example_args: json!({"command": "ls -la"}),
        side_effects: SideEffects::Exec,
        visible_in_prompt: true,
        callable_by_model: true,
        idempotent: false,
        handler: Arc::new(RunCmdTool),
    }
}
