//! write_file tool - create or overwrite a file in the workspace.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::fs;

use crate::error::ErrorCode;
use crate::tools::registry::{SideEffects, ToolCtx, ToolHandler, ToolResult, ToolSpec};

pub struct WriteFileTool;

#[derive(Deserialize)]
struct Params {
    path: String,
    contents: String,
}

#[async_trait]
impl ToolHandler for WriteFileTool {
    async fn call(&self, ctx: &ToolCtx, args: Value) -> ToolResult {
        let params: Params = match serde_json::from_value(args) {
            Ok(p) => p,
            Err(e) => return ToolResult::failure(ErrorCode::InvalidArgs, e.to_string()),
        };

        let path = match ctx.resolve_in_workspace(&params.path) {
            Ok(p) => p,
            Err(e) => return ToolResult::failure_with(e),
        };

        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                return ToolResult::failure(
                    ErrorCode::Io,
                    format!("failed to create parent directories: {}", e),
                );
            }
        }

        match fs::write(&path, params.contents.as_bytes()).await {
            Ok(()) => ToolResult::success(json!({
                "bytes_written": params.contents.len(),
                "touched_paths": [path.to_string_lossy()],
            })),
            Err(e) => ToolResult::failure(ErrorCode::Io, format!("failed to write file: {}", e)),
        }
    }
}

pub fn spec() -> ToolSpec {
    ToolSpec {
        name: "write_file".into(),
        summary: "Create or overwrite a file".into(),
        description: "Write the given contents to a file in the workspace, creating \
                      parent directories as needed."
            .into(),
        args_schema: json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the workspace root"
                },
                "contents": {
                    "type": "string",
                    "description": "Full file contents to write"
                }
            },
            "required": ["path", "contents"],
            "additionalProperties": false
        }),
        example_args: json!({"path": "notes.md", "contents": "# Notes\n"}),
        side_effects: SideEffects::Write,
        visible_in_prompt: true,
        callable_by_model: true,
        idempotent: false,
        handler: Arc::new(WriteFileTool),
    }
}
