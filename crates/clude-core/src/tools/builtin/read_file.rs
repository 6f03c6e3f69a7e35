//! read_file tool - read file contents with line offset/limit.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::fs;

use crate::error::ErrorCode;
use crate::tools::registry::{SideEffects, ToolCtx, ToolHandler, ToolResult, ToolSpec};

const DEFAULT_LIMIT: usize = 2000;

pub struct ReadFileTool;

#[derive(Deserialize)]
struct Params {
    path: String,
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

#[async_trait]
impl ToolHandler for ReadFileTool {
    async fn call(&self, ctx: &ToolCtx, args: Value) -> ToolResult {
        let params: Params = match serde_json::from_value(args) {
            Ok(p) => p,
            Err(e) => return ToolResult::failure(ErrorCode::InvalidArgs, e.to_string()),
        };

        let path = match ctx.resolve_in_workspace(&params.path) {
            Ok(p) => p,
            Err(e) => return ToolResult::failure_with(e),
        };

        if !path.is_file() {
            return ToolResult::failure(
                ErrorCode::Io,
                format!("not a file: {}", params.path),
            );
        }

        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return ToolResult::failure(ErrorCode::Io, format!("failed to read file: {}", e))
            }
        };

        // Binary detection over the first 8 KiB.
        let check_len = bytes.len().min(8192);
        if bytes[..check_len].contains(&0) {
            return ToolResult::success(json!({
                "content": format!("(binary file, {} bytes)", bytes.len()),
                "total_lines": 0,
                "lines_returned": 0,
            }));
        }

        let content = match String::from_utf8(bytes) {
            Ok(s) => s,
            Err(e) => {
                return ToolResult::failure(ErrorCode::Io, format!("file is not valid UTF-8: {}", e))
            }
        };

        let lines: Vec<&str> = content.lines().collect();
        let total_lines = lines.len();
        let start = params.offset.unwrap_or(1).saturating_sub(1);
        let limit = params.limit.unwrap_or(DEFAULT_LIMIT);
        let end = (start + limit).min(total_lines);

        if start >= total_lines && total_lines > 0 {
            return ToolResult::failure(
                ErrorCode::InvalidArgs,
                format!("start line {} is beyond file length ({})", start + 1, total_lines),
            );
        }

        ToolResult::success(json!({
            "content": lines[start.min(total_lines)..end].join("\n"),
            "total_lines": total_lines,
            "lines_returned": end.saturating_sub(start),
            "start_line": start + 1,
        }))
    }
}

pub fn spec() -> ToolSpec {
    ToolSpec {
        name: "read_file".into(),
        summary: "Read file contents, optionally a line range".into(),
        description: "Read a text file from the workspace. Supports 1-indexed line \
                      offset and a line limit for large files. Detects binary files."
            .into(),
        args_schema: json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the workspace root"
                },
                "offset": {
                    "type": "integer",
                    "description": "1-indexed line to start reading from"
                },
                "limit": {
                    "type": "integer",
                    "description": "Number of lines to read"
                }
            },
            "required": ["path"],
            "additionalProperties": false
        }),
        example_args: json!({"path": "src/main.rs", "limit": 50}),
        side_effects: SideEffects::Read,
        visible_in_prompt: true,
        callable_by_model: true,
        idempotent: true,
        handler: Arc::new(ReadFileTool),
    }
}
