//! list_dir tool - non-recursive directory listing.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ErrorCode;
use crate::tools::registry::{SideEffects, ToolCtx, ToolHandler, ToolResult, ToolSpec};

pub struct ListDirTool;

#[derive(Deserialize)]
struct Params {
    #[serde(default = "default_path")]
    path: String,
    #[serde(default)]
    include_hidden: bool,
}

fn default_path() -> String {
    ".".to_string()
}

#[async_trait]
impl ToolHandler for ListDirTool {
    async fn call(&self, ctx: &ToolCtx, args: Value) -> ToolResult {
        let params: Params = match serde_json::from_value(args) {
            Ok(p) => p,
            Err(e) => return ToolResult::failure(ErrorCode::InvalidArgs, e.to_string()),
        };

        let path = match ctx.resolve_in_workspace(&params.path) {
            Ok(p) => p,
            Err(e) => return ToolResult::failure_with(e),
        };

        let read_dir = match std::fs::read_dir(&path) {
            Ok(rd) => rd,
            Err(e) => {
                return ToolResult::failure(
                    ErrorCode::Io,
                    format!("failed to list '{}': {}", params.path, e),
                )
            }
        };

        let mut entries: Vec<Value> = Vec::new();
        for entry in read_dir.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !params.include_hidden && name.starts_with('.') {
                continue;
            }
            let kind = match entry.file_type() {
                Ok(ft) if ft.is_dir() => "dir",
                Ok(ft) if ft.is_symlink() => "symlink",
                _ => "file",
            };
            entries.push(json!({"name": name, "kind": kind}));
        }
        entries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));

        let count = entries.len();
        ToolResult::success(json!({
            "entries": entries,
            "count": count,
        }))
    }
}

pub fn spec() -> ToolSpec {
    ToolSpec {
        name: "list_dir".into(),
        summary: "List one directory level".into(),
        description: "List the entries of a workspace directory (non-recursive). \
                      Hidden entries are skipped unless include_hidden is set."
            .into(),
        args_schema: json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory path relative to the workspace root",
                    "default": "."
                },
                "include_hidden": {
                    "type": "boolean",
                    "description": "Include dotfiles",
                    "default": false
                }
            },
            "required": [],
            "additionalProperties": false
        }),
        example_args: json!({"path": "src"}),
        side_effects: SideEffects::Read,
        visible_in_prompt: true,
        callable_by_model: true,
        idempotent: true,
        handler: Arc::new(ListDirTool),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn ctx_for(dir: &TempDir) -> ToolCtx {
        let config = CoreConfig {
            workspace_root: dir.path().to_path_buf(),
            ..Default::default()
        };
        ToolCtx::new(config, CancellationToken::new())
    }

    #[tokio::test]
    async fn lists_sorted_entries() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.txt"), "").unwrap();
        std::fs::write(dir.path().join("a.txt"), "").unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join(".hidden"), "").unwrap();

        let ctx = ctx_for(&dir);
        let result = ListDirTool.call(&ctx, json!({})).await;
        assert!(result.ok);
        let payload = result.payload.unwrap();
        assert_eq!(payload["count"], 3);
        let names: Vec<&str> = payload["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "src"]);
    }

    #[tokio::test]
    async fn include_hidden_shows_dotfiles() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".env"), "").unwrap();
        let ctx = ctx_for(&dir);
        let result = ListDirTool
            .call(&ctx, json!({"include_hidden": true}))
            .await;
        assert_eq!(result.payload.unwrap()["count"], 1);
    }
}
