//! grep tool - regex search across workspace files.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use walkdir::WalkDir;

use crate::error::ErrorCode;
use crate::tools::registry::{SideEffects, ToolCtx, ToolHandler, ToolResult, ToolSpec};

const DEFAULT_MAX_RESULTS: usize = 50;
const MAX_FILE_BYTES: u64 = 2 * 1024 * 1024;
const PREVIEW_CHARS: usize = 160;

/// Directories never worth searching.
const SKIP_DIRS: &[&str] = &[".git", "target", "node_modules", ".clude"];

pub struct GrepTool;

#[derive(Deserialize)]
struct Params {
    pattern: String,
    #[serde(default = "default_path")]
    path: String,
    #[serde(default)]
    max_results: Option<usize>,
}

fn default_path() -> String {
    ".".to_string()
}

#[async_trait]
impl ToolHandler for GrepTool {
    async fn call(&self, ctx: &ToolCtx, args: Value) -> ToolResult {
        let params: Params = match serde_json::from_value(args) {
            Ok(p) => p,
            Err(e) => return ToolResult::failure(ErrorCode::InvalidArgs, e.to_string()),
        };

        let regex = match Regex::new(&params.pattern) {
            Ok(r) => r,
            Err(e) => {
                return ToolResult::failure(
                    ErrorCode::InvalidArgs,
                    format!("invalid pattern: {}", e),
                )
            }
        };

        let root = match ctx.resolve_in_workspace(&params.path) {
            Ok(p) => p,
            Err(e) => return ToolResult::failure_with(e),
        };

        let max_results = params.max_results.unwrap_or(DEFAULT_MAX_RESULTS);
        let workspace_root = ctx.workspace_root.clone();

        // Blocking walk on the blocking pool; the turn thread stays async.
        let scan = tokio::task::spawn_blocking(move || {
            scan_tree(&root, &workspace_root, &regex, max_results)
        })
        .await;

        match scan {
            Ok(Ok(outcome)) => ToolResult::success(json!({
                "hits": outcome.hits,
                "files_matched": outcome.files_matched,
                "files_scanned": outcome.files_scanned,
            })),
            Ok(Err(e)) => ToolResult::failure(ErrorCode::Io, e),
            Err(e) => ToolResult::failure(ErrorCode::Tool, format!("grep task failed: {}", e)),
        }
    }
}

struct ScanOutcome {
    hits: Vec<Value>,
    files_matched: usize,
    files_scanned: usize,
}

fn scan_tree(
    root: &Path,
    workspace_root: &Path,
    regex: &Regex,
    max_results: usize,
) -> Result<ScanOutcome, String> {
    if !root.exists() {
        return Err(format!("path does not exist: {}", root.display()));
    }

    let mut hits: Vec<Value> = Vec::new();
    let mut files_matched = 0usize;
    let mut files_scanned = 0usize;

    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        let name = entry.file_name().to_string_lossy();
        !(entry.file_type().is_dir() && SKIP_DIRS.contains(&name.as_ref()))
    });

    'files: for entry in walker.flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.metadata().map(|m| m.len() > MAX_FILE_BYTES).unwrap_or(true) {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue; // binary or unreadable
        };
        files_scanned += 1;

        let display_path = entry
            .path()
            .strip_prefix(workspace_root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .to_string();

        let mut matched_this_file = false;
        for (line_no, line) in content.lines().enumerate() {
            if regex.is_match(line) {
                if !matched_this_file {
                    matched_this_file = true;
                    files_matched += 1;
                }
                let preview: String = line.chars().take(PREVIEW_CHARS).collect();
                hits.push(json!({
                    "path": display_path,
                    "line": line_no + 1,
                    "preview": preview.trim_end(),
                }));
                if hits.len() >= max_results {
                    break 'files;
                }
            }
        }
    }

    Ok(ScanOutcome {
        hits,
        files_matched,
        files_scanned,
    })
}

pub fn spec() -> ToolSpec {
    ToolSpec {
        name: "grep".into(),
        summary: "Regex search across workspace files".into(),
        description: "Search file contents under a directory with a regular \
                      expression. Returns path:line hits with a short preview. \
                      Skips VCS and build directories."
            .into(),
        args_schema: json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regular expression to search for"
                },
                "path": {
                    "type": "string",
                    "description": "Directory to search under",
                    "default": "."
                },
                "max_results": {
                    "type": "integer",
                    "description": "Cap on returned hits",
                    "default": 50
                }
            },
            "required": ["pattern"],
            "additionalProperties": false
        }),
        example_args: json!({"pattern": "fn main", "path": "src"}),
        side_effects: SideEffects::Read,
        visible_in_prompt: true,
        callable_by_model: true,
        idempotent: true,
        handler: Arc::new(GrepTool),
    }
}
