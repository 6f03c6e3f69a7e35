//! Session-scoped cache of deterministic read-tool results.
//!
//! Keys are `(tool_name, canonical_json(args))`. Every entry remembers the
//! workspace-normalized paths referenced by its arguments; before a
//! write-class tool commits, entries referencing a touched path are
//! invalidated. The cache lives and dies with the session.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::audit::canonical_json;

use super::registry::ToolResult;

#[derive(Debug, Clone)]
struct CacheEntry {
    result: ToolResult,
    /// Normalized path forms of every string argument.
    arg_paths: Vec<PathBuf>,
}

pub struct ToolResultCache {
    workspace_root: PathBuf,
    entries: HashMap<(String, String), CacheEntry>,
    hits: usize,
    misses: usize,
}

impl ToolResultCache {
    pub fn new(workspace_root: PathBuf) -> Self {
        Self {
            workspace_root,
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    fn key(tool_name: &str, args: &Value) -> (String, String) {
        (tool_name.to_string(), canonical_json(args))
    }

    /// Look up a cached result. Hits are returned with `from_cache=true`.
    pub fn get(&mut self, tool_name: &str, args: &Value) -> Option<ToolResult> {
        match self.entries.get(&Self::key(tool_name, args)) {
            Some(entry) => {
                self.hits += 1;
                let mut result = entry.result.clone();
                result.from_cache = true;
                Some(result)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, tool_name: &str, args: &Value, result: &ToolResult) {
        let arg_paths = collect_string_args(args)
            .into_iter()
            .map(|s| self.normalize(&s))
            .collect();
        self.entries.insert(
            Self::key(tool_name, args),
            CacheEntry {
                result: result.clone(),
                arg_paths,
            },
        );
    }

    /// Drop every entry whose arguments reference one of the touched paths.
    pub fn invalidate_paths(&mut self, touched: &[String]) {
        if touched.is_empty() {
            return;
        }
        let normalized: Vec<PathBuf> = touched.iter().map(|p| self.normalize(p)).collect();
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            !entry
                .arg_paths
                .iter()
                .any(|arg| normalized.iter().any(|t| t == arg))
        });
        let dropped = before - self.entries.len();
        if dropped > 0 {
            tracing::debug!(dropped, "tool cache invalidated entries");
        }
    }

    /// Drop everything (exec with unknown write set, or session end).
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> (usize, usize) {
        (self.hits, self.misses)
    }

    fn normalize(&self, raw: &str) -> PathBuf {
        let path = Path::new(raw);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }
}

/// All string leaves of an argument object, recursively.
fn collect_string_args(args: &Value) -> Vec<String> {
    let mut out = Vec::new();
    collect_into(args, &mut out);
    out
}

fn collect_into(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(s.clone()),
        Value::Array(items) => {
            for item in items {
                collect_into(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_into(item, out);
            }
        }
        _ => {}
    }
}
