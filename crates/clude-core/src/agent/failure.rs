//! Repeated tool-failure detection.
//!
//! Tracks error signatures across the inner loop and trips a fail-fast when
//! the same tool keeps failing the same way, instead of burning the whole
//! per-step tool budget. Any success clears the counters (the agent
//! recovered).

use std::collections::HashMap;

use crate::error::ErrorCode;
use crate::tools::registry::ToolResult;

/// Stop after this many identical failures.
pub const REPEATED_FAILURE_THRESHOLD: usize = 2;

#[derive(Default)]
pub struct FailureTracker {
    counters: HashMap<String, usize>,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one result. Returns a diagnostic when the same signature has
    /// now been seen `REPEATED_FAILURE_THRESHOLD` times.
    pub fn observe(&mut self, tool: &str, result: &ToolResult) -> Option<String> {
        if result.ok {
            self.counters.clear();
            return None;
        }

        let (code, fingerprint) = result
            .error
            .as_ref()
            .map(|e| (e.code, normalize_fingerprint(&e.message)))
            .unwrap_or((ErrorCode::Tool, "unknown".to_string()));

        let signature = format!("{}|{}|{}", tool, code, fingerprint);
        let count = self
            .counters
            .entry(signature)
            .and_modify(|c| *c += 1)
            .or_insert(1);

        if *count >= REPEATED_FAILURE_THRESHOLD {
            Some(format!(
                "'{}' failed {} times with the same '{}' error; a different approach is required",
                tool, *count, code
            ))
        } else {
            None
        }
    }
}

fn normalize_fingerprint(message: &str) -> String {
    let mut compact = String::new();
    for part in message.split_whitespace() {
        if !compact.is_empty() {
            compact.push(' ');
        }
        compact.push_str(part);
    }
    if compact.is_empty() {
        return "unknown".to_string();
    }
    compact.make_ascii_lowercase();
    compact.chars().take(160).collect()
}
