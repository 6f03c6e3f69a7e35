//! Result compressor: turns raw tool results into bounded structured
//! summaries before they re-enter the conversation.
//!
//! Three fidelity levels, chosen from context utilization: `summary` keeps
//! counts only, `compact` (the default) keeps key fields plus capped lists,
//! `detailed` raises the caps and is used on the first call of a tool in a
//! turn. No path ever emits an unbounded payload.

use serde_json::{json, Map, Value};

use super::registry::ToolResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fidelity {
    Summary,
    Compact,
    Detailed,
}

impl Fidelity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::Compact => "compact",
            Self::Detailed => "detailed",
        }
    }

    fn list_cap(self) -> usize {
        match self {
            Self::Summary => 0,
            Self::Compact => 10,
            Self::Detailed => 20,
        }
    }

    fn string_cap(self) -> usize {
        match self {
            Self::Summary => 120,
            Self::Compact => 400,
            Self::Detailed => 1500,
        }
    }

    fn total_budget(self) -> usize {
        match self {
            Self::Summary => 400,
            Self::Compact => 2000,
            Self::Detailed => 6000,
        }
    }
}

/// Utilization above which feedback degrades to counts only.
const SUMMARY_UTILIZATION: f32 = 0.85;

/// Pick a fidelity from the current context pressure. The first call of a
/// tool within a turn gets the detailed view.
pub fn choose_fidelity(utilization: f32, first_call_for_tool: bool) -> Fidelity {
    if utilization >= SUMMARY_UTILIZATION {
        Fidelity::Summary
    } else if first_call_for_tool {
        Fidelity::Detailed
    } else {
        Fidelity::Compact
    }
}

/// Bounded feedback ready to append as the next user message.
#[derive(Debug, Clone)]
pub struct CompressedFeedback {
    pub text: String,
    pub truncated: bool,
    pub fidelity: Fidelity,
}

/// Numeric keys that survive the summary level.
const COUNT_KEYS: &[&str] = &[
    "hits",
    "files_matched",
    "lines",
    "exit_code",
    "count",
    "total_lines",
    "lines_returned",
    "bytes_written",
    "entries_total",
];

/// Compress one tool result. `salient` biases preview windows toward tokens
/// from the current user/step text.
pub fn compress(
    tool_name: &str,
    result: &ToolResult,
    fidelity: Fidelity,
    salient: &[String],
) -> CompressedFeedback {
    let mut truncated = false;

    let body = if result.ok {
        let payload = result.payload.clone().unwrap_or(Value::Null);
        let compressed = match fidelity {
            Fidelity::Summary => summarize_payload(&payload),
            _ => shrink_value(&payload, fidelity, salient, &mut truncated),
        };
        let mut envelope = Map::new();
        envelope.insert("ok".into(), json!(true));
        envelope.insert("tool".into(), json!(tool_name));
        if result.from_cache {
            envelope.insert("from_cache".into(), json!(true));
        }
        envelope.insert("data".into(), compressed);
        if truncated {
            envelope.insert("truncated".into(), json!(true));
        }
        Value::Object(envelope)
    } else {
        // Errors pass through structurally; the message is already sanitized.
        let error = result
            .error
            .as_ref()
            .map(|e| serde_json::to_value(e).unwrap_or(Value::Null))
            .unwrap_or(Value::Null);
        json!({
            "ok": false,
            "tool": tool_name,
            "error": error,
        })
    };

    let mut text = body.to_string();
    let budget = fidelity.total_budget();
    if text.len() > budget {
        text = elide_middle(&text, budget);
        truncated = true;
    }

    CompressedFeedback {
        text,
        truncated,
        fidelity,
    }
}

/// Summary level: counts only. Arrays become `<key>_count`.
fn summarize_payload(payload: &Value) -> Value {
    let Value::Object(map) = payload else {
        return json!({});
    };
    let mut out = Map::new();
    for (key, value) in map {
        match value {
            Value::Number(_) if COUNT_KEYS.contains(&key.as_str()) => {
                out.insert(key.clone(), value.clone());
            }
            Value::Array(items) => {
                out.insert(format!("{}_count", key), json!(items.len()));
            }
            _ => {}
        }
    }
    Value::Object(out)
}

/// Compact/detailed level: cap lists, bound strings, recurse into objects.
fn shrink_value(value: &Value, fidelity: Fidelity, salient: &[String], truncated: &mut bool) -> Value {
    match value {
        Value::Array(items) => {
            let cap = fidelity.list_cap();
            let kept: Vec<Value> = items
                .iter()
                .take(cap)
                .map(|v| shrink_value(v, fidelity, salient, truncated))
                .collect();
            if items.len() > cap {
                *truncated = true;
                let mut wrapper = Map::new();
                wrapper.insert("items".into(), Value::Array(kept));
                wrapper.insert("total".into(), json!(items.len()));
                wrapper.insert("shown".into(), json!(cap));
                Value::Object(wrapper)
            } else {
                Value::Array(kept)
            }
        }
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, item) in map {
                out.insert(key.clone(), shrink_value(item, fidelity, salient, truncated));
            }
            Value::Object(out)
        }
        Value::String(text) => {
            let cap = fidelity.string_cap();
            if text.len() <= cap {
                return value.clone();
            }
            *truncated = true;
            Value::String(preview(text, cap, salient))
        }
        other => other.clone(),
    }
}

/// Preview window for an over-budget string: keyword-biased when the salient
/// tokens match, head+tail otherwise.
fn preview(text: &str, budget: usize, salient: &[String]) -> String {
    if let Some(window) = keyword_window(text, budget, salient) {
        return window;
    }
    elide_middle(text, budget)
}

/// A window centered on the first salient token found in the text.
fn keyword_window(text: &str, budget: usize, salient: &[String]) -> Option<String> {
    let hit = salient
        .iter()
        .filter(|t| t.len() >= 3)
        .filter_map(|t| text.find(t.as_str()))
        .min()?;

    let half = budget / 2;
    let start = floor_boundary(text, hit.saturating_sub(half));
    let end = floor_boundary(text, (hit + half).min(text.len()));
    let mut out = String::new();
    if start > 0 {
        out.push_str(&format!("…[elided {} chars]… ", start));
    }
    out.push_str(&text[start..end]);
    if end < text.len() {
        out.push_str(&format!(" …[elided {} chars]…", text.len() - end));
    }
    Some(out)
}

/// Keep head and tail, elide the middle.
fn elide_middle(text: &str, budget: usize) -> String {
    if text.len() <= budget {
        return text.to_string();
    }
    let keep = budget.saturating_sub(32).max(32);
    let head_len = floor_boundary(text, keep * 2 / 3);
    let tail_start = floor_boundary(text, text.len() - (keep - keep * 2 / 3));
    let elided = tail_start - head_len;
    format!(
        "{}…[elided {} chars]…{}",
        &text[..head_len],
        elided,
        &text[tail_start..]
    )
}

fn floor_boundary(text: &str, index: usize) -> usize {
    let mut boundary = index.min(text.len());
    while boundary > 0 && !text.is_char_boundary(boundary) {
        boundary -= 1;
    }
    boundary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn grep_result(hits: usize) -> ToolResult {
        let items: Vec<Value> = (0..hits)
            .map(|i| json!({"path": format!("src/f{}.rs", i), "line": i + 1, "preview": "fn main"}))
            .collect();
        ToolResult::success(json!({
            "hits": items,
            "files_matched": hits,
        }))
    }

    #[test]
    fn summary_keeps_counts_only() {
        let result = grep_result(40);
        let out = compress("grep", &result, Fidelity::Summary, &[]);
        let parsed: Value = serde_json::from_str(&out.text).unwrap();
        assert_eq!(parsed["data"]["files_matched"], 40);
        assert_eq!(parsed["data"]["hits_count"], 40);
        assert!(parsed["data"].get("hits").is_none());
    }

    #[test]
    fn compact_caps_lists_and_marks_truncated() {
        let result = grep_result(40);
        let out = compress("grep", &result, Fidelity::Compact, &[]);
        assert!(out.truncated);
        let parsed: Value = serde_json::from_str(&out.text).unwrap();
        assert_eq!(parsed["truncated"], true);
        assert_eq!(parsed["data"]["hits"]["shown"], 10);
        assert_eq!(parsed["data"]["hits"]["total"], 40);
        assert_eq!(parsed["data"]["hits"]["items"].as_array().unwrap().len(), 10);
    }

    #[test]
    fn small_results_pass_untruncated() {
        let result = grep_result(2);
        let out = compress("grep", &result, Fidelity::Compact, &[]);
        assert!(!out.truncated);
        let parsed: Value = serde_json::from_str(&out.text).unwrap();
        assert!(parsed.get("truncated").is_none());
    }

    #[test]
    fn long_strings_are_elided_with_marker() {
        let result = ToolResult::success(json!({"content": "x".repeat(5000)}));
        let out = compress("read_file", &result, Fidelity::Compact, &[]);
        assert!(out.truncated);
        assert!(out.text.contains("elided"));
        assert!(out.text.len() <= Fidelity::Compact.total_budget() + 64);
    }

    #[test]
    fn keyword_bias_selects_matching_window() {
        let mut content = "a".repeat(3000);
        content.push_str("fn launch_rocket() {}");
        content.push_str(&"b".repeat(3000));
        let result = ToolResult::success(json!({"content": content}));

        let out = compress(
            "read_file",
            &result,
            Fidelity::Compact,
            &["launch_rocket".to_string()],
        );
        assert!(out.text.contains("launch_rocket"));
    }

    #[test]
    fn errors_pass_through_with_code() {
        let result = ToolResult::failure(ErrorCode::Io, "no such file: a.txt");
        let out = compress("read_file", &result, Fidelity::Compact, &[]);
        let parsed: Value = serde_json::from_str(&out.text).unwrap();
        assert_eq!(parsed["ok"], false);
        assert_eq!(parsed["error"]["code"], "E_IO");
    }

    #[test]
    fn fidelity_selection() {
        assert_eq!(choose_fidelity(0.9, false), Fidelity::Summary);
        assert_eq!(choose_fidelity(0.3, true), Fidelity::Detailed);
        assert_eq!(choose_fidelity(0.3, false), Fidelity::Compact);
    }

    #[test]
    fn cache_hits_are_marked() {
        let mut result = grep_result(1);
        result.from_cache = true;
        let out = compress("grep", &result, Fidelity::Compact, &[]);
        let parsed: Value = serde_json::from_str(&out.text).unwrap();
        assert_eq!(parsed["from_cache"], true);
    }
}
