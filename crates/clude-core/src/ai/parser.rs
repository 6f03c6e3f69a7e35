//! Structured parsing of assistant output.
//!
//! The loop accepts exactly two machine shapes — control frames and tool
//! calls — with everything else treated as natural language. Precedence is
//! control → tool → text, and both machine shapes must be the entire
//! message: surrounding prose disqualifies. Control tokens quoted inside
//! prose (`STEP_DONE` and friends) never trigger control semantics.

use serde_json::Value;

/// Protocol-level signal, distinct from a tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlFrame {
    StepDone,
    Replan { reason: Option<String> },
}

/// A parsed `{"tool": …, "args": {…}}` request.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall {
    pub tool: String,
    pub args: Value,
}

/// Tagged union over everything the model may answer with.
#[derive(Debug, Clone, PartialEq)]
pub enum AssistantOutput {
    Control(ControlFrame),
    ToolCall(ParsedToolCall),
    Text(String),
}

/// Parse one assistant message. Never fails: unparseable content is text.
pub fn parse_assistant_output(text: &str) -> AssistantOutput {
    let trimmed = text.trim();

    // Control frames must be the bare object, no fence, no prose.
    if let Some(frame) = try_control_frame(trimmed) {
        return AssistantOutput::Control(frame);
    }

    if let Some(call) = try_tool_call(trimmed) {
        return AssistantOutput::ToolCall(call);
    }

    // A fenced code block whose entire content is one tool-call object is
    // also accepted.
    if let Some(inner) = strip_single_fence(trimmed) {
        if let Some(call) = try_tool_call(inner.trim()) {
            return AssistantOutput::ToolCall(call);
        }
    }

    AssistantOutput::Text(text.to_string())
}

fn try_control_frame(trimmed: &str) -> Option<ControlFrame> {
    let value: Value = serde_json::from_str(trimmed).ok()?;
    let obj = value.as_object()?;
    let control = obj.get("control")?.as_str()?;

    match control {
        "step_done" => {
            if obj.len() == 1 {
                Some(ControlFrame::StepDone)
            } else {
                None
            }
        }
        "replan" => {
            let known_keys = obj.keys().all(|k| k == "control" || k == "reason");
            if !known_keys {
                return None;
            }
            let reason = obj
                .get("reason")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            Some(ControlFrame::Replan { reason })
        }
        _ => None,
    }
}

fn try_tool_call(trimmed: &str) -> Option<ParsedToolCall> {
    let value: Value = serde_json::from_str(trimmed).ok()?;
    let obj = value.as_object()?;
    let tool = obj.get("tool")?.as_str()?.to_string();

    // Only `tool` and `args` are legal keys; anything else is not a call.
    if !obj.keys().all(|k| k == "tool" || k == "args") {
        return None;
    }

    let args = match obj.get("args") {
        None => Value::Object(serde_json::Map::new()),
        Some(Value::Object(map)) => Value::Object(map.clone()),
        Some(_) => return None,
    };

    Some(ParsedToolCall { tool, args })
}

/// If the whole message is one fenced block, return the inner content.
fn strip_single_fence(trimmed: &str) -> Option<&str> {
    let rest = trimmed.strip_prefix("```")?;
    let body = rest.strip_suffix("```")?;
    // Drop the optional language tag on the opening fence line.
    let inner = match body.find('\n') {
        Some(idx) => &body[idx + 1..],
        None => body,
    };
    // A second fence inside means this was not a single block.
    if inner.contains("```") {
        return None;
    }
    Some(inner)
}
