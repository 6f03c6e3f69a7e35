//! ReAct fallback loop.
//!
//! Used when planning is disabled (chat and capability intents) or when
//! plan generation never produced usable JSON. The loop alternates
//! user ↔ assistant with the same parser as the step executor; plain text
//! ends the turn as the final answer. Control frames are a protocol
//! violation here and are corrected a bounded number of times before the
//! loop degrades to returning the raw text.

use serde_json::json;

use crate::ai::parser::{parse_assistant_output, AssistantOutput};

use super::events::EventKind;
use super::executor::{LoopSignal, TurnCtx};

/// Terminal outcome of a ReAct run.
pub enum ReactOutcome {
    /// Normal end: the model answered in prose.
    Final(String),
    /// Iteration fuse blew before a prose answer.
    Exhausted,
    LlmFailed,
    Cancelled,
    BudgetExhausted,
}

pub async fn run_react(ctx: &mut TurnCtx<'_>) -> ReactOutcome {
    let mut control_violations = 0usize;

    for _ in 0..ctx.bounds.max_step_tool_calls {
        let text = match ctx.chat().await {
            Ok(text) => text,
            Err(LoopSignal::Cancelled) => return ReactOutcome::Cancelled,
            Err(LoopSignal::BudgetExhausted) => return ReactOutcome::BudgetExhausted,
            Err(LoopSignal::Llm(_)) => return ReactOutcome::LlmFailed,
        };
        ctx.store.append_assistant(text.clone());

        match parse_assistant_output(&text) {
            AssistantOutput::Text(answer) => {
                return ReactOutcome::Final(answer);
            }
            AssistantOutput::ToolCall(call) => {
                let outcome = ctx.run_tool(&call, None).await;
                ctx.store.append_user(outcome.feedback.text);
            }
            AssistantOutput::Control(frame) => {
                // Control frames belong to plan execution, not this loop.
                control_violations += 1;
                if control_violations > ctx.bounds.max_protocol_retries {
                    ctx.emitter.emit(
                        EventKind::LlmError,
                        json!({
                            "kind": "protocol",
                            "message": "persistent control frames outside plan execution; \
                                        degrading to raw text",
                        }),
                    );
                    return ReactOutcome::Final(text);
                }
                tracing::debug!(?frame, "control frame rejected in ReAct loop");
                ctx.store.append_user(
                    "Control frames are not valid here. Either call a tool as a \
                     single JSON object or answer the user in plain text."
                        .to_string(),
                );
            }
        }
    }

    ReactOutcome::Exhausted
}
