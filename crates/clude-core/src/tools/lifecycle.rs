//! Per-call tool pipeline: risk evaluation → confirmation → command safety
//! → dispatch → audit → compression.
//!
//! Every dispatch request from the model goes through `run_tool_call`. The
//! function never returns a raw error: denials, policy rejections, and
//! handler failures all come back as a `ToolResult` plus the compressed
//! feedback that becomes the next user message.

use std::time::Instant;

use serde_json::json;
use tokio::sync::mpsc;

use crate::agent::events::{EventKind, TurnEmitter, TurnInput};
use crate::ai::parser::ParsedToolCall;
use crate::audit::payload_digest;
use crate::config::ConfirmPolicy;
use crate::error::{ErrorCode, ToolError};

use super::cache::ToolResultCache;
use super::compressor::{compress, CompressedFeedback, Fidelity};
use super::registry::{SideEffects, ToolCtx, ToolRegistry, ToolResult};
use super::risk::{route, ExecutionDecision, RiskLevel};
use super::safety;

/// Outcome of one lifecycle pass.
pub struct ToolCallOutcome {
    pub result: ToolResult,
    pub feedback: CompressedFeedback,
    /// True when the call was stopped by policy or the user (as opposed to
    /// failing inside the handler).
    pub denied: bool,
}

/// Everything the pipeline needs from the surrounding turn.
pub struct ToolCallRequest<'a> {
    pub call: &'a ParsedToolCall,
    pub risk: RiskLevel,
    pub confirm_policy: ConfirmPolicy,
    /// Set once the HIGH-risk plan review has been approved this turn.
    pub plan_review_approved: &'a mut bool,
    pub fidelity: Fidelity,
    pub salient: &'a [String],
    pub step_id: Option<&'a str>,
}

pub async fn run_tool_call(
    registry: &ToolRegistry,
    cache: &mut ToolResultCache,
    ctx: &ToolCtx,
    emitter: &TurnEmitter,
    input_rx: &mut mpsc::UnboundedReceiver<TurnInput>,
    request: ToolCallRequest<'_>,
) -> ToolCallOutcome {
    let call = request.call;
    let call_id = uuid::Uuid::new_v4().to_string();
    let args_digest = payload_digest(&call.args);

    emit(
        emitter,
        request.step_id,
        EventKind::ToolCallParsed,
        json!({
            "call_id": call_id,
            "tool": call.tool,
            "args_digest": args_digest,
        }),
    );

    // ── Schema validation ──────────────────────────────────────────
    let validated = match registry.validate_args(&call.tool, call.args.clone()) {
        Ok(args) => args,
        Err(error) => {
            return finish(
                emitter,
                &request,
                &call_id,
                &args_digest,
                ToolResult::failure_with(error),
                false,
                0,
            );
        }
    };

    // ── Risk evaluation ────────────────────────────────────────────
    let Some(spec) = registry.get(&call.tool) else {
        return finish(
            emitter,
            &request,
            &call_id,
            &args_digest,
            ToolResult::failure(ErrorCode::NoTool, format!("unknown tool: {}", call.tool)),
            false,
            0,
        );
    };
    let side_effects = spec.side_effects;
    let decision = route(request.risk, side_effects);

    match decision {
        ExecutionDecision::Reject => {
            emit(
                emitter,
                request.step_id,
                EventKind::PolicyDeny,
                json!({
                    "call_id": call_id,
                    "tool": call.tool,
                    "reason": "risk level rejects side-effecting tools",
                }),
            );
            return finish(
                emitter,
                &request,
                &call_id,
                &args_digest,
                ToolResult::failure(
                    ErrorCode::PolicyDenied,
                    "tool rejected at this risk level",
                ),
                true,
                0,
            );
        }
        ExecutionDecision::Confirm => {
            let gated = match side_effects {
                SideEffects::Write => request.confirm_policy.confirm_write,
                SideEffects::Exec | SideEffects::Network => request.confirm_policy.confirm_exec,
                SideEffects::Read => false,
            };
            if gated {
                let approved = await_confirmation(
                    emitter,
                    input_rx,
                    ctx,
                    &call_id,
                    &call.tool,
                    &validated,
                    "confirm",
                    request.step_id,
                )
                .await;
                if !approved {
                    emit(
                        emitter,
                        request.step_id,
                        EventKind::PolicyDeny,
                        json!({
                            "call_id": call_id,
                            "tool": call.tool,
                            "reason": "user denied confirmation",
                        }),
                    );
                    return finish(
                        emitter,
                        &request,
                        &call_id,
                        &args_digest,
                        ToolResult::failure_with(ToolError::new(
                            ErrorCode::Denied,
                            "user declined the tool execution",
                        )),
                        true,
                        0,
                    );
                }
            }
        }
        ExecutionDecision::Approve => {
            // HIGH risk: one plan-review approval covers the rest of the turn.
            if !*request.plan_review_approved {
                let approved = await_confirmation(
                    emitter,
                    input_rx,
                    ctx,
                    &call_id,
                    &call.tool,
                    &validated,
                    "plan_review",
                    request.step_id,
                )
                .await;
                if !approved {
                    emit(
                        emitter,
                        request.step_id,
                        EventKind::PolicyDeny,
                        json!({
                            "call_id": call_id,
                            "tool": call.tool,
                            "reason": "plan review not approved",
                        }),
                    );
                    return finish(
                        emitter,
                        &request,
                        &call_id,
                        &args_digest,
                        ToolResult::failure_with(ToolError::new(
                            ErrorCode::Denied,
                            "plan review was not approved",
                        )),
                        true,
                        0,
                    );
                }
                *request.plan_review_approved = true;
            }
        }
        ExecutionDecision::Auto => {}
    }

    // ── Command safety for exec tools ──────────────────────────────
    if matches!(side_effects, SideEffects::Exec) {
        let command = validated
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if let Err(error) = safety::check_command(command, &ctx.config.exec_allow_list) {
            emit(
                emitter,
                request.step_id,
                EventKind::PolicyDeny,
                json!({
                    "call_id": call_id,
                    "tool": call.tool,
                    "reason": error.message.clone(),
                }),
            );
            return finish(
                emitter,
                &request,
                &call_id,
                &args_digest,
                ToolResult::failure_with(error),
                true,
                0,
            );
        }
    }

    // ── Execute ────────────────────────────────────────────────────
    let started = Instant::now();
    let result = registry.dispatch(&call.tool, validated, ctx, cache).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    finish(
        emitter,
        &request,
        &call_id,
        &args_digest,
        result,
        false,
        duration_ms,
    )
}

/// Emit the audit pair (tool_result + tool_result_fed_back) and compress.
fn finish(
    emitter: &TurnEmitter,
    request: &ToolCallRequest<'_>,
    call_id: &str,
    args_digest: &str,
    result: ToolResult,
    denied: bool,
    duration_ms: u64,
) -> ToolCallOutcome {
    let result_digest = payload_digest(
        &serde_json::to_value(&result).unwrap_or(serde_json::Value::Null),
    );
    emit(
        emitter,
        request.step_id,
        EventKind::ToolResult,
        json!({
            "call_id": call_id,
            "tool": request.call.tool,
            "args_digest": args_digest,
            "result_digest": result_digest,
            "duration_ms": duration_ms,
            "ok": result.ok,
            "from_cache": result.from_cache,
        }),
    );

    let feedback = compress(&request.call.tool, &result, request.fidelity, request.salient);

    emit(
        emitter,
        request.step_id,
        EventKind::ToolResultFedBack,
        json!({
            "call_id": call_id,
            "chars": feedback.text.len(),
            "truncated": feedback.truncated,
            "fidelity": feedback.fidelity.as_str(),
        }),
    );

    ToolCallOutcome {
        result,
        feedback,
        denied,
    }
}

/// Ask the UI collaborator and wait. Timeout and channel close count as
/// denial; a `Cancel` input also trips the turn's cancel token.
#[allow(clippy::too_many_arguments)]
async fn await_confirmation(
    emitter: &TurnEmitter,
    input_rx: &mut mpsc::UnboundedReceiver<TurnInput>,
    ctx: &ToolCtx,
    call_id: &str,
    tool: &str,
    args: &serde_json::Value,
    kind: &str,
    step_id: Option<&str>,
) -> bool {
    emit(
        emitter,
        step_id,
        EventKind::ToolConfirm,
        json!({
            "call_id": call_id,
            "tool": tool,
            "args": args,
            "kind": kind,
        }),
    );

    let deadline = tokio::time::Instant::now() + ctx.config.confirm_timeout;
    loop {
        match tokio::time::timeout_at(deadline, input_rx.recv()).await {
            Ok(Some(TurnInput::Confirmation {
                call_id: answered_id,
                approved,
            })) if answered_id == call_id => return approved,
            Ok(Some(TurnInput::Cancel)) => {
                ctx.cancel.cancel();
                return false;
            }
            Ok(Some(_)) => continue, // answer for another call; keep waiting
            Ok(None) => return false,
            Err(_) => {
                tracing::warn!(tool, "confirmation timed out, treating as denial");
                return false;
            }
        }
    }
}

fn emit(
    emitter: &TurnEmitter,
    step_id: Option<&str>,
    kind: EventKind,
    payload: serde_json::Value,
) {
    match step_id {
        Some(step_id) => emitter.emit_step(step_id, kind, payload),
        None => emitter.emit(kind, payload),
    }
}
