//! The orchestrator — one canonical loop per session turn.
//!
//! A turn runs: classify → select profile → compose system prompt →
//! (plan + execute | ReAct) → final answer, with every stage emitting into
//! the event bus. Consumers (CLI, tests) subscribe to the bus and feed
//! `TurnInput`s back for confirmations and cancellation. Panics never
//! escape a turn: the outer boundary reports `internal_error`.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ai::client::LlmClient;
use crate::config::CoreConfig;
use crate::context::MessageStore;
use crate::error::{LlmError, PlanError};
use crate::intent::{classify, ProfileRouter};
use crate::plan::model::{FullPlan, VerifyMode};
use crate::plan::parser::parse_plan;
use crate::prompts::AssetLoader;
use crate::redact::redact;
use crate::tools::cache::ToolResultCache;
use crate::tools::registry::{ToolCtx, ToolRegistry};

use super::events::{EventBus, EventKind, StopReason, TurnEmitter, TurnInput};
use super::executor::{execute_plan, PlanRunOutcome, TurnCtx};
use super::react::{run_react, ReactOutcome};
use super::state::{AgentState, AgentStateMachine, Trigger};

/// Shared services the orchestrator needs.
pub struct OrchestratorServices {
    pub llm: Arc<LlmClient>,
    pub registry: Arc<ToolRegistry>,
    pub router: Arc<ProfileRouter>,
    pub assets: Arc<AssetLoader>,
    pub bus: Arc<EventBus>,
}

/// Per-session configuration.
pub struct SessionConfig {
    pub session_id: String,
    pub project_id: Option<String>,
    pub core: CoreConfig,
}

/// Terminal result of one turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub final_text: String,
    pub stop_reason: StopReason,
    pub trace_id: String,
}

/// The orchestrator owns the session's message store and tool cache; a plan
/// lives only for the duration of one turn.
pub struct Orchestrator {
    services: OrchestratorServices,
    config: SessionConfig,
    store: MessageStore,
    cache: ToolResultCache,
}

const PLAN_SYSTEM_PROMPT: &str = "\
You plan work for a code agent. Answer with ONE JSON object and nothing\n\
else, shaped as:\n\
{\"type\": \"FullPlan\", \"title\": str, \"constraints\": [str],\n\
 \"steps\": [{\"id\": str, \"description\": str, \"dependencies\": [str],\n\
 \"tools_expected\": [str]}],\n\
 \"verification\": {\"mode\": \"none|lint|test|build|custom\",\n\
 \"commands\": [str], \"required\": bool, \"stop_on_fail\": bool},\n\
 \"risk_level\": \"LOW|MEDIUM|HIGH|CRITICAL\"}\n\
Step ids must be unique; dependencies must reference existing ids and form\n\
no cycle. Keep plans small and concrete.";

const FALLBACK_FINAL_TEXT: &str =
    "I could not complete the request within the configured limits.";

impl Orchestrator {
    pub fn new(services: OrchestratorServices, config: SessionConfig) -> Self {
        let cache = ToolResultCache::new(config.core.workspace_root.clone());
        Self {
            services,
            config,
            store: MessageStore::new(),
            cache,
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.services.bus
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    /// Run one turn to completion. The caller owns the input channel and the
    /// cancellation token; both are observed at every suspension point.
    pub async fn run_turn(
        &mut self,
        user_text: &str,
        input_rx: &mut mpsc::UnboundedReceiver<TurnInput>,
        cancel: CancellationToken,
    ) -> TurnOutcome {
        let trace_id = uuid::Uuid::new_v4().to_string();
        let emitter = TurnEmitter::new(
            self.services.bus.clone(),
            trace_id.clone(),
            self.config.session_id.clone(),
        );

        let inner = AssertUnwindSafe(self.turn_inner(user_text, input_rx, cancel, &emitter))
            .catch_unwind()
            .await;

        let outcome = match inner {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::error!("panic caught at turn boundary");
                TurnOutcome {
                    final_text: "An internal error interrupted this turn.".to_string(),
                    stop_reason: StopReason::InternalError,
                    trace_id: trace_id.clone(),
                }
            }
        };

        emitter.emit(
            EventKind::FinalText,
            json!({"text": redact(&outcome.final_text)}),
        );
        emitter.emit(
            EventKind::StopReason,
            json!({"stop_reason": outcome.stop_reason}),
        );
        outcome
    }

    async fn turn_inner(
        &mut self,
        user_text: &str,
        input_rx: &mut mpsc::UnboundedReceiver<TurnInput>,
        cancel: CancellationToken,
        emitter: &TurnEmitter,
    ) -> TurnOutcome {
        let trace_id = emitter.trace_id().to_string();
        let mut machine = AgentStateMachine::new(emitter.clone());
        machine.apply(Trigger::UserMessage);

        // ── Classify and route ─────────────────────────────────────
        let verdict = classify(user_text, &self.services.llm, emitter, &cancel).await;
        emitter.emit(
            EventKind::IntentClassified,
            json!({
                "intent": verdict.intent.as_label(),
                "confidence": verdict.confidence,
                "source": verdict.source,
            }),
        );

        let routed = self
            .services
            .router
            .select(verdict.intent, self.config.project_id.as_deref());
        emitter.emit(
            EventKind::ProfileSelected,
            json!({
                "profile": routed.profile.name,
                "risk_level": routed.profile.risk_level,
                "planning_enabled": routed.planning_enabled,
            }),
        );

        machine.advance(AgentState::ContextBuilding);

        // ── System prompt ──────────────────────────────────────────
        let mut vars = std::collections::HashMap::new();
        vars.insert(
            "workspace_root".to_string(),
            self.config.core.workspace_root.display().to_string(),
        );
        vars.insert("tools".to_string(), self.services.registry.render_manifest());
        vars.insert("instruction".to_string(), user_text.to_string());

        let system_prompt = routed
            .profile
            .compose_system_prompt(&self.services.assets, &vars)
            .unwrap_or_else(|e| {
                tracing::warn!("profile assets unreadable, using built-in defaults: {}", e);
                crate::prompts::PromptProfile::default_profile()
                    .compose_system_prompt(&self.services.assets, &vars)
                    .expect("builtin assets always load")
            });
        self.store.set_system_prompt(system_prompt);
        emitter.emit(
            EventKind::SystemPromptRefreshed,
            json!({"chars": self.store.system_prompt().map(|m| m.text().len()).unwrap_or(0)}),
        );

        let user_prompt = routed
            .profile
            .render_user_prompt(&self.services.assets, &vars)
            .unwrap_or_else(|_| user_text.to_string());
        self.store.append_user(user_prompt);

        // ── Build the turn context ─────────────────────────────────
        let tool_ctx = ToolCtx::new(self.config.core.clone(), cancel.clone());
        let mut ctx = TurnCtx {
            llm: &self.services.llm,
            registry: &self.services.registry,
            emitter,
            tool_ctx: &tool_ctx,
            cancel: &cancel,
            input_rx,
            store: &mut self.store,
            cache: &mut self.cache,
            risk: routed.profile.risk_level,
            confirm_policy: self.config.core.confirm_policy,
            bounds: self.config.core.bounds.clone(),
            salient: salient_tokens(user_text),
            plan_review_approved: false,
            tools_called: HashSet::new(),
            llm_calls: 0,
        };

        // ── Plan or ReAct ──────────────────────────────────────────
        let stop_reason;
        let mut final_text = None;

        if routed.planning_enabled {
            machine.advance(AgentState::Planning);
            match generate_plan(&mut ctx, user_text).await {
                PlanGenOutcome::Plan(mut plan) => {
                    machine.advance(AgentState::Executing);
                    match execute_plan(&mut ctx, &mut plan).await {
                        PlanRunOutcome::Completed => {
                            machine.advance(AgentState::Verifying);
                            run_verification(&mut ctx, &plan).await;
                            machine.advance(AgentState::Summarizing);
                            final_text = Some(summarize(&mut ctx).await);
                            stop_reason = StopReason::Done;
                        }
                        PlanRunOutcome::Deadlock => {
                            machine.advance(AgentState::Blocked);
                            final_text = Some(
                                "The plan deadlocked: remaining steps depend on failed or \
                                 blocked work."
                                    .to_string(),
                            );
                            stop_reason = StopReason::Deadlock;
                        }
                        PlanRunOutcome::ReplanExhausted => {
                            final_text = Some(
                                "Replanning budget exhausted without completing the plan."
                                    .to_string(),
                            );
                            stop_reason = StopReason::ReplanExhausted;
                        }
                        PlanRunOutcome::LlmFailed => {
                            stop_reason = StopReason::LlmError;
                        }
                        PlanRunOutcome::Cancelled => {
                            machine.apply(Trigger::Cancel);
                            stop_reason = StopReason::Cancelled;
                        }
                        PlanRunOutcome::BudgetExhausted => {
                            stop_reason = StopReason::MaxIterations;
                        }
                    }
                }
                PlanGenOutcome::FallbackToReact => {
                    machine.advance(AgentState::Executing);
                    let (text, reason) = react_to_outcome(run_react(&mut ctx).await, &mut machine);
                    final_text = text;
                    stop_reason = reason;
                }
                PlanGenOutcome::LlmFailed => {
                    stop_reason = StopReason::LlmError;
                }
                PlanGenOutcome::Cancelled => {
                    machine.apply(Trigger::Cancel);
                    stop_reason = StopReason::Cancelled;
                }
            }
        } else {
            machine.advance(AgentState::Executing);
            let (text, reason) = react_to_outcome(run_react(&mut ctx).await, &mut machine);
            final_text = text;
            stop_reason = reason;
        }

        drop(ctx);

        if machine.state() != AgentState::Done {
            machine.advance(AgentState::Done);
        }

        let final_text = final_text
            .or_else(|| self.store.last_assistant_text())
            .unwrap_or_else(|| FALLBACK_FINAL_TEXT.to_string());

        TurnOutcome {
            final_text: redact(&final_text),
            stop_reason,
            trace_id,
        }
    }
}

fn react_to_outcome(
    outcome: ReactOutcome,
    machine: &mut AgentStateMachine,
) -> (Option<String>, StopReason) {
    match outcome {
        ReactOutcome::Final(text) => (Some(text), StopReason::Done),
        ReactOutcome::Exhausted => (None, StopReason::MaxIterations),
        ReactOutcome::LlmFailed => (None, StopReason::LlmError),
        ReactOutcome::BudgetExhausted => (None, StopReason::MaxIterations),
        ReactOutcome::Cancelled => {
            machine.apply(Trigger::Cancel);
            (None, StopReason::Cancelled)
        }
    }
}

enum PlanGenOutcome {
    Plan(FullPlan),
    /// The model never produced JSON at all; degrade to ReAct.
    FallbackToReact,
    LlmFailed,
    Cancelled,
}

/// Ask the model for a plan with bounded corrective retries. Validation
/// failures (cycles, duplicate ids) are protocol errors and end the turn;
/// a model that simply does not emit JSON sends the turn down the ReAct
/// path instead.
async fn generate_plan(ctx: &mut TurnCtx<'_>, user_text: &str) -> PlanGenOutcome {
    let request = format!(
        "Task: {}\n\nAvailable tools:\n{}\nProduce the plan now (at most {} steps).",
        user_text,
        ctx.registry.render_manifest(),
        ctx.bounds.max_plan_steps,
    );

    let mut saw_json = false;
    let mut last_error = String::new();

    for attempt in 0..=ctx.bounds.max_plan_parse_retries {
        if ctx.cancel.is_cancelled() {
            return PlanGenOutcome::Cancelled;
        }
        ctx.llm_calls += 1;

        let user_message = if attempt == 0 {
            request.clone()
        } else {
            format!("{}\n\nYour previous answer was invalid: {}", request, last_error)
        };

        let answer = match ctx
            .llm
            .complete_simple(
                PLAN_SYSTEM_PROMPT,
                &user_message,
                ctx.bounds.max_llm_output_tokens,
                ctx.emitter,
                ctx.cancel,
            )
            .await
        {
            Ok(answer) => answer,
            Err(LlmError::Cancelled) => return PlanGenOutcome::Cancelled,
            Err(_) => return PlanGenOutcome::LlmFailed,
        };

        match parse_plan(&answer, ctx.bounds.max_plan_steps) {
            Ok(plan) => {
                ctx.emitter.emit(
                    EventKind::PlanGenerated,
                    json!({
                        "title": plan.title,
                        "steps": plan.steps.len(),
                        "risk_level": plan.risk_level,
                        "verification_mode": plan.verification.mode,
                    }),
                );
                return PlanGenOutcome::Plan(plan);
            }
            Err(PlanError::NoJson) => {
                last_error = "no JSON object found".to_string();
            }
            Err(e) => {
                saw_json = true;
                last_error = e.to_string();
            }
        }
        tracing::debug!(attempt, error = %last_error, "plan answer rejected");
    }

    if saw_json {
        // The model kept producing structurally invalid plans.
        ctx.emitter.emit(
            EventKind::LlmError,
            json!({"kind": "protocol", "message": format!("plan validation failed: {}", last_error)}),
        );
        PlanGenOutcome::LlmFailed
    } else {
        tracing::info!("model never produced plan JSON, falling back to ReAct");
        PlanGenOutcome::FallbackToReact
    }
}

/// Run the plan's verification commands through the normal tool lifecycle.
async fn run_verification(ctx: &mut TurnCtx<'_>, plan: &FullPlan) {
    if plan.verification.mode == VerifyMode::None || plan.verification.commands.is_empty() {
        return;
    }

    for command in &plan.verification.commands {
        let call = crate::ai::parser::ParsedToolCall {
            tool: "run_cmd".to_string(),
            args: json!({"command": command}),
        };
        let outcome = ctx.run_tool(&call, None).await;
        let exit_code = outcome
            .result
            .payload
            .as_ref()
            .and_then(|p| p.get("exit_code"))
            .and_then(|c| c.as_i64());
        let ok = outcome.result.ok && exit_code == Some(0);

        ctx.emitter.emit(
            EventKind::Verify,
            json!({
                "command": command,
                "ok": ok,
                "exit_code": exit_code,
                "required": plan.verification.required,
            }),
        );
        ctx.store.append_user(format!(
            "Verification command `{}` {}.",
            command,
            if ok { "passed" } else { "failed" }
        ));

        if !ok && plan.verification.stop_on_fail {
            break;
        }
    }
}

/// Final summarizing call over the transcript.
async fn summarize(ctx: &mut TurnCtx<'_>) -> String {
    ctx.store.append_user(
        "All plan steps are complete. Summarize the outcome for the user in \
         plain text (no JSON)."
            .to_string(),
    );
    match ctx.chat().await {
        Ok(text) => {
            ctx.store.append_assistant(text.clone());
            text
        }
        Err(_) => ctx
            .store
            .last_assistant_text()
            .unwrap_or_else(|| FALLBACK_FINAL_TEXT.to_string()),
    }
}

/// Tokens from the user text worth biasing previews and trimming toward.
fn salient_tokens(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.split(|c: char| c.is_whitespace() || "\"'`,;:!?()[]{}<>".contains(c))
        .filter(|t| t.len() >= 4)
        .map(|t| t.to_string())
        .filter(|t| seen.insert(t.clone()))
        .take(8)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn salient_tokens_dedupe_and_cap() {
        let tokens = salient_tokens("read src/main.go and src/main.go again, please read");
        assert!(tokens.contains(&"src/main.go".to_string()));
        assert_eq!(
            tokens.iter().filter(|t| *t == "src/main.go").count(),
            1
        );
        assert!(tokens.len() <= 8);
    }

    #[test]
    fn short_tokens_are_dropped() {
        let tokens = salient_tokens("go to a b c");
        assert!(tokens.is_empty());
    }
}
