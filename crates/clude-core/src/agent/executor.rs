//! Plan execution: dependency-ordered step cursor with a bounded inner
//! tool loop per step, deadlock detection, and LLM-driven replanning.

use std::collections::HashSet;

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ai::client::LlmClient;
use crate::ai::parser::{parse_assistant_output, AssistantOutput, ControlFrame};
use crate::config::{Bounds, ConfirmPolicy};
use crate::context::MessageStore;
use crate::error::LlmError;
use crate::plan::model::{FullPlan, StepStatus};
use crate::plan::parser::{parse_plan_message, render_plan, PlanMessage};
use crate::plan::patch::apply_patch;
use crate::tools::cache::ToolResultCache;
use crate::tools::compressor::choose_fidelity;
use crate::tools::lifecycle::{run_tool_call, ToolCallOutcome, ToolCallRequest};
use crate::tools::registry::{ToolCtx, ToolRegistry};
use crate::tools::risk::RiskLevel;

use super::events::{EventKind, TurnEmitter, TurnInput};
use super::failure::FailureTracker;

/// Everything one turn threads through the executor and the ReAct loop.
pub struct TurnCtx<'a> {
    pub llm: &'a LlmClient,
    pub registry: &'a ToolRegistry,
    pub emitter: &'a TurnEmitter,
    pub tool_ctx: &'a ToolCtx,
    pub cancel: &'a CancellationToken,
    pub input_rx: &'a mut mpsc::UnboundedReceiver<TurnInput>,
    pub store: &'a mut MessageStore,
    pub cache: &'a mut ToolResultCache,
    pub risk: RiskLevel,
    pub confirm_policy: ConfirmPolicy,
    pub bounds: Bounds,
    pub salient: Vec<String>,
    /// Set once the HIGH-risk plan review has been approved.
    pub plan_review_approved: bool,
    /// Tools already called this turn (first call gets detailed feedback).
    pub tools_called: HashSet<String>,
    /// Global LLM-call counter against the turn fuse.
    pub llm_calls: usize,
}

/// Why a chat inside the loop could not continue.
pub enum LoopSignal {
    Llm(LlmError),
    Cancelled,
    BudgetExhausted,
}

impl<'a> TurnCtx<'a> {
    /// One bounded LLM call over the session store.
    pub async fn chat(&mut self) -> Result<String, LoopSignal> {
        if self.cancel.is_cancelled() {
            return Err(LoopSignal::Cancelled);
        }
        if self.llm_calls >= self.bounds.llm_call_budget() {
            tracing::warn!(llm_calls = self.llm_calls, "turn LLM call budget exhausted");
            return Err(LoopSignal::BudgetExhausted);
        }
        self.llm_calls += 1;

        match self
            .llm
            .chat(self.store, self.emitter, self.cancel, &self.salient)
            .await
        {
            Ok(text) => Ok(text),
            Err(LlmError::Cancelled) => Err(LoopSignal::Cancelled),
            Err(error) => Err(LoopSignal::Llm(error)),
        }
    }

    /// Run one parsed tool call through the full lifecycle.
    pub async fn run_tool(
        &mut self,
        call: &crate::ai::parser::ParsedToolCall,
        step_id: Option<&str>,
    ) -> ToolCallOutcome {
        let first_call = self.tools_called.insert(call.tool.clone());
        let fidelity = choose_fidelity(self.llm.utilization(self.store), first_call);
        run_tool_call(
            self.registry,
            self.cache,
            self.tool_ctx,
            self.emitter,
            self.input_rx,
            ToolCallRequest {
                call,
                risk: self.risk,
                confirm_policy: self.confirm_policy,
                plan_review_approved: &mut self.plan_review_approved,
                fidelity,
                salient: &self.salient,
                step_id,
            },
        )
        .await
    }
}

/// Terminal outcome of a plan execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanRunOutcome {
    Completed,
    Deadlock,
    ReplanExhausted,
    LlmFailed,
    Cancelled,
    BudgetExhausted,
}

/// Per-step result of the inner loop.
enum StepOutcome {
    Done,
    Failed(String),
    Replan(String),
    Interrupted(LoopSignal),
}

const REPLAN_SYSTEM_PROMPT: &str = "\
You repair plans for a code agent. Given the current plan JSON, the failed\n\
step, and the failure reason, answer with ONE JSON object and nothing else.\n\
Prefer a PlanPatch: {\"type\": \"PlanPatch\", \"remove\": [...], \"update\":\n\
[...], \"add\": [...]}. Only produce a full {\"type\": \"FullPlan\", ...} if\n\
patching is impossible. Do not touch steps that are already done.";

/// Execute a plan to a terminal outcome, replanning on failed steps.
pub async fn execute_plan(ctx: &mut TurnCtx<'_>, plan: &mut FullPlan) -> PlanRunOutcome {
    let mut replans = 0usize;

    loop {
        if plan.all_terminal() {
            return PlanRunOutcome::Completed;
        }

        let Some(next_id) = plan.ready_steps().first().map(|s| s.id.clone()) else {
            // Nothing ready but steps remain: every path is blocked/failed.
            for step in &mut plan.steps {
                if step.status == StepStatus::Pending {
                    step.status = StepStatus::Blocked;
                }
            }
            tracing::warn!("plan deadlocked: no runnable steps remain");
            return PlanRunOutcome::Deadlock;
        };

        let outcome = run_step(ctx, plan, &next_id).await;
        match outcome {
            StepOutcome::Done => {
                plan.set_status(&next_id, StepStatus::Done);
                emit_step_end(ctx, &next_id, StepStatus::Done);
            }
            StepOutcome::Failed(reason) | StepOutcome::Replan(reason) => {
                plan.set_status(&next_id, StepStatus::Failed);
                emit_step_end(ctx, &next_id, StepStatus::Failed);

                replans += 1;
                if replans > ctx.bounds.max_replans {
                    return PlanRunOutcome::ReplanExhausted;
                }
                match replan(ctx, plan, &next_id, &reason).await {
                    Ok(next_plan) => {
                        *plan = next_plan;
                        ctx.emitter.emit(
                            EventKind::PlanReplanned,
                            json!({
                                "failed_step": next_id,
                                "reason": reason,
                                "replans": replans,
                                "steps": plan.steps.len(),
                            }),
                        );
                    }
                    Err(signal) => return interrupt_outcome(signal),
                }
            }
            StepOutcome::Interrupted(signal) => {
                plan.set_status(&next_id, StepStatus::Failed);
                emit_step_end(ctx, &next_id, StepStatus::Failed);
                return interrupt_outcome(signal);
            }
        }
    }
}

fn interrupt_outcome(signal: LoopSignal) -> PlanRunOutcome {
    match signal {
        LoopSignal::Cancelled => PlanRunOutcome::Cancelled,
        LoopSignal::BudgetExhausted => PlanRunOutcome::BudgetExhausted,
        LoopSignal::Llm(_) => PlanRunOutcome::LlmFailed,
    }
}

fn emit_step_end(ctx: &TurnCtx<'_>, step_id: &str, status: StepStatus) {
    ctx.emitter.emit_step(
        step_id,
        EventKind::PlanStepEnd,
        json!({"status": status}),
    );
}

/// Inner loop for one step, bounded by `max_step_tool_calls`.
async fn run_step(ctx: &mut TurnCtx<'_>, plan: &mut FullPlan, step_id: &str) -> StepOutcome {
    let Some(step) = plan.step_mut(step_id) else {
        return StepOutcome::Failed(format!("step {} disappeared", step_id));
    };
    step.status = StepStatus::InProgress;
    let description = step.description.clone();
    let tools_expected = step.tools_expected.clone();

    ctx.emitter.emit_step(
        step_id,
        EventKind::PlanStepStart,
        json!({"description": description, "tools_expected": tools_expected}),
    );

    // The step briefing enters once; tool feedback keeps the loop going.
    let briefing = format!(
        "Current step: {}\n\nAvailable tools:\n{}\n\
         Call one tool per reply as a single JSON object, or reply\n\
         {{\"control\": \"step_done\"}} when this step is complete, or\n\
         {{\"control\": \"replan\", \"reason\": \"...\"}} if the plan no longer fits.",
        description,
        ctx.registry.render_manifest(),
    );
    ctx.store.append_user(briefing);

    let mut failures = FailureTracker::new();
    let mut protocol_violations = 0usize;

    for _ in 0..ctx.bounds.max_step_tool_calls {
        let text = match ctx.chat().await {
            Ok(text) => text,
            Err(signal) => return StepOutcome::Interrupted(signal),
        };
        ctx.store.append_assistant(text.clone());

        match parse_assistant_output(&text) {
            AssistantOutput::Control(ControlFrame::StepDone) => {
                return StepOutcome::Done;
            }
            AssistantOutput::Control(ControlFrame::Replan { reason }) => {
                return StepOutcome::Replan(
                    reason.unwrap_or_else(|| "model requested replan".to_string()),
                );
            }
            AssistantOutput::ToolCall(call) => {
                let outcome = ctx.run_tool(&call, Some(step_id)).await;
                if let Some(diagnostic) = failures.observe(&call.tool, &outcome.result) {
                    ctx.store.append_user(format!(
                        "Stopping this step: {}. Signal step_done or replan.",
                        diagnostic
                    ));
                    return StepOutcome::Failed(diagnostic);
                }
                ctx.store.append_user(outcome.feedback.text);
            }
            AssistantOutput::Text(_) => {
                if tools_expected.is_empty() {
                    // Informational step: prose completes it.
                    return StepOutcome::Done;
                }
                protocol_violations += 1;
                if protocol_violations > ctx.bounds.max_protocol_retries {
                    return StepOutcome::Failed(
                        "model kept answering prose where a tool call or control frame was required"
                            .to_string(),
                    );
                }
                ctx.store.append_user(
                    "Reply with a single JSON object only: a tool call \
                     {\"tool\": ..., \"args\": {...}}, or {\"control\": \"step_done\"}, \
                     or {\"control\": \"replan\", \"reason\": \"...\"}."
                        .to_string(),
                );
            }
        }
    }

    // Forced fuse: the step never produced a terminal control frame.
    StepOutcome::Failed(format!(
        "step exhausted its tool budget ({} calls)",
        ctx.bounds.max_step_tool_calls
    ))
}

/// Ask the model for a `PlanPatch` (full plan only if patching is
/// impossible), apply it, and preserve completed steps.
async fn replan(
    ctx: &mut TurnCtx<'_>,
    plan: &FullPlan,
    failed_step: &str,
    reason: &str,
) -> Result<FullPlan, LoopSignal> {
    let prompt = format!(
        "Current plan:\n{}\n\nStep '{}' failed: {}\n\n\
         Produce a PlanPatch that lets the remaining work proceed (for\n\
         example by replacing the failed step or inserting a step that\n\
         reports the blocker to the user).",
        render_plan(plan),
        failed_step,
        reason
    );

    let mut last_error = String::new();
    for attempt in 0..=ctx.bounds.max_plan_parse_retries {
        if ctx.cancel.is_cancelled() {
            return Err(LoopSignal::Cancelled);
        }
        if ctx.llm_calls >= ctx.bounds.llm_call_budget() {
            return Err(LoopSignal::BudgetExhausted);
        }
        ctx.llm_calls += 1;

        let user_message = if attempt == 0 {
            prompt.clone()
        } else {
            format!("{}\n\nYour previous answer was invalid: {}", prompt, last_error)
        };

        let answer = ctx
            .llm
            .complete_simple(
                REPLAN_SYSTEM_PROMPT,
                &user_message,
                ctx.bounds.max_llm_output_tokens,
                ctx.emitter,
                ctx.cancel,
            )
            .await
            .map_err(|e| match e {
                LlmError::Cancelled => LoopSignal::Cancelled,
                other => LoopSignal::Llm(other),
            })?;

        match parse_plan_message(&answer, ctx.bounds.max_plan_steps) {
            Ok(PlanMessage::Patch(patch)) => {
                match apply_patch(plan, &patch, ctx.bounds.max_plan_steps) {
                    Ok(next) => return Ok(next),
                    Err(e) => last_error = e.to_string(),
                }
            }
            Ok(PlanMessage::Full(mut full)) => {
                // Carry completed work over by id.
                for step in &mut full.steps {
                    if plan.step(&step.id).map(|s| s.status) == Some(StepStatus::Done) {
                        step.status = StepStatus::Done;
                    }
                }
                return Ok(full);
            }
            Err(e) => last_error = e.to_string(),
        }
        tracing::debug!(attempt, error = %last_error, "replan answer rejected");
    }

    Err(LoopSignal::Llm(LlmError::Protocol(format!(
        "replanning failed after retries: {}",
        last_error
    ))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::events::EventBus;
    use crate::ai::client::ScriptedBackend;
    use crate::config::CoreConfig;
    use crate::plan::model::PlanStep;
    use crate::tools::builtin::default_registry;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Harness {
        backend: Arc<ScriptedBackend>,
        llm: LlmClient,
        registry: ToolRegistry,
        emitter: TurnEmitter,
        tool_ctx: ToolCtx,
        cancel: CancellationToken,
        input_rx: mpsc::UnboundedReceiver<TurnInput>,
        _input_tx: mpsc::UnboundedSender<TurnInput>,
        store: MessageStore,
        cache: ToolResultCache,
        bounds: Bounds,
        _dir: TempDir,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::new());
        let config = CoreConfig {
            workspace_root: dir.path().to_path_buf(),
            confirm_policy: crate::config::ConfirmPolicy {
                confirm_write: false,
                confirm_exec: false,
            },
            ..Default::default()
        };
        let llm = LlmClient::new(backend.clone(), config.clone());
        let bus = Arc::new(EventBus::new());
        let emitter = TurnEmitter::new(bus, "t".into(), "s".into());
        let cancel = CancellationToken::new();
        let tool_ctx = ToolCtx::new(config.clone(), cancel.clone());
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let mut store = MessageStore::new();
        store.set_system_prompt("sys");
        store.append_user("task");

        Harness {
            backend,
            llm,
            registry: default_registry().unwrap(),
            emitter,
            tool_ctx,
            cancel,
            input_rx,
            _input_tx: input_tx,
            store,
            cache: ToolResultCache::new(PathBuf::from(dir.path())),
            bounds: config.bounds,
            _dir: dir,
        }
    }

    fn turn_ctx<'a>(h: &'a mut Harness) -> TurnCtx<'a> {
        TurnCtx {
            llm: &h.llm,
            registry: &h.registry,
            emitter: &h.emitter,
            tool_ctx: &h.tool_ctx,
            cancel: &h.cancel,
            input_rx: &mut h.input_rx,
            store: &mut h.store,
            cache: &mut h.cache,
            risk: RiskLevel::Medium,
            confirm_policy: crate::config::ConfirmPolicy {
                confirm_write: false,
                confirm_exec: false,
            },
            bounds: h.bounds.clone(),
            salient: Vec::new(),
            plan_review_approved: false,
            tools_called: HashSet::new(),
            llm_calls: 0,
        }
    }

    fn simple_plan() -> FullPlan {
        let mut step = PlanStep::new("s1", "list the workspace");
        step.tools_expected = vec!["list_dir".into()];
        FullPlan::new("test", vec![step])
    }

    #[tokio::test]
    async fn plan_completes_on_tool_then_step_done() {
        let mut h = harness();
        h.backend
            .push_text(r#"{"tool": "list_dir", "args": {}}"#);
        h.backend.push_text(r#"{"control": "step_done"}"#);

        let mut plan = simple_plan();
        let outcome = execute_plan(&mut turn_ctx(&mut h), &mut plan).await;
        assert_eq!(outcome, PlanRunOutcome::Completed);
        assert_eq!(plan.step("s1").unwrap().status, StepStatus::Done);
    }

    #[tokio::test]
    async fn informational_step_completes_on_prose() {
        let mut h = harness();
        h.backend.push_text("Nothing to do here, moving on.");

        let mut plan = FullPlan::new("info", vec![PlanStep::new("s1", "explain")]);
        let outcome = execute_plan(&mut turn_ctx(&mut h), &mut plan).await;
        assert_eq!(outcome, PlanRunOutcome::Completed);
    }

    #[tokio::test]
    async fn prose_on_tool_step_burns_protocol_retries_then_replans() {
        let mut h = harness();
        // Three prose answers exhaust the protocol retries (2) and fail the
        // step; the replan prompt then gets a patch that drops the step.
        h.backend.push_text("I think I should look around.");
        h.backend.push_text("Still thinking out loud.");
        h.backend.push_text("More prose.");
        h.backend
            .push_text(r#"{"type": "PlanPatch", "remove": ["s1"], "add": [{"id": "s2", "description": "report blocker"}]}"#);
        h.backend.push_text("Summary of the blocker.");

        let mut plan = simple_plan();
        let outcome = execute_plan(&mut turn_ctx(&mut h), &mut plan).await;
        // s1 removed, s2 is informational and completes on prose.
        assert_eq!(outcome, PlanRunOutcome::Completed);
        assert!(plan.step("s2").is_some());
    }

    #[tokio::test]
    async fn replans_exhaust_when_step_keeps_failing() {
        let mut h = harness();
        // The single step fails repeatedly; replans exhaust.
        for _ in 0..=h.bounds.max_replans {
            h.backend.push_text("prose");
            h.backend.push_text("prose");
            h.backend.push_text("prose");
            // Replan answer: an (invalid) patch is retried, then gives up.
            h.backend
                .push_text(r#"{"type": "PlanPatch", "update": [{"id": "s1", "status": "pending"}]}"#);
        }

        let mut plan = simple_plan();
        let outcome = execute_plan(&mut turn_ctx(&mut h), &mut plan).await;
        // Each failure consumes one replan; the valid patches reset s1 to
        // pending, so the loop keeps failing until replans exhaust.
        assert_eq!(outcome, PlanRunOutcome::ReplanExhausted);
    }

    #[tokio::test]
    async fn dependency_failure_blocks_dependents() {
        let mut h = harness();
        // Step a fails on prose (3x); replan attempts return garbage until
        // the retry budget is gone → LlmFailed? No: parse failures end with
        // Protocol error. Use a patch that marks nothing and still fails.
        h.backend.push_text("prose");
        h.backend.push_text("prose");
        h.backend.push_text("prose");
        h.backend.push_text("not json");
        h.backend.push_text("not json");
        h.backend.push_text("not json");

        let mut a = PlanStep::new("a", "first");
        a.tools_expected = vec!["list_dir".into()];
        let mut b = PlanStep::new("b", "second");
        b.dependencies = vec!["a".into()];
        let mut plan = FullPlan::new("dep", vec![a, b]);

        let outcome = execute_plan(&mut turn_ctx(&mut h), &mut plan).await;
        assert_eq!(outcome, PlanRunOutcome::LlmFailed);
        assert_eq!(plan.step("a").unwrap().status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn deadlock_when_patch_leaves_dependents_unrunnable() {
        let mut h = harness();
        // Step a fails; the patch is empty (valid but useless), so b can
        // never become ready.
        h.backend.push_text("prose");
        h.backend.push_text("prose");
        h.backend.push_text("prose");
        h.backend.push_text(r#"{"type": "PlanPatch"}"#);

        let mut a = PlanStep::new("a", "first");
        a.tools_expected = vec!["list_dir".into()];
        let mut b = PlanStep::new("b", "second");
        b.dependencies = vec!["a".into()];
        let mut plan = FullPlan::new("dep", vec![a, b]);

        let outcome = execute_plan(&mut turn_ctx(&mut h), &mut plan).await;
        assert_eq!(outcome, PlanRunOutcome::Deadlock);
        assert_eq!(plan.step("b").unwrap().status, StepStatus::Blocked);
    }

    #[tokio::test]
    async fn cancellation_stops_the_plan() {
        let mut h = harness();
        h.cancel.cancel();
        let mut plan = simple_plan();
        let outcome = execute_plan(&mut turn_ctx(&mut h), &mut plan).await;
        assert_eq!(outcome, PlanRunOutcome::Cancelled);
    }

    #[tokio::test]
    async fn global_llm_call_fuse_stops_the_turn() {
        let mut h = harness();
        h.backend
            .push_text(r#"{"tool": "list_dir", "args": {}}"#);

        let mut plan = simple_plan();
        let mut ctx = turn_ctx(&mut h);
        // Simulate a turn that already spent its entire call budget.
        ctx.llm_calls = ctx.bounds.llm_call_budget();
        let outcome = execute_plan(&mut ctx, &mut plan).await;
        assert_eq!(outcome, PlanRunOutcome::BudgetExhausted);
        // The fuse tripped before the backend was ever reached.
        assert_eq!(h.backend.requests().len(), 0);
    }

    #[tokio::test]
    async fn repeated_tool_failures_fail_fast() {
        let mut h = harness();
        // Same failing call twice trips the tracker before the budget.
        h.backend
            .push_text(r#"{"tool": "read_file", "args": {"path": "missing.txt"}}"#);
        h.backend
            .push_text(r#"{"tool": "read_file", "args": {"path": "missing.txt"}}"#);
        // Replan: remove the step, add an informational one.
        h.backend
            .push_text(r#"{"type": "PlanPatch", "remove": ["s1"], "add": [{"id": "s2", "description": "report"}]}"#);
        h.backend.push_text("Could not read the file.");

        let mut plan = simple_plan();
        let mut ctx = turn_ctx(&mut h);
        let outcome = execute_plan(&mut ctx, &mut plan).await;
        assert_eq!(outcome, PlanRunOutcome::Completed);
    }
}
