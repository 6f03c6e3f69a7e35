//! Canonical agent states and the transition rules between them.
//!
//! The machine is a Mealy-style transducer: every accepted transition emits
//! one `state` event into the bus. External inputs arrive as `Trigger`s (a
//! closed set); phase progress the orchestrator drives itself goes through
//! `advance`, validated against the successor table. An invalid transition
//! is a bug: fatal in debug builds, logged and ignored in release.

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::events::{EventKind, TurnEmitter};

/// Agent states. `Idle` and `Done` are the only quiescent states; every
/// other state must make progress within a bounded number of events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    Idle,
    Intake,
    Clarifying,
    ContextBuilding,
    Planning,
    Executing,
    Verifying,
    Summarizing,
    AwaitingConfirmation,
    Recovering,
    Blocked,
    Done,
}

/// Closed set of external transition triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Trigger {
    UserMessage,
    ToolCallRequest,
    ToolCallResult,
    Confirm,
    Timeout,
    Cancel,
    StepDone,
    Replan,
}

impl AgentState {
    fn is_active(self) -> bool {
        !matches!(self, Self::Idle | Self::Done)
    }

    /// States the orchestrator may move to directly.
    fn allowed_successors(self) -> &'static [AgentState] {
        use AgentState::*;
        match self {
            Idle => &[Intake],
            Intake => &[Clarifying, ContextBuilding],
            Clarifying => &[ContextBuilding, Done],
            ContextBuilding => &[Planning, Executing],
            Planning => &[Executing, Blocked, Done],
            Executing => &[
                AwaitingConfirmation,
                Verifying,
                Summarizing,
                Recovering,
                Blocked,
                Planning,
                Done,
            ],
            Verifying => &[Summarizing, Executing, Recovering, Done],
            Summarizing => &[Done],
            AwaitingConfirmation => &[Executing, Done],
            Recovering => &[Executing, Planning, Blocked, Done],
            Blocked => &[Done],
            Done => &[],
        }
    }
}

/// Deterministic transition function over (state, trigger). `None` means the
/// trigger is not accepted in that state.
fn next_state(state: AgentState, trigger: Trigger) -> Option<AgentState> {
    use AgentState::*;
    use Trigger::*;

    match (state, trigger) {
        // Cancellation wins from every state.
        (_, Cancel) => Some(Done),

        (Idle, UserMessage) => Some(Intake),
        (Clarifying, UserMessage) => Some(ContextBuilding),

        (Executing, ToolCallRequest) => Some(Executing),
        (Executing, ToolCallResult) => Some(Executing),
        (Executing, StepDone) => Some(Executing),
        (Executing, Replan) => Some(Planning),

        (AwaitingConfirmation, Confirm) => Some(Executing),

        (Recovering, ToolCallResult) => Some(Executing),
        (Recovering, Replan) => Some(Planning),

        (s, Timeout) if s.is_active() => Some(Recovering),

        _ => None,
    }
}

/// Per-session state machine, bound to the turn's event emitter.
pub struct AgentStateMachine {
    state: AgentState,
    emitter: TurnEmitter,
}

impl AgentStateMachine {
    pub fn new(emitter: TurnEmitter) -> Self {
        Self {
            state: AgentState::Idle,
            emitter,
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    /// Apply an external trigger. Unaccepted triggers are bugs.
    pub fn apply(&mut self, trigger: Trigger) -> AgentState {
        match next_state(self.state, trigger) {
            Some(next) => self.commit(next, Some(trigger)),
            None => {
                debug_assert!(
                    false,
                    "invalid transition {:?} + {:?}",
                    self.state, trigger
                );
                tracing::error!(
                    state = ?self.state,
                    trigger = ?trigger,
                    "invalid state transition ignored"
                );
            }
        }
        self.state
    }

    /// Orchestrator-driven phase progress, validated against the successor
    /// table.
    pub fn advance(&mut self, to: AgentState) -> AgentState {
        if self.state.allowed_successors().contains(&to) {
            self.commit(to, None);
        } else if self.state != to {
            debug_assert!(false, "invalid advance {:?} -> {:?}", self.state, to);
            tracing::error!(from = ?self.state, to = ?to, "invalid state advance ignored");
        }
        self.state
    }

    fn commit(&mut self, next: AgentState, trigger: Option<Trigger>) {
        let from = self.state;
        self.state = next;
        self.emitter.emit(
            EventKind::State,
            json!({
                "from": from,
                "to": next,
                "trigger": trigger,
            }),
        );
    }
}
