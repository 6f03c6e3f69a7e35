//! Agent loop: state machine, events, executors, and the orchestrator.
//!
//! ## Orchestrator (the canonical loop)
//! - `Orchestrator` - classify → route → plan/ReAct → final answer
//! - `TurnOutcome` / `StopReason` - terminal result of a turn
//! - `OrchestratorServices` / `SessionConfig` - dependencies and config
//!
//! ## Core components
//! - `EventBus` / `TurnEvent` / `TurnEmitter` - the structured event stream
//! - `AgentStateMachine` - canonical states and transitions
//! - `TurnInput` - confirmations and cancellation from the UI collaborator
//!
//! ## Execution
//! - `execute_plan` - dependency-ordered step executor with replanning
//! - `run_react` - fallback user↔tool loop
//! - `FailureTracker` - repeated-tool-failure fail-fast

pub mod events;
pub mod executor;
pub mod failure;
pub mod orchestrator;
pub mod react;
pub mod state;

pub use events::{EventBus, EventKind, StopReason, TurnEmitter, TurnEvent, TurnInput};
pub use executor::{execute_plan, PlanRunOutcome, TurnCtx};
pub use failure::FailureTracker;
pub use orchestrator::{Orchestrator, OrchestratorServices, SessionConfig, TurnOutcome};
pub use react::{run_react, ReactOutcome};
pub use state::{AgentState, AgentStateMachine, Trigger};
