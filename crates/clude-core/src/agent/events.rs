//! Canonical event stream for the agent loop.
//!
//! Every component emits `TurnEvent`s into the `EventBus`; the audit and
//! trace recorders (and any UI) consume them. The bus is non-blocking on the
//! producer side, strictly ordered per session via a monotone sequence
//! number, and never drops events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Fixed event vocabulary. Consumers match exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    IntentClassified,
    ProfileSelected,
    SystemPromptRefreshed,
    PlanGenerated,
    PlanStepStart,
    PlanStepEnd,
    PlanReplanned,
    LlmRequest,
    LlmResponse,
    LlmError,
    ToolCallParsed,
    ToolConfirm,
    PolicyDeny,
    ToolResult,
    ToolResultFedBack,
    Verify,
    State,
    FinalText,
    StopReason,
}

/// Terminal classification of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Done,
    Cancelled,
    MaxIterations,
    MaxReplans,
    Deadlock,
    ReplanExhausted,
    LlmError,
    PolicyReject,
    InternalError,
}

impl StopReason {
    /// Exit code when the core is wrapped by a CLI.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Done => 0,
            Self::Cancelled => 4,
            Self::PolicyReject => 2,
            _ => 1,
        }
    }
}

/// One structured event in the turn's stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnEvent {
    pub trace_id: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Monotone within one turn; replay observes the same order.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub payload: Value,
}

/// External inputs the UI collaborator provides back to a running turn.
#[derive(Debug, Clone)]
pub enum TurnInput {
    /// Answer to a `tool_confirm` (or plan-review) request.
    Confirmation { call_id: String, approved: bool },
    /// User requested cancellation.
    Cancel,
}

/// Fan-out bus. Producers never block; each consumer owns its receiver and
/// drains asynchronously.
pub struct EventBus {
    consumers: Mutex<Vec<mpsc::UnboundedSender<TurnEvent>>>,
    seq: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            consumers: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Register a consumer. Events emitted after this call are delivered in
    /// emission order.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TurnEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.consumers.lock().push(tx);
        rx
    }

    /// Assign the next sequence number and deliver to every live consumer.
    pub fn publish(&self, mut event: TurnEvent) {
        event.seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let mut consumers = self.consumers.lock();
        consumers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Handle bound to one turn's identifiers, so components emit without
/// threading ids everywhere.
#[derive(Clone)]
pub struct TurnEmitter {
    bus: Arc<EventBus>,
    trace_id: String,
    session_id: String,
}

impl TurnEmitter {
    pub fn new(bus: Arc<EventBus>, trace_id: String, session_id: String) -> Self {
        Self {
            bus,
            trace_id,
            session_id,
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn emit(&self, kind: EventKind, payload: Value) {
        self.emit_inner(None, kind, payload);
    }

    pub fn emit_step(&self, step_id: &str, kind: EventKind, payload: Value) {
        self.emit_inner(Some(step_id.to_string()), kind, payload);
    }

    fn emit_inner(&self, step_id: Option<String>, kind: EventKind, payload: Value) {
        self.bus.publish(TurnEvent {
            trace_id: self.trace_id.clone(),
            session_id: self.session_id.clone(),
            step_id,
            seq: 0, // assigned by the bus
            timestamp: Utc::now(),
            kind,
            payload,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn events_arrive_in_emission_order() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe();
        let emitter = TurnEmitter::new(bus, "t1".into(), "s1".into());

        emitter.emit(EventKind::IntentClassified, json!({"intent": "GENERAL_CHAT"}));
        emitter.emit(EventKind::State, json!({"state": "INTAKE"}));
        emitter.emit(EventKind::FinalText, json!({"text": "hi"}));

        let a = rx.recv().await.unwrap();
        let b = rx.recv().await.unwrap();
        let c = rx.recv().await.unwrap();
        assert_eq!(a.kind, EventKind::IntentClassified);
        assert_eq!(b.kind, EventKind::State);
        assert_eq!(c.kind, EventKind::FinalText);
        assert!(a.seq < b.seq && b.seq < c.seq);
    }

    #[tokio::test]
    async fn dropped_consumer_does_not_block_producers() {
        let bus = Arc::new(EventBus::new());
        let rx = bus.subscribe();
        drop(rx);
        let emitter = TurnEmitter::new(bus.clone(), "t1".into(), "s1".into());
        emitter.emit(EventKind::State, json!({}));

        // A fresh consumer still receives subsequent events.
        let mut rx2 = bus.subscribe();
        emitter.emit(EventKind::FinalText, json!({"text": "ok"}));
        let ev = rx2.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::FinalText);
    }

    #[test]
    fn stop_reason_exit_codes() {
        assert_eq!(StopReason::Done.exit_code(), 0);
        assert_eq!(StopReason::PolicyReject.exit_code(), 2);
        assert_eq!(StopReason::Cancelled.exit_code(), 4);
        assert_eq!(StopReason::Deadlock.exit_code(), 1);
    }

    #[test]
    fn event_kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&EventKind::ToolResultFedBack).unwrap(),
            "\"tool_result_fed_back\""
        );
    }
}
