//! Audit and trace recorders.
//!
//! Both consume the event bus and append JSONL, one event per line, with
//! locked writes. The audit log carries payload digests only; the trace log
//! carries full payloads for per-turn replay.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;

use crate::agent::events::{EventBus, TurnEvent};

/// Short hex digest of a JSON payload, stable across runs.
pub fn payload_digest(payload: &serde_json::Value) -> String {
    let canonical = canonical_json(payload);
    let hash = Sha256::digest(canonical.as_bytes());
    hex_prefix(&hash, 16)
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for byte in bytes {
        use std::fmt::Write as _;
        let _ = write!(out, "{:02x}", byte);
        if out.len() >= chars {
            break;
        }
    }
    out.truncate(chars);
    out
}

/// JSON with object keys sorted recursively, so digests don't depend on
/// serialization order.
pub fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = String::from("{");
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                out.push_str(&canonical_json(&map[*key]));
            }
            out.push('}');
            out
        }
        serde_json::Value::Array(items) => {
            let mut out = String::from("[");
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&canonical_json(item));
            }
            out.push(']');
            out
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Append-only JSONL file with a write lock.
pub struct JsonlSink {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl JsonlSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating log directory {}", parent.display()))?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, line: &serde_json::Value) -> Result<()> {
        let mut file = self.file.lock();
        serde_json::to_writer(&mut *file, line)?;
        file.write_all(b"\n")?;
        file.flush()?;
        Ok(())
    }
}

/// Spawn the audit consumer: one digest line per event.
pub fn spawn_audit_recorder(bus: &EventBus, sink: Arc<JsonlSink>) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let line = json!({
                "trace_id": event.trace_id,
                "session_id": event.session_id,
                "seq": event.seq,
                "timestamp": event.timestamp.to_rfc3339(),
                "kind": event.kind,
                "payload_digest": payload_digest(&event.payload),
            });
            if let Err(e) = sink.append(&line) {
                tracing::error!(path = %sink.path().display(), "audit append failed: {}", e);
            }
        }
    })
}

/// Spawn the trace consumer: full events for replay.
pub fn spawn_trace_recorder(bus: &EventBus, sink: Arc<JsonlSink>) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_value(&event) {
                Ok(line) => {
                    if let Err(e) = sink.append(&line) {
                        tracing::error!(path = %sink.path().display(), "trace append failed: {}", e);
                    }
                }
                Err(e) => tracing::error!("trace serialize failed: {}", e),
            }
        }
    })
}

/// In-memory collector used by tests and the CLI summary view.
pub struct EventCollector {
    events: Arc<Mutex<Vec<TurnEvent>>>,
    handle: JoinHandle<()>,
}

impl EventCollector {
    pub fn spawn(bus: &EventBus) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let store = events.clone();
        let mut rx = bus.subscribe();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                store.lock().push(event);
            }
        });
        Self { events, handle }
    }

    /// Snapshot of everything collected so far.
    pub fn events(&self) -> Vec<TurnEvent> {
        self.events.lock().clone()
    }

    pub fn abort(self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::events::{EventKind, TurnEmitter};
    use tempfile::TempDir;

    #[test]
    fn canonical_json_sorts_keys() {
        let a: serde_json::Value = serde_json::json!({"b": 1, "a": {"z": 2, "y": 3}});
        assert_eq!(canonical_json(&a), r#"{"a":{"y":3,"z":2},"b":1}"#);
    }

    #[test]
    fn digest_is_order_independent() {
        let a: serde_json::Value = serde_json::from_str(r#"{"x":1,"y":2}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"y":2,"x":1}"#).unwrap();
        assert_eq!(payload_digest(&a), payload_digest(&b));
        assert_eq!(payload_digest(&a).len(), 16);
    }

    #[tokio::test]
    async fn audit_recorder_writes_digest_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = Arc::new(JsonlSink::open(&path).unwrap());
        let bus = Arc::new(EventBus::new());
        let handle = spawn_audit_recorder(&bus, sink);

        let emitter = TurnEmitter::new(bus.clone(), "trace-1".into(), "sess-1".into());
        emitter.emit(EventKind::ToolResult, serde_json::json!({"tool": "read_file"}));

        // Let the consumer drain.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        handle.abort();

        let content = std::fs::read_to_string(&path).unwrap();
        let line: serde_json::Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(line["trace_id"], "trace-1");
        assert_eq!(line["kind"], "tool_result");
        assert_eq!(line["payload_digest"].as_str().unwrap().len(), 16);
        // Digest-only: raw payload never lands in the audit file.
        assert!(!content.contains("read_file"));
    }

    #[tokio::test]
    async fn trace_recorder_writes_full_events() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trace.jsonl");
        let sink = Arc::new(JsonlSink::open(&path).unwrap());
        let bus = Arc::new(EventBus::new());
        let handle = spawn_trace_recorder(&bus, sink);

        let emitter = TurnEmitter::new(bus.clone(), "trace-2".into(), "sess-2".into());
        emitter.emit(EventKind::FinalText, serde_json::json!({"text": "all done"}));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        handle.abort();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("all done"));
    }
}
