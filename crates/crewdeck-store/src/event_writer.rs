use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crewdeck_types::{EventId, EventKind};
use once_cell::sync::Lazy;
use rusqlite::Connection;

use crate::db::Storage;
use crate::queries::event::{self, EventRefs};
use crate::time::fmt_ts;
use crate::{Error, Result};

/// Declared payload contract for one event kind.
struct PayloadContract {
    required: &'static [&'static str],
    optional: &'static [&'static str],
}

static CONTRACTS: Lazy<HashMap<EventKind, PayloadContract>> = Lazy::new(|| {
    use EventKind::*;
    let mut map = HashMap::new();
    map.insert(SessionRegistered, PayloadContract {
        required: &["session_uuid"],
        optional: &["project_path", "working_directory"],
    });
    map.insert(SessionEnded, PayloadContract {
        required: &["reason"],
        optional: &["session_uuid"],
    });
    map.insert(TurnDetected, PayloadContract {
        required: &["actor", "intent"],
        optional: &["text_preview", "timestamp_source"],
    });
    map.insert(StateTransition, PayloadContract {
        required: &["from_state", "to_state", "trigger"],
        optional: &["confidence", "reason"],
    });
    map.insert(HookReceived, PayloadContract {
        required: &["hook"],
        optional: &["working_directory", "kind"],
    });
    map.insert(HookSessionStart, PayloadContract {
        required: &["claude_session_id"],
        optional: &["working_directory"],
    });
    map.insert(HookSessionEnd, PayloadContract {
        required: &["claude_session_id"],
        optional: &["reason"],
    });
    map.insert(HookUserPrompt, PayloadContract {
        required: &["claude_session_id"],
        optional: &["prompt_preview"],
    });
    map.insert(HookStop, PayloadContract {
        required: &["claude_session_id"],
        optional: &[],
    });
    map.insert(HookNotification, PayloadContract {
        required: &["claude_session_id"],
        optional: &["message", "kind"],
    });
    map.insert(HookPostToolUse, PayloadContract {
        required: &["claude_session_id"],
        optional: &["tool_name", "output_preview"],
    });
    map.insert(QuestionDetected, PayloadContract {
        required: &["question"],
        optional: &["turn_id"],
    });
    map
});

/// Validate a payload against the declared contract before any I/O.
pub fn validate_payload(kind: EventKind, payload: &serde_json::Value) -> Result<()> {
    let contract = CONTRACTS
        .get(&kind)
        .ok_or_else(|| Error::Validation(format!("Unknown event type: {kind}")))?;

    let object = payload
        .as_object()
        .ok_or_else(|| Error::Validation(format!("Payload for {kind} must be an object")))?;

    let missing: Vec<&str> = contract
        .required
        .iter()
        .copied()
        .filter(|field| !object.contains_key(*field))
        .collect();
    if !missing.is_empty() {
        return Err(Error::Validation(format!(
            "Missing required fields for {kind}: {}",
            missing.join(", ")
        )));
    }

    for field in object.keys() {
        let declared = contract.required.contains(&field.as_str())
            || contract.optional.contains(&field.as_str());
        if !declared {
            return Err(Error::Validation(format!(
                "Undeclared field for {kind}: {field}"
            )));
        }
    }
    Ok(())
}

/// Result of a write attempt.
#[derive(Debug, Clone)]
pub struct WriteResult {
    pub success: bool,
    pub event_id: Option<EventId>,
    pub error: Option<String>,
    pub retries: u32,
}

impl WriteResult {
    fn ok(event_id: EventId, retries: u32) -> Self {
        Self { success: true, event_id: Some(event_id), error: None, retries }
    }

    fn failed(error: String, retries: u32) -> Self {
        Self { success: false, event_id: None, error: Some(error), retries }
    }
}

#[derive(Debug, Default, Clone)]
pub struct WriterMetrics {
    pub total_writes: u64,
    pub successful_writes: u64,
    pub failed_writes: u64,
    pub last_write_timestamp: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Validated, retrying writer for the event log.
///
/// Two persistence modes: `write` owns a short-lived connection and commits;
/// `write_with_conn` rides a caller's connection so a hook handler can bundle
/// turn, transition, and event into one transaction.
pub struct EventWriter {
    storage: Storage,
    retry_attempts: u32,
    retry_delay_ms: u64,
    running: AtomicBool,
    metrics: Mutex<WriterMetrics>,
}

impl EventWriter {
    pub fn new(storage: Storage, retry_attempts: u32, retry_delay_ms: u64) -> Self {
        Self {
            storage,
            retry_attempts,
            retry_delay_ms,
            running: AtomicBool::new(true),
            metrics: Mutex::new(WriterMetrics::default()),
        }
    }

    /// Own-connection mode: validate, open, insert, commit, retrying
    /// transient failures with exponential backoff.
    pub fn write(&self, kind: EventKind, payload: serde_json::Value, refs: EventRefs) -> WriteResult {
        if !self.running.load(Ordering::SeqCst) {
            return self.record(WriteResult::failed("Event writer is stopped".to_string(), 0));
        }
        if let Err(err) = validate_payload(kind, &payload) {
            return self.record(WriteResult::failed(err.to_string(), 0));
        }

        let mut retries = 0;
        loop {
            let attempt = self
                .storage
                .connect()
                .and_then(|db| event::insert(db.conn(), kind.as_str(), &payload, Utc::now(), refs));
            match attempt {
                Ok(event_id) => return self.record(WriteResult::ok(event_id, retries)),
                Err(err) if err.is_transient() && retries < self.retry_attempts => {
                    let delay = self.retry_delay_ms.saturating_mul(1 << retries.min(10));
                    tracing::debug!(%err, retries, delay_ms = delay, "transient event write failure");
                    std::thread::sleep(Duration::from_millis(delay));
                    retries += 1;
                }
                Err(err) => return self.record(WriteResult::failed(err.to_string(), retries)),
            }
        }
    }

    /// Pass-through mode: insert on the caller's connection without
    /// committing, leaving transaction control to the caller.
    pub fn write_with_conn(
        &self,
        conn: &Connection,
        kind: EventKind,
        payload: serde_json::Value,
        refs: EventRefs,
    ) -> WriteResult {
        if !self.running.load(Ordering::SeqCst) {
            return self.record(WriteResult::failed("Event writer is stopped".to_string(), 0));
        }
        if let Err(err) = validate_payload(kind, &payload) {
            return self.record(WriteResult::failed(err.to_string(), 0));
        }

        match event::insert(conn, kind.as_str(), &payload, Utc::now(), refs) {
            Ok(event_id) => self.record(WriteResult::ok(event_id, 0)),
            Err(err) => self.record(WriteResult::failed(err.to_string(), 0)),
        }
    }

    pub fn metrics(&self) -> WriterMetrics {
        self.metrics.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn record(&self, result: WriteResult) -> WriteResult {
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.total_writes += 1;
            if result.success {
                metrics.successful_writes += 1;
                metrics.last_write_timestamp = Some(Utc::now());
            } else {
                metrics.failed_writes += 1;
                metrics.last_error = result.error.clone();
            }
        }
        result
    }
}

/// Convenience for building event timestamps in payloads.
pub fn now_ts() -> String {
    fmt_ts(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn writer() -> (tempfile::TempDir, EventWriter) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().join("events.db")).unwrap();
        (dir, EventWriter::new(storage, 3, 10))
    }

    #[test]
    fn valid_payload_is_written() {
        let (_dir, writer) = writer();
        let result = writer.write(
            EventKind::SessionRegistered,
            json!({"session_uuid": "S1", "project_path": "/proj"}),
            EventRefs::default(),
        );
        assert!(result.success, "{:?}", result.error);
        assert!(result.event_id.is_some());
        assert_eq!(result.retries, 0);

        let metrics = writer.metrics();
        assert_eq!(metrics.total_writes, 1);
        assert_eq!(metrics.successful_writes, 1);
        assert!(metrics.last_write_timestamp.is_some());
    }

    #[test]
    fn missing_required_field_is_rejected_before_io() {
        let (_dir, writer) = writer();
        let result = writer.write(
            EventKind::StateTransition,
            json!({"from_state": "commanded"}),
            EventRefs::default(),
        );
        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.contains("Missing required fields"), "{error}");
        assert!(error.contains("to_state"));
        assert_eq!(writer.metrics().failed_writes, 1);
    }

    #[test]
    fn undeclared_field_is_rejected() {
        let (_dir, writer) = writer();
        let result = writer.write(
            EventKind::HookStop,
            json!({"claude_session_id": "S1", "surprise": true}),
            EventRefs::default(),
        );
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Undeclared field"));
    }

    #[test]
    fn stopped_writer_refuses_writes() {
        let (_dir, writer) = writer();
        writer.stop();
        let result = writer.write(
            EventKind::HookStop,
            json!({"claude_session_id": "S1"}),
            EventRefs::default(),
        );
        assert!(!result.success);
        assert!(result.error.unwrap().to_lowercase().contains("stopped"));
    }

    #[test]
    fn pass_through_rides_callers_transaction() {
        let (_dir, writer) = writer();
        let mut db = writer.storage.connect().unwrap();
        let tx = db.conn_mut().transaction().unwrap();

        let result = writer.write_with_conn(
            &tx,
            EventKind::SessionEnded,
            json!({"reason": "timeout"}),
            EventRefs::default(),
        );
        assert!(result.success);

        // Rolling back the outer transaction discards the event too.
        tx.rollback().unwrap();
        let rows = event::list_by_type(db.conn(), "session_ended", 10).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn every_declared_kind_validates_a_minimal_payload() {
        let minimal: &[(EventKind, serde_json::Value)] = &[
            (EventKind::SessionRegistered, json!({"session_uuid": "S"})),
            (EventKind::SessionEnded, json!({"reason": "timeout"})),
            (EventKind::TurnDetected, json!({"actor": "agent", "intent": "progress"})),
            (
                EventKind::StateTransition,
                json!({"from_state": "commanded", "to_state": "processing", "trigger": "agent_progress"}),
            ),
            (EventKind::HookReceived, json!({"hook": "stop"})),
            (EventKind::HookSessionStart, json!({"claude_session_id": "S"})),
            (EventKind::HookSessionEnd, json!({"claude_session_id": "S"})),
            (EventKind::HookUserPrompt, json!({"claude_session_id": "S"})),
            (EventKind::HookStop, json!({"claude_session_id": "S"})),
            (EventKind::HookNotification, json!({"claude_session_id": "S"})),
            (EventKind::HookPostToolUse, json!({"claude_session_id": "S"})),
            (EventKind::QuestionDetected, json!({"question": "Which port?"})),
        ];
        assert_eq!(minimal.len(), EventKind::ALL.len());
        for (kind, payload) in minimal {
            validate_payload(*kind, payload).unwrap();
        }
    }
}
