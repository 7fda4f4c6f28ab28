use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

use rlm_core::{FailureKind, Result, SessionId};

/// One recorded operation invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Position in the call tree's log, shared by all sessions in the tree.
    pub seq: u64,
    pub session_id: SessionId,
    pub depth: u32,
    pub operation: String,
    pub args: Value,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: TraceOutcome,
    /// Session created to serve this operation (sub-calls only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_session: Option<SessionId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TraceOutcome {
    Ok { summary: String },
    Error { kind: FailureKind, message: String },
}

impl TraceOutcome {
    pub fn ok(summary: impl Into<String>) -> Self {
        TraceOutcome::Ok {
            summary: summary.into(),
        }
    }

    pub fn from_result<T>(result: &Result<T>, summarize: impl FnOnce(&T) -> String) -> Self {
        match result {
            Ok(value) => TraceOutcome::ok(summarize(value)),
            Err(e) => TraceOutcome::Error {
                kind: e.failure_kind(),
                message: e.to_string(),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, TraceOutcome::Ok { .. })
    }
}

/// An operation that has started but not yet been recorded.
pub struct PendingEvent {
    operation: &'static str,
    args: Value,
    started_at: DateTime<Utc>,
    started: Instant,
    child_session: Option<SessionId>,
}

impl PendingEvent {
    pub fn with_child(mut self, child: SessionId) -> Self {
        self.child_session = Some(child);
        self
    }
}

#[derive(Default)]
struct TraceLog {
    events: Mutex<Vec<TraceEvent>>,
}

/// A session's handle on the call tree's trace log.
///
/// Handles for nested sessions share the root's log, so the root ends up with
/// every event in the tree, in recording order.
#[derive(Clone)]
pub struct Trace {
    log: Arc<TraceLog>,
    session_id: SessionId,
    depth: u32,
}

impl Trace {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            log: Arc::new(TraceLog::default()),
            session_id,
            depth: 0,
        }
    }

    /// A handle for a nested session writing into the same log.
    pub fn child(&self, session_id: SessionId, depth: u32) -> Self {
        Self {
            log: Arc::clone(&self.log),
            session_id,
            depth,
        }
    }

    pub fn begin(&self, operation: &'static str, args: Value) -> PendingEvent {
        PendingEvent {
            operation,
            args,
            started_at: Utc::now(),
            started: Instant::now(),
            child_session: None,
        }
    }

    pub fn finish(&self, pending: PendingEvent, outcome: TraceOutcome) {
        let mut events = self.log.events.lock();
        let seq = events.len() as u64;
        events.push(TraceEvent {
            seq,
            session_id: self.session_id,
            depth: self.depth,
            operation: pending.operation.to_string(),
            args: pending.args,
            started_at: pending.started_at,
            duration_ms: pending.started.elapsed().as_millis() as u64,
            outcome,
            child_session: pending.child_session,
        });
    }

    /// All events in the tree, ordered by `seq`.
    pub fn events(&self) -> Vec<TraceEvent> {
        self.log.events.lock().clone()
    }

    /// Events recorded by one session.
    pub fn for_session(&self, session_id: SessionId) -> Vec<TraceEvent> {
        self.log
            .events
            .lock()
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.log.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Begin an event that is recorded even if the future running the
    /// operation is dropped before it finishes.
    pub(crate) fn guard(&self, operation: &'static str, args: Value) -> EventGuard {
        EventGuard {
            trace: self.clone(),
            pending: Some(self.begin(operation, args)),
        }
    }
}

/// A pending event bound to its trace. Finishing it records the outcome;
/// dropping it unfinished records an `aborted` error.
pub(crate) struct EventGuard {
    trace: Trace,
    pending: Option<PendingEvent>,
}

impl EventGuard {
    pub(crate) fn set_child(&mut self, child: SessionId) {
        if let Some(pending) = self.pending.as_mut() {
            pending.child_session = Some(child);
        }
    }

    pub(crate) fn finish(mut self, outcome: TraceOutcome) {
        if let Some(pending) = self.pending.take() {
            self.trace.finish(pending, outcome);
        }
    }
}

impl Drop for EventGuard {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            self.trace.finish(
                pending,
                TraceOutcome::Error {
                    kind: FailureKind::Aborted,
                    message: "operation dropped before it finished".into(),
                },
            );
        }
    }
}
