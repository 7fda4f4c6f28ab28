use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an engine session (root or nested).
pub type SessionId = Uuid;

/// Index metadata describing a context sub-range without materializing its text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    /// Ordinal position, 0-based and sequential.
    pub id: usize,
    /// Inclusive start offset (characters).
    pub start: usize,
    /// Exclusive end offset (characters).
    pub end: usize,
}

impl ChunkDescriptor {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Why a sub-call failed. Serialized into batch results as a per-item marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    DepthExceeded,
    /// The individual call exceeded its per-call timeout.
    Timeout,
    /// The call was still pending when the batch deadline passed.
    BatchTimeout,
    Backend,
    /// The nested session finished without producing an answer.
    NoAnswer,
    SafetyBreak,
    Aborted,
    InvalidRequest,
    SubCall,
    Other,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::DepthExceeded => "depth_exceeded",
            FailureKind::Timeout => "timeout",
            FailureKind::BatchTimeout => "batch_timeout",
            FailureKind::Backend => "backend",
            FailureKind::NoAnswer => "no_answer",
            FailureKind::SafetyBreak => "safety_break",
            FailureKind::Aborted => "aborted",
            FailureKind::InvalidRequest => "invalid_request",
            FailureKind::SubCall => "sub_call",
            FailureKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// Result of a single sub-call, serial or batched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubCallOutcome {
    Success { value: String },
    Failure { kind: FailureKind, message: String },
}

impl SubCallOutcome {
    pub fn success(value: impl Into<String>) -> Self {
        SubCallOutcome::Success {
            value: value.into(),
        }
    }

    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        SubCallOutcome::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SubCallOutcome::Success { .. })
    }

    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }

    pub fn value(&self) -> Option<&str> {
        match self {
            SubCallOutcome::Success { value } => Some(value),
            SubCallOutcome::Failure { .. } => None,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            SubCallOutcome::Success { .. } => None,
            SubCallOutcome::Failure { kind, .. } => Some(*kind),
        }
    }

    /// Render for generated code: successes as their text, failures as a
    /// `{"error": kind, "message": ...}` object.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            SubCallOutcome::Success { value } => serde_json::Value::String(value.clone()),
            SubCallOutcome::Failure { kind, message } => serde_json::json!({
                "error": kind.to_string(),
                "message": message,
            }),
        }
    }
}

impl From<crate::Result<String>> for SubCallOutcome {
    fn from(result: crate::Result<String>) -> Self {
        match result {
            Ok(value) => SubCallOutcome::Success { value },
            Err(e) => SubCallOutcome::Failure {
                kind: e.failure_kind(),
                message: e.to_string(),
            },
        }
    }
}

/// Terminal and non-terminal states of an engine session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Running,
    Completed,
    Failed,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionState::Running)
    }
}
