use thiserror::Error;

use crate::types::{FailureKind, SubCallOutcome};

/// Unified error type for the RLM scaffold.
#[derive(Error, Debug)]
pub enum RlmError {
    // ── Context errors ─────────────────────────────────────────
    /// Bounds are signed so negative offsets from generated code can be reported as-is.
    #[error("range error: [{start}, {end}) is not within a context of length {len}")]
    Range { start: i64, end: i64, len: usize },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    // ── Recursion / memory errors ──────────────────────────────
    #[error("recursion depth exceeded: depth {depth} has reached max_depth {max_depth}")]
    DepthExceeded { depth: u32, max_depth: u32 },

    #[error("variable not found: {0}")]
    VariableNotFound(String),

    // ── Backend errors ─────────────────────────────────────────
    #[error("backend error: {0}")]
    Backend(String),

    #[error("backend timed out after {timeout_ms}ms")]
    BackendTimeout { timeout_ms: u64 },

    #[error("backend rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("model not found: {0}")]
    ModelNotFound(String),

    // ── Dispatch errors ────────────────────────────────────────
    #[error("sub-call failed: {0}")]
    SubCallFailed(String),

    #[error("batch deadline of {timeout_ms}ms passed before the sub-call finished")]
    BatchTimeout { timeout_ms: u64 },

    #[error("batch partial failure: {} of {} sub-calls failed", failed_count(.outcomes), .outcomes.len())]
    BatchPartialFailure { outcomes: Vec<SubCallOutcome> },

    // ── Session errors ─────────────────────────────────────────
    #[error("safety break: {0}")]
    SafetyBreak(String),

    #[error("session aborted: {0}")]
    Aborted(String),

    #[error("operation parse error: {0}")]
    OperationParse(String),

    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    #[error("config validation failed: {field}: {reason}")]
    ConfigValidation { field: String, reason: String },

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

fn failed_count(outcomes: &[SubCallOutcome]) -> usize {
    outcomes.iter().filter(|o| o.is_failure()).count()
}

impl RlmError {
    /// The marker recorded when this error fails a sub-call.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            RlmError::DepthExceeded { .. } => FailureKind::DepthExceeded,
            RlmError::BackendTimeout { .. } => FailureKind::Timeout,
            RlmError::BatchTimeout { .. } => FailureKind::BatchTimeout,
            RlmError::Backend(_) | RlmError::RateLimited { .. } | RlmError::ModelNotFound(_) => {
                FailureKind::Backend
            }
            RlmError::VariableNotFound(_) => FailureKind::NoAnswer,
            RlmError::SafetyBreak(_) => FailureKind::SafetyBreak,
            RlmError::Aborted(_) => FailureKind::Aborted,
            RlmError::Range { .. } | RlmError::InvalidParameter(_) => FailureKind::InvalidRequest,
            RlmError::SubCallFailed(_) | RlmError::BatchPartialFailure { .. } => {
                FailureKind::SubCall
            }
            _ => FailureKind::Other,
        }
    }

    /// Errors that generated code can observe and recover from in its next round.
    /// The others end the session when the session's own operation raised them.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            RlmError::VariableNotFound(_) | RlmError::SafetyBreak(_) | RlmError::Aborted(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RlmError>;
