//! Error types for llama-stream.

use llama_engine::{BackendError, Position, TokenizeError};
use llama_kv::KVError;
use llama_runtime::PressureLevel;
use serde::Serialize;
use thiserror::Error;

/// Closed classification of failures, consumed uniformly by the session state
/// machine and by hosts inspecting `last_error`.
///
/// Success is the `Ok` arm of [`Result`], and cancellation is
/// [`Termination::Cancelled`](crate::Termination::Cancelled), so neither
/// appears here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Rejected before any state changed: no model, bad config, prompt too long.
    Precondition,
    TokenizeOverflow,
    /// The backend failed to load, evaluate or sample.
    EvaluateFailed,
    /// The resource policy refused memory before anything was allocated.
    AllocationRejected,
    ShiftFailed,
}

/// Top-level error type for llama-stream operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("no model loaded")]
    NoModel,

    #[error("no generation in progress")]
    NotGenerating,

    #[error("session already started")]
    AlreadyStarted,

    #[error("a threaded generation is still running")]
    Busy,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("empty prompt")]
    EmptyPrompt,

    #[error("prompt of {tokens} tokens does not fit in {headroom} free positions")]
    PromptTooLong { tokens: usize, headroom: usize },

    #[error("context window error: {0}")]
    Window(KVError),

    #[error("tokenizer still needs {required} slots after retry")]
    TokenizeOverflow { required: usize },

    #[error("tokenization failed: {0}")]
    Tokenize(String),

    #[error("model load failed: {0}")]
    ModelLoad(String),

    #[error("evaluation failed at position {position}: {reason}")]
    Evaluate { position: Position, reason: String },

    #[error("sampling failed: {0}")]
    Sample(String),

    #[error("backend holds {held} positions but {committed} are committed")]
    PositionMismatch { held: usize, committed: usize },

    #[error("allocation of {requested_mb} MB rejected ({available_mb} MB available)")]
    AllocationRejected { requested_mb: u64, available_mb: u64 },

    #[error("memory pressure is {0}")]
    Pressure(PressureLevel),

    #[error("window shift failed: {0}")]
    Shift(KVError),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
}

impl RuntimeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::NoModel
            | RuntimeError::NotGenerating
            | RuntimeError::AlreadyStarted
            | RuntimeError::Busy
            | RuntimeError::InvalidConfig(_)
            | RuntimeError::EmptyPrompt
            | RuntimeError::PromptTooLong { .. }
            | RuntimeError::Window(_)
            | RuntimeError::Tokenize(_)
            | RuntimeError::Spawn(_) => ErrorKind::Precondition,
            RuntimeError::TokenizeOverflow { .. } => ErrorKind::TokenizeOverflow,
            RuntimeError::ModelLoad(_)
            | RuntimeError::Evaluate { .. }
            | RuntimeError::Sample(_)
            | RuntimeError::PositionMismatch { .. } => ErrorKind::EvaluateFailed,
            RuntimeError::AllocationRejected { .. } | RuntimeError::Pressure(_) => {
                ErrorKind::AllocationRejected
            }
            RuntimeError::Shift(_) => ErrorKind::ShiftFailed,
        }
    }
}

impl From<BackendError> for RuntimeError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::ModelLoad(reason) => RuntimeError::ModelLoad(reason),
            BackendError::Evaluate { position, reason } => {
                RuntimeError::Evaluate { position, reason }
            }
            BackendError::Sample(reason) => RuntimeError::Sample(reason),
        }
    }
}

impl From<TokenizeError> for RuntimeError {
    fn from(err: TokenizeError) -> Self {
        match err {
            TokenizeError::BufferTooSmall { required } => RuntimeError::TokenizeOverflow { required },
            TokenizeError::Invalid(reason) => RuntimeError::Tokenize(reason),
        }
    }
}

impl From<KVError> for RuntimeError {
    fn from(err: KVError) -> Self {
        match err {
            KVError::ShiftRefused { .. } => RuntimeError::Shift(err),
            other => RuntimeError::Window(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_failures_are_evaluate_failed() {
        let err: RuntimeError = BackendError::Evaluate {
            position: 7,
            reason: "bad batch".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::EvaluateFailed);
        assert_eq!(err.to_string(), "evaluation failed at position 7: bad batch");
    }

    #[test]
    fn refused_shift_maps_to_shift_failed() {
        let err: RuntimeError = KVError::ShiftRefused { start: 0, end: 4 }.into();
        assert_eq!(err.kind(), ErrorKind::ShiftFailed);

        let err: RuntimeError = KVError::CapacityExceeded { len: 9, max: 8 }.into();
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[test]
    fn policy_rejection_is_distinct_from_backend_failure() {
        let rejected = RuntimeError::AllocationRejected {
            requested_mb: 700,
            available_mb: 600,
        };
        let failed = RuntimeError::ModelLoad("corrupt file".into());
        assert_eq!(rejected.kind(), ErrorKind::AllocationRejected);
        assert_eq!(failed.kind(), ErrorKind::EvaluateFailed);
    }
}
