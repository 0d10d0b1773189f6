//! Error types shared by the engine, its providers and activity handlers.
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Typed outcome of an activity that did not produce a result.
///
/// Recorded verbatim in history (`Event::TaskFailed`) so workflow code sees the
/// same failure on every replay. Cancellation stays distinct from failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum TaskFailure {
    #[error("activity failed: {0}")]
    Failed(String),
    #[error("activity canceled: {0}")]
    Canceled(String),
    #[error("unregistered activity: {0}")]
    Unregistered(String),
    #[error("invalid activity input: {0}")]
    InvalidInput(String),
}

impl TaskFailure {
    pub fn failed(msg: impl Into<String>) -> Self {
        TaskFailure::Failed(msg.into())
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, TaskFailure::Canceled(_))
    }
}

/// Errors surfaced by history stores and queues.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("instance not found: {0}")]
    InstanceNotFound(String),
    #[error("instance already exists: {0}")]
    InstanceExists(String),
    #[error("history cap exceeded (cap={cap}, have={have}, append={append})")]
    CapExceeded { cap: usize, have: usize, append: usize },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors returned by the public runtime API.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("orchestration not registered: {0}")]
    Unregistered(String),
    #[error("instance not found: {0}")]
    NotFound(String),
    #[error("instance is not running: {0}")]
    NotRunning(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("timed out waiting for instance {0}")]
    Timeout(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

const MAX_SURFACED_ERROR_LEN: usize = 256;

/// Reduce an error message to a single bounded line before it is exposed
/// through status queries.
pub fn sanitize_error(msg: &str) -> String {
    let first = msg.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("unknown error");
    if first.chars().count() > MAX_SURFACED_ERROR_LEN {
        let mut out: String = first.chars().take(MAX_SURFACED_ERROR_LEN).collect();
        out.push('…');
        out
    } else {
        first.to_string()
    }
}
