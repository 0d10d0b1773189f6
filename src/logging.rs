//! Replay-safe logging for orchestration code.
//!
//! Orchestrations re-run from the top on every turn, so a plain `tracing`
//! call inside workflow code would fire once per replay. Workflow code buffers
//! messages on the context instead; the runtime keeps a per-activation cursor
//! and forwards only messages that were not emitted by an earlier turn.
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Tracks how many buffered orchestration logs were already emitted for one
/// instance activation.
#[derive(Debug, Default)]
pub struct ReplayLogCursor {
    emitted: usize,
}

impl ReplayLogCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit the tail of `logs` that previous turns have not emitted yet.
    pub fn emit_new(&mut self, instance: &str, turn_index: u64, logs: &[(LogLevel, String)]) {
        if logs.len() <= self.emitted {
            return;
        }
        for (level, msg) in &logs[self.emitted..] {
            emit(instance, turn_index, *level, msg);
        }
        self.emitted = logs.len();
    }

    pub fn emitted(&self) -> usize {
        self.emitted
    }
}

fn emit(instance: &str, turn_index: u64, level: LogLevel, msg: &str) {
    match level {
        LogLevel::Debug => debug!(instance, turn_index, message = %msg, "orchestration"),
        LogLevel::Info => info!(instance, turn_index, message = %msg, "orchestration"),
        LogLevel::Warn => warn!(instance, turn_index, message = %msg, "orchestration"),
        LogLevel::Error => error!(instance, turn_index, message = %msg, "orchestration"),
    }
}
