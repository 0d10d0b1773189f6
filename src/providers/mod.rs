//! Persistence for instance histories, status snapshots and the work queues
//! the runtime dispatches through.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::runtime::RuntimeStatus;
use crate::{Event, ProviderError, TaskFailure};

pub mod fs;
pub mod in_memory;

/// A history event with the sequence number the store assigned on append.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryRecord {
    pub seq: u64,
    pub event: Event,
}

/// Materialized current state of an instance, kept next to its history so
/// status queries never need a replay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceSnapshot {
    pub orchestration: String,
    pub version: String,
    pub runtime_status: RuntimeStatus,
    #[serde(default)]
    pub custom_status: Option<serde_json::Value>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl InstanceSnapshot {
    pub fn pending(orchestration: impl Into<String>, version: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            orchestration: orchestration.into(),
            version: version.into(),
            runtime_status: RuntimeStatus::Pending,
            custom_status: None,
            output: None,
            error: None,
            created_at: now,
            last_updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_updated_at = Utc::now();
    }
}

/// Queue selector for provider-backed work dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueKind {
    /// Starts, completions, external events and termination requests for instances.
    Orchestrator,
    /// Activity executions.
    Worker,
    /// Timer schedules awaiting their due time.
    Timer,
}

/// Items moved through the provider queues.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum WorkItem {
    StartOrchestration { instance: String, orchestration: String },
    ActivityExecute { instance: String, id: u64, name: String, input: String },
    ActivityCompleted { instance: String, id: u64, result: String },
    ActivityFailed { instance: String, id: u64, failure: TaskFailure },
    TimerSchedule { instance: String, id: u64, fire_at_ms: u64 },
    TimerFired { instance: String, id: u64, fire_at_ms: u64 },
    ExternalRaised { instance: String, name: String, data: String },
    TerminateInstance { instance: String, reason: String },
}

impl WorkItem {
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::StartOrchestration { instance, .. }
            | WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::TimerSchedule { instance, .. }
            | WorkItem::TimerFired { instance, .. }
            | WorkItem::ExternalRaised { instance, .. }
            | WorkItem::TerminateInstance { instance, .. } => instance,
        }
    }

    /// Signals from callers are distinct deliveries even when their payloads match.
    /// Everything else is keyed by its call-site and may be collapsed on enqueue.
    pub fn is_signal(&self) -> bool {
        matches!(self, WorkItem::ExternalRaised { .. } | WorkItem::TerminateInstance { .. })
    }
}

/// Storage abstraction for instance histories and work queues.
///
/// Implementations must accept concurrent appends for different instances.
/// The runtime guarantees a single writer per instance.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Create an empty instance. Fails if it already exists.
    async fn create_instance(&self, instance: &str) -> Result<(), ProviderError>;

    /// Read the full history for an instance (empty if unknown).
    async fn read(&self, instance: &str) -> Vec<Event> {
        self.read_records(instance).await.into_iter().map(|r| r.event).collect()
    }

    /// Read the history with sequence numbers.
    async fn read_records(&self, instance: &str) -> Vec<HistoryRecord>;

    /// Append events. Completion records already present for the same call-site
    /// and a second terminal record are dropped.
    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), ProviderError>;

    async fn read_snapshot(&self, instance: &str) -> Option<InstanceSnapshot>;

    async fn write_snapshot(&self, instance: &str, snapshot: &InstanceSnapshot) -> Result<(), ProviderError>;

    /// List all known instance ids.
    async fn list_instances(&self) -> Vec<String>;

    /// Enqueue a work item. Re-enqueuing an item identical to one already queued is a no-op,
    /// except for signals (see [`WorkItem::is_signal`]).
    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), ProviderError>;

    /// Peek-lock the next item; it stays invisible until acked or abandoned.
    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)>;

    /// Permanently remove a locked item.
    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError>;

    /// Return a locked item to the front of its queue.
    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError>;
}

/// Tracks completion-like records per call-site so a redelivered completion
/// is never appended twice.
#[derive(Default)]
pub(crate) struct CompletionDedupe {
    seen: std::collections::HashSet<(u64, &'static str)>,
    terminal: bool,
}

impl CompletionDedupe {
    pub(crate) fn from_history<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut d = Self::default();
        for ev in events {
            d.observe(ev);
        }
        d
    }

    fn key(ev: &Event) -> Option<(u64, &'static str)> {
        match ev {
            Event::TaskCompleted { id, .. } | Event::TaskFailed { id, .. } => Some((*id, "task")),
            Event::TimerFired { id, .. } => Some((*id, "timer")),
            _ => None,
        }
    }

    /// Returns `true` if `ev` should be appended.
    pub(crate) fn admit(&mut self, ev: &Event) -> bool {
        if ev.is_terminal() {
            if self.terminal {
                return false;
            }
        } else if let Some(k) = Self::key(ev) {
            if self.seen.contains(&k) {
                return false;
            }
        }
        self.observe(ev);
        true
    }

    fn observe(&mut self, ev: &Event) {
        if ev.is_terminal() {
            self.terminal = true;
        } else if let Some(k) = Self::key(ev) {
            self.seen.insert(k);
        }
    }
}
