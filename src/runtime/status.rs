use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Runtime;
use crate::error::sanitize_error;
use crate::Event;

/// Lifecycle of an instance as reported to pollers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuntimeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Terminated,
}

impl RuntimeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RuntimeStatus::Completed | RuntimeStatus::Failed | RuntimeStatus::Terminated)
    }
}

impl std::fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RuntimeStatus::Pending => "Pending",
            RuntimeStatus::Running => "Running",
            RuntimeStatus::Completed => "Completed",
            RuntimeStatus::Failed => "Failed",
            RuntimeStatus::Terminated => "Terminated",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of an instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub instance_id: String,
    pub name: String,
    pub runtime_status: RuntimeStatus,
    pub custom_status: Option<serde_json::Value>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_updated_at: Option<DateTime<Utc>>,
}

/// Status implied by history alone, used when no snapshot was written.
pub(crate) fn status_from_history(history: &[Event]) -> (RuntimeStatus, Option<String>, Option<String>) {
    for e in history.iter().rev() {
        match e {
            Event::ExecutionCompleted { output } => return (RuntimeStatus::Completed, Some(output.clone()), None),
            Event::ExecutionFailed { error } => return (RuntimeStatus::Failed, None, Some(sanitize_error(error))),
            Event::ExecutionTerminated { .. } => return (RuntimeStatus::Terminated, None, None),
            _ => {}
        }
    }
    let started = history.iter().any(|e| {
        matches!(
            e,
            Event::TaskScheduled { .. } | Event::TimerCreated { .. } | Event::EventSubscribed { .. }
        )
    });
    if started {
        (RuntimeStatus::Running, None, None)
    } else {
        (RuntimeStatus::Pending, None, None)
    }
}

impl Runtime {
    /// Current status of `instance`, or `None` if it was never created.
    pub async fn get_status(&self, instance: &str) -> Option<InstanceStatus> {
        if let Some(s) = self.history_store.read_snapshot(instance).await {
            return Some(InstanceStatus {
                instance_id: instance.to_string(),
                name: s.orchestration,
                runtime_status: s.runtime_status,
                custom_status: s.custom_status,
                output: s.output,
                error: s.error,
                created_at: Some(s.created_at),
                last_updated_at: Some(s.last_updated_at),
            });
        }
        let history = self.history_store.read(instance).await;
        let name = history.iter().find_map(|e| match e {
            Event::OrchestrationStarted { name, .. } => Some(name.clone()),
            _ => None,
        })?;
        let (runtime_status, output, error) = status_from_history(&history);
        Some(InstanceStatus {
            instance_id: instance.to_string(),
            name,
            runtime_status,
            custom_status: None,
            output,
            error,
            created_at: None,
            last_updated_at: None,
        })
    }
}
