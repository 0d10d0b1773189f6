//! Folding delivered messages into an instance's in-memory history, and
//! re-enqueuing work that history says is still outstanding.
use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use super::router::OrchestratorMsg;
use crate::providers::{HistoryStore, QueueKind, WorkItem};
use crate::{Event, ProviderError, WaitTarget};

/// Result of folding one message into history.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Applied {
    Appended,
    /// Redelivery of something already recorded, or a completion for a
    /// call-site history never scheduled.
    Ignored,
}

fn task_completed(history: &[Event], id: u64) -> bool {
    history.iter().any(|e| {
        matches!(e, Event::TaskCompleted { id: cid, .. } | Event::TaskFailed { id: cid, .. } if *cid == id)
    })
}

fn task_scheduled(history: &[Event], id: u64) -> bool {
    history
        .iter()
        .any(|e| matches!(e, Event::TaskScheduled { id: cid, .. } if *cid == id))
}

fn timer_fired(history: &[Event], id: u64) -> bool {
    history
        .iter()
        .any(|e| matches!(e, Event::TimerFired { id: cid, .. } if *cid == id))
}

fn timer_created(history: &[Event], id: u64) -> bool {
    history
        .iter()
        .any(|e| matches!(e, Event::TimerCreated { id: cid, .. } if *cid == id))
}

/// Append the history record for `msg`, deduplicating completions per
/// call-site. Mirrors the dedupe the stores apply so local and persisted
/// history stay identical.
pub(crate) fn append_completion(history: &mut Vec<Event>, msg: OrchestratorMsg) -> Applied {
    match msg {
        OrchestratorMsg::ActivityCompleted { instance, id, result, .. } => {
            if task_completed(history, id) {
                debug!(instance = %instance, id, "duplicate activity completion ignored");
                return Applied::Ignored;
            }
            if !task_scheduled(history, id) {
                warn!(instance = %instance, id, "completion for unscheduled activity ignored");
                return Applied::Ignored;
            }
            history.push(Event::TaskCompleted { id, result });
        }
        OrchestratorMsg::ActivityFailed { instance, id, failure, .. } => {
            if task_completed(history, id) {
                debug!(instance = %instance, id, "duplicate activity failure ignored");
                return Applied::Ignored;
            }
            if !task_scheduled(history, id) {
                warn!(instance = %instance, id, "failure for unscheduled activity ignored");
                return Applied::Ignored;
            }
            history.push(Event::TaskFailed { id, failure });
        }
        OrchestratorMsg::TimerFired {
            instance, id, fire_at_ms, ..
        } => {
            if timer_fired(history, id) {
                debug!(instance = %instance, id, "duplicate timer firing ignored");
                return Applied::Ignored;
            }
            if !timer_created(history, id) {
                warn!(instance = %instance, id, "firing for unknown timer ignored");
                return Applied::Ignored;
            }
            history.push(Event::TimerFired { id, fire_at_ms });
        }
        OrchestratorMsg::ExternalRaised { name, data, .. } => {
            // Buffered by name even with no subscriber yet
            history.push(Event::EventRaised { name, data });
        }
        OrchestratorMsg::TerminateRequested { reason, .. } => {
            if history.iter().any(|e| matches!(e, Event::TerminateRequested { .. })) {
                return Applied::Ignored;
            }
            history.push(Event::TerminateRequested { reason });
        }
    }
    Applied::Appended
}

/// Whether any of `new_events` satisfies a point the orchestration is
/// suspended on.
pub(crate) fn wakes(waiting: &[WaitTarget], new_events: &[Event]) -> bool {
    new_events
        .iter()
        .any(|ev| waiting.iter().any(|w| w.is_satisfied_by(ev)))
}

/// Re-enqueue activity executions and timers that history shows as
/// scheduled but not completed. Queue enqueue is idempotent for items still
/// waiting, so this is safe to run after a crash.
pub(crate) async fn rehydrate_pending(
    instance: &str,
    history: &[Event],
    store: &Arc<dyn HistoryStore>,
) -> Result<(), ProviderError> {
    let done_tasks: HashSet<u64> = history
        .iter()
        .filter_map(|e| match e {
            Event::TaskCompleted { id, .. } | Event::TaskFailed { id, .. } => Some(*id),
            _ => None,
        })
        .collect();
    let fired: HashSet<u64> = history
        .iter()
        .filter_map(|e| match e {
            Event::TimerFired { id, .. } => Some(*id),
            _ => None,
        })
        .collect();

    for e in history {
        let (kind, item) = match e {
            Event::TaskScheduled { id, name, input } if !done_tasks.contains(id) => (
                QueueKind::Worker,
                WorkItem::ActivityExecute {
                    instance: instance.to_string(),
                    id: *id,
                    name: name.clone(),
                    input: input.clone(),
                },
            ),
            Event::TimerCreated { id, fire_at_ms } if !fired.contains(id) => (
                QueueKind::Timer,
                WorkItem::TimerSchedule {
                    instance: instance.to_string(),
                    id: *id,
                    fire_at_ms: *fire_at_ms,
                },
            ),
            _ => continue,
        };
        debug!(instance, ?item, "rehydrating outstanding work");
        store.enqueue_work(kind, item).await?;
    }
    Ok(())
}
