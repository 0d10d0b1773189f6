use std::sync::Arc;

use tracing::debug;

use super::Runtime;
use crate::providers::{QueueKind, WorkItem};
use crate::{Action, Event, ProviderError};

/// Materialize a turn's actions into provider work items. Runs only after
/// the turn's history delta has been persisted. Stops at the first item the
/// store refuses.
pub(crate) async fn dispatch_actions(
    rt: &Arc<Runtime>,
    instance: &str,
    history: &[Event],
    actions: Vec<Action>,
) -> Result<(), ProviderError> {
    for action in actions {
        match action {
            Action::CallActivity { id, name, input } => {
                dispatch_call_activity(rt, instance, id, name, input).await?;
            }
            Action::CreateTimer { id, delay_ms } => {
                dispatch_create_timer(rt, instance, history, id, delay_ms).await?;
            }
            Action::WaitExternal { id, name } => {
                // Nothing to enqueue; raised events route by instance
                debug!(instance, id, name = %name, "subscribed to external event");
            }
        }
    }
    Ok(())
}

async fn dispatch_call_activity(
    rt: &Arc<Runtime>,
    instance: &str,
    id: u64,
    name: String,
    input: String,
) -> Result<(), ProviderError> {
    debug!(instance, id, name = %name, "dispatching activity");
    rt.history_store
        .enqueue_work(
            QueueKind::Worker,
            WorkItem::ActivityExecute {
                instance: instance.to_string(),
                id,
                name,
                input,
            },
        )
        .await
}

async fn dispatch_create_timer(
    rt: &Arc<Runtime>,
    instance: &str,
    history: &[Event],
    id: u64,
    delay_ms: u64,
) -> Result<(), ProviderError> {
    // The due time was fixed when the timer was recorded
    let fire_at_ms = history
        .iter()
        .find_map(|e| match e {
            Event::TimerCreated { id: cid, fire_at_ms } if *cid == id => Some(*fire_at_ms),
            _ => None,
        })
        .unwrap_or_else(|| super::timers::now_ms().saturating_add(delay_ms));
    debug!(instance, id, fire_at_ms, "dispatching timer");
    rt.history_store
        .enqueue_work(
            QueueKind::Timer,
            WorkItem::TimerSchedule {
                instance: instance.to_string(),
                id,
                fire_at_ms,
            },
        )
        .await
}
