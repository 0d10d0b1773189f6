use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::providers::{HistoryStore, QueueKind, WorkItem};

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Due {
    fire_at_ms: u64,
    instance: String,
    id: u64,
}

/// In-process timer wheel: holds scheduled timers and enqueues `TimerFired`
/// on the orchestrator queue once each is due.
pub(crate) struct TimerService {
    store: Arc<dyn HistoryStore>,
    rx: mpsc::UnboundedReceiver<WorkItem>,
    heap: BinaryHeap<Reverse<Due>>,
    idle_ms: u64,
}

impl TimerService {
    pub(crate) fn start(
        store: Arc<dyn HistoryStore>,
        idle_ms: u64,
    ) -> (JoinHandle<()>, mpsc::UnboundedSender<WorkItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let svc = TimerService {
            store,
            rx,
            heap: BinaryHeap::new(),
            idle_ms,
        };
        (tokio::spawn(svc.run()), tx)
    }

    fn accept(&mut self, item: WorkItem) {
        match item {
            WorkItem::TimerSchedule {
                instance,
                id,
                fire_at_ms,
            } => {
                debug!(instance = %instance, id, fire_at_ms, "timer accepted");
                self.heap.push(Reverse(Due {
                    fire_at_ms,
                    instance,
                    id,
                }));
            }
            other => error!(?other, "unexpected work item sent to timer service"),
        }
    }

    async fn fire_due(&mut self) {
        let now = now_ms();
        while let Some(Reverse(next)) = self.heap.peek() {
            if next.fire_at_ms > now {
                break;
            }
            let Some(Reverse(due)) = self.heap.pop() else { break };
            let item = WorkItem::TimerFired {
                instance: due.instance.clone(),
                id: due.id,
                fire_at_ms: due.fire_at_ms,
            };
            if let Err(e) = self.store.enqueue_work(QueueKind::Orchestrator, item).await {
                warn!(instance = %due.instance, id = due.id, error = %e, "failed to enqueue fired timer; retrying");
                self.heap.push(Reverse(due));
                break;
            }
        }
    }

    async fn run(mut self) {
        loop {
            let wait = match self.heap.peek() {
                Some(Reverse(next)) => Duration::from_millis(next.fire_at_ms.saturating_sub(now_ms()).max(1)),
                None => Duration::from_millis(self.idle_ms.max(1) * 100),
            };
            tokio::select! {
                maybe = self.rx.recv() => match maybe {
                    Some(item) => self.accept(item),
                    None => return,
                },
                _ = tokio::time::sleep(wait) => {}
            }
            self.fire_due().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::in_memory::InMemoryHistoryStore;

    #[tokio::test]
    async fn due_timers_fire_in_order() {
        let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::default());
        let (_jh, tx) = TimerService::start(store.clone(), 5);
        let now = now_ms();
        tx.send(WorkItem::TimerSchedule {
            instance: "i".into(),
            id: 2,
            fire_at_ms: now + 40,
        })
        .unwrap();
        tx.send(WorkItem::TimerSchedule {
            instance: "i".into(),
            id: 1,
            fire_at_ms: now + 10,
        })
        .unwrap();

        let mut fired = Vec::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while fired.len() < 2 && std::time::Instant::now() < deadline {
            let next = store.dequeue_peek_lock(QueueKind::Orchestrator).await;
            if let Some((WorkItem::TimerFired { id, .. }, token)) = next {
                fired.push(id);
                store.ack(QueueKind::Orchestrator, &token).await.unwrap();
            } else {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        assert_eq!(fired, vec![1, 2]);
    }
}
