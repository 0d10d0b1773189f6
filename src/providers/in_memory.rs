use std::collections::{HashMap, VecDeque};

use tokio::sync::Mutex;

use super::{CompletionDedupe, HistoryRecord, HistoryStore, InstanceSnapshot, QueueKind, WorkItem};
use crate::{Event, ProviderError};

#[derive(Default)]
struct Queue {
    ready: VecDeque<WorkItem>,
    locked: HashMap<String, WorkItem>,
}

/// In-memory store for tests and embedding; nothing survives the process.
pub struct InMemoryHistoryStore {
    histories: Mutex<HashMap<String, Vec<HistoryRecord>>>,
    snapshots: Mutex<HashMap<String, InstanceSnapshot>>,
    queues: Mutex<HashMap<QueueKind, Queue>>,
    next_token: std::sync::atomic::AtomicU64,
    cap: usize,
}

impl Default for InMemoryHistoryStore {
    fn default() -> Self {
        Self {
            histories: Mutex::new(HashMap::new()),
            snapshots: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            next_token: std::sync::atomic::AtomicU64::new(1),
            cap: 1024,
        }
    }
}

impl InMemoryHistoryStore {
    pub fn with_cap(cap: usize) -> Self {
        Self {
            cap,
            ..Self::default()
        }
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn create_instance(&self, instance: &str) -> Result<(), ProviderError> {
        let mut h = self.histories.lock().await;
        if h.contains_key(instance) {
            return Err(ProviderError::InstanceExists(instance.to_string()));
        }
        h.insert(instance.to_string(), Vec::new());
        Ok(())
    }

    async fn read_records(&self, instance: &str) -> Vec<HistoryRecord> {
        self.histories.lock().await.get(instance).cloned().unwrap_or_default()
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), ProviderError> {
        let mut h = self.histories.lock().await;
        let records = h
            .get_mut(instance)
            .ok_or_else(|| ProviderError::InstanceNotFound(instance.to_string()))?;
        if records.len() + new_events.len() > self.cap {
            return Err(ProviderError::CapExceeded {
                cap: self.cap,
                have: records.len(),
                append: new_events.len(),
            });
        }
        let mut dedupe = CompletionDedupe::from_history(records.iter().map(|r| &r.event));
        for ev in new_events {
            if !dedupe.admit(&ev) {
                continue;
            }
            let seq = records.len() as u64 + 1;
            records.push(HistoryRecord { seq, event: ev });
        }
        Ok(())
    }

    async fn read_snapshot(&self, instance: &str) -> Option<InstanceSnapshot> {
        self.snapshots.lock().await.get(instance).cloned()
    }

    async fn write_snapshot(&self, instance: &str, snapshot: &InstanceSnapshot) -> Result<(), ProviderError> {
        self.snapshots
            .lock()
            .await
            .insert(instance.to_string(), snapshot.clone());
        Ok(())
    }

    async fn list_instances(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.histories.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), ProviderError> {
        let mut qs = self.queues.lock().await;
        let q = qs.entry(kind).or_default();
        if !item.is_signal() && q.ready.contains(&item) {
            return Ok(());
        }
        q.ready.push_back(item);
        Ok(())
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let mut qs = self.queues.lock().await;
        let q = qs.get_mut(&kind)?;
        let item = q.ready.pop_front()?;
        let n = self.next_token.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let token = format!("mem-{n:x}");
        q.locked.insert(token.clone(), item.clone());
        Some((item, token))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        if let Some(q) = self.queues.lock().await.get_mut(&kind) {
            q.locked.remove(token);
        }
        Ok(())
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        if let Some(q) = self.queues.lock().await.get_mut(&kind) {
            if let Some(item) = q.locked.remove(token) {
                q.ready.push_front(item);
            }
        }
        Ok(())
    }
}
