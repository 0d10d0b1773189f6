use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, warn};

use super::{CompletionDedupe, HistoryRecord, HistoryStore, InstanceSnapshot, QueueKind, WorkItem};
use crate::{Event, ProviderError};

/// Filesystem-backed store: one directory per instance holding a JSONL
/// history and a JSON snapshot, plus one JSONL file per queue.
///
/// Locked queue items live in sidecar files under `.locks/`; reopening a
/// store puts any item left locked by a crashed process back on its queue.
#[derive(Clone)]
pub struct FsHistoryStore {
    root: PathBuf,
    orch_queue_file: PathBuf,
    work_queue_file: PathBuf,
    timer_queue_file: PathBuf,
    cap: usize,
    // serializes read-modify-write of the queue files
    queue_lock: Arc<tokio::sync::Mutex<()>>,
    token_seq: Arc<std::sync::atomic::AtomicU64>,
}

impl FsHistoryStore {
    /// Create a new store rooted at the given directory path.
    /// If `reset_on_create` is true, delete any existing data under the root first.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Self {
        let path = root.as_ref().to_path_buf();
        if reset_on_create {
            let _ = std::fs::remove_dir_all(&path);
        }
        let _ = std::fs::create_dir_all(path.join("instances"));
        let store = Self {
            orch_queue_file: path.join("orch-queue.jsonl"),
            work_queue_file: path.join("work-queue.jsonl"),
            timer_queue_file: path.join("timer-queue.jsonl"),
            root: path,
            cap: 4096,
            queue_lock: Arc::new(tokio::sync::Mutex::new(())),
            token_seq: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        };
        for kind in [QueueKind::Orchestrator, QueueKind::Worker, QueueKind::Timer] {
            let _ = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(store.queue_file(kind));
            if !reset_on_create {
                store.recover_locked(kind);
            }
        }
        store
    }

    /// Create a new store with a custom history cap (useful for tests).
    pub fn new_with_cap(root: impl AsRef<Path>, reset_on_create: bool, cap: usize) -> Self {
        let mut s = Self::new(root, reset_on_create);
        s.cap = cap;
        s
    }

    fn inst_root(&self, instance: &str) -> PathBuf {
        self.root.join("instances").join(instance)
    }
    fn history_path(&self, instance: &str) -> PathBuf {
        self.inst_root(instance).join("history.jsonl")
    }
    fn snapshot_path(&self, instance: &str) -> PathBuf {
        self.inst_root(instance).join("snapshot.json")
    }
    fn lock_dir(&self, kind: QueueKind) -> PathBuf {
        match kind {
            QueueKind::Orchestrator => self.root.join(".locks/orch"),
            QueueKind::Worker => self.root.join(".locks/work"),
            QueueKind::Timer => self.root.join(".locks/timer"),
        }
    }
    fn lock_path(&self, kind: QueueKind, token: &str) -> PathBuf {
        self.lock_dir(kind).join(format!("{token}.lock"))
    }
    fn queue_file(&self, kind: QueueKind) -> &PathBuf {
        match kind {
            QueueKind::Orchestrator => &self.orch_queue_file,
            QueueKind::Worker => &self.work_queue_file,
            QueueKind::Timer => &self.timer_queue_file,
        }
    }

    fn read_queue(&self, kind: QueueKind) -> Vec<WorkItem> {
        let content = std::fs::read_to_string(self.queue_file(kind)).unwrap_or_default();
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str::<WorkItem>(l).ok())
            .collect()
    }

    /// Rewrite a queue file atomically via a temp file and rename.
    fn write_queue(&self, kind: QueueKind, items: &[WorkItem]) -> Result<(), ProviderError> {
        let qf = self.queue_file(kind);
        let tmp = qf.with_extension("jsonl.tmp");
        {
            let mut tf = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            for it in items {
                let line = serde_json::to_string(it)?;
                tf.write_all(line.as_bytes())?;
                tf.write_all(b"\n")?;
            }
        }
        std::fs::rename(&tmp, qf)?;
        Ok(())
    }

    fn recover_locked(&self, kind: QueueKind) {
        let Ok(entries) = std::fs::read_dir(self.lock_dir(kind)) else {
            return;
        };
        let mut recovered = Vec::new();
        for ent in entries.flatten() {
            let path = ent.path();
            if let Ok(data) = std::fs::read_to_string(&path) {
                if let Ok(item) = serde_json::from_str::<WorkItem>(&data) {
                    recovered.push(item);
                }
            }
            let _ = std::fs::remove_file(&path);
        }
        if recovered.is_empty() {
            return;
        }
        warn!(?kind, count = recovered.len(), "requeueing items left locked by a previous process");
        let mut items = recovered;
        for it in self.read_queue(kind) {
            if !items.contains(&it) {
                items.push(it);
            }
        }
        if let Err(e) = self.write_queue(kind, &items) {
            warn!(?kind, error = %e, "failed to requeue recovered items");
        }
    }
}

#[async_trait::async_trait]
impl HistoryStore for FsHistoryStore {
    async fn create_instance(&self, instance: &str) -> Result<(), ProviderError> {
        let inst_dir = self.inst_root(instance);
        if fs::try_exists(&inst_dir).await? {
            return Err(ProviderError::InstanceExists(instance.to_string()));
        }
        fs::create_dir_all(&inst_dir).await?;
        fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(self.history_path(instance))
            .await?;
        Ok(())
    }

    /// Read the JSONL history for the instance; unparsable lines are skipped.
    async fn read_records(&self, instance: &str) -> Vec<HistoryRecord> {
        let data = fs::read_to_string(self.history_path(instance)).await.unwrap_or_default();
        data.lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str::<HistoryRecord>(l).ok())
            .collect()
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), ProviderError> {
        let path = self.history_path(instance);
        if !fs::try_exists(&path).await? {
            return Err(ProviderError::InstanceNotFound(instance.to_string()));
        }
        let existing = self.read_records(instance).await;
        if existing.len() + new_events.len() > self.cap {
            return Err(ProviderError::CapExceeded {
                cap: self.cap,
                have: existing.len(),
                append: new_events.len(),
            });
        }
        let mut dedupe = CompletionDedupe::from_history(existing.iter().map(|r| &r.event));
        let mut seq = existing.last().map(|r| r.seq).unwrap_or(0);
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&path).await?;
        for ev in new_events {
            if !dedupe.admit(&ev) {
                debug!(instance, ?ev, "dropping duplicate completion");
                continue;
            }
            seq += 1;
            let line = serde_json::to_string(&HistoryRecord { seq, event: ev })?;
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn read_snapshot(&self, instance: &str) -> Option<InstanceSnapshot> {
        let data = fs::read_to_string(self.snapshot_path(instance)).await.ok()?;
        serde_json::from_str(&data).ok()
    }

    async fn write_snapshot(&self, instance: &str, snapshot: &InstanceSnapshot) -> Result<(), ProviderError> {
        let path = self.snapshot_path(instance);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(snapshot)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn list_instances(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Ok(mut rd) = fs::read_dir(self.root.join("instances")).await {
            while let Ok(Some(ent)) = rd.next_entry().await {
                if let Some(name) = ent.file_name().to_str() {
                    out.push(name.to_string());
                }
            }
        }
        out.sort();
        out
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), ProviderError> {
        let _guard = self.queue_lock.lock().await;
        let mut items = self.read_queue(kind);
        if !item.is_signal() && items.contains(&item) {
            return Ok(());
        }
        items.push(item);
        self.write_queue(kind, &items)
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let _guard = self.queue_lock.lock().await;
        let mut items = self.read_queue(kind);
        if items.is_empty() {
            return None;
        }
        let first = items.remove(0);
        let now_ns = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let n = self.token_seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let token = format!("{now_ns:x}-{:x}-{n:x}", std::process::id());
        // Persist the lock sidecar before dropping the item from the queue
        std::fs::create_dir_all(self.lock_dir(kind)).ok()?;
        let line = serde_json::to_string(&first).ok()?;
        std::fs::write(self.lock_path(kind, &token), line).ok()?;
        if let Err(e) = self.write_queue(kind, &items) {
            warn!(?kind, error = %e, "failed to rewrite queue after lock");
            let _ = std::fs::remove_file(self.lock_path(kind, &token));
            return None;
        }
        Some((first, token))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        let path = self.lock_path(kind, token);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        let _guard = self.queue_lock.lock().await;
        let path = self.lock_path(kind, token);
        if !path.exists() {
            return Ok(());
        }
        let data = std::fs::read_to_string(&path)?;
        let item: WorkItem = serde_json::from_str(&data)?;
        let mut items = self.read_queue(kind);
        items.insert(0, item);
        self.write_queue(kind, &items)?;
        std::fs::remove_file(&path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_assigns_sequence_and_drops_duplicate_completions() {
        let td = tempfile::tempdir().unwrap();
        let store = FsHistoryStore::new(td.path(), true);
        store.create_instance("i1").await.unwrap();
        store
            .append(
                "i1",
                vec![
                    Event::TaskScheduled {
                        id: 1,
                        name: "A".into(),
                        input: "x".into(),
                    },
                    Event::TaskCompleted {
                        id: 1,
                        result: "ok".into(),
                    },
                ],
            )
            .await
            .unwrap();
        store
            .append(
                "i1",
                vec![Event::TaskCompleted {
                    id: 1,
                    result: "again".into(),
                }],
            )
            .await
            .unwrap();
        let recs = store.read_records("i1").await;
        assert_eq!(recs.len(), 2);
        assert_eq!(recs.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn locked_items_are_recovered_on_reopen() {
        let td = tempfile::tempdir().unwrap();
        let item = WorkItem::StartOrchestration {
            instance: "i1".into(),
            orchestration: "O".into(),
        };
        {
            let store = FsHistoryStore::new(td.path(), true);
            store.enqueue_work(QueueKind::Orchestrator, item.clone()).await.unwrap();
            let (locked, _token) = store.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap();
            assert_eq!(locked, item);
            assert!(store.dequeue_peek_lock(QueueKind::Orchestrator).await.is_none());
            // dropped without ack, as if the process crashed
        }
        let reopened = FsHistoryStore::new(td.path(), false);
        let (again, token) = reopened.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap();
        assert_eq!(again, item);
        reopened.ack(QueueKind::Orchestrator, &token).await.unwrap();
    }

    #[tokio::test]
    async fn identical_signals_are_queued_separately() {
        let td = tempfile::tempdir().unwrap();
        let store = FsHistoryStore::new(td.path(), true);
        let timer = WorkItem::TimerSchedule {
            instance: "i1".into(),
            id: 2,
            fire_at_ms: 5,
        };
        let raise = WorkItem::ExternalRaised {
            instance: "i1".into(),
            name: "Approve".into(),
            data: "true".into(),
        };
        for item in [timer.clone(), timer.clone(), raise.clone(), raise.clone()] {
            store.enqueue_work(QueueKind::Orchestrator, item).await.unwrap();
        }
        let mut drained = Vec::new();
        while let Some((item, token)) = store.dequeue_peek_lock(QueueKind::Orchestrator).await {
            store.ack(QueueKind::Orchestrator, &token).await.unwrap();
            drained.push(item);
        }
        assert_eq!(drained, vec![timer, raise.clone(), raise]);
    }

    #[tokio::test]
    async fn append_past_cap_is_refused() {
        let td = tempfile::tempdir().unwrap();
        let store = FsHistoryStore::new_with_cap(td.path(), true, 2);
        store.create_instance("i1").await.unwrap();
        let timer = |id| Event::TimerCreated { id, fire_at_ms: 0 };
        store.append("i1", vec![timer(1), timer(2)]).await.unwrap();
        let err = store.append("i1", vec![timer(3)]).await.unwrap_err();
        assert!(matches!(err, ProviderError::CapExceeded { cap: 2, have: 2, append: 1 }));
        assert_eq!(store.read("i1").await.len(), 2);
    }
}
