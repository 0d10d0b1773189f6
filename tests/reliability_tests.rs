use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use claims_dtf::providers::fs::FsHistoryStore;
use claims_dtf::providers::in_memory::InMemoryHistoryStore;
use claims_dtf::providers::{HistoryRecord, HistoryStore, InstanceSnapshot, QueueKind, WorkItem};
use claims_dtf::runtime::{ActivityContext, ActivityRegistry, Runtime};
use claims_dtf::{
    Event, OrchestrationContext, OrchestrationRegistry, ProviderError, RuntimeError, RuntimeStatus, TaskFailure,
};
mod common;

fn fs_store(path: &std::path::Path, reset: bool) -> Arc<dyn HistoryStore> {
    Arc::new(FsHistoryStore::new(path, reset))
}

fn wait_then_echo() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register("WaitEvt", |ctx: OrchestrationContext, _input: String| async move {
            let a = ctx.schedule_activity("Stamp", "a").into_activity().await.map_err(|e| e.to_string())?;
            let v = ctx.schedule_wait("Evt").into_event().await;
            Ok(format!("{a}:{v}"))
        })
        .build()
}

fn stamp_activities() -> Arc<ActivityRegistry> {
    Arc::new(
        ActivityRegistry::builder()
            .register("Stamp", |input: String| async move { Ok(format!("stamped-{input}")) })
            .build(),
    )
}

#[tokio::test]
async fn instance_resumes_after_restart_fs() {
    let td = tempfile::tempdir().unwrap();
    let inst = "inst-restart";

    let store1 = fs_store(td.path(), true);
    let rt1 = Runtime::start_with_store(store1.clone(), stamp_activities(), wait_then_echo()).await;
    let _h = rt1.start_orchestration(inst, "WaitEvt", "").await.unwrap();
    assert!(common::wait_for_subscription(store1.clone(), inst, "Evt", 2_000).await);
    rt1.shutdown().await;

    // A fresh process over the same directory picks the instance up again
    let store2 = fs_store(td.path(), false);
    let rt2 = Runtime::start_with_store(store2.clone(), stamp_activities(), wait_then_echo()).await;
    let status = rt2.get_status(inst).await.unwrap();
    assert!(!status.runtime_status.is_terminal());
    rt2.raise_event(inst, "Evt", "after-restart").await.unwrap();

    let status = rt2.wait_for_orchestration(inst, Duration::from_secs(5)).await.unwrap();
    assert_eq!(status.runtime_status, RuntimeStatus::Completed);
    assert_eq!(status.output.as_deref(), Some("stamped-a:after-restart"));
    // The activity completed before the restart and is not run again
    let hist = store2.read(inst).await;
    assert_eq!(common::count(&hist, |e| matches!(e, Event::TaskScheduled { .. })), 1);
    assert_eq!(common::count(&hist, |e| matches!(e, Event::TaskCompleted { .. })), 1);
    rt2.shutdown().await;
}

#[tokio::test]
async fn timer_duplicate_workitems_dedup_fs() {
    let td = tempfile::tempdir().unwrap();
    let store = fs_store(td.path(), true);

    let orchestrations = OrchestrationRegistry::builder()
        .register("OneTimer", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_timer(100).into_timer().await;
            Ok("t".to_string())
        })
        .build();
    let no_activities = Arc::new(ActivityRegistry::builder().build());
    let rt = Runtime::start_with_store(store.clone(), no_activities, orchestrations).await;

    let inst = "inst-timer-dup";
    let _h = rt.start_orchestration(inst, "OneTimer", "").await.unwrap();
    assert!(
        common::wait_for_history(
            store.clone(),
            inst,
            |h| h.iter().any(|e| matches!(e, Event::TimerCreated { .. })),
            2_000
        )
        .await
    );
    let (id, fire_at_ms) = store
        .read(inst)
        .await
        .iter()
        .find_map(|e| match e {
            Event::TimerCreated { id, fire_at_ms } => Some((*id, *fire_at_ms)),
            _ => None,
        })
        .unwrap();

    // Redelivery after a crash looks exactly like this
    let wi = WorkItem::TimerFired {
        instance: inst.to_string(),
        id,
        fire_at_ms,
    };
    let _ = store.enqueue_work(QueueKind::Orchestrator, wi.clone()).await;
    let _ = store.enqueue_work(QueueKind::Orchestrator, wi).await;

    let ok = common::wait_for_history(
        store.clone(),
        inst,
        |h| {
            h.iter()
                .any(|e| matches!(e, Event::ExecutionCompleted { output } if output == "t"))
        },
        5_000,
    )
    .await;
    assert!(ok, "timeout waiting for completion");
    tokio::time::sleep(Duration::from_millis(200)).await;
    let hist = store.read(inst).await;
    assert_eq!(common::count(&hist, |e| matches!(e, Event::TimerFired { .. })), 1);
    assert_eq!(common::count(&hist, |e| e.is_terminal()), 1);
    rt.shutdown().await;
}

#[tokio::test]
async fn duplicate_activity_completion_is_ignored_fs() {
    let td = tempfile::tempdir().unwrap();
    let store = fs_store(td.path(), true);
    let rt = Runtime::start_with_store(store.clone(), stamp_activities(), wait_then_echo()).await;

    let inst = "inst-act-dup";
    let handle = rt.start_orchestration(inst, "WaitEvt", "").await.unwrap();
    assert!(common::wait_for_subscription(store.clone(), inst, "Evt", 2_000).await);

    // A second completion for the same call-site, e.g. from a redelivered activity
    store
        .enqueue_work(
            QueueKind::Orchestrator,
            WorkItem::ActivityCompleted {
                instance: inst.to_string(),
                id: 1,
                result: "stamped-again".into(),
            },
        )
        .await
        .unwrap();
    rt.raise_event(inst, "Evt", "v").await.unwrap();

    let (hist, output) = handle.await.unwrap();
    assert_eq!(output.unwrap(), "stamped-a:v");
    assert_eq!(common::count(&hist, |e| matches!(e, Event::TaskCompleted { .. })), 1);
    rt.shutdown().await;
}

#[tokio::test]
async fn event_raised_before_wait_is_buffered() {
    let td = tempfile::tempdir().unwrap();
    let store = fs_store(td.path(), true);
    let gate = Arc::new(tokio::sync::Notify::new());
    let gate_for_activity = gate.clone();
    let activities = ActivityRegistry::builder()
        .register("Slow", move |_input: String| {
            let gate = gate_for_activity.clone();
            async move {
                gate.notified().await;
                Ok("slow".to_string())
            }
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("SlowThenWait", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_activity("Slow", "").into_activity().await.map_err(|e| e.to_string())?;
            Ok(ctx.schedule_wait("Early").into_event().await)
        })
        .build();
    let rt = Runtime::start_with_store(store.clone(), Arc::new(activities), orchestrations).await;

    let inst = "inst-early";
    let handle = rt.start_orchestration(inst, "SlowThenWait", "").await.unwrap();
    assert!(
        common::wait_for_history(
            store.clone(),
            inst,
            |h| h.iter().any(|e| matches!(e, Event::TaskScheduled { .. })),
            2_000
        )
        .await
    );
    // Nobody waits for "Early" yet
    rt.raise_event(inst, "Early", "buffered").await.unwrap();
    assert!(
        common::wait_for_history(
            store.clone(),
            inst,
            |h| h.iter().any(|e| matches!(e, Event::EventRaised { .. })),
            2_000
        )
        .await
    );
    gate.notify_one();

    let (hist, output) = handle.await.unwrap();
    assert_eq!(output.unwrap(), "buffered");
    let raised = hist.iter().position(|e| matches!(e, Event::EventRaised { .. })).unwrap();
    let subscribed = hist.iter().position(|e| matches!(e, Event::EventSubscribed { .. })).unwrap();
    assert!(raised < subscribed);
    rt.shutdown().await;
}

#[tokio::test]
async fn identical_events_are_each_delivered() {
    let td = tempfile::tempdir().unwrap();
    let store = fs_store(td.path(), true);
    let orchestrations = OrchestrationRegistry::builder()
        .register("TwoApprovals", |ctx: OrchestrationContext, _input: String| async move {
            let first = ctx.schedule_wait("Approve").into_event().await;
            let second = ctx.schedule_wait("Approve").into_event().await;
            Ok(format!("{first}+{second}"))
        })
        .build();
    let no_activities = Arc::new(ActivityRegistry::builder().build());
    let rt = Runtime::start_with_store(store.clone(), no_activities, orchestrations).await;

    let inst = "inst-same-event";
    let handle = rt.start_orchestration(inst, "TwoApprovals", "").await.unwrap();
    assert!(common::wait_for_subscription(store.clone(), inst, "Approve", 2_000).await);
    // Same name and payload, but two separate approvals
    rt.raise_event(inst, "Approve", "true").await.unwrap();
    rt.raise_event(inst, "Approve", "true").await.unwrap();

    let (hist, output) = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("both approvals should be delivered")
        .unwrap();
    assert_eq!(output.unwrap(), "true+true");
    assert_eq!(common::count(&hist, |e| matches!(e, Event::EventRaised { .. })), 2);
    rt.shutdown().await;
}

/// In-memory store whose worker queue refuses the first few enqueues.
struct FlakyWorkerQueue {
    inner: InMemoryHistoryStore,
    refusals: AtomicUsize,
}

#[async_trait]
impl HistoryStore for FlakyWorkerQueue {
    async fn create_instance(&self, instance: &str) -> Result<(), ProviderError> {
        self.inner.create_instance(instance).await
    }
    async fn read_records(&self, instance: &str) -> Vec<HistoryRecord> {
        self.inner.read_records(instance).await
    }
    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), ProviderError> {
        self.inner.append(instance, new_events).await
    }
    async fn read_snapshot(&self, instance: &str) -> Option<InstanceSnapshot> {
        self.inner.read_snapshot(instance).await
    }
    async fn write_snapshot(&self, instance: &str, snapshot: &InstanceSnapshot) -> Result<(), ProviderError> {
        self.inner.write_snapshot(instance, snapshot).await
    }
    async fn list_instances(&self) -> Vec<String> {
        self.inner.list_instances().await
    }
    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), ProviderError> {
        let refuse = kind == QueueKind::Worker
            && self
                .refusals
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if refuse {
            return Err(ProviderError::Io(std::io::Error::other("worker queue unavailable")));
        }
        self.inner.enqueue_work(kind, item).await
    }
    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        self.inner.dequeue_peek_lock(kind).await
    }
    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        self.inner.ack(kind, token).await
    }
    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        self.inner.abandon(kind, token).await
    }
}

#[tokio::test]
async fn refused_activity_enqueue_is_retried() {
    let store: Arc<dyn HistoryStore> = Arc::new(FlakyWorkerQueue {
        inner: InMemoryHistoryStore::default(),
        refusals: AtomicUsize::new(2),
    });
    let orchestrations = OrchestrationRegistry::builder()
        .register("StampOnce", |ctx: OrchestrationContext, input: String| async move {
            ctx.schedule_activity("Stamp", input).into_activity().await.map_err(|e| e.to_string())
        })
        .build();
    let rt = Runtime::start_with_store(store.clone(), stamp_activities(), orchestrations).await;

    let handle = rt.start_orchestration("inst-flaky", "StampOnce", "x").await.unwrap();
    let (hist, output) = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("activity should run once the queue accepts it")
        .unwrap();
    assert_eq!(output.unwrap(), "stamped-x");
    assert_eq!(common::count(&hist, |e| matches!(e, Event::TaskScheduled { .. })), 1);
    assert_eq!(common::count(&hist, |e| matches!(e, Event::TaskCompleted { .. })), 1);
    rt.shutdown().await;
}

#[tokio::test]
async fn terminate_cancels_in_flight_activity() {
    let td = tempfile::tempdir().unwrap();
    let store = fs_store(td.path(), true);
    let observed_cancel = Arc::new(AtomicBool::new(false));
    let observed = observed_cancel.clone();
    let activities = ActivityRegistry::builder()
        .register_with_context("Forever", move |ctx: ActivityContext, _input: String| {
            let observed = observed.clone();
            async move {
                ctx.cancelled().await;
                observed.store(true, Ordering::SeqCst);
                Err(TaskFailure::Canceled("instance terminated".into()))
            }
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("LongRunning", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_activity("Forever", "").into_activity().await.map_err(|e| e.to_string())
        })
        .build();
    let rt = Runtime::start_with_store(store.clone(), Arc::new(activities), orchestrations).await;

    let inst = "inst-terminate";
    let handle = rt.start_orchestration(inst, "LongRunning", "").await.unwrap();
    assert!(
        common::wait_for_history(
            store.clone(),
            inst,
            |h| h.iter().any(|e| matches!(e, Event::TaskScheduled { .. })),
            2_000
        )
        .await
    );
    rt.terminate_instance(inst, "operator request").await.unwrap();

    let (hist, output) = handle.await.unwrap();
    assert_eq!(output.unwrap_err(), "terminated: operator request");
    assert!(matches!(hist.last(), Some(Event::ExecutionTerminated { reason }) if reason == "operator request"));
    let status = rt.get_status(inst).await.unwrap();
    assert_eq!(status.runtime_status, RuntimeStatus::Terminated);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !observed_cancel.load(Ordering::SeqCst) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(observed_cancel.load(Ordering::SeqCst), "activity never saw the cancellation");
    rt.shutdown().await;
}

#[tokio::test]
async fn raise_event_rejects_unknown_and_finished_instances() {
    let td = tempfile::tempdir().unwrap();
    let store = fs_store(td.path(), true);
    let orchestrations = OrchestrationRegistry::builder()
        .register("Immediate", |_ctx: OrchestrationContext, input: String| async move { Ok(input) })
        .build();
    let rt = Runtime::start_with_store(store, Arc::new(ActivityRegistry::builder().build()), orchestrations).await;

    let missing = rt.raise_event("no-such-instance", "Evt", "x").await;
    assert!(matches!(missing, Err(RuntimeError::NotFound(id)) if id == "no-such-instance"));

    let handle = rt.start_orchestration("inst-done", "Immediate", "out").await.unwrap();
    let (_, output) = handle.await.unwrap();
    assert_eq!(output.unwrap(), "out");
    let late = rt.raise_event("inst-done", "Evt", "x").await;
    assert!(matches!(late, Err(RuntimeError::NotRunning(_))));
    let terminate = rt.terminate_instance("inst-done", "too late").await;
    assert!(matches!(terminate, Err(RuntimeError::NotRunning(_))));

    let dup = rt.start_orchestration("inst-done", "Immediate", "again").await;
    assert!(dup.is_err(), "instance ids are unique");
    rt.shutdown().await;
}
