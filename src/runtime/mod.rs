use crate::config::RuntimeOptions;
use crate::error::sanitize_error;
use crate::logging::ReplayLogCursor;
use crate::providers::in_memory::InMemoryHistoryStore;
use crate::providers::{HistoryStore, InstanceSnapshot, QueueKind, WorkItem};
use crate::{Event, OrchestrationContext, ProviderError, RuntimeError, TaskFailure};
use async_trait::async_trait;
use semver::Version;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

mod completions;
mod detect;
mod dispatch;
pub mod registry;
pub mod replay;
pub mod router;
mod status;
mod timers;

pub use registry::{
    ActivityContext, ActivityHandler, ActivityRegistry, ActivityRegistryBuilder, OrchestrationRegistry,
    OrchestrationRegistryBuilder, DEFAULT_VERSION,
};
pub use router::{InstanceRouter, OrchestratorMsg};
pub use status::{InstanceStatus, RuntimeStatus};

use replay::{DefaultReplayEngine, ReplayEngine};

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

type InstanceResult = (Vec<Event>, Result<String, String>);

enum Disposition {
    Ack,
    Abandon,
}

/// In-process runtime that drives instances through provider-backed queues
/// and persists history via a `HistoryStore`.
pub struct Runtime {
    router: Arc<InstanceRouter>,
    joins: Mutex<Vec<JoinHandle<()>>>,
    instance_joins: Mutex<Vec<JoinHandle<()>>>,
    activity_joins: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) history_store: Arc<dyn HistoryStore>,
    active_instances: Mutex<HashSet<String>>,
    // Instances whose outstanding work was re-enqueued by this process
    rehydrated: Mutex<HashSet<String>>,
    result_waiters: Mutex<HashMap<String, Vec<oneshot::Sender<InstanceResult>>>>,
    orchestration_registry: OrchestrationRegistry,
    cancel_signals: Mutex<HashMap<String, watch::Sender<bool>>>,
    // Instances waiting to be activated again after an enqueue failure
    reactivate_tx: mpsc::UnboundedSender<String>,
    replay_engine: Arc<dyn ReplayEngine>,
    options: RuntimeOptions,
}

impl Runtime {
    /// Start a new runtime using the in-memory history store.
    pub async fn start(
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        let history_store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::default());
        Self::start_with_store(history_store, activity_registry, orchestration_registry).await
    }

    /// Start a new runtime with a custom `HistoryStore` implementation.
    pub async fn start_with_store(
        history_store: Arc<dyn HistoryStore>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(
            history_store,
            activity_registry,
            orchestration_registry,
            RuntimeOptions::default(),
        )
        .await
    }

    pub async fn start_with_options(
        history_store: Arc<dyn HistoryStore>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        // Install a default subscriber if none set (ok to call many times)
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
            .try_init();

        let (reactivate_tx, reactivate_rx) = mpsc::unbounded_channel();
        let runtime = Arc::new(Self {
            router: Arc::new(InstanceRouter::default()),
            joins: Mutex::new(Vec::new()),
            instance_joins: Mutex::new(Vec::new()),
            activity_joins: Mutex::new(Vec::new()),
            history_store,
            active_instances: Mutex::new(HashSet::new()),
            rehydrated: Mutex::new(HashSet::new()),
            result_waiters: Mutex::new(HashMap::new()),
            orchestration_registry,
            cancel_signals: Mutex::new(HashMap::new()),
            reactivate_tx,
            replay_engine: Arc::new(DefaultReplayEngine::new()),
            options,
        });

        let handle = runtime.clone().start_orchestration_dispatcher();
        runtime.joins.lock().await.push(handle);

        let work_handle = runtime.clone().start_work_dispatcher(activity_registry);
        runtime.joins.lock().await.push(work_handle);

        let timer_handle = runtime.clone().start_timer_dispatcher();
        runtime.joins.lock().await.push(timer_handle);

        let reactivate_handle = runtime.clone().start_reactivation_dispatcher(reactivate_rx);
        runtime.joins.lock().await.push(reactivate_handle);

        runtime.resume_incomplete_instances().await;
        runtime
    }

    /// Reactivate instances a previous process left unfinished so their
    /// outstanding activities and timers are re-enqueued.
    async fn resume_incomplete_instances(self: &Arc<Self>) {
        for instance in self.history_store.list_instances().await {
            let unfinished = match self.history_store.read_snapshot(&instance).await {
                Some(s) => !s.runtime_status.is_terminal(),
                None => {
                    let history = self.history_store.read(&instance).await;
                    !history.is_empty() && !status::status_from_history(&history).0.is_terminal()
                }
            };
            if unfinished {
                info!(instance = %instance, "resuming unfinished instance");
                self.ensure_instance_active(&instance).await;
            }
        }
    }

    // ---------------- public API

    /// Create a new instance of `orchestration_name` under a generated id and
    /// return the id. The instance starts asynchronously.
    pub async fn schedule_instance(
        &self,
        orchestration_name: &str,
        input: impl Into<String>,
    ) -> Result<String, RuntimeError> {
        let instance = uuid::Uuid::new_v4().to_string();
        self.create_and_enqueue(&instance, orchestration_name, input.into()).await?;
        Ok(instance)
    }

    /// Start an instance under a caller-chosen id and get a handle that
    /// resolves with its final history and output.
    pub async fn start_orchestration(
        self: &Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        input: impl Into<String>,
    ) -> Result<JoinHandle<InstanceResult>, RuntimeError> {
        let rx = self.register_waiter(instance).await;
        if let Err(e) = self.create_and_enqueue(instance, orchestration_name, input.into()).await {
            drop(rx);
            if let Some(ws) = self.result_waiters.lock().await.get_mut(instance) {
                ws.retain(|w| !w.is_closed());
            }
            return Err(e);
        }
        Ok(tokio::spawn(async move {
            rx.await
                .unwrap_or_else(|_| (Vec::new(), Err("runtime stopped before the instance finished".to_string())))
        }))
    }

    async fn create_and_enqueue(&self, instance: &str, name: &str, input: String) -> Result<(), RuntimeError> {
        if instance.trim().is_empty() {
            return Err(RuntimeError::InvalidInput("instance id must not be empty".into()));
        }
        let (version, _) = self
            .orchestration_registry
            .resolve_for_start(name)
            .ok_or_else(|| RuntimeError::Unregistered(name.to_string()))?;
        let version = version.to_string();
        self.history_store.create_instance(instance).await?;
        self.history_store
            .append(
                instance,
                vec![Event::OrchestrationStarted {
                    name: name.to_string(),
                    version: version.clone(),
                    input,
                }],
            )
            .await?;
        self.history_store
            .write_snapshot(instance, &InstanceSnapshot::pending(name, version.as_str()))
            .await?;
        self.history_store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::StartOrchestration {
                    instance: instance.to_string(),
                    orchestration: name.to_string(),
                },
            )
            .await?;
        info!(instance, orchestration = name, version = %version, "instance scheduled");
        Ok(())
    }

    /// Deliver a named external event to a running instance. Events raised
    /// before the instance waits are buffered.
    pub async fn raise_event(
        &self,
        instance: &str,
        name: impl Into<String>,
        data: impl Into<String>,
    ) -> Result<(), RuntimeError> {
        self.require_running(instance).await?;
        let name = name.into();
        debug!(instance, name = %name, "raising external event");
        self.history_store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::ExternalRaised {
                    instance: instance.to_string(),
                    name,
                    data: data.into(),
                },
            )
            .await?;
        Ok(())
    }

    /// Request termination. The instance records the request, cancels its
    /// in-flight activities and ends as `Terminated`.
    pub async fn terminate_instance(&self, instance: &str, reason: impl Into<String>) -> Result<(), RuntimeError> {
        self.require_running(instance).await?;
        let reason = reason.into();
        info!(instance, reason = %reason, "termination requested");
        self.history_store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::TerminateInstance {
                    instance: instance.to_string(),
                    reason,
                },
            )
            .await?;
        Ok(())
    }

    async fn require_running(&self, instance: &str) -> Result<(), RuntimeError> {
        match self.get_status(instance).await {
            None => Err(RuntimeError::NotFound(instance.to_string())),
            Some(s) if s.runtime_status.is_terminal() => Err(RuntimeError::NotRunning(instance.to_string())),
            Some(_) => Ok(()),
        }
    }

    /// Poll until the instance reaches a terminal status.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<InstanceStatus, RuntimeError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.get_status(instance).await {
                None => return Err(RuntimeError::NotFound(instance.to_string())),
                Some(s) if s.runtime_status.is_terminal() => return Ok(s),
                Some(_) => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RuntimeError::Timeout(instance.to_string()));
            }
            tokio::time::sleep(Duration::from_millis(self.options.poller_idle_sleep_ms.max(5))).await;
        }
    }

    /// Abort background tasks. Channels are dropped with the runtime.
    pub async fn shutdown(self: Arc<Self>) {
        for j in self.joins.lock().await.drain(..) {
            j.abort();
        }
        for j in self.activity_joins.lock().await.drain(..) {
            j.abort();
        }
        for j in self.instance_joins.lock().await.drain(..) {
            j.abort();
        }
    }

    // ---------------- waiters and cancellation

    async fn register_waiter(&self, instance: &str) -> oneshot::Receiver<InstanceResult> {
        let (tx, rx) = oneshot::channel();
        self.result_waiters
            .lock()
            .await
            .entry(instance.to_string())
            .or_default()
            .push(tx);
        rx
    }

    async fn has_waiters(&self, instance: &str) -> bool {
        self.result_waiters
            .lock()
            .await
            .get(instance)
            .is_some_and(|ws| ws.iter().any(|w| !w.is_closed()))
    }

    async fn notify_waiters(&self, instance: &str, history: &[Event], result: &Result<String, String>) {
        if let Some(waiters) = self.result_waiters.lock().await.remove(instance) {
            for w in waiters {
                let _ = w.send((history.to_vec(), result.clone()));
            }
        }
    }

    async fn cancel_receiver(&self, instance: &str) -> watch::Receiver<bool> {
        self.cancel_signals
            .lock()
            .await
            .entry(instance.to_string())
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    /// Forget the cancel channel once no activity of `instance` holds it.
    async fn release_cancel(&self, instance: &str) {
        let mut signals = self.cancel_signals.lock().await;
        if signals.get(instance).is_some_and(|tx| tx.receiver_count() == 0) {
            signals.remove(instance);
        }
    }

    async fn signal_cancel(&self, instance: &str) {
        if let Some(tx) = self.cancel_signals.lock().await.remove(instance) {
            tx.send_replace(true);
        }
    }

    // ---------------- queue helpers

    async fn ack(&self, kind: QueueKind, token: &str) {
        if let Err(e) = self.history_store.ack(kind, token).await {
            warn!(?kind, token, error = %e, "ack failed");
        }
    }

    async fn abandon(&self, kind: QueueKind, token: &str) {
        if let Err(e) = self.history_store.abandon(kind, token).await {
            warn!(?kind, token, error = %e, "abandon failed");
        }
    }

    async fn ensure_instance_active(self: &Arc<Self>, instance: &str) -> bool {
        if self.active_instances.lock().await.contains(instance) {
            return false;
        }
        let this = self.clone();
        let inst = instance.to_string();
        let handle = tokio::spawn(async move {
            let _ = this.run_instance_to_completion(&inst).await;
        });
        let mut joins = self.instance_joins.lock().await;
        joins.retain(|j| !j.is_finished());
        joins.push(handle);
        true
    }

    // ---------------- dispatchers

    fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let Some((item, token)) = self.history_store.dequeue_peek_lock(QueueKind::Orchestrator).await else {
                    tokio::time::sleep(Duration::from_millis(self.options.poller_idle_sleep_ms)).await;
                    continue;
                };
                let ack_token = Some(token.clone());
                let msg = match item {
                    WorkItem::StartOrchestration { instance, orchestration } => {
                        debug!(instance = %instance, orchestration = %orchestration, "start picked up");
                        self.ensure_instance_active(&instance).await;
                        self.ack(QueueKind::Orchestrator, &token).await;
                        continue;
                    }
                    WorkItem::ActivityCompleted { instance, id, result } => OrchestratorMsg::ActivityCompleted {
                        instance,
                        id,
                        result,
                        ack_token,
                    },
                    WorkItem::ActivityFailed { instance, id, failure } => OrchestratorMsg::ActivityFailed {
                        instance,
                        id,
                        failure,
                        ack_token,
                    },
                    WorkItem::TimerFired {
                        instance,
                        id,
                        fire_at_ms,
                    } => OrchestratorMsg::TimerFired {
                        instance,
                        id,
                        fire_at_ms,
                        ack_token,
                    },
                    WorkItem::ExternalRaised { instance, name, data } => OrchestratorMsg::ExternalRaised {
                        instance,
                        name,
                        data,
                        ack_token,
                    },
                    WorkItem::TerminateInstance { instance, reason } => OrchestratorMsg::TerminateRequested {
                        instance,
                        reason,
                        ack_token,
                    },
                    other @ (WorkItem::ActivityExecute { .. } | WorkItem::TimerSchedule { .. }) => {
                        error!(?other, "unexpected work item on orchestrator queue; dropping");
                        self.ack(QueueKind::Orchestrator, &token).await;
                        continue;
                    }
                };
                self.deliver_or_rehydrate(msg, &token).await;
            }
        })
    }

    /// Forward to a live instance, or drop the message if the instance is
    /// finished, or activate the instance and abandon for redelivery.
    async fn deliver_or_rehydrate(self: &Arc<Self>, msg: OrchestratorMsg, token: &str) {
        let msg = match self.router.try_deliver(msg).await {
            Ok(()) => return,
            Err(m) => m,
        };
        let instance = msg.instance().to_string();
        match self.get_status(&instance).await {
            None => {
                warn!(instance = %instance, "message for unknown instance dropped");
                self.ack(QueueKind::Orchestrator, token).await;
            }
            Some(s) if s.runtime_status.is_terminal() => {
                debug!(
                    instance = %instance,
                    status = %s.runtime_status,
                    ?msg,
                    "late message for finished instance dropped"
                );
                self.ack(QueueKind::Orchestrator, token).await;
            }
            Some(_) => {
                self.ensure_instance_active(&instance).await;
                self.abandon(QueueKind::Orchestrator, token).await;
                tokio::time::sleep(Duration::from_millis(self.options.poller_gate_delay_ms)).await;
            }
        }
    }

    fn start_work_dispatcher(self: Arc<Self>, activities: Arc<ActivityRegistry>) -> JoinHandle<()> {
        let permits = Arc::new(Semaphore::new(self.options.max_concurrent_activities.max(1)));
        tokio::spawn(async move {
            loop {
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    return;
                };
                let Some((item, token)) = self.history_store.dequeue_peek_lock(QueueKind::Worker).await else {
                    drop(permit);
                    tokio::time::sleep(Duration::from_millis(self.options.poller_idle_sleep_ms)).await;
                    continue;
                };
                match item {
                    WorkItem::ActivityExecute {
                        instance,
                        id,
                        name,
                        input,
                    } => {
                        let rt = self.clone();
                        let activities = activities.clone();
                        let handle = tokio::spawn(async move {
                            let _permit = permit;
                            let outcome = rt.execute_activity(&activities, &instance, id, &name, input).await;
                            let completion = match outcome {
                                Ok(result) => WorkItem::ActivityCompleted {
                                    instance: instance.clone(),
                                    id,
                                    result,
                                },
                                Err(failure) => {
                                    debug!(
                                        instance = %instance,
                                        id,
                                        name = %name,
                                        failure = %failure,
                                        "activity did not succeed"
                                    );
                                    WorkItem::ActivityFailed {
                                        instance: instance.clone(),
                                        id,
                                        failure,
                                    }
                                }
                            };
                            match rt.history_store.enqueue_work(QueueKind::Orchestrator, completion).await {
                                Ok(()) => rt.ack(QueueKind::Worker, &token).await,
                                Err(e) => {
                                    error!(
                                        instance = %instance,
                                        id,
                                        error = %e,
                                        "failed to enqueue activity completion"
                                    );
                                    rt.abandon(QueueKind::Worker, &token).await;
                                }
                            }
                        });
                        let mut joins = self.activity_joins.lock().await;
                        joins.retain(|j| !j.is_finished());
                        joins.push(handle);
                    }
                    other => {
                        error!(?other, "unexpected work item on worker queue; dropping");
                        self.ack(QueueKind::Worker, &token).await;
                    }
                }
            }
        })
    }

    async fn execute_activity(
        &self,
        activities: &ActivityRegistry,
        instance: &str,
        id: u64,
        name: &str,
        input: String,
    ) -> Result<String, TaskFailure> {
        let Some(handler) = activities.get(name) else {
            warn!(instance, id, name, "activity not registered");
            return Err(TaskFailure::Unregistered(name.to_string()));
        };
        let ctx = ActivityContext::new(instance, id, name, self.cancel_receiver(instance).await);
        let outcome = if ctx.is_cancelled() {
            drop(ctx);
            Err(TaskFailure::Canceled("instance terminated".into()))
        } else {
            debug!(instance, id, name, "activity started");
            let watcher = ctx.clone();
            let run = tokio::spawn(async move { handler.invoke(ctx, input).await });
            let abort = run.abort_handle();
            tokio::select! {
                joined = run => match joined {
                    Ok(r) => r,
                    Err(e) => Err(TaskFailure::Failed(format!("activity task aborted: {e}"))),
                },
                _ = watcher.cancelled() => {
                    abort.abort();
                    Err(TaskFailure::Canceled("instance terminated".into()))
                }
            }
        };
        self.release_cancel(instance).await;
        outcome
    }

    fn start_reactivation_dispatcher(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<String>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(instance) = rx.recv().await {
                // Another activation may already have rehydrated it
                if self.rehydrated.lock().await.contains(&instance) {
                    continue;
                }
                if !self.ensure_instance_active(&instance).await {
                    debug!(instance = %instance, "instance still active; retrying reactivation later");
                    self.schedule_reactivation(instance);
                }
            }
        })
    }

    fn schedule_reactivation(&self, instance: String) {
        let tx = self.reactivate_tx.clone();
        let delay = Duration::from_millis(self.options.dispatch_retry_ms.max(1));
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(instance);
        });
    }

    fn start_timer_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let (svc_jh, svc_tx) =
                timers::TimerService::start(self.history_store.clone(), self.options.poller_idle_sleep_ms);

            // Intake: pull schedules, hand them to the service, then ack
            let intake_rt = self.clone();
            let intake = tokio::spawn(async move {
                loop {
                    let Some((item, token)) = intake_rt.history_store.dequeue_peek_lock(QueueKind::Timer).await
                    else {
                        tokio::time::sleep(Duration::from_millis(intake_rt.options.poller_idle_sleep_ms)).await;
                        continue;
                    };
                    match item {
                        item @ WorkItem::TimerSchedule { .. } => {
                            if svc_tx.send(item).is_err() {
                                intake_rt.abandon(QueueKind::Timer, &token).await;
                                return;
                            }
                            intake_rt.ack(QueueKind::Timer, &token).await;
                        }
                        other => {
                            error!(?other, "unexpected work item on timer queue; dropping");
                            intake_rt.ack(QueueKind::Timer, &token).await;
                        }
                    }
                }
            });
            // Aborting this dispatcher must take both tasks down
            struct AbortOnDrop(Vec<tokio::task::AbortHandle>);
            impl Drop for AbortOnDrop {
                fn drop(&mut self) {
                    for h in &self.0 {
                        h.abort();
                    }
                }
            }
            let _guard = AbortOnDrop(vec![intake.abort_handle(), svc_jh.abort_handle()]);
            tokio::select! {
                _ = intake => {}
                _ = svc_jh => {}
            }
        })
    }

    // ---------------- instance execution

    /// Drive one activation of `instance`: replay, persist, dispatch and wait
    /// for completions until it finishes or goes idle.
    pub async fn run_instance_to_completion(self: Arc<Self>, instance: &str) -> InstanceResult {
        {
            let mut act = self.active_instances.lock().await;
            if !act.insert(instance.to_string()) {
                return (Vec::new(), Err("already_active".into()));
            }
        }
        // Ensure removal of active flag even if the task panics
        struct ActiveGuard {
            rt: Arc<Runtime>,
            inst: String,
        }
        impl Drop for ActiveGuard {
            fn drop(&mut self) {
                let rt = self.rt.clone();
                let inst = std::mem::take(&mut self.inst);
                tokio::spawn(async move {
                    rt.active_instances.lock().await.remove(&inst);
                });
            }
        }
        let _active_guard = ActiveGuard {
            rt: self.clone(),
            inst: instance.to_string(),
        };

        let mut inbox = self.router.register(instance).await;
        let history: Vec<Event> = self.history_store.read(instance).await;

        if history.is_empty() {
            error!(instance, "activation requested for an instance without history");
            self.close_inbox(instance, &mut inbox, Disposition::Ack).await;
            return (history, Err(format!("instance {instance} has no history")));
        }
        if let Some(result) = terminal_result(&history) {
            self.close_inbox(instance, &mut inbox, Disposition::Ack).await;
            self.notify_waiters(instance, &history, &result).await;
            return (history, result);
        }

        let (name, version, input) = match started_record(&history) {
            Some(s) => s,
            None => {
                let err = detect::detect_malformed_start(&history).unwrap_or_else(|| "malformed history".into());
                let mut snapshot = InstanceSnapshot::pending("unknown", "0.0.0");
                return self.finish(instance, &mut inbox, history, Err(err), &mut snapshot).await;
            }
        };
        let mut snapshot = self
            .history_store
            .read_snapshot(instance)
            .await
            .unwrap_or_else(|| InstanceSnapshot::pending(name.as_str(), version.as_str()));

        let inconsistent = detect::detect_malformed_start(&history)
            .or_else(|| detect::detect_completion_kind_mismatch(&history));
        if let Some(err) = inconsistent {
            error!(instance, error = %err, "history is inconsistent");
            return self.finish(instance, &mut inbox, history, Err(err), &mut snapshot).await;
        }

        let handler = Version::parse(&version)
            .ok()
            .and_then(|v| self.orchestration_registry.resolve_exact(&name, &v));
        let Some(handler) = handler else {
            let err = format!("orchestration {name}@{version} is not registered");
            error!(instance, error = %err, "cannot resolve handler");
            return self.finish(instance, &mut inbox, history, Err(err), &mut snapshot).await;
        };

        if self.rehydrated.lock().await.insert(instance.to_string()) {
            if let Err(e) = completions::rehydrate_pending(instance, &history, &self.history_store).await {
                return self.retry_activation(instance, &mut inbox, history, e).await;
            }
        }

        if snapshot.runtime_status != RuntimeStatus::Running {
            snapshot.runtime_status = RuntimeStatus::Running;
            snapshot.touch();
            self.write_snapshot(instance, &snapshot).await;
        }

        self.drive(instance, &mut inbox, history, handler, input, snapshot).await
    }

    async fn drive(
        self: &Arc<Self>,
        instance: &str,
        inbox: &mut mpsc::UnboundedReceiver<OrchestratorMsg>,
        mut history: Vec<Event>,
        handler: Arc<dyn OrchestrationHandler>,
        input: String,
        mut snapshot: InstanceSnapshot,
    ) -> InstanceResult {
        let mut cursor = ReplayLogCursor::new();
        let mut turn_index: u64 = 0;
        let idle = Duration::from_millis(self.options.idle_dehydrate_ms);
        loop {
            if let Some(reason) = pending_terminate(&history) {
                return self.terminate(instance, inbox, history, reason, &mut snapshot).await;
            }

            let baseline_len = history.len();
            let turn = self
                .replay_engine
                .replay(history.clone(), turn_index, handler.clone(), input.clone());
            cursor.emit_new(instance, turn_index, &turn.logs);

            let mut snapshot_dirty = false;
            if let Some(cs) = turn.custom_status {
                if snapshot.custom_status.as_ref() != Some(&cs) {
                    snapshot.custom_status = Some(cs);
                    snapshot_dirty = true;
                }
            }
            if let Some(msg) = turn.nondeterminism {
                error!(instance, turn_index, error = %msg, "nondeterministic replay");
                return self.finish(instance, inbox, history, Err(msg), &mut snapshot).await;
            }

            history = turn.history;
            if history.len() > baseline_len {
                let delta = history[baseline_len..].to_vec();
                if let Err(e) = self.history_store.append(instance, delta).await {
                    return self.fail_unpersisted(instance, inbox, history, e.to_string(), &mut snapshot).await;
                }
            }
            if let Some(out) = turn.output {
                return self.finish(instance, inbox, history, out, &mut snapshot).await;
            }
            if let Err(e) = dispatch::dispatch_actions(self, instance, &history, turn.actions).await {
                return self.retry_activation(instance, inbox, history, e).await;
            }
            if snapshot_dirty {
                snapshot.touch();
                self.write_snapshot(instance, &snapshot).await;
            }
            let waiting = turn.waiting;
            debug!(instance, turn_index, ?waiting, "turn suspended");

            // Fold completions until one resumes a suspension point
            loop {
                let first = match tokio::time::timeout(idle, inbox.recv()).await {
                    Ok(Some(m)) => m,
                    Ok(None) => return (history, Err("instance inbox closed".into())),
                    Err(_) => {
                        if self.has_waiters(instance).await {
                            continue;
                        }
                        debug!(instance, "dehydrating idle instance");
                        self.close_inbox(instance, inbox, Disposition::Abandon).await;
                        return (history, Ok(String::new()));
                    }
                };
                let mut batch = vec![first];
                while batch.len() < self.options.completion_batch_limit.max(1) {
                    match inbox.try_recv() {
                        Ok(m) => batch.push(m),
                        Err(_) => break,
                    }
                }

                let len_before = history.len();
                let mut tokens = Vec::with_capacity(batch.len());
                for msg in batch {
                    if let Some(t) = msg.ack_token() {
                        tokens.push(t.to_string());
                    }
                    completions::append_completion(&mut history, msg);
                }
                if history.len() > len_before {
                    let delta = history[len_before..].to_vec();
                    if let Err(e) = self.history_store.append(instance, delta).await {
                        for t in &tokens {
                            self.abandon(QueueKind::Orchestrator, t).await;
                        }
                        return self.fail_unpersisted(instance, inbox, history, e.to_string(), &mut snapshot).await;
                    }
                }
                for t in &tokens {
                    self.ack(QueueKind::Orchestrator, t).await;
                }

                let new_events = &history[len_before..];
                if new_events.iter().any(|e| matches!(e, Event::TerminateRequested { .. })) {
                    break;
                }
                if completions::wakes(&waiting, new_events) {
                    break;
                }
            }
            turn_index += 1;
        }
    }

    /// Record the terminal event for `result` and release everything tied to
    /// the activation.
    async fn finish(
        self: &Arc<Self>,
        instance: &str,
        inbox: &mut mpsc::UnboundedReceiver<OrchestratorMsg>,
        mut history: Vec<Event>,
        result: Result<String, String>,
        snapshot: &mut InstanceSnapshot,
    ) -> InstanceResult {
        let terminal = match &result {
            Ok(output) => Event::ExecutionCompleted { output: output.clone() },
            Err(error) => Event::ExecutionFailed { error: error.clone() },
        };
        if let Err(e) = self.history_store.append(instance, vec![terminal.clone()]).await {
            return self.fail_unpersisted(instance, inbox, history, e.to_string(), snapshot).await;
        }
        history.push(terminal);

        match &result {
            Ok(output) => {
                info!(instance, "instance completed");
                snapshot.runtime_status = RuntimeStatus::Completed;
                snapshot.output = Some(output.clone());
                snapshot.error = None;
            }
            Err(e) => {
                let clean = sanitize_error(e);
                warn!(instance, error = %clean, "instance failed");
                snapshot.runtime_status = RuntimeStatus::Failed;
                snapshot.output = None;
                snapshot.error = Some(clean);
            }
        }
        snapshot.touch();
        self.write_snapshot(instance, snapshot).await;

        self.cancel_signals.lock().await.remove(instance);
        self.close_inbox(instance, inbox, Disposition::Ack).await;
        self.notify_waiters(instance, &history, &result).await;
        (history, result)
    }

    async fn terminate(
        self: &Arc<Self>,
        instance: &str,
        inbox: &mut mpsc::UnboundedReceiver<OrchestratorMsg>,
        mut history: Vec<Event>,
        reason: String,
        snapshot: &mut InstanceSnapshot,
    ) -> InstanceResult {
        let terminal = Event::ExecutionTerminated { reason: reason.clone() };
        if let Err(e) = self.history_store.append(instance, vec![terminal.clone()]).await {
            return self.fail_unpersisted(instance, inbox, history, e.to_string(), snapshot).await;
        }
        history.push(terminal);
        info!(instance, reason = %reason, "instance terminated");

        snapshot.runtime_status = RuntimeStatus::Terminated;
        snapshot.output = None;
        snapshot.error = None;
        snapshot.touch();
        self.write_snapshot(instance, snapshot).await;

        self.signal_cancel(instance).await;
        self.close_inbox(instance, inbox, Disposition::Ack).await;
        let result = Err(format!("terminated: {reason}"));
        self.notify_waiters(instance, &history, &result).await;
        (history, result)
    }

    /// Work recorded in history could not be enqueued. The activation is
    /// dropped and a fresh one scheduled; its rehydration re-enqueues every
    /// outstanding activity and timer.
    async fn retry_activation(
        self: &Arc<Self>,
        instance: &str,
        inbox: &mut mpsc::UnboundedReceiver<OrchestratorMsg>,
        history: Vec<Event>,
        store_error: ProviderError,
    ) -> InstanceResult {
        error!(instance, error = %store_error, "failed to enqueue instance work; reactivating");
        self.rehydrated.lock().await.remove(instance);
        self.close_inbox(instance, inbox, Disposition::Abandon).await;

        self.schedule_reactivation(instance.to_string());
        (history, Ok(String::new()))
    }

    /// History could not be written. The instance is reported failed so
    /// callers stop waiting on it.
    async fn fail_unpersisted(
        self: &Arc<Self>,
        instance: &str,
        inbox: &mut mpsc::UnboundedReceiver<OrchestratorMsg>,
        history: Vec<Event>,
        store_error: String,
        snapshot: &mut InstanceSnapshot,
    ) -> InstanceResult {
        error!(instance, error = %store_error, "failed to persist history");
        let err = format!("history store error: {store_error}");
        snapshot.runtime_status = RuntimeStatus::Failed;
        snapshot.error = Some(sanitize_error(&err));
        snapshot.touch();
        self.write_snapshot(instance, snapshot).await;
        self.signal_cancel(instance).await;
        self.close_inbox(instance, inbox, Disposition::Ack).await;
        let result = Err(err);
        self.notify_waiters(instance, &history, &result).await;
        (history, result)
    }

    async fn write_snapshot(&self, instance: &str, snapshot: &InstanceSnapshot) {
        if let Err(e) = self.history_store.write_snapshot(instance, snapshot).await {
            warn!(instance, error = %e, "failed to write status snapshot");
        }
    }

    /// Unregister the inbox and settle whatever is still buffered in it.
    async fn close_inbox(
        &self,
        instance: &str,
        inbox: &mut mpsc::UnboundedReceiver<OrchestratorMsg>,
        disposition: Disposition,
    ) {
        self.router.unregister(instance).await;
        while let Ok(msg) = inbox.try_recv() {
            if let Some(token) = msg.ack_token() {
                match disposition {
                    Disposition::Ack => {
                        debug!(instance, ?msg, "dropping message for finished instance");
                        self.ack(QueueKind::Orchestrator, token).await;
                    }
                    Disposition::Abandon => self.abandon(QueueKind::Orchestrator, token).await,
                }
            }
        }
    }
}

fn started_record(history: &[Event]) -> Option<(String, String, String)> {
    match history.first() {
        Some(Event::OrchestrationStarted { name, version, input }) => {
            Some((name.clone(), version.clone(), input.clone()))
        }
        _ => None,
    }
}

fn terminal_result(history: &[Event]) -> Option<Result<String, String>> {
    history.iter().rev().find_map(|e| match e {
        Event::ExecutionCompleted { output } => Some(Ok(output.clone())),
        Event::ExecutionFailed { error } => Some(Err(error.clone())),
        Event::ExecutionTerminated { reason } => Some(Err(format!("terminated: {reason}"))),
        _ => None,
    })
}

fn pending_terminate(history: &[Event]) -> Option<String> {
    history.iter().find_map(|e| match e {
        Event::TerminateRequested { reason } => Some(reason.clone()),
        _ => None,
    })
}
