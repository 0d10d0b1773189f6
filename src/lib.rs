//! Durable, replay-driven claim processing.
//!
//! The crate has two layers. The lower layer is a small Durable Task style
//! engine: orchestration code runs against an append-only history of
//! [`Event`]s and is re-executed from the top on every turn, so every
//! activity call, timer and external wait must be recorded before it takes
//! effect and answered from history afterwards. It provides:
//!
//! - Public data model: `Event`, `Action`
//! - Orchestration driver: `run_turn` and `run_turn_detailed`
//! - An `OrchestrationContext` with futures to schedule activities, timers
//!   and external waits, correlated by positional call-site ids
//! - A unified `DurableFuture` that composes with `join`/`select`
//! - A multi-instance [`runtime::Runtime`] backed by a [`providers::HistoryStore`]
//!
//! The upper layer ([`claims`]) is the insurance claim workflow built on it,
//! with reasoning-backed activities ([`agents`]), external collaborators
//! ([`collaborators`]) and an HTTP surface ([`api`]).
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

pub mod agents;
pub mod api;
pub mod claims;
pub mod collaborators;
pub mod config;
pub mod correlator;
pub mod error;
pub mod futures;
pub mod logging;
pub mod providers;
pub mod runtime;

pub use error::{ProviderError, RuntimeError, TaskFailure};
pub use runtime::{
    InstanceStatus, OrchestrationHandler, OrchestrationRegistry, OrchestrationRegistryBuilder, RuntimeStatus,
};

use crate::correlator::EventCorrelator;
use crate::logging::LogLevel;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

// Internal codec utilities for typed I/O
pub(crate) mod _typed_codec {
    use serde::{de::DeserializeOwned, Serialize};
    use serde_json::Value;
    pub trait Codec {
        fn encode<T: Serialize>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }
    pub struct Json;
    impl Codec for Json {
        fn encode<T: Serialize>(v: &T) -> Result<String, String> {
            // Plain strings travel unquoted so string-typed activities stay readable in history
            match serde_json::to_value(v) {
                Ok(Value::String(s)) => Ok(s),
                Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            match serde_json::from_str::<T>(s) {
                Ok(v) => Ok(v),
                Err(first) => {
                    // Fallback: treat raw string as a JSON string value
                    let val = Value::String(s.to_string());
                    serde_json::from_value(val).map_err(|_| first.to_string())
                }
            }
        }
    }
}

use crate::_typed_codec::Codec;

/// Append-only orchestration history entries persisted by a provider and
/// consumed during replay. Scheduling records carry the positional call-site
/// id that their completion echoes back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Event {
    /// Instance was created by name with its input. Version pins the handler for replay.
    OrchestrationStarted { name: String, version: String, input: String },

    /// Activity call-site `id` was scheduled.
    TaskScheduled { id: u64, name: String, input: String },
    /// Activity call-site `id` completed with a result.
    TaskCompleted { id: u64, result: String },
    /// Activity call-site `id` failed or was canceled.
    TaskFailed { id: u64, failure: TaskFailure },

    /// Timer was created and will logically fire at `fire_at_ms`.
    TimerCreated { id: u64, fire_at_ms: u64 },
    /// Timer fired.
    TimerFired { id: u64, fire_at_ms: u64 },

    /// Workflow code started waiting on a named external event at call-site `id`.
    EventSubscribed { id: u64, name: String },
    /// An external event arrived. Matched to waits by name, first in first out.
    EventRaised { name: String, data: String },

    /// Termination was requested by an operator.
    TerminateRequested { reason: String },

    /// Terminal: orchestration returned a result.
    ExecutionCompleted { output: String },
    /// Terminal: orchestration returned an error or could not be replayed.
    ExecutionFailed { error: String },
    /// Terminal: orchestration was terminated.
    ExecutionTerminated { reason: String },
}

impl Event {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::ExecutionCompleted { .. } | Event::ExecutionFailed { .. } | Event::ExecutionTerminated { .. }
        )
    }
}

/// Declarative decisions produced by an orchestration turn. The runtime
/// materializes these into queue work items after the turn's history is
/// persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Schedule an activity invocation.
    CallActivity { id: u64, name: String, input: String },
    /// Create a timer that will fire after the requested delay.
    CreateTimer { id: u64, delay_ms: u64 },
    /// Subscribe to an external event by name.
    WaitExternal { id: u64, name: String },
}

/// A point the orchestration is currently suspended on. Completions that
/// match none of these are recorded but do not resume the orchestration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WaitTarget {
    Task(u64),
    Timer(u64),
    Event(String),
}

impl WaitTarget {
    /// Whether a newly appended history event satisfies this wait.
    pub fn is_satisfied_by(&self, event: &Event) -> bool {
        match (self, event) {
            (WaitTarget::Task(id), Event::TaskCompleted { id: cid, .. })
            | (WaitTarget::Task(id), Event::TaskFailed { id: cid, .. })
            | (WaitTarget::Timer(id), Event::TimerFired { id: cid, .. }) => id == cid,
            (WaitTarget::Event(name), Event::EventRaised { name: n, .. }) => name == n,
            _ => false,
        }
    }
}

/// Kind and name recorded for a call-site in history; used to detect code
/// that no longer matches the recorded execution.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CallSite {
    Task { name: String },
    Timer,
    Wait { name: String },
}

impl std::fmt::Display for CallSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallSite::Task { name } => write!(f, "activity '{name}'"),
            CallSite::Timer => write!(f, "timer"),
            CallSite::Wait { name } => write!(f, "wait for '{name}'"),
        }
    }
}

#[derive(Debug)]
struct CtxInner {
    history: Vec<Event>,
    actions: Vec<Action>,

    // Positional correlation: ids restart at 1 on every replay
    next_correlation_id: u64,
    recorded_call_sites: HashMap<u64, CallSite>,
    correlator: EventCorrelator,
    // Futures polled and still pending, keyed by correlation id
    waiting: HashMap<u64, WaitTarget>,
    nondeterminism: Option<String>,

    turn_index: u64,
    log_buffer: Vec<(LogLevel, String)>,
    custom_status: Option<serde_json::Value>,
}

impl CtxInner {
    fn new(history: Vec<Event>) -> Self {
        let mut recorded_call_sites = HashMap::new();
        for ev in &history {
            match ev {
                Event::TaskScheduled { id, name, .. } => {
                    recorded_call_sites.insert(*id, CallSite::Task { name: name.clone() });
                }
                Event::TimerCreated { id, .. } => {
                    recorded_call_sites.insert(*id, CallSite::Timer);
                }
                Event::EventSubscribed { id, name } => {
                    recorded_call_sites.insert(*id, CallSite::Wait { name: name.clone() });
                }
                _ => {}
            }
        }
        let correlator = EventCorrelator::from_history(&history);
        Self {
            history,
            actions: Vec::new(),
            next_correlation_id: 1,
            recorded_call_sites,
            correlator,
            waiting: HashMap::new(),
            nondeterminism: None,
            turn_index: 0,
            log_buffer: Vec::new(),
            custom_status: None,
        }
    }

    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_correlation_id;
        self.next_correlation_id += 1;
        id
    }

    /// Claim the next call-site id. Returns `true` when the call-site is new
    /// and must be recorded, `false` when history already holds it.
    fn claim_call_site(&mut self, site: CallSite) -> (u64, bool) {
        let id = self.next_id();
        match self.recorded_call_sites.get(&id) {
            Some(existing) if *existing == site => (id, false),
            Some(existing) => {
                if self.nondeterminism.is_none() {
                    self.nondeterminism = Some(format!(
                        "nondeterministic replay at call-site {id}: history recorded {existing}, code requested {site}"
                    ));
                }
                (id, false)
            }
            None => {
                self.recorded_call_sites.insert(id, site);
                (id, self.nondeterminism.is_none())
            }
        }
    }

    fn record(&mut self, event: Event, action: Action) {
        self.history.push(event);
        self.actions.push(action);
    }
}

/// User-facing orchestration context for scheduling and replay-safe helpers.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    /// Construct a new context from an existing history vector.
    pub fn new(history: Vec<Event>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(history))),
        }
    }

    fn take_actions(&self) -> Vec<Action> {
        std::mem::take(&mut self.inner.lock().unwrap().actions)
    }

    /// The zero-based turn counter assigned by the host for diagnostics.
    pub fn turn_index(&self) -> u64 {
        self.inner.lock().unwrap().turn_index
    }
    pub(crate) fn set_turn_index(&self, idx: u64) {
        self.inner.lock().unwrap().turn_index = idx;
    }

    // Replay-safe logging
    /// Drain the buffered log messages accumulated during the turn.
    pub fn take_log_buffer(&self) -> Vec<(LogLevel, String)> {
        std::mem::take(&mut self.inner.lock().unwrap().log_buffer)
    }
    /// Buffer a log message for the current turn.
    pub fn push_log(&self, level: LogLevel, msg: impl Into<String>) {
        self.inner.lock().unwrap().log_buffer.push((level, msg.into()));
    }
    pub fn log_info(&self, msg: impl Into<String>) {
        self.push_log(LogLevel::Info, msg);
    }
    pub fn log_warn(&self, msg: impl Into<String>) {
        self.push_log(LogLevel::Warn, msg);
    }
    pub fn log_error(&self, msg: impl Into<String>) {
        self.push_log(LogLevel::Error, msg);
    }
    pub fn log_debug(&self, msg: impl Into<String>) {
        self.push_log(LogLevel::Debug, msg);
    }

    /// Publish an observational status value for external pollers.
    ///
    /// Write-only: there is no way to read it back from workflow code, and it
    /// is never recorded in history.
    pub fn set_custom_status<T: Serialize>(&self, status: &T) {
        match serde_json::to_value(status) {
            Ok(v) => self.inner.lock().unwrap().custom_status = Some(v),
            Err(e) => self.push_log(LogLevel::Warn, format!("custom status not serializable: {e}")),
        }
    }

    fn take_custom_status(&self) -> Option<serde_json::Value> {
        self.inner.lock().unwrap().custom_status.take()
    }

    fn nondeterminism(&self) -> Option<String> {
        self.inner.lock().unwrap().nondeterminism.clone()
    }

    fn waiting_snapshot(&self) -> Vec<WaitTarget> {
        let inner = self.inner.lock().unwrap();
        let mut ids: Vec<_> = inner.waiting.iter().collect();
        ids.sort_by_key(|(id, _)| **id);
        ids.into_iter().map(|(_, t)| t.clone()).collect()
    }
}

pub use crate::futures::{AggregateDurableFuture, DurableFuture, DurableOutput, JoinFuture, SelectFuture};
use crate::futures::Kind;

impl OrchestrationContext {
    /// Schedule an activity and return a `DurableFuture` correlated to it.
    ///
    /// The scheduling is recorded immediately, so activities created before
    /// any of them is awaited are dispatched together.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        let name: String = name.into();
        let input: String = input.into();
        let mut inner = self.inner.lock().unwrap();
        let (id, is_new) = inner.claim_call_site(CallSite::Task { name: name.clone() });
        if is_new {
            inner.record(
                Event::TaskScheduled {
                    id,
                    name: name.clone(),
                    input: input.clone(),
                },
                Action::CallActivity {
                    id,
                    name: name.clone(),
                    input,
                },
            );
        }
        drop(inner);
        DurableFuture::new(id, Kind::Activity { name }, self.clone())
    }

    /// Typed helper that serializes the input; pair with `into_activity_typed`.
    pub fn schedule_activity_typed<In: Serialize>(&self, name: impl Into<String>, input: &In) -> DurableFuture {
        // Serializing plain data records cannot fail
        let payload = crate::_typed_codec::Json::encode(input).expect("activity input must serialize");
        self.schedule_activity(name, payload)
    }

    /// Schedule a timer and return a `DurableFuture` correlated to it.
    pub fn schedule_timer(&self, delay_ms: u64) -> DurableFuture {
        let mut inner = self.inner.lock().unwrap();
        let (id, is_new) = inner.claim_call_site(CallSite::Timer);
        if is_new {
            let fire_at_ms = inner.now_ms().saturating_add(delay_ms);
            inner.record(Event::TimerCreated { id, fire_at_ms }, Action::CreateTimer { id, delay_ms });
        }
        drop(inner);
        DurableFuture::new(id, Kind::Timer, self.clone())
    }

    /// Wait for an external event by name. Events raised before the wait are
    /// buffered and delivered in arrival order.
    pub fn schedule_wait(&self, name: impl Into<String>) -> DurableFuture {
        let name: String = name.into();
        let mut inner = self.inner.lock().unwrap();
        let (id, is_new) = inner.claim_call_site(CallSite::Wait { name: name.clone() });
        if is_new {
            inner.record(
                Event::EventSubscribed { id, name: name.clone() },
                Action::WaitExternal { id, name: name.clone() },
            );
        }
        drop(inner);
        DurableFuture::new(id, Kind::External { name }, self.clone())
    }

    /// Deterministic select over two futures: returns (winner_index, DurableOutput)
    pub fn select2(&self, a: DurableFuture, b: DurableFuture) -> SelectFuture {
        SelectFuture(AggregateDurableFuture::new_select(vec![a, b]))
    }
    /// Deterministic select over N futures; the child whose completion is
    /// earliest in history wins.
    pub fn select(&self, futures: Vec<DurableFuture>) -> SelectFuture {
        SelectFuture(AggregateDurableFuture::new_select(futures))
    }
    /// Join over N futures; outputs are returned in argument order.
    pub fn join(&self, futures: Vec<DurableFuture>) -> JoinFuture {
        JoinFuture(AggregateDurableFuture::new_join(futures))
    }

    // Resolution helpers used by DurableFuture

    pub(crate) fn completion_index(&self, id: u64, kind: &Kind) -> Option<usize> {
        let inner = self.inner.lock().unwrap();
        match kind {
            Kind::Activity { .. } => inner.history.iter().position(|e| {
                matches!(e, Event::TaskCompleted { id: cid, .. } | Event::TaskFailed { id: cid, .. } if *cid == id)
            }),
            Kind::Timer => inner
                .history
                .iter()
                .position(|e| matches!(e, Event::TimerFired { id: cid, .. } if *cid == id)),
            Kind::External { name } => inner.correlator.peek(name),
        }
    }

    pub(crate) fn take_completion(&self, id: u64, kind: &Kind) -> Option<DurableOutput> {
        let mut inner = self.inner.lock().unwrap();
        inner.waiting.remove(&id);
        match kind {
            Kind::Activity { .. } => inner.history.iter().find_map(|e| match e {
                Event::TaskCompleted { id: cid, result } if *cid == id => {
                    Some(DurableOutput::Activity(Ok(result.clone())))
                }
                Event::TaskFailed { id: cid, failure } if *cid == id => {
                    Some(DurableOutput::Activity(Err(failure.clone())))
                }
                _ => None,
            }),
            Kind::Timer => inner
                .history
                .iter()
                .any(|e| matches!(e, Event::TimerFired { id: cid, .. } if *cid == id))
                .then_some(DurableOutput::Timer),
            Kind::External { name } => inner.correlator.consume(name).map(DurableOutput::External),
        }
    }

    pub(crate) fn mark_waiting(&self, id: u64, kind: &Kind) {
        let target = match kind {
            Kind::Activity { .. } => WaitTarget::Task(id),
            Kind::Timer => WaitTarget::Timer(id),
            Kind::External { name } => WaitTarget::Event(name.clone()),
        };
        self.inner.lock().unwrap().waiting.insert(id, target);
    }

    pub(crate) fn release_wait(&self, id: u64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.waiting.remove(&id);
        }
    }
}

fn noop_waker() -> Waker {
    unsafe fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe fn wake(_: *const ()) {}
    unsafe fn wake_by_ref(_: *const ()) {}
    unsafe fn drop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

fn poll_once<F: Future>(fut: Pin<&mut F>) -> Poll<F::Output> {
    let w = noop_waker();
    let mut cx = Context::from_waker(&w);
    fut.poll(&mut cx)
}

/// Tuple returned by `run_turn`: updated history, actions to execute,
/// buffered logs, and the output if the orchestration finished.
pub type TurnResult<O> = (Vec<Event>, Vec<Action>, Vec<(LogLevel, String)>, Option<O>);

/// Everything a host needs from one replay turn.
#[derive(Debug)]
pub struct TurnOutcome<O> {
    pub history: Vec<Event>,
    pub actions: Vec<Action>,
    pub logs: Vec<(LogLevel, String)>,
    pub output: Option<O>,
    /// Latest value published through `set_custom_status` during the turn.
    pub custom_status: Option<serde_json::Value>,
    /// Call-sites the orchestration is suspended on after the turn.
    pub waiting: Vec<WaitTarget>,
    /// Set when the code no longer matches the recorded history.
    pub nondeterminism: Option<String>,
}

/// Poll the orchestrator once against `history`.
pub fn run_turn<O, F>(history: Vec<Event>, orchestrator: impl Fn(OrchestrationContext) -> F) -> TurnResult<O>
where
    F: Future<Output = O>,
{
    let t = run_turn_detailed(history, 0, orchestrator);
    (t.history, t.actions, t.logs, t.output)
}

/// Same as `run_turn` but annotates the context with a caller-supplied turn
/// index and reports suspension points, custom status and nondeterminism.
pub fn run_turn_detailed<O, F>(
    history: Vec<Event>,
    turn_index: u64,
    orchestrator: impl Fn(OrchestrationContext) -> F,
) -> TurnOutcome<O>
where
    F: Future<Output = O>,
{
    let ctx = OrchestrationContext::new(history);
    ctx.set_turn_index(turn_index);
    let (output, waiting) = {
        let fut = orchestrator(ctx.clone());
        let mut fut = std::pin::pin!(fut);
        match poll_once(fut.as_mut()) {
            Poll::Ready(out) => (Some(out), Vec::new()),
            // Snapshot before the future drops and releases its waits
            Poll::Pending => (None, ctx.waiting_snapshot()),
        }
    };
    let nondeterminism = ctx.nondeterminism();
    let actions = if nondeterminism.is_some() {
        Vec::new()
    } else {
        ctx.take_actions()
    };
    let history = ctx.inner.lock().unwrap().history.clone();
    TurnOutcome {
        history,
        actions,
        logs: ctx.take_log_buffer(),
        output,
        custom_status: ctx.take_custom_status(),
        waiting,
        nondeterminism,
    }
}
