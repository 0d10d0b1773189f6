//! Durable futures returned by `OrchestrationContext` and their aggregates.
//!
//! A `DurableFuture` never registers a waker: the runtime re-runs the whole
//! orchestration when history changes, so polling only has to answer whether
//! the correlated completion is already in history.
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::{OrchestrationContext, TaskFailure};

/// Output of a `DurableFuture` when awaited via unified composition.
#[derive(Debug, Clone, PartialEq)]
pub enum DurableOutput {
    Activity(Result<String, TaskFailure>),
    Timer,
    External(String),
}

#[derive(Debug, Clone)]
pub(crate) enum Kind {
    Activity { name: String },
    Timer,
    External { name: String },
}

/// A unified future for activities, timers, and external events that carries
/// its positional correlation id.
pub struct DurableFuture {
    id: u64,
    kind: Kind,
    ctx: OrchestrationContext,
    done: bool,
}

impl DurableFuture {
    pub(crate) fn new(id: u64, kind: Kind, ctx: OrchestrationContext) -> Self {
        Self {
            id,
            kind,
            ctx,
            done: false,
        }
    }

    /// Correlation id of the call-site this future belongs to.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// History position of the completion this future would resolve with.
    fn peek(&self) -> Option<usize> {
        if self.done {
            return None;
        }
        self.ctx.completion_index(self.id, &self.kind)
    }

    fn take(&mut self) -> Option<DurableOutput> {
        let out = self.ctx.take_completion(self.id, &self.kind);
        if out.is_some() {
            self.done = true;
        }
        out
    }

    fn park(&self) {
        self.ctx.mark_waiting(self.id, &self.kind);
    }

    /// Await an activity result as a raw string.
    pub async fn into_activity(self) -> Result<String, TaskFailure> {
        match self.await {
            DurableOutput::Activity(r) => r,
            other => Err(TaskFailure::Failed(format!("expected an activity completion, got {other:?}"))),
        }
    }

    /// Await an activity result decoded to a typed value.
    pub async fn into_activity_typed<Out: serde::de::DeserializeOwned>(self) -> Result<Out, TaskFailure> {
        use crate::_typed_codec::Codec;
        let raw = self.into_activity().await?;
        crate::_typed_codec::Json::decode::<Out>(&raw)
            .map_err(|e| TaskFailure::Failed(format!("activity result did not decode: {e}")))
    }

    /// Await the correlated timer.
    pub async fn into_timer(self) {
        match self.await {
            DurableOutput::Timer => {}
            other => unreachable!("into_timer on non-timer future: {other:?}"),
        }
    }

    /// Await the payload of the correlated external event.
    pub async fn into_event(self) -> String {
        match self.await {
            DurableOutput::External(v) => v,
            other => unreachable!("into_event on non-external future: {other:?}"),
        }
    }

    /// Await an external event decoded to a typed value.
    pub async fn into_event_typed<T: serde::de::DeserializeOwned>(self) -> Result<T, String> {
        use crate::_typed_codec::Codec;
        crate::_typed_codec::Json::decode::<T>(&self.into_event().await)
    }
}

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.peek().is_some() {
            if let Some(out) = this.take() {
                return Poll::Ready(out);
            }
        }
        this.park();
        Poll::Pending
    }
}

impl Drop for DurableFuture {
    fn drop(&mut self) {
        if !self.done {
            self.ctx.release_wait(self.id);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AggregateMode {
    Select,
    Join,
}

/// Shared state behind `JoinFuture` and `SelectFuture`.
pub struct AggregateDurableFuture {
    children: Vec<DurableFuture>,
    results: Vec<Option<DurableOutput>>,
    mode: AggregateMode,
}

impl AggregateDurableFuture {
    pub(crate) fn new_select(children: Vec<DurableFuture>) -> Self {
        let n = children.len();
        Self {
            children,
            results: vec![None; n],
            mode: AggregateMode::Select,
        }
    }

    pub(crate) fn new_join(children: Vec<DurableFuture>) -> Self {
        let n = children.len();
        Self {
            children,
            results: vec![None; n],
            mode: AggregateMode::Join,
        }
    }

    fn poll_select(&mut self) -> Poll<(usize, DurableOutput)> {
        // Earliest completion in history wins; ties go to the lower index
        let winner = self
            .children
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.peek().map(|pos| (pos, i)))
            .min();
        if let Some((_, i)) = winner {
            if let Some(out) = self.children[i].take() {
                // Losers are released so a late completion cannot resume this point again
                for (j, c) in self.children.iter().enumerate() {
                    if j != i && !c.done {
                        c.ctx.release_wait(c.id);
                    }
                }
                return Poll::Ready((i, out));
            }
        }
        for c in &self.children {
            c.park();
        }
        Poll::Pending
    }

    fn poll_join(&mut self) -> Poll<Vec<DurableOutput>> {
        for (i, child) in self.children.iter_mut().enumerate() {
            if self.results[i].is_some() {
                continue;
            }
            // peek then take one child at a time so two waits on one name see distinct events
            if child.peek().is_some() {
                self.results[i] = child.take();
            }
            if self.results[i].is_none() {
                child.park();
            }
        }
        if self.results.iter().all(Option::is_some) {
            Poll::Ready(self.results.iter_mut().filter_map(Option::take).collect())
        } else {
            Poll::Pending
        }
    }
}

/// Resolves with `(winner_index, output)` once any child completes.
pub struct SelectFuture(pub(crate) AggregateDurableFuture);

impl Future for SelectFuture {
    type Output = (usize, DurableOutput);

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        debug_assert_eq!(this.0.mode, AggregateMode::Select);
        this.0.poll_select()
    }
}

/// Resolves with every child's output, in argument order, once all complete.
pub struct JoinFuture(pub(crate) AggregateDurableFuture);

impl Future for JoinFuture {
    type Output = Vec<DurableOutput>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        debug_assert_eq!(this.0.mode, AggregateMode::Join);
        this.0.poll_join()
    }
}
