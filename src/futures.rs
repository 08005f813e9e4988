use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::de::DeserializeOwned;

use crate::codec::{Codec, Json};
use crate::{Action, Event, OrchestrationContext, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KindTag {
    Activity,
    Timer,
    External,
    SubOrch,
}

/// Result of a resolved `DurableFuture`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurableOutput {
    Activity(Result<String, String>),
    Timer,
    External(String),
    SubOrchestration(Result<String, String>),
}

pub(crate) enum Kind {
    Activity {
        id: u64,
        name: String,
        input: String,
        retry: Option<RetryPolicy>,
        scheduled: Cell<bool>,
        ctx: OrchestrationContext,
    },
    Timer {
        id: u64,
        delay_ms: u64,
        scheduled: Cell<bool>,
        ctx: OrchestrationContext,
    },
    External {
        id: u64,
        name: String,
        scheduled: Cell<bool>,
        ctx: OrchestrationContext,
    },
    SubOrch {
        id: u64,
        name: String,
        instance: String,
        input: String,
        scheduled: Cell<bool>,
        ctx: OrchestrationContext,
    },
}

/// A future for an activity, timer, external event or sub-orchestration,
/// resolved by correlation id against the instance history. The first poll
/// records the scheduling event and the matching `Action`.
pub struct DurableFuture(pub(crate) Kind);

impl DurableFuture {
    pub(crate) fn new(kind: Kind) -> Self {
        Self(kind)
    }

    /// Correlation id assigned to this future.
    pub fn correlation_id(&self) -> u64 {
        match &self.0 {
            Kind::Activity { id, .. } | Kind::Timer { id, .. } | Kind::External { id, .. } | Kind::SubOrch { id, .. } => {
                *id
            }
        }
    }

    pub(crate) fn tag(&self) -> KindTag {
        match &self.0 {
            Kind::Activity { .. } => KindTag::Activity,
            Kind::Timer { .. } => KindTag::Timer,
            Kind::External { .. } => KindTag::External,
            Kind::SubOrch { .. } => KindTag::SubOrch,
        }
    }

    fn ctx(&self) -> &OrchestrationContext {
        match &self.0 {
            Kind::Activity { ctx, .. } | Kind::Timer { ctx, .. } | Kind::External { ctx, .. } | Kind::SubOrch { ctx, .. } => {
                ctx
            }
        }
    }

    /// Look up the completion for this future, scheduling it on first use.
    /// Returns the history index of the completion without consuming it.
    pub(crate) fn poll_inner(&self) -> Option<(usize, DurableOutput)> {
        let mut inner = self.ctx().inner.lock().unwrap();
        let id = self.correlation_id();
        if let Some(found) = find_completion(&inner.history, id, self.tag()) {
            return Some(found);
        }
        match &self.0 {
            Kind::Activity {
                name,
                input,
                retry,
                scheduled,
                ..
            } => {
                let recorded = inner
                    .history
                    .iter()
                    .any(|e| matches!(e, Event::ActivityScheduled { id: cid, .. } if *cid == id));
                if !recorded && !scheduled.replace(true) {
                    inner.history.push(Event::ActivityScheduled {
                        id,
                        name: name.clone(),
                        input: input.clone(),
                        retry: retry.clone(),
                    });
                    inner.record_action(Action::CallActivity {
                        id,
                        name: name.clone(),
                        input: input.clone(),
                        retry: retry.clone(),
                    });
                }
            }
            Kind::Timer {
                delay_ms, scheduled, ..
            } => {
                let recorded = inner
                    .history
                    .iter()
                    .any(|e| matches!(e, Event::TimerCreated { id: cid, .. } if *cid == id));
                if !recorded && !scheduled.replace(true) {
                    let fire_at_ms = inner.current_time_ms().saturating_add(*delay_ms);
                    inner.history.push(Event::TimerCreated { id, fire_at_ms });
                    inner.record_action(Action::CreateTimer { id, fire_at_ms });
                }
            }
            Kind::External { name, scheduled, .. } => {
                let recorded = inner
                    .history
                    .iter()
                    .any(|e| matches!(e, Event::ExternalSubscribed { id: cid, .. } if *cid == id));
                if !recorded && !scheduled.replace(true) {
                    inner.history.push(Event::ExternalSubscribed { id, name: name.clone() });
                    inner.record_action(Action::WaitExternal { id, name: name.clone() });
                }
            }
            Kind::SubOrch {
                name,
                instance,
                input,
                scheduled,
                ..
            } => {
                let recorded = inner
                    .history
                    .iter()
                    .any(|e| matches!(e, Event::SubOrchestrationScheduled { id: cid, .. } if *cid == id));
                if !recorded && !scheduled.replace(true) {
                    inner.history.push(Event::SubOrchestrationScheduled {
                        id,
                        name: name.clone(),
                        instance: instance.clone(),
                        input: input.clone(),
                    });
                    inner.record_action(Action::StartSubOrchestration {
                        id,
                        name: name.clone(),
                        instance: instance.clone(),
                        input: input.clone(),
                    });
                }
            }
        }
        None
    }

    pub(crate) fn consume(&self, idx: usize) {
        self.ctx().inner.lock().unwrap().mark_consumed(idx);
    }
}

fn find_completion(hist: &[Event], id: u64, kind: KindTag) -> Option<(usize, DurableOutput)> {
    hist.iter().enumerate().find_map(|(idx, e)| {
        let out = match (kind, e) {
            (KindTag::Activity, Event::ActivityCompleted { id: cid, result }) if *cid == id => {
                DurableOutput::Activity(Ok(result.clone()))
            }
            (KindTag::Activity, Event::ActivityFailed { id: cid, error, .. }) if *cid == id => {
                DurableOutput::Activity(Err(error.clone()))
            }
            (KindTag::Timer, Event::TimerFired { id: cid, .. }) if *cid == id => DurableOutput::Timer,
            (KindTag::External, Event::ExternalEventReceived { id: cid, data, .. }) if *cid == id => {
                DurableOutput::External(data.clone())
            }
            (KindTag::SubOrch, Event::SubOrchestrationCompleted { id: cid, result }) if *cid == id => {
                DurableOutput::SubOrchestration(Ok(result.clone()))
            }
            (KindTag::SubOrch, Event::SubOrchestrationFailed { id: cid, error }) if *cid == id => {
                DurableOutput::SubOrchestration(Err(error.clone()))
            }
            _ => return None,
        };
        Some((idx, out))
    })
}

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.poll_inner() {
            Some((idx, out)) => {
                self.consume(idx);
                Poll::Ready(out)
            }
            None => Poll::Pending,
        }
    }
}

impl DurableFuture {
    /// Await an activity result as a raw string.
    pub async fn into_activity(self) -> Result<String, String> {
        match self.await {
            DurableOutput::Activity(v) => v,
            other => panic!("into_activity used on non-activity future: {other:?}"),
        }
    }

    /// Await an activity result decoded to a typed value.
    pub async fn into_activity_typed<Out: DeserializeOwned>(self) -> Result<Out, String> {
        let s = self.into_activity().await?;
        Json::decode::<Out>(&s)
    }

    pub async fn into_timer(self) {
        match self.await {
            DurableOutput::Timer => {}
            other => panic!("into_timer used on non-timer future: {other:?}"),
        }
    }

    /// Await the payload of the correlated external event.
    pub async fn into_event(self) -> String {
        match self.await {
            DurableOutput::External(v) => v,
            other => panic!("into_event used on non-external future: {other:?}"),
        }
    }

    pub async fn into_event_typed<T: DeserializeOwned>(self) -> Result<T, String> {
        Json::decode::<T>(&self.into_event().await)
    }

    pub async fn into_sub_orchestration(self) -> Result<String, String> {
        match self.await {
            DurableOutput::SubOrchestration(v) => v,
            other => panic!("into_sub_orchestration used on non-sub-orch future: {other:?}"),
        }
    }

    pub async fn into_sub_orchestration_typed<Out: DeserializeOwned>(self) -> Result<Out, String> {
        let s = self.into_sub_orchestration().await?;
        Json::decode::<Out>(&s)
    }
}

pub(crate) struct AggregateDurableFuture {
    ctx: OrchestrationContext,
    children: Vec<DurableFuture>,
}

impl AggregateDurableFuture {
    pub(crate) fn new(ctx: OrchestrationContext, children: Vec<DurableFuture>) -> Self {
        Self { ctx, children }
    }
}

/// Resolves with the child whose completion appears first in history.
/// Losing timers are cancelled.
pub struct SelectFuture(pub(crate) AggregateDurableFuture);

impl Future for SelectFuture {
    type Output = (usize, DurableOutput);

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let agg = &self.0;
        // Poll every child so all of them get scheduled in this turn.
        let ready: Vec<(usize, usize, DurableOutput)> = agg
            .children
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.poll_inner().map(|(h, o)| (i, h, o)))
            .collect();
        let Some((winner, hist_idx, out)) = ready.into_iter().min_by_key(|(_, h, _)| *h) else {
            return Poll::Pending;
        };
        let mut inner = agg.ctx.inner.lock().unwrap();
        inner.mark_consumed(hist_idx);
        for (i, child) in agg.children.iter().enumerate() {
            if i != winner
                && let Kind::Timer { id, .. } = &child.0
            {
                inner.cancel_timer(*id);
            }
        }
        Poll::Ready((winner, out))
    }
}

/// Resolves once every child has completed; outputs keep argument order.
pub struct JoinFuture(pub(crate) AggregateDurableFuture);

impl Future for JoinFuture {
    type Output = Vec<DurableOutput>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let agg = &self.0;
        let polled: Vec<Option<(usize, DurableOutput)>> = agg.children.iter().map(DurableFuture::poll_inner).collect();
        if polled.iter().any(Option::is_none) {
            return Poll::Pending;
        }
        let mut inner = agg.ctx.inner.lock().unwrap();
        let outputs = polled
            .into_iter()
            .flatten()
            .map(|(idx, out)| {
                inner.mark_consumed(idx);
                out
            })
            .collect();
        Poll::Ready(outputs)
    }
}
