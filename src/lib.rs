//! Durable, replay-driven orchestration of the meeting summary pipeline.
//!
//! Orchestrations are ordinary async Rust functions executed by deterministic
//! replay: every turn re-runs the function against the instance's
//! append-only `Event` history, resolving recorded work immediately and
//! suspending at the first unresolved await. The crate provides:
//!
//! - The history model (`Event`) and turn decisions (`Action`)
//! - `OrchestrationContext` for scheduling activities, timers, external
//!   waits and sub-orchestrations by correlation id
//! - `DurableFuture` composition (`select`, `join`, `fan_out`) and the
//!   timer vs. event race
//! - The turn driver (`run_turn*`, `Executor`) and the provider-backed
//!   `runtime::Runtime`
//! - The transcription and summarization pipeline in `pipeline`
use std::collections::HashSet;
use std::future::Future;
use std::pin::pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod config;
pub mod fanout;
pub mod futures;
pub mod logging;
pub mod pipeline;
pub mod providers;
pub mod retry;
pub mod runtime;

pub use crate::fanout::{FailurePolicy, FanIn, FanInError, FanOutFuture, FanOutOptions};
pub use crate::futures::{DurableFuture, DurableOutput, JoinFuture, SelectFuture};
pub use crate::logging::LogLevel;
pub use crate::retry::{ActivityError, FailureKind, RetryOn, RetryPolicy};
pub use runtime::{
    OrchestrationDescriptor, OrchestrationHandler, OrchestrationRegistry, OrchestrationRegistryBuilder,
    OrchestrationStatus,
};

// Built-in activities backing the non-deterministic context helpers.
pub(crate) const SYSTEM_NOW_ACTIVITY: &str = "__system_now";
pub(crate) const SYSTEM_NEW_GUID_ACTIVITY: &str = "__system_new_guid";

use crate::codec::{Codec, Json};
use crate::futures::{AggregateDurableFuture, Kind, KindTag};

pub(crate) mod codec {
    use serde::{Serialize, de::DeserializeOwned};
    use serde_json::Value;

    pub trait Codec {
        fn encode<T: Serialize>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }

    /// JSON payload codec. Plain strings travel unquoted so string-typed
    /// orchestrations and activities interoperate with typed ones.
    pub struct Json;

    impl Codec for Json {
        fn encode<T: Serialize>(v: &T) -> Result<String, String> {
            match serde_json::to_value(v) {
                Ok(Value::String(s)) => Ok(s),
                Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }

        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            match serde_json::from_str::<T>(s) {
                Ok(v) => Ok(v),
                Err(first) => serde_json::from_value(Value::String(s.to_string())).map_err(|_| first.to_string()),
            }
        }
    }
}

/// Append-only orchestration history entries persisted by a provider and
/// consumed during replay. Scheduling events and their completions are
/// paired by a correlation id unique within the instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Event {
    /// Instance was created for orchestration `name`. Parent linkage is set
    /// for sub-orchestrations.
    OrchestrationStarted {
        name: String,
        input: String,
        started_at_ms: u64,
        parent_instance: Option<String>,
        parent_id: Option<u64>,
    },
    /// Marker written before each batch of delivered completions. Its
    /// timestamp feeds the deterministic clock.
    OrchestratorResumed { at_ms: u64 },
    OrchestrationCompleted { output: String },
    OrchestrationFailed { error: String },
    OrchestrationTerminated { reason: String },

    ActivityScheduled {
        id: u64,
        name: String,
        input: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry: Option<RetryPolicy>,
    },
    ActivityCompleted { id: u64, result: String },
    /// Activity failed after `attempts` tries; `error` is the last failure.
    ActivityFailed {
        id: u64,
        error: String,
        #[serde(default)]
        attempts: u32,
    },

    TimerCreated { id: u64, fire_at_ms: u64 },
    TimerFired { id: u64, fire_at_ms: u64 },
    /// Timer lost a race; a later firing is discarded.
    TimerCancelled { id: u64 },

    ExternalSubscribed { id: u64, name: String },
    ExternalEventReceived { id: u64, name: String, data: String },

    /// Sub-orchestration scheduled; `instance` is the child suffix, the full
    /// child id is `{parent}::{instance}`.
    SubOrchestrationScheduled {
        id: u64,
        name: String,
        instance: String,
        input: String,
    },
    SubOrchestrationCompleted { id: u64, result: String },
    SubOrchestrationFailed { id: u64, error: String },
}

impl Event {
    /// Correlation id carried by scheduling and completion events.
    pub fn correlation_id(&self) -> Option<u64> {
        match self {
            Event::ActivityScheduled { id, .. }
            | Event::ActivityCompleted { id, .. }
            | Event::ActivityFailed { id, .. }
            | Event::TimerCreated { id, .. }
            | Event::TimerFired { id, .. }
            | Event::TimerCancelled { id }
            | Event::ExternalSubscribed { id, .. }
            | Event::ExternalEventReceived { id, .. }
            | Event::SubOrchestrationScheduled { id, .. }
            | Event::SubOrchestrationCompleted { id, .. }
            | Event::SubOrchestrationFailed { id, .. } => Some(*id),
            Event::OrchestrationStarted { .. }
            | Event::OrchestratorResumed { .. }
            | Event::OrchestrationCompleted { .. }
            | Event::OrchestrationFailed { .. }
            | Event::OrchestrationTerminated { .. } => None,
        }
    }

    /// True for events that resolve a scheduled future.
    pub fn is_completion(&self) -> bool {
        matches!(
            self,
            Event::ActivityCompleted { .. }
                | Event::ActivityFailed { .. }
                | Event::TimerFired { .. }
                | Event::ExternalEventReceived { .. }
                | Event::SubOrchestrationCompleted { .. }
                | Event::SubOrchestrationFailed { .. }
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::OrchestrationCompleted { .. }
                | Event::OrchestrationFailed { .. }
                | Event::OrchestrationTerminated { .. }
        )
    }
}

/// Decisions produced by an orchestration turn. The runtime materializes
/// them into provider work items.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    CallActivity {
        id: u64,
        name: String,
        input: String,
        retry: Option<RetryPolicy>,
    },
    /// Create a durable timer due at `fire_at_ms` on the deterministic clock.
    CreateTimer { id: u64, fire_at_ms: u64 },
    /// Cancel a timer that lost a race.
    CancelTimer { id: u64 },
    WaitExternal { id: u64, name: String },
    StartSubOrchestration {
        id: u64,
        name: String,
        instance: String,
        input: String,
    },
}

#[derive(Debug)]
pub(crate) struct CtxInner {
    pub(crate) history: Vec<Event>,
    actions: Vec<Action>,
    next_correlation_id: u64,
    turn_index: u64,
    // Length of the history handed to this turn; later entries were produced by the turn itself.
    baseline_len: usize,
    // Highest history index of a completion the orchestration has consumed.
    consumed_upto: Option<usize>,
    // Set for a turn that only re-executes code an earlier activation already ran.
    replay_only: bool,
    log_buffer: Vec<(LogLevel, String)>,
    claimed_activity_ids: HashSet<u64>,
    claimed_timer_ids: HashSet<u64>,
    claimed_external_ids: HashSet<u64>,
    claimed_sub_orchestration_ids: HashSet<u64>,
}

impl CtxInner {
    fn new(history: Vec<Event>) -> Self {
        let max_id = history.iter().filter_map(Event::correlation_id).max().unwrap_or(0);
        Self {
            baseline_len: history.len(),
            history,
            actions: Vec::new(),
            next_correlation_id: max_id.saturating_add(1),
            turn_index: 0,
            consumed_upto: None,
            replay_only: false,
            log_buffer: Vec::new(),
            claimed_activity_ids: HashSet::new(),
            claimed_timer_ids: HashSet::new(),
            claimed_external_ids: HashSet::new(),
            claimed_sub_orchestration_ids: HashSet::new(),
        }
    }

    pub(crate) fn record_action(&mut self, a: Action) {
        self.actions.push(a);
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_correlation_id;
        self.next_correlation_id += 1;
        id
    }

    fn claimed(&self, kind: KindTag) -> &HashSet<u64> {
        match kind {
            KindTag::Activity => &self.claimed_activity_ids,
            KindTag::Timer => &self.claimed_timer_ids,
            KindTag::External => &self.claimed_external_ids,
            KindTag::SubOrch => &self.claimed_sub_orchestration_ids,
        }
    }

    fn claimed_mut(&mut self, kind: KindTag) -> &mut HashSet<u64> {
        match kind {
            KindTag::Activity => &mut self.claimed_activity_ids,
            KindTag::Timer => &mut self.claimed_timer_ids,
            KindTag::External => &mut self.claimed_external_ids,
            KindTag::SubOrch => &mut self.claimed_sub_orchestration_ids,
        }
    }

    /// Adopt the first unclaimed recorded schedule matching `is_match`, or
    /// allocate a fresh correlation id.
    fn adopt_or_allocate(&mut self, kind: KindTag, is_match: impl Fn(&Event) -> bool) -> u64 {
        let claimed = self.claimed(kind);
        let adopted = self
            .history
            .iter()
            .filter(|e| is_match(e))
            .filter_map(Event::correlation_id)
            .find(|id| !claimed.contains(id));
        let id = match adopted {
            Some(id) => id,
            None => self.next_id(),
        };
        self.claimed_mut(kind).insert(id);
        id
    }

    pub(crate) fn mark_consumed(&mut self, idx: usize) {
        self.consumed_upto = Some(self.consumed_upto.map_or(idx, |c| c.max(idx)));
    }

    pub(crate) fn current_time_ms(&self) -> u64 {
        let started = self
            .history
            .iter()
            .find_map(|e| match e {
                Event::OrchestrationStarted { started_at_ms, .. } => Some(*started_at_ms),
                _ => None,
            })
            .unwrap_or(0);
        let Some(upto) = self.consumed_upto else {
            return started;
        };
        self.history[..=upto]
            .iter()
            .rev()
            .find_map(|e| match e {
                Event::OrchestratorResumed { at_ms } => Some(*at_ms),
                _ => None,
            })
            .unwrap_or(started)
    }

    fn is_replaying(&self) -> bool {
        if self.replay_only {
            return true;
        }
        let Some(marker) = self.history[..self.baseline_len]
            .iter()
            .rposition(|e| matches!(e, Event::OrchestratorResumed { .. }))
        else {
            return false;
        };
        self.consumed_upto.is_none_or(|c| c < marker)
    }

    /// Record a cancellation for a timer that lost a race, unless it already
    /// fired or was cancelled.
    pub(crate) fn cancel_timer(&mut self, id: u64) {
        let settled = self.history.iter().any(|e| {
            matches!(e, Event::TimerFired { id: cid, .. } | Event::TimerCancelled { id: cid } if *cid == id)
        });
        let created = self
            .history
            .iter()
            .any(|e| matches!(e, Event::TimerCreated { id: cid, .. } if *cid == id));
        if created && !settled {
            self.history.push(Event::TimerCancelled { id });
            self.record_action(Action::CancelTimer { id });
        }
    }
}

/// Outcome of `OrchestrationContext::wait_for_event_or_timer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaceOutcome {
    Event(String),
    TimedOut,
}

/// User-facing orchestration context for scheduling and replay-safe helpers.
#[derive(Clone)]
pub struct OrchestrationContext {
    pub(crate) inner: Arc<Mutex<CtxInner>>,
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

    /// Deterministic time in milliseconds since the epoch: the instance start
    /// time, advanced to the resume marker of the latest consumed completion.
    pub fn current_time_ms(&self) -> u64 {
        self.inner.lock().unwrap().current_time_ms()
    }

    /// True while the orchestration is re-executing work that was already
    /// observed in an earlier turn.
    pub fn is_replaying(&self) -> bool {
        self.inner.lock().unwrap().is_replaying()
    }

    /// Drain the buffered log messages accumulated during the turn.
    pub fn take_log_buffer(&self) -> Vec<(LogLevel, String)> {
        std::mem::take(&mut self.inner.lock().unwrap().log_buffer)
    }

    /// Buffer a log line unless the orchestration is replaying.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.is_replaying() {
            inner.log_buffer.push((level, message.into()));
        }
    }

    pub fn log_info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }
    pub fn log_warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }
    pub fn log_error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }
    pub fn log_debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }

    /// Wall-clock time obtained through a system activity, recorded in history.
    pub async fn system_now_ms(&self) -> Result<u64, String> {
        let v = self.schedule_activity(SYSTEM_NOW_ACTIVITY, "").into_activity().await?;
        v.parse::<u64>().map_err(|e| format!("system_now returned {v:?}: {e}"))
    }

    /// A fresh UUID obtained through a system activity, recorded in history.
    pub async fn system_new_guid(&self) -> Result<String, String> {
        self.schedule_activity(SYSTEM_NEW_GUID_ACTIVITY, "").into_activity().await
    }
}

impl OrchestrationContext {
    /// Schedule an activity and return a `DurableFuture` correlated to it.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        self.schedule_activity_with(name, input, None)
    }

    /// Schedule an activity that the worker retries according to `policy`.
    pub fn schedule_activity_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        policy: RetryPolicy,
    ) -> DurableFuture {
        self.schedule_activity_with(name, input, Some(policy))
    }

    pub(crate) fn schedule_activity_with(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        retry: Option<RetryPolicy>,
    ) -> DurableFuture {
        let name: String = name.into();
        let input: String = input.into();
        let id = self.inner.lock().unwrap().adopt_or_allocate(KindTag::Activity, |e| {
            matches!(e, Event::ActivityScheduled { name: n, input: i, .. } if n == &name && i == &input)
        });
        DurableFuture::new(Kind::Activity {
            id,
            name,
            input,
            retry,
            scheduled: Default::default(),
            ctx: self.clone(),
        })
    }

    /// Typed helper that serializes input; decode the result with `into_activity_typed`.
    pub fn schedule_activity_typed<In: Serialize>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> Result<DurableFuture, String> {
        Ok(self.schedule_activity(name, Json::encode(input)?))
    }

    /// Typed variant of `schedule_activity_with_retry`.
    pub fn schedule_activity_typed_with_retry<In: Serialize>(
        &self,
        name: impl Into<String>,
        input: &In,
        policy: RetryPolicy,
    ) -> Result<DurableFuture, String> {
        Ok(self.schedule_activity_with_retry(name, Json::encode(input)?, policy))
    }

    /// Schedule a durable timer that fires `delay_ms` after the current
    /// deterministic time.
    pub fn schedule_timer(&self, delay_ms: u64) -> DurableFuture {
        let id = self
            .inner
            .lock()
            .unwrap()
            .adopt_or_allocate(KindTag::Timer, |e| matches!(e, Event::TimerCreated { .. }));
        DurableFuture::new(Kind::Timer {
            id,
            delay_ms,
            scheduled: Default::default(),
            ctx: self.clone(),
        })
    }

    /// Subscribe to an external event by name and return its `DurableFuture`.
    pub fn schedule_wait(&self, name: impl Into<String>) -> DurableFuture {
        let name: String = name.into();
        let id = self.inner.lock().unwrap().adopt_or_allocate(KindTag::External, |e| {
            matches!(e, Event::ExternalSubscribed { name: n, .. } if n == &name)
        });
        DurableFuture::new(Kind::External {
            id,
            name,
            scheduled: Default::default(),
            ctx: self.clone(),
        })
    }

    /// Schedule a sub-orchestration. The child instance id is derived from the
    /// parent instance and the correlation id.
    pub fn schedule_sub_orchestration(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        let name: String = name.into();
        let input: String = input.into();
        let mut inner = self.inner.lock().unwrap();
        let id = inner.adopt_or_allocate(KindTag::SubOrch, |e| {
            matches!(e, Event::SubOrchestrationScheduled { name: n, input: i, .. } if n == &name && i == &input)
        });
        let instance = inner
            .history
            .iter()
            .find_map(|e| match e {
                Event::SubOrchestrationScheduled { id: cid, instance, .. } if *cid == id => Some(instance.clone()),
                _ => None,
            })
            .unwrap_or_else(|| format!("sub::{id}"));
        drop(inner);
        DurableFuture::new(Kind::SubOrch {
            id,
            name,
            instance,
            input,
            scheduled: Default::default(),
            ctx: self.clone(),
        })
    }

    pub fn schedule_sub_orchestration_typed<In: Serialize>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> Result<DurableFuture, String> {
        Ok(self.schedule_sub_orchestration(name, Json::encode(input)?))
    }

    /// Wait for whichever comes first: the named external event or a timer
    /// due `timeout` after the current deterministic time. A losing timer is
    /// cancelled and its later firing has no effect.
    pub async fn wait_for_event_or_timer(&self, name: impl Into<String>, timeout: Duration) -> RaceOutcome {
        let event = self.schedule_wait(name);
        let timer = self.schedule_timer(duration_ms(timeout));
        match self.select2(event, timer).await {
            (_, DurableOutput::External(data)) => RaceOutcome::Event(data),
            _ => RaceOutcome::TimedOut,
        }
    }

    /// Schedule one activity per input and aggregate the results in input order.
    pub fn fan_out(&self, name: impl Into<String>, inputs: Vec<String>, options: FanOutOptions) -> FanOutFuture {
        FanOutFuture::new(self.clone(), name.into(), inputs, options)
    }
}

pub(crate) fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl OrchestrationContext {
    /// Deterministic select over two futures: returns (winner_index, output).
    pub fn select2(&self, a: DurableFuture, b: DurableFuture) -> SelectFuture {
        SelectFuture(AggregateDurableFuture::new(self.clone(), vec![a, b]))
    }
    /// Deterministic select over N futures; the earliest completion in history wins.
    pub fn select(&self, futures: Vec<DurableFuture>) -> SelectFuture {
        SelectFuture(AggregateDurableFuture::new(self.clone(), futures))
    }
    /// Wait for all futures; outputs are returned in argument order.
    pub fn join(&self, futures: Vec<DurableFuture>) -> JoinFuture {
        JoinFuture(AggregateDurableFuture::new(self.clone(), futures))
    }
}

/// Tuple returned by `run_turn` and `run_turn_with`: the updated history,
/// actions to execute, per-turn logs, and an optional output.
pub type TurnResult<O> = (Vec<Event>, Vec<Action>, Vec<(LogLevel, String)>, Option<O>);

/// Poll the orchestrator once against `history`.
pub fn run_turn<O, F>(history: Vec<Event>, orchestrator: impl Fn(OrchestrationContext) -> F) -> TurnResult<O>
where
    F: Future<Output = O>,
{
    run_turn_with(history, 0, orchestrator)
}

/// Same as `run_turn` but annotates the context with a caller-supplied
/// turn index for diagnostics and logging.
pub fn run_turn_with<O, F>(
    history: Vec<Event>,
    turn_index: u64,
    orchestrator: impl Fn(OrchestrationContext) -> F,
) -> TurnResult<O>
where
    F: Future<Output = O>,
{
    let (hist, actions, logs, out, _claims) = run_turn_with_claims(history, turn_index, orchestrator);
    (hist, actions, logs, out)
}

/// Snapshot of correlation ids claimed by the orchestrator during a turn.
#[derive(Debug, Clone, Default)]
pub struct ClaimedIdsSnapshot {
    pub activities: HashSet<u64>,
    pub timers: HashSet<u64>,
    pub externals: HashSet<u64>,
    pub sub_orchestrations: HashSet<u64>,
}

impl OrchestrationContext {
    pub(crate) fn claimed_ids_snapshot(&self) -> ClaimedIdsSnapshot {
        let inner = self.inner.lock().unwrap();
        ClaimedIdsSnapshot {
            activities: inner.claimed_activity_ids.clone(),
            timers: inner.claimed_timer_ids.clone(),
            externals: inner.claimed_external_ids.clone(),
            sub_orchestrations: inner.claimed_sub_orchestration_ids.clone(),
        }
    }
}

/// Turn result plus the correlation ids claimed during the turn.
pub type ClaimedTurnResult<O> = (
    Vec<Event>,
    Vec<Action>,
    Vec<(LogLevel, String)>,
    Option<O>,
    ClaimedIdsSnapshot,
);

/// Same as `run_turn_with` but also returns which correlation ids were claimed.
pub fn run_turn_with_claims<O, F>(
    history: Vec<Event>,
    turn_index: u64,
    orchestrator: impl Fn(OrchestrationContext) -> F,
) -> ClaimedTurnResult<O>
where
    F: Future<Output = O>,
{
    run_turn_in_mode(history, turn_index, false, orchestrator)
}

/// Poll once. With `replay_only` the whole turn counts as replay: nothing
/// is logged, even past the newest resume marker.
pub(crate) fn run_turn_in_mode<O, F>(
    history: Vec<Event>,
    turn_index: u64,
    replay_only: bool,
    orchestrator: impl Fn(OrchestrationContext) -> F,
) -> ClaimedTurnResult<O>
where
    F: Future<Output = O>,
{
    let ctx = OrchestrationContext::new(history);
    {
        let mut inner = ctx.inner.lock().unwrap();
        inner.turn_index = turn_index;
        inner.replay_only = replay_only;
    }
    let mut fut = pin!(orchestrator(ctx.clone()));
    let mut cx = Context::from_waker(Waker::noop());
    let out = match fut.as_mut().poll(&mut cx) {
        Poll::Ready(out) => Some(out),
        Poll::Pending => None,
    };
    let actions = ctx.take_actions();
    let logs = ctx.take_log_buffer();
    let claims = ctx.claimed_ids_snapshot();
    let hist_after = ctx.inner.lock().unwrap().history.clone();
    (hist_after, actions, logs, out, claims)
}

/// Helper for single-threaded, host-driven execution in tests and samples.
pub struct Executor;

impl Executor {
    /// Alternately replays one turn and lets `execute_actions` materialize
    /// the requested actions into history, until the orchestrator completes.
    pub fn drive_to_completion<O, F, X>(
        mut history: Vec<Event>,
        orchestrator: impl Fn(OrchestrationContext) -> F,
        mut execute_actions: X,
    ) -> (Vec<Event>, O)
    where
        F: Future<Output = O>,
        X: FnMut(Vec<Action>, &mut Vec<Event>),
    {
        loop {
            let (hist_after_replay, actions, _logs, output) = run_turn(history, &orchestrator);
            history = hist_after_replay;
            if let Some(out) = output {
                return (history, out);
            }
            execute_actions(actions, &mut history);
        }
    }
}
