//! Provider-backed runtime.
//!
//! Three dispatchers poll the provider queues: the orchestrator dispatcher
//! routes completions to instance drivers (rehydrating idle instances), the
//! worker dispatcher executes activities with their retry policies, and the
//! timer dispatcher feeds the in-process timer service. Each active
//! instance has exactly one driver task that replays its history, persists
//! new events and dispatches the resulting actions.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::{Mutex, Semaphore, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::codec::{Codec, Json};
use crate::config::RuntimeOptions;
use crate::providers::in_memory::InMemoryHistoryStore;
use crate::providers::{HistoryStore, QueueKind, RetryBackoff, WorkItem};
use crate::retry::RetryDecision;
use crate::{Event, OrchestrationContext, RetryPolicy, logging};

pub mod completions;
pub mod detect;
pub mod dispatch;
pub mod registry;
pub mod replay;
pub mod router;
pub mod status;
mod timers;

pub use registry::{ActivityRegistry, OrchestrationRegistry, OrchestrationRegistryBuilder};
pub use router::{InstanceRouter, OrchestratorMsg};

use detect::CompletionKind;
use replay::{DefaultReplayEngine, ReplayEngine};
use timers::{TimerCommand, TimerService, now_ms};

/// High-level orchestration status derived from history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationStatus {
    NotFound,
    Running,
    Completed { output: String },
    Failed { error: String },
    Terminated { reason: String },
}

impl OrchestrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed { .. }
                | OrchestrationStatus::Failed { .. }
                | OrchestrationStatus::Terminated { .. }
        )
    }
}

/// Error type returned by orchestration wait helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Other(String),
}

/// Introspection: what an instance was started as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestrationDescriptor {
    pub name: String,
    pub parent_instance: Option<String>,
    pub parent_id: Option<u64>,
    pub started_at_ms: u64,
}

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

/// Final history and result of an instance.
pub type InstanceOutcome = (Vec<Event>, Result<String, String>);

type ParentLink = Option<(String, u64)>;

pub struct Runtime {
    router: Arc<InstanceRouter>,
    joins: Mutex<Vec<JoinHandle<()>>>,
    instance_joins: Mutex<Vec<JoinHandle<()>>>,
    history_store: Arc<dyn HistoryStore>,
    // Instances with a live driver task. std mutex so the driver's guard can clear it on drop.
    active_instances: StdMutex<HashSet<String>>,
    // Instances whose pending work was re-enqueued since this runtime started.
    rehydrated: StdMutex<HashSet<String>>,
    result_waiters: Mutex<HashMap<String, Vec<oneshot::Sender<InstanceOutcome>>>>,
    orchestration_registry: OrchestrationRegistry,
    options: RuntimeOptions,
}

struct ActiveGuard {
    rt: Arc<Runtime>,
    inst: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Ok(mut active) = self.rt.active_instances.lock() {
            active.remove(&self.inst);
        }
    }
}

impl Runtime {
    /// Start a runtime over a fresh in-memory store.
    pub async fn start(
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        let history_store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::default());
        Self::start_with_store(history_store, activity_registry, orchestration_registry).await
    }

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
        logging::init_tracing();

        let runtime = Arc::new(Self {
            router: Arc::new(InstanceRouter::new()),
            joins: Mutex::new(Vec::new()),
            instance_joins: Mutex::new(Vec::new()),
            history_store,
            active_instances: StdMutex::new(HashSet::new()),
            rehydrated: StdMutex::new(HashSet::new()),
            result_waiters: Mutex::new(HashMap::new()),
            orchestration_registry,
            options,
        });

        // Pending work is re-enqueued before any dispatcher can lock it.
        runtime.recover_instances().await;

        let orch = runtime.clone().start_orchestration_dispatcher();
        let work = runtime.clone().start_work_dispatcher(activity_registry);
        let timer = runtime.clone().start_timer_dispatcher();
        runtime.joins.lock().await.extend([orch, work, timer]);
        runtime
    }

    fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.options.poller_idle_sleep_ms)
    }

    async fn ack_item(&self, kind: QueueKind, instance: &str, token: &str) {
        if let Err(e) = self.history_store.ack(kind, token).await {
            warn!(instance, ?kind, token, error = %e, "failed to ack work item");
        }
    }

    async fn abandon_item(&self, kind: QueueKind, instance: &str, token: &str) {
        if let Err(e) = self.history_store.abandon(kind, token).await {
            warn!(instance, ?kind, token, error = %e, "failed to abandon work item");
        }
    }

    // ---------------- dispatchers

    fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.history_store.dequeue_peek_lock(QueueKind::Orchestrator).await {
                    Some((item, token)) => self.handle_orchestrator_item(item, token).await,
                    None => tokio::time::sleep(self.idle_sleep()).await,
                }
            }
        })
    }

    async fn handle_orchestrator_item(self: &Arc<Self>, item: WorkItem, token: String) {
        let ack_token = Some(token.clone());
        let msg = match item {
            WorkItem::StartOrchestration {
                instance,
                orchestration,
                input,
                parent_instance,
                parent_id,
            } => {
                debug!(instance, orchestration, "StartOrchestration");
                let parent = parent_instance.zip(parent_id);
                if let Err(e) = self.start_from_queue(&instance, &orchestration, input, parent).await {
                    warn!(instance, orchestration, error = %e, "failed to start orchestration from queue");
                }
                self.ack_item(QueueKind::Orchestrator, &instance, &token).await;
                return;
            }
            WorkItem::ActivityCompleted { instance, id, result } => OrchestratorMsg::ActivityCompleted {
                instance,
                id,
                result,
                ack_token,
            },
            WorkItem::ActivityFailed {
                instance,
                id,
                error,
                attempts,
            } => OrchestratorMsg::ActivityFailed {
                instance,
                id,
                error,
                attempts,
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
            WorkItem::ExternalRaised { instance, name, data } => OrchestratorMsg::ExternalByName {
                instance,
                name,
                data,
                ack_token,
            },
            WorkItem::SubOrchCompleted {
                parent_instance,
                parent_id,
                result,
            } => OrchestratorMsg::SubOrchCompleted {
                instance: parent_instance,
                id: parent_id,
                result,
                ack_token,
            },
            WorkItem::SubOrchFailed {
                parent_instance,
                parent_id,
                error,
            } => OrchestratorMsg::SubOrchFailed {
                instance: parent_instance,
                id: parent_id,
                error,
                ack_token,
            },
            WorkItem::TerminateInstance { instance, reason } => OrchestratorMsg::TerminateRequested {
                instance,
                reason,
                ack_token,
            },
            other => {
                error!(?other, "unexpected work item on orchestrator queue; dropped");
                self.ack_item(QueueKind::Orchestrator, other.instance(), &token).await;
                return;
            }
        };
        self.deliver_or_rehydrate(msg, token).await;
    }

    /// Forward to a live driver, or activate the instance and abandon the
    /// item for redelivery. Items for finished or unknown instances are dropped.
    async fn deliver_or_rehydrate(self: &Arc<Self>, msg: OrchestratorMsg, token: String) {
        let instance = msg.instance().to_string();
        if self.router.try_send(msg).await.is_ok() {
            return;
        }
        let hist = self.history_store.read(&instance).await;
        let Some(desc) = status::descriptor_from_history(&hist) else {
            warn!(instance, "message for unknown instance dropped");
            self.ack_item(QueueKind::Orchestrator, &instance, &token).await;
            return;
        };
        if hist.iter().any(Event::is_terminal) {
            debug!(instance, "message for finished instance dropped");
            self.ack_item(QueueKind::Orchestrator, &instance, &token).await;
            return;
        }
        self.ensure_instance_active(&instance, &desc.name).await;
        self.abandon_item(QueueKind::Orchestrator, &instance, &token).await;
        tokio::time::sleep(Duration::from_millis(self.options.poller_gate_delay_ms)).await;
    }

    fn start_work_dispatcher(self: Arc<Self>, activities: Arc<ActivityRegistry>) -> JoinHandle<()> {
        let permits = Arc::new(Semaphore::new(self.options.worker_concurrency.max(1)));
        tokio::spawn(async move {
            // Dropped with the dispatcher, aborting in-flight and backing-off attempts.
            let mut running = JoinSet::new();
            loop {
                while running.try_join_next().is_some() {}
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };
                let Some((item, token)) = self.history_store.dequeue_peek_lock(QueueKind::Worker).await else {
                    drop(permit);
                    tokio::time::sleep(self.idle_sleep()).await;
                    continue;
                };
                let WorkItem::ActivityExecute {
                    instance,
                    id,
                    name,
                    input,
                    retry,
                    backoff,
                } = item
                else {
                    error!(?item, "unexpected work item on worker queue; dropped");
                    self.ack_item(QueueKind::Worker, item.instance(), &token).await;
                    continue;
                };
                let rt = self.clone();
                let activities = activities.clone();
                let permits = permits.clone();
                running.spawn(async move {
                    // A retry waits out its backoff without holding a worker slot.
                    let wait = backoff
                        .map(|b| Duration::from_millis(b.not_before_ms.saturating_sub(now_ms())))
                        .filter(|d| !d.is_zero());
                    let _permit = match wait {
                        Some(wait) => {
                            drop(permit);
                            tokio::time::sleep(wait).await;
                            let Ok(permit) = permits.acquire_owned().await else {
                                rt.abandon_item(QueueKind::Worker, &instance, &token).await;
                                return;
                            };
                            permit
                        }
                        None => permit,
                    };
                    let attempt = ActivityAttempt {
                        instance: instance.clone(),
                        id,
                        name,
                        input,
                        retry,
                        backoff,
                    };
                    let (kind, next) = execute_activity(&activities, attempt).await;
                    match rt.history_store.enqueue_work(kind, next).await {
                        Ok(()) => rt.ack_item(QueueKind::Worker, &instance, &token).await,
                        Err(e) => {
                            error!(instance, id, error = %e, "failed to enqueue activity outcome");
                            rt.abandon_item(QueueKind::Worker, &instance, &token).await;
                        }
                    }
                });
            }
        })
    }

    fn start_timer_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let (_service, tx) = TimerService::start(self.history_store.clone());
            loop {
                let Some((item, token)) = self.history_store.dequeue_peek_lock(QueueKind::Timer).await else {
                    tokio::time::sleep(self.idle_sleep()).await;
                    continue;
                };
                let instance = item.instance().to_string();
                let cmd = match item {
                    WorkItem::TimerSchedule {
                        instance,
                        id,
                        fire_at_ms,
                    } => TimerCommand::Schedule {
                        instance,
                        id,
                        fire_at_ms,
                    },
                    WorkItem::TimerCancel { instance, id } => TimerCommand::Cancel { instance, id },
                    other => {
                        error!(?other, "unexpected work item on timer queue; dropped");
                        self.ack_item(QueueKind::Timer, other.instance(), &token).await;
                        continue;
                    }
                };
                if tx.send(cmd).is_err() {
                    error!("timer service stopped");
                    self.abandon_item(QueueKind::Timer, &instance, &token).await;
                    break;
                }
                self.ack_item(QueueKind::Timer, &instance, &token).await;
            }
        })
    }

    // ---------------- instance lifecycle

    /// Spawn a driver for `instance` unless one is already running.
    async fn ensure_instance_active(self: &Arc<Self>, instance: &str, orchestration_name: &str) -> bool {
        match self.active_instances.lock() {
            Ok(mut active) => {
                if !active.insert(instance.to_string()) {
                    return false;
                }
            }
            Err(_) => return false,
        }
        let guard = ActiveGuard {
            rt: self.clone(),
            inst: instance.to_string(),
        };
        let rt = self.clone();
        let inst = instance.to_string();
        let name = orchestration_name.to_string();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            rt.run_instance(&inst, &name).await;
        });
        self.instance_joins.lock().await.push(handle);
        true
    }

    /// Create the instance and append `OrchestrationStarted` if it has no history yet.
    async fn create_started(
        &self,
        instance: &str,
        orchestration_name: &str,
        input: String,
        parent: ParentLink,
    ) -> Result<(), String> {
        let _ = self.history_store.create_instance(instance).await;
        if !self.history_store.read(instance).await.is_empty() {
            warn!(instance, "instance already has history; duplicate start ignored");
            return Ok(());
        }
        let (parent_instance, parent_id) = parent.unzip();
        self.history_store
            .append(
                instance,
                vec![Event::OrchestrationStarted {
                    name: orchestration_name.to_string(),
                    input,
                    started_at_ms: now_ms(),
                    parent_instance,
                    parent_id,
                }],
            )
            .await
            .map_err(|e| format!("failed to append OrchestrationStarted: {e}"))
    }

    /// Child starts arrive through the queue. A child that already finished
    /// re-reports its outcome to the parent.
    async fn start_from_queue(
        self: &Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        input: String,
        parent: ParentLink,
    ) -> Result<(), String> {
        let hist = self.history_store.read(instance).await;
        if let Some(out) = terminal_result(&hist) {
            if let Some((pinst, pid)) = parent {
                self.notify_parent(&pinst, pid, out).await;
            }
            return Ok(());
        }
        self.create_started(instance, orchestration_name, input, parent).await?;
        self.ensure_instance_active(instance, orchestration_name).await;
        Ok(())
    }

    async fn start_internal_rx(
        self: &Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        input: String,
    ) -> Result<oneshot::Receiver<InstanceOutcome>, String> {
        self.create_started(instance, orchestration_name, input, None).await?;
        let (tx, rx) = oneshot::channel();
        self.result_waiters
            .lock()
            .await
            .entry(instance.to_string())
            .or_default()
            .push(tx);
        let hist = self.history_store.read(instance).await;
        if let Some(out) = terminal_result(&hist) {
            self.notify_waiters(instance, &hist, out).await;
        } else {
            self.ensure_instance_active(instance, orchestration_name).await;
        }
        Ok(rx)
    }

    /// Start (or attach to) `instance` and return a handle resolving to its
    /// final history and output.
    pub async fn start_orchestration(
        self: Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        input: impl Into<String>,
    ) -> Result<JoinHandle<InstanceOutcome>, String> {
        let rx = self.start_internal_rx(instance, orchestration_name, input.into()).await?;
        Ok(tokio::spawn(async move {
            rx.await
                .unwrap_or_else(|_| (Vec::new(), Err("runtime dropped the result waiter".to_string())))
        }))
    }

    /// Typed variant of `start_orchestration`; input and output travel as JSON.
    pub async fn start_orchestration_typed<In, Out>(
        self: Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        input: In,
    ) -> Result<JoinHandle<(Vec<Event>, Result<Out, String>)>, String>
    where
        In: Serialize,
        Out: DeserializeOwned + Send + 'static,
    {
        let payload = Json::encode(&input).map_err(|e| format!("encode: {e}"))?;
        let rx = self.start_internal_rx(instance, orchestration_name, payload).await?;
        Ok(tokio::spawn(async move {
            match rx.await {
                Ok((hist, res)) => (hist, res.and_then(|s| Json::decode::<Out>(&s))),
                Err(_) => (Vec::new(), Err("runtime dropped the result waiter".to_string())),
            }
        }))
    }

    /// Create a new instance with a generated id and start it in the
    /// background. Returns once `OrchestrationStarted` is persisted.
    pub async fn schedule_new_orchestration(
        self: &Arc<Self>,
        orchestration_name: &str,
        input: impl Into<String>,
    ) -> Result<String, String> {
        let instance = uuid::Uuid::new_v4().to_string();
        self.create_started(&instance, orchestration_name, input.into(), None)
            .await?;
        self.ensure_instance_active(&instance, orchestration_name).await;
        info!(instance, orchestration = orchestration_name, "scheduled new orchestration");
        Ok(instance)
    }

    pub async fn schedule_new_orchestration_typed<In: Serialize>(
        self: &Arc<Self>,
        orchestration_name: &str,
        input: &In,
    ) -> Result<String, String> {
        let payload = Json::encode(input).map_err(|e| format!("encode: {e}"))?;
        self.schedule_new_orchestration(orchestration_name, payload).await
    }

    /// Activate every instance that is still running. Runs on start-up;
    /// returns the instances that got a new driver.
    pub async fn recover_instances(self: &Arc<Self>) -> Vec<String> {
        let mut recovered = Vec::new();
        for instance in self.history_store.list_instances().await {
            let hist = self.history_store.read(&instance).await;
            if hist.iter().any(Event::is_terminal) {
                continue;
            }
            let Some(desc) = status::descriptor_from_history(&hist) else {
                continue;
            };
            if self.mark_rehydrated(&instance) {
                completions::rehydrate_pending(&instance, &hist, &self.history_store).await;
            }
            if self.ensure_instance_active(&instance, &desc.name).await {
                recovered.push(instance);
            }
        }
        if !recovered.is_empty() {
            info!(count = recovered.len(), "recovered running instances");
        }
        recovered
    }

    /// True the first time `instance` is seen by this runtime.
    fn mark_rehydrated(&self, instance: &str) -> bool {
        self.rehydrated
            .lock()
            .map(|mut seen| seen.insert(instance.to_string()))
            .unwrap_or(false)
    }

    // ---------------- instance driver

    async fn run_instance(self: &Arc<Self>, instance: &str, orchestration_name: &str) {
        let mut inbox = self.router.register(instance).await;
        let mut history = self.history_store.read(instance).await;

        if let Some(out) = terminal_result(&history) {
            self.notify_waiters(instance, &history, out).await;
            self.release_inbox(instance, inbox, true).await;
            return;
        }
        let Some(Event::OrchestrationStarted {
            input,
            parent_instance,
            parent_id,
            ..
        }) = history
            .iter()
            .find(|e| matches!(e, Event::OrchestrationStarted { .. }))
            .cloned()
        else {
            error!(instance, "no OrchestrationStarted in history; driver not started");
            self.release_inbox(instance, inbox, false).await;
            return;
        };
        let parent_link: ParentLink = parent_instance.zip(parent_id);

        if self.mark_rehydrated(instance) {
            completions::rehydrate_pending(instance, &history, &self.history_store).await;
        }

        let Some(handler) = self.orchestration_registry.get(orchestration_name) else {
            let err = format!("unregistered:{orchestration_name}");
            self.finish(instance, &mut history, Err(err), &parent_link).await;
            self.release_inbox(instance, inbox, true).await;
            return;
        };

        let engine = DefaultReplayEngine;
        let mut turn_index: u64 = 0;
        let mut last_appended: Vec<(CompletionKind, u64)> = Vec::new();
        // Anything past OrchestrationStarted means an earlier activation
        // already ran (and logged) the code this first turn re-executes.
        let mut replay_only = history
            .iter()
            .any(|e| !matches!(e, Event::OrchestrationStarted { .. }));
        loop {
            let baseline_len = history.len();
            let outcome = engine.replay(history, turn_index, replay_only, handler.clone(), input.clone());
            replay_only = false;
            logging::flush_orchestration_logs(instance, orchestration_name, turn_index, outcome.logs);
            history = outcome.history;

            let nondeterminism =
                detect::detect_frontier_nondeterminism(&history[..baseline_len], &history[baseline_len..]).or_else(
                    || {
                        if last_appended.is_empty() {
                            None
                        } else {
                            detect::detect_await_mismatch(&last_appended, &outcome.claims)
                        }
                    },
                );
            last_appended.clear();
            if let Some(err) = nondeterminism {
                warn!(instance, turn_index, error = %err, "orchestration diverged from its history");
                history.truncate(baseline_len);
                self.finish(instance, &mut history, Err(err), &parent_link).await;
                self.release_inbox(instance, inbox, true).await;
                return;
            }

            if history.len() > baseline_len
                && let Err(e) = self
                    .history_store
                    .append(instance, history[baseline_len..].to_vec())
                    .await
            {
                error!(instance, turn_index, error = %e, "failed to append turn events");
                self.notify_waiters(instance, &history, Err(format!("history append failed: {e}")))
                    .await;
                self.release_inbox(instance, inbox, false).await;
                return;
            }
            for action in outcome.decisions {
                dispatch::dispatch_action(self, instance, action).await;
            }

            if let Some(out) = outcome.output {
                self.finish(instance, &mut history, out, &parent_link).await;
                self.release_inbox(instance, inbox, true).await;
                return;
            }

            // Wait for a batch that changes history.
            let len_before = loop {
                let Some(first) = self.next_message(instance, &mut inbox).await else {
                    debug!(instance, turn_index, "dehydrating idle instance");
                    self.release_inbox(instance, inbox, false).await;
                    return;
                };
                match self.fold_batch(instance, &mut history, first, &mut inbox).await {
                    Ok(Some(len_before)) => break len_before,
                    Ok(None) => continue,
                    Err(e) => {
                        error!(instance, turn_index, error = %e, "failed to append completions");
                        self.notify_waiters(instance, &history, Err(format!("history append failed: {e}")))
                            .await;
                        self.release_inbox(instance, inbox, false).await;
                        return;
                    }
                }
            };

            if let Some(reason) = history[len_before..].iter().find_map(|e| match e {
                Event::OrchestrationTerminated { reason } => Some(reason.clone()),
                _ => None,
            }) {
                info!(instance, reason, "orchestration terminated");
                self.terminate_children(instance, &history).await;
                let out = Err(format!("terminated: {reason}"));
                self.notify_waiters(instance, &history, out.clone()).await;
                if let Some((pinst, pid)) = &parent_link {
                    self.notify_parent(pinst, *pid, out).await;
                }
                self.release_inbox(instance, inbox, true).await;
                return;
            }

            detect::collect_last_appended(&history, len_before, &mut last_appended);
            if let Some(err) = detect::detect_completion_kind_mismatch(&history[..len_before], &last_appended) {
                warn!(instance, turn_index, error = %err, "completion does not match its schedule");
                self.finish(instance, &mut history, Err(err), &parent_link).await;
                self.release_inbox(instance, inbox, true).await;
                return;
            }
            turn_index = turn_index.saturating_add(1);
        }
    }

    /// Next inbox message, or `None` once the instance should dehydrate.
    /// Instances with result waiters stay resident.
    async fn next_message(
        &self,
        instance: &str,
        inbox: &mut mpsc::UnboundedReceiver<OrchestratorMsg>,
    ) -> Option<OrchestratorMsg> {
        let idle = Duration::from_millis(self.options.idle_dehydrate_ms);
        loop {
            match tokio::time::timeout(idle, inbox.recv()).await {
                Ok(msg) => return msg,
                Err(_) if self.result_waiters.lock().await.contains_key(instance) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Fold `first` and whatever else is queued (up to the batch limit) into
    /// history behind an `OrchestratorResumed` marker and persist it. Returns
    /// the history length before the batch, or `None` if nothing changed.
    async fn fold_batch(
        &self,
        instance: &str,
        history: &mut Vec<Event>,
        first: OrchestratorMsg,
        inbox: &mut mpsc::UnboundedReceiver<OrchestratorMsg>,
    ) -> Result<Option<usize>, String> {
        let len_before = history.len();
        history.push(Event::OrchestratorResumed { at_ms: now_ms() });
        let mut persist_then_ack: Vec<String> = Vec::new();
        let mut ack_now: Vec<String> = Vec::new();
        let mut next = Some(first);
        let mut taken = 0;
        while let Some(msg) = next.take() {
            match completions::append_completion(history, msg) {
                (Some(t), true) => persist_then_ack.push(t),
                (Some(t), false) => ack_now.push(t),
                (None, _) => {}
            }
            taken += 1;
            if taken < self.options.completion_batch_limit.max(1) {
                next = inbox.try_recv().ok();
            }
        }
        for t in ack_now {
            self.ack_item(QueueKind::Orchestrator, instance, &t).await;
        }
        if history.len() == len_before + 1 {
            history.pop();
            return Ok(None);
        }
        if let Err(e) = self.history_store.append(instance, history[len_before..].to_vec()).await {
            history.truncate(len_before);
            for t in persist_then_ack {
                self.abandon_item(QueueKind::Orchestrator, instance, &t).await;
            }
            return Err(e);
        }
        for t in persist_then_ack {
            self.ack_item(QueueKind::Orchestrator, instance, &t).await;
        }
        Ok(Some(len_before))
    }

    /// Persist the terminal event for `out` and report it to waiters and the parent.
    async fn finish(
        &self,
        instance: &str,
        history: &mut Vec<Event>,
        out: Result<String, String>,
        parent_link: &ParentLink,
    ) {
        let term = match &out {
            Ok(output) => Event::OrchestrationCompleted { output: output.clone() },
            Err(error) => Event::OrchestrationFailed { error: error.clone() },
        };
        if let Err(e) = self.history_store.append(instance, vec![term.clone()]).await {
            error!(instance, error = %e, "failed to append terminal event");
        }
        history.push(term);
        match &out {
            Ok(_) => info!(instance, "orchestration completed"),
            Err(e) => warn!(instance, error = %e, "orchestration failed"),
        }
        self.notify_waiters(instance, history, out.clone()).await;
        if let Some((pinst, pid)) = parent_link {
            self.notify_parent(pinst, *pid, out).await;
        }
    }

    async fn notify_waiters(&self, instance: &str, history: &[Event], out: Result<String, String>) {
        if let Some(waiters) = self.result_waiters.lock().await.remove(instance) {
            for w in waiters {
                let _ = w.send((history.to_vec(), out.clone()));
            }
        }
    }

    async fn notify_parent(&self, parent_instance: &str, parent_id: u64, out: Result<String, String>) {
        let item = match out {
            Ok(result) => WorkItem::SubOrchCompleted {
                parent_instance: parent_instance.to_string(),
                parent_id,
                result,
            },
            Err(error) => WorkItem::SubOrchFailed {
                parent_instance: parent_instance.to_string(),
                parent_id,
                error,
            },
        };
        if let Err(e) = self.history_store.enqueue_work(QueueKind::Orchestrator, item).await {
            warn!(parent_instance, parent_id, error = %e, "failed to report child outcome to parent");
        }
    }

    async fn terminate_children(&self, instance: &str, history: &[Event]) {
        for e in history {
            let Event::SubOrchestrationScheduled {
                id, instance: child, ..
            } = e
            else {
                continue;
            };
            let settled = history.iter().any(|r| {
                matches!(r, Event::SubOrchestrationCompleted { id: cid, .. } | Event::SubOrchestrationFailed { id: cid, .. } if cid == id)
            });
            if !settled {
                let child_instance = format!("{instance}::{child}");
                if let Err(e) = self
                    .history_store
                    .enqueue_work(
                        QueueKind::Orchestrator,
                        WorkItem::TerminateInstance {
                            instance: child_instance.clone(),
                            reason: "parent terminated".into(),
                        },
                    )
                    .await
                {
                    warn!(instance, child_instance, error = %e, "failed to terminate child");
                }
            }
        }
    }

    /// Unregister the inbox and settle anything still in it: acked when the
    /// instance is finished, abandoned for redelivery otherwise.
    async fn release_inbox(&self, instance: &str, mut inbox: mpsc::UnboundedReceiver<OrchestratorMsg>, finished: bool) {
        self.router.unregister(instance).await;
        inbox.close();
        while let Ok(msg) = inbox.try_recv() {
            let Some(t) = msg.ack_token() else { continue };
            if finished {
                self.ack_item(QueueKind::Orchestrator, instance, t).await;
            } else {
                self.abandon_item(QueueKind::Orchestrator, instance, t).await;
            }
        }
    }

    // ---------------- client API

    /// Raise an external event into an instance. Returns whether it was
    /// enqueued; it is dropped with a warning if the instance has not
    /// subscribed to `name`.
    pub async fn raise_event(&self, instance: &str, name: impl Into<String>, data: impl Into<String>) -> bool {
        let name = name.into();
        let data = data.into();
        let hist = self.history_store.read(instance).await;
        let subscribed = hist
            .iter()
            .any(|e| matches!(e, Event::ExternalSubscribed { name: n, .. } if n == &name));
        if !subscribed {
            warn!(instance, event_name = %name, "raise_event: no subscription; event dropped");
            return false;
        }
        if let Err(e) = self
            .history_store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::ExternalRaised {
                    instance: instance.to_string(),
                    name: name.clone(),
                    data,
                },
            )
            .await
        {
            warn!(instance, event_name = %name, error = %e, "raise_event: failed to enqueue");
            return false;
        }
        info!(instance, event_name = %name, "raise_event: enqueued");
        true
    }

    /// Request termination; the instance records `OrchestrationTerminated`
    /// and terminates its running children.
    pub async fn terminate_instance(&self, instance: &str, reason: impl Into<String>) {
        if let Err(e) = self
            .history_store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::TerminateInstance {
                    instance: instance.to_string(),
                    reason: reason.into(),
                },
            )
            .await
        {
            warn!(instance, error = %e, "terminate_instance: failed to enqueue");
        }
    }

    /// Wait until the instance is terminal or `timeout` elapses.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, WaitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut delay_ms: u64 = 5;
        loop {
            let status = self.get_orchestration_status(instance).await;
            if status.is_terminal() {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WaitError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            delay_ms = delay_ms.saturating_mul(2).min(100);
        }
    }

    /// Typed wait: `Ok(Ok(out))` on completion, `Ok(Err(e))` on failure or termination.
    pub async fn wait_for_orchestration_typed<Out: DeserializeOwned>(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<Result<Out, String>, WaitError> {
        match self.wait_for_orchestration(instance, timeout).await? {
            OrchestrationStatus::Completed { output } => Json::decode::<Out>(&output)
                .map(Ok)
                .map_err(|e| WaitError::Other(format!("decode failed: {e}"))),
            OrchestrationStatus::Failed { error } => Ok(Err(error)),
            OrchestrationStatus::Terminated { reason } => Ok(Err(format!("terminated: {reason}"))),
            other => Err(WaitError::Other(format!("unexpected status {other:?}"))),
        }
    }

    /// Abort the dispatchers and every instance driver.
    pub async fn shutdown(self: Arc<Self>) {
        for j in self.joins.lock().await.drain(..) {
            j.abort();
        }
        for j in self.instance_joins.lock().await.drain(..) {
            j.abort();
        }
    }
}

/// Outcome of an instance whose history already ends in a terminal event.
fn terminal_result(history: &[Event]) -> Option<Result<String, String>> {
    history.iter().rev().find_map(|e| match e {
        Event::OrchestrationCompleted { output } => Some(Ok(output.clone())),
        Event::OrchestrationFailed { error } => Some(Err(error.clone())),
        Event::OrchestrationTerminated { reason } => Some(Err(format!("terminated: {reason}"))),
        _ => None,
    })
}

/// One dequeued `ActivityExecute`.
struct ActivityAttempt {
    instance: String,
    id: u64,
    name: String,
    input: String,
    retry: Option<RetryPolicy>,
    backoff: Option<RetryBackoff>,
}

/// Run a single attempt and decide what follows it: the outcome for the
/// orchestrator queue, or the same execution back on the worker queue with
/// its retry progress and the time of the next attempt.
async fn execute_activity(activities: &ActivityRegistry, attempt: ActivityAttempt) -> (QueueKind, WorkItem) {
    let ActivityAttempt {
        instance,
        id,
        name,
        input,
        retry,
        backoff,
    } = attempt;
    let Some(handler) = activities.get(&name) else {
        warn!(instance, id, name, "activity not registered");
        return (
            QueueKind::Orchestrator,
            WorkItem::ActivityFailed {
                instance,
                id,
                error: format!("unregistered:{name}"),
                attempts: 0,
            },
        );
    };
    let attempts = backoff.map_or(0, |b| b.attempts) + 1;
    let first_attempt_at_ms = backoff.map_or_else(now_ms, |b| b.first_attempt_at_ms);
    let error = match handler.invoke(input.clone()).await {
        Ok(result) => {
            debug!(instance, id, name, attempts, "activity completed");
            return (QueueKind::Orchestrator, WorkItem::ActivityCompleted { instance, id, result });
        }
        Err(e) => e,
    };
    let policy = retry.clone().unwrap_or_else(RetryPolicy::no_retry);
    let elapsed = Duration::from_millis(now_ms().saturating_sub(first_attempt_at_ms));
    match policy.evaluate(&error, attempts, elapsed) {
        RetryDecision::Retry { delay } => {
            debug!(instance, id, name, attempts, delay_ms = %delay.as_millis(), error = %error, "activity attempt failed; retry scheduled");
            let backoff = RetryBackoff {
                attempts,
                first_attempt_at_ms,
                not_before_ms: now_ms().saturating_add(crate::duration_ms(delay)),
            };
            (
                QueueKind::Worker,
                WorkItem::ActivityExecute {
                    instance,
                    id,
                    name,
                    input,
                    retry,
                    backoff: Some(backoff),
                },
            )
        }
        RetryDecision::GiveUp { reason } => {
            warn!(instance, id, name, attempts, ?reason, error = %error, "activity failed");
            (
                QueueKind::Orchestrator,
                WorkItem::ActivityFailed {
                    instance,
                    id,
                    error: error.to_string(),
                    attempts,
                },
            )
        }
    }
}
