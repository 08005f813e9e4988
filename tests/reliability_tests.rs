use meeting_summz::providers::HistoryStore;
use meeting_summz::providers::fs::FsHistoryStore;
use meeting_summz::providers::{QueueKind, WorkItem};
use meeting_summz::runtime::registry::ActivityRegistry;
use meeting_summz::runtime::{self};
use meeting_summz::{Event, OrchestrationContext, OrchestrationRegistry, OrchestrationStatus};
use std::sync::Arc as StdArc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
mod common;

fn first_timer(hist: &[Event]) -> (u64, u64) {
    hist.iter()
        .find_map(|e| match e {
            Event::TimerCreated { id, fire_at_ms } => Some((*id, *fire_at_ms)),
            _ => None,
        })
        .unwrap()
}

#[tokio::test]
async fn external_duplicate_workitems_dedup_fs() {
    let td = tempfile::tempdir().unwrap();
    let store = StdArc::new(FsHistoryStore::new(td.path(), true)) as StdArc<dyn HistoryStore>;

    let orch = |ctx: OrchestrationContext, _input: String| async move {
        let v = ctx.schedule_wait("Evt").into_event().await;
        Ok(v)
    };
    let orchestration_registry = OrchestrationRegistry::builder().register("WaitEvt", orch).build();
    let activity_registry = ActivityRegistry::builder().build();
    let rt =
        runtime::Runtime::start_with_store(store.clone(), StdArc::new(activity_registry), orchestration_registry).await;

    let inst = "inst-ext-dup";
    let _h = rt.clone().start_orchestration(inst, "WaitEvt", "").await.unwrap();
    assert!(common::wait_for_subscription(store.clone(), inst, "Evt", 2_000).await);

    let wi = WorkItem::ExternalRaised {
        instance: inst.to_string(),
        name: "Evt".to_string(),
        data: "ok".to_string(),
    };
    let _ = store.enqueue_work(QueueKind::Orchestrator, wi.clone()).await;
    let _ = store.enqueue_work(QueueKind::Orchestrator, wi.clone()).await;

    let ok = common::wait_for_history(
        store.clone(),
        inst,
        |h| {
            h.iter()
                .any(|e| matches!(e, Event::OrchestrationCompleted { output } if output == "ok"))
        },
        5_000,
    )
    .await;
    assert!(ok, "timeout waiting for completion");

    let hist = store.read(inst).await;
    let received = hist
        .iter()
        .filter(|e| matches!(e, Event::ExternalEventReceived { name, .. } if name == "Evt"))
        .count();
    assert_eq!(received, 1, "expected 1 ExternalEventReceived, got {received}");

    rt.shutdown().await;
}

#[tokio::test]
async fn timer_duplicate_workitems_dedup_fs() {
    let td = tempfile::tempdir().unwrap();
    let store = StdArc::new(FsHistoryStore::new(td.path(), true)) as StdArc<dyn HistoryStore>;

    let orch = |ctx: OrchestrationContext, _input: String| async move {
        ctx.schedule_timer(100).into_timer().await;
        Ok("t".to_string())
    };
    let orchestration_registry = OrchestrationRegistry::builder().register("OneTimer", orch).build();
    let activity_registry = ActivityRegistry::builder().build();
    let rt =
        runtime::Runtime::start_with_store(store.clone(), StdArc::new(activity_registry), orchestration_registry).await;

    let inst = "inst-timer-dup";
    let _h = rt.clone().start_orchestration(inst, "OneTimer", "").await.unwrap();
    assert!(
        common::wait_for_history(
            store.clone(),
            inst,
            |h| h.iter().any(|e| matches!(e, Event::TimerCreated { .. })),
            2_000
        )
        .await
    );
    let (id, fire_at_ms) = first_timer(&store.read(inst).await);

    // The timer service fires this id as well; only one firing may land.
    let wi = WorkItem::TimerFired {
        instance: inst.to_string(),
        id,
        fire_at_ms,
    };
    let _ = store.enqueue_work(QueueKind::Orchestrator, wi.clone()).await;
    let _ = store.enqueue_work(QueueKind::Orchestrator, wi.clone()).await;

    let ok = common::wait_for_history(
        store.clone(),
        inst,
        |h| {
            h.iter()
                .any(|e| matches!(e, Event::OrchestrationCompleted { output } if output == "t"))
        },
        5_000,
    )
    .await;
    assert!(ok, "timeout waiting for completion");

    let hist = store.read(inst).await;
    let fired = hist.iter().filter(|e| matches!(e, Event::TimerFired { .. })).count();
    assert_eq!(fired, 1, "expected 1 TimerFired, got {fired}");

    rt.shutdown().await;
}

#[tokio::test]
async fn activity_duplicate_completion_workitems_dedup_fs() {
    let td = tempfile::tempdir().unwrap();
    let store = StdArc::new(FsHistoryStore::new(td.path(), true)) as StdArc<dyn HistoryStore>;

    let activity_registry = ActivityRegistry::builder()
        .register("SlowEcho", |input: String| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(input)
        })
        .build();
    let orch = |ctx: OrchestrationContext, _input: String| async move {
        ctx.schedule_activity("SlowEcho", "x").into_activity().await
    };
    let orchestration_registry = OrchestrationRegistry::builder().register("OneSlowAct", orch).build();
    let rt =
        runtime::Runtime::start_with_store(store.clone(), StdArc::new(activity_registry), orchestration_registry).await;

    let inst = "inst-act-dup";
    let _h = rt.clone().start_orchestration(inst, "OneSlowAct", "").await.unwrap();
    assert!(
        common::wait_for_history(
            store.clone(),
            inst,
            |h| h
                .iter()
                .any(|e| matches!(e, Event::ActivityScheduled { name, .. } if name == "SlowEcho")),
            2_000
        )
        .await
    );
    let id = store
        .read(inst)
        .await
        .iter()
        .find_map(|e| match e {
            Event::ActivityScheduled { id, name, .. } if name == "SlowEcho" => Some(*id),
            _ => None,
        })
        .unwrap();

    // Same result as the worker will report.
    let wi = WorkItem::ActivityCompleted {
        instance: inst.to_string(),
        id,
        result: "x".to_string(),
    };
    let _ = store.enqueue_work(QueueKind::Orchestrator, wi.clone()).await;
    let _ = store.enqueue_work(QueueKind::Orchestrator, wi.clone()).await;

    let ok = common::wait_for_history(
        store.clone(),
        inst,
        |h| {
            h.iter()
                .any(|e| matches!(e, Event::OrchestrationCompleted { output } if output == "x"))
        },
        5_000,
    )
    .await;
    assert!(ok, "timeout waiting for completion");

    // Let the real worker result arrive after completion; it must be dropped.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let hist = store.read(inst).await;
    let outcomes = hist
        .iter()
        .filter(|e| {
            matches!(e, Event::ActivityCompleted { id: cid, .. } | Event::ActivityFailed { id: cid, .. } if *cid == id)
        })
        .count();
    assert_eq!(outcomes, 1, "expected a single outcome for id={id}");
    assert!(matches!(hist.last(), Some(Event::OrchestrationCompleted { .. })));

    rt.shutdown().await;
}

#[tokio::test]
async fn activity_in_flight_at_crash_runs_again_after_restart_fs() {
    let td = tempfile::tempdir().unwrap();
    let store1 = StdArc::new(FsHistoryStore::new(td.path(), true)) as StdArc<dyn HistoryStore>;

    let orch = |ctx: OrchestrationContext, input: String| async move {
        let a = ctx.schedule_activity("Step", input).into_activity().await?;
        let b = ctx.schedule_activity("Step", a).into_activity().await?;
        Ok(b)
    };

    // First process: the activity never returns before the crash.
    let hanging = ActivityRegistry::builder()
        .register("Step", |_input: String| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(String::new())
        })
        .build();
    let rt1 = runtime::Runtime::start_with_store(
        store1.clone(),
        StdArc::new(hanging),
        OrchestrationRegistry::builder().register("TwoSteps", orch).build(),
    )
    .await;
    let inst = "inst-crash";
    let _h = rt1.clone().start_orchestration(inst, "TwoSteps", "a").await.unwrap();
    assert!(
        common::wait_for_history(
            store1.clone(),
            inst,
            |h| h.iter().any(|e| matches!(e, Event::ActivityScheduled { .. })),
            2_000
        )
        .await
    );
    rt1.shutdown().await;

    // Second process over the same directory.
    let runs = StdArc::new(AtomicU32::new(0));
    let r = runs.clone();
    let working = ActivityRegistry::builder()
        .register("Step", move |input: String| {
            let r = r.clone();
            async move {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(format!("{input}+"))
            }
        })
        .build();
    let store2 = StdArc::new(FsHistoryStore::new(td.path(), false)) as StdArc<dyn HistoryStore>;
    let rt2 = runtime::Runtime::start_with_store(
        store2.clone(),
        StdArc::new(working),
        OrchestrationRegistry::builder().register("TwoSteps", orch).build(),
    )
    .await;
    // Start-up already recovered the instance.
    assert!(rt2.recover_instances().await.is_empty());

    match rt2.wait_for_orchestration(inst, Duration::from_secs(5)).await.unwrap() {
        OrchestrationStatus::Completed { output } => assert_eq!(output, "a++"),
        other => panic!("unexpected status: {other:?}"),
    }
    // The abandoned execution may be redelivered alongside the rehydrated one.
    assert!(runs.load(Ordering::SeqCst) >= 2);

    let hist = store2.read(inst).await;
    let scheduled = hist
        .iter()
        .filter(|e| matches!(e, Event::ActivityScheduled { .. }))
        .count();
    let completed = hist
        .iter()
        .filter(|e| matches!(e, Event::ActivityCompleted { .. }))
        .count();
    assert_eq!((scheduled, completed), (2, 2));
    rt2.shutdown().await;
}

#[tokio::test]
async fn recover_instances_skips_terminal_instances_fs() {
    let td = tempfile::tempdir().unwrap();
    let store = StdArc::new(FsHistoryStore::new(td.path(), true)) as StdArc<dyn HistoryStore>;
    let orch = |_ctx: OrchestrationContext, input: String| async move { Ok(input) };

    let rt1 = runtime::Runtime::start_with_store(
        store.clone(),
        StdArc::new(ActivityRegistry::builder().build()),
        OrchestrationRegistry::builder().register("Echo", orch).build(),
    )
    .await;
    let h = rt1.clone().start_orchestration("inst-done", "Echo", "hi").await.unwrap();
    let (_hist, out) = h.await.unwrap();
    assert_eq!(out.unwrap(), "hi");
    rt1.shutdown().await;

    let rt2 = runtime::Runtime::start_with_store(
        store.clone(),
        StdArc::new(ActivityRegistry::builder().build()),
        OrchestrationRegistry::builder().register("Echo", orch).build(),
    )
    .await;
    assert!(rt2.recover_instances().await.is_empty());
    assert_eq!(
        rt2.get_orchestration_status("inst-done").await,
        OrchestrationStatus::Completed { output: "hi".into() }
    );
    rt2.shutdown().await;
}

#[tokio::test]
async fn pending_timer_resumes_after_restart_without_manual_recovery_fs() {
    let td = tempfile::tempdir().unwrap();
    let orch = |ctx: OrchestrationContext, _input: String| async move {
        ctx.schedule_timer(300).into_timer().await;
        Ok("woke".to_string())
    };

    let store1 = StdArc::new(FsHistoryStore::new(td.path(), true)) as StdArc<dyn HistoryStore>;
    let rt1 = runtime::Runtime::start_with_store(
        store1.clone(),
        StdArc::new(ActivityRegistry::builder().build()),
        OrchestrationRegistry::builder().register("Nap", orch).build(),
    )
    .await;
    let inst = rt1.schedule_new_orchestration("Nap", "").await.unwrap();
    assert!(
        common::wait_for_history(
            store1.clone(),
            &inst,
            |h| h.iter().any(|e| matches!(e, Event::TimerCreated { .. })),
            2_000
        )
        .await
    );
    // Give the timer dispatcher time to take the schedule off the queue.
    tokio::time::sleep(Duration::from_millis(50)).await;
    rt1.shutdown().await;

    let store2 = StdArc::new(FsHistoryStore::new(td.path(), false)) as StdArc<dyn HistoryStore>;
    let rt2 = runtime::Runtime::start_with_store(
        store2.clone(),
        StdArc::new(ActivityRegistry::builder().build()),
        OrchestrationRegistry::builder().register("Nap", orch).build(),
    )
    .await;
    match rt2.wait_for_orchestration(&inst, Duration::from_secs(5)).await.unwrap() {
        OrchestrationStatus::Completed { output } => assert_eq!(output, "woke"),
        other => panic!("unexpected status: {other:?}"),
    }
    let fired = store2
        .read(&inst)
        .await
        .iter()
        .filter(|e| matches!(e, Event::TimerFired { .. }))
        .count();
    assert_eq!(fired, 1);
    rt2.shutdown().await;
}

/// In-memory store whose acks always fail.
struct AckFailingStore {
    inner: meeting_summz::providers::in_memory::InMemoryHistoryStore,
    failed_acks: AtomicU32,
}

#[async_trait::async_trait]
impl HistoryStore for AckFailingStore {
    async fn read(&self, instance: &str) -> Vec<Event> {
        self.inner.read(instance).await
    }
    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), String> {
        self.inner.append(instance, new_events).await
    }
    async fn reset(&self) {
        self.inner.reset().await
    }
    async fn list_instances(&self) -> Vec<String> {
        self.inner.list_instances().await
    }
    async fn dump_all_pretty(&self) -> String {
        self.inner.dump_all_pretty().await
    }
    async fn create_instance(&self, instance: &str) -> Result<(), String> {
        self.inner.create_instance(instance).await
    }
    async fn remove_instance(&self, instance: &str) -> Result<(), String> {
        self.inner.remove_instance(instance).await
    }
    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), String> {
        self.inner.enqueue_work(kind, item).await
    }
    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        self.inner.dequeue_peek_lock(kind).await
    }
    async fn ack(&self, _kind: QueueKind, token: &str) -> Result<(), String> {
        self.failed_acks.fetch_add(1, Ordering::SeqCst);
        Err(format!("ack rejected for {token}"))
    }
    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        self.inner.abandon(kind, token).await
    }
}

#[tokio::test]
async fn failed_acks_are_reported_without_stalling_the_runtime() {
    let store = StdArc::new(AckFailingStore {
        inner: Default::default(),
        failed_acks: AtomicU32::new(0),
    });
    let activity_registry = ActivityRegistry::builder()
        .register("Echo", |input: String| async move { Ok(input) })
        .build();
    let orch = |ctx: OrchestrationContext, input: String| async move {
        ctx.schedule_activity("Echo", input).into_activity().await
    };
    let orchestration_registry = OrchestrationRegistry::builder().register("EchoOnce", orch).build();
    let rt = runtime::Runtime::start_with_store(
        store.clone() as StdArc<dyn HistoryStore>,
        StdArc::new(activity_registry),
        orchestration_registry,
    )
    .await;

    let (_hist, out) = common::run(&rt, "inst-ack-fail", "EchoOnce", "hi").await;
    assert_eq!(out.unwrap(), "hi");
    assert!(store.failed_acks.load(Ordering::SeqCst) >= 2);
    rt.shutdown().await;
}
