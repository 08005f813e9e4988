use futures::future::join3;
use meeting_summz::providers::HistoryStore;
use meeting_summz::providers::fs::FsHistoryStore;
use meeting_summz::providers::in_memory::InMemoryHistoryStore;
use meeting_summz::runtime::registry::ActivityRegistry;
use meeting_summz::runtime::{self};
use meeting_summz::{Action, DurableOutput, Event, OrchestrationContext, OrchestrationRegistry, run_turn};
use std::sync::Arc;
use std::sync::Arc as StdArc;
mod common;

fn without_markers(hist: &[Event]) -> Vec<&Event> {
    hist.iter()
        .filter(|e| !matches!(e, Event::OrchestratorResumed { .. }))
        .collect()
}

async fn three_way_join(ctx: OrchestrationContext) -> String {
    let f_a = ctx.schedule_activity("A", "1");
    let f_t = ctx.schedule_timer(5);
    let f_e = ctx.schedule_wait("Go");

    let (o_a, _o_t, o_e) = join3(f_a, f_t, f_e).await;

    let a = match o_a {
        DurableOutput::Activity(v) => v.unwrap(),
        _ => unreachable!("A must be activity result"),
    };
    let evt = match o_e {
        DurableOutput::External(v) => v,
        _ => unreachable!("Go must be external event"),
    };

    let b = ctx.schedule_activity("B", a.clone()).into_activity().await.unwrap();
    format!("evt={evt}, b={b}")
}

async fn orchestration_completes_and_replays_deterministically_with(store: StdArc<dyn HistoryStore>) {
    let orchestration = |ctx: OrchestrationContext, _input: String| async move { Ok(three_way_join(ctx).await) };

    let activity_registry = ActivityRegistry::builder()
        .register("A", |input: String| async move {
            Ok(input.parse::<i32>().unwrap_or(0).saturating_add(1).to_string())
        })
        .register("B", |input: String| async move { Ok(format!("{input}!")) })
        .build();

    let orchestration_registry = OrchestrationRegistry::builder()
        .register("DeterministicOrchestration", orchestration)
        .build();

    let rt =
        runtime::Runtime::start_with_store(store.clone(), Arc::new(activity_registry), orchestration_registry).await;
    let store_for_wait = store.clone();
    let rt_clone = rt.clone();
    tokio::spawn(async move {
        let _ = crate::common::wait_for_subscription(store_for_wait, "inst-orch-1", "Go", 1000).await;
        rt_clone.raise_event("inst-orch-1", "Go", "ok").await;
    });
    let handle = rt
        .clone()
        .start_orchestration("inst-orch-1", "DeterministicOrchestration", "")
        .await;
    let (final_history, output) = handle.unwrap().await.unwrap();
    let output = output.unwrap();
    assert_eq!(output, "evt=ok, b=2!");
    // OrchestrationStarted + 4 schedule/complete pairs + terminal event
    assert_eq!(without_markers(&final_history).len(), 10, "{final_history:#?}");
    assert!(
        final_history
            .iter()
            .any(|e| matches!(e, Event::OrchestratorResumed { .. })),
        "each delivered batch is preceded by a resume marker"
    );

    let (_h2, acts2, _logs2, out2) = run_turn(final_history.clone(), three_way_join);
    assert!(acts2.is_empty(), "replay should not produce new actions");
    assert_eq!(out2.unwrap(), output);
    rt.shutdown().await;
}

#[tokio::test]
async fn orchestration_completes_and_replays_deterministically_fs() {
    let td = tempfile::tempdir().unwrap();
    let store = StdArc::new(FsHistoryStore::new(td.path(), true)) as StdArc<dyn HistoryStore>;
    orchestration_completes_and_replays_deterministically_with(store).await;
}

#[tokio::test]
async fn orchestration_completes_and_replays_deterministically_inmem() {
    let store = StdArc::new(InMemoryHistoryStore::default()) as StdArc<dyn HistoryStore>;
    orchestration_completes_and_replays_deterministically_with(store).await;
}

#[test]
fn action_order_is_deterministic_in_first_turn() {
    let orchestrator = |ctx: OrchestrationContext| async move {
        let f_a = ctx.schedule_activity("A", "1");
        let f_t = ctx.schedule_timer(500);
        let f_e = ctx.schedule_wait("Go");
        let f_s = ctx.schedule_sub_orchestration("Child", "x");
        let _ = ctx.join(vec![f_a, f_t, f_e, f_s]).await;
        unreachable!("should not complete in the first turn");
    };

    let (_hist_after, actions, _logs, _out) = run_turn(Vec::new(), orchestrator);
    let kinds: Vec<&'static str> = actions
        .iter()
        .map(|a| match a {
            Action::CallActivity { .. } => "CallActivity",
            Action::CreateTimer { .. } => "CreateTimer",
            Action::CancelTimer { .. } => "CancelTimer",
            Action::WaitExternal { .. } => "WaitExternal",
            Action::StartSubOrchestration { .. } => "StartSubOrchestration",
        })
        .collect();
    assert_eq!(
        kinds,
        vec!["CallActivity", "CreateTimer", "WaitExternal", "StartSubOrchestration"],
        "actions must be recorded in declaration order"
    );
}

#[test]
fn is_replaying_tracks_resume_markers() {
    let history = vec![
        Event::OrchestrationStarted {
            name: "R".into(),
            input: String::new(),
            started_at_ms: 1_000,
            parent_instance: None,
            parent_id: None,
        },
        Event::ActivityScheduled {
            id: 1,
            name: "A".into(),
            input: "1".into(),
            retry: None,
        },
        Event::OrchestratorResumed { at_ms: 2_000 },
        Event::ActivityCompleted {
            id: 1,
            result: "2".into(),
        },
    ];
    let orchestrator = |ctx: OrchestrationContext| async move {
        let before = ctx.is_replaying();
        let _ = ctx.schedule_activity("A", "1").into_activity().await;
        let after = ctx.is_replaying();
        ctx.log_info("done");
        (before, after)
    };
    let (_h, actions, logs, out) = run_turn(history, orchestrator);
    assert!(actions.is_empty());
    assert_eq!(out, Some((true, false)));
    assert_eq!(logs.len(), 1, "logs: {logs:?}");
}

#[tokio::test]
async fn changed_orchestration_code_fails_instance_as_nondeterministic() {
    let store = StdArc::new(InMemoryHistoryStore::default()) as StdArc<dyn HistoryStore>;
    // History written by an earlier version that scheduled "A".
    store.create_instance("inst-nd").await.unwrap();
    store
        .append(
            "inst-nd",
            vec![
                Event::OrchestrationStarted {
                    name: "Flip".into(),
                    input: String::new(),
                    started_at_ms: 0,
                    parent_instance: None,
                    parent_id: None,
                },
                Event::ActivityScheduled {
                    id: 1,
                    name: "A".into(),
                    input: "x".into(),
                    retry: None,
                },
            ],
        )
        .await
        .unwrap();

    let orchestrator = |ctx: OrchestrationContext, _input: String| async move {
        ctx.schedule_activity("B", "x").into_activity().await
    };
    let reg = OrchestrationRegistry::builder().register("Flip", orchestrator).build();
    let rt = runtime::Runtime::start_with_store(store.clone(), Arc::new(ActivityRegistry::builder().build()), reg).await;
    let h = rt.clone().start_orchestration("inst-nd", "Flip", "").await.unwrap();
    let (hist, out) = h.await.unwrap();
    let err = out.unwrap_err();
    assert!(err.contains("nondeterministic"), "unexpected error: {err}");
    assert!(matches!(hist.last(), Some(Event::OrchestrationFailed { .. })));
    assert!(
        !hist
            .iter()
            .any(|e| matches!(e, Event::ActivityScheduled { name, .. } if name == "B")),
        "diverged schedule must not be persisted"
    );
    rt.shutdown().await;
}

async fn sequential_activity_chain_completes_with(store: StdArc<dyn HistoryStore>) {
    let orchestrator = |ctx: OrchestrationContext, _input: String| async move {
        let a = ctx.schedule_activity("A", "1").into_activity().await?;
        let b = ctx.schedule_activity("B", a).into_activity().await?;
        let c = ctx.schedule_activity("C", b).into_activity().await?;
        Ok(format!("c={c}"))
    };

    let activity_registry = ActivityRegistry::builder()
        .register("A", |input: String| async move {
            Ok(input.parse::<i32>().map(|x| x + 1).unwrap_or(0).to_string())
        })
        .register("B", |input: String| async move { Ok(format!("{input}b")) })
        .register("C", |input: String| async move { Ok(format!("{input}c")) })
        .build();

    let orchestration_registry = OrchestrationRegistry::builder()
        .register("SequentialOrchestration", orchestrator)
        .build();

    let rt = runtime::Runtime::start_with_store(store, Arc::new(activity_registry), orchestration_registry).await;
    let handle = rt
        .clone()
        .start_orchestration("inst-seq-1", "SequentialOrchestration", "")
        .await;
    let (final_history, output) = handle.unwrap().await.unwrap();
    assert_eq!(output.unwrap(), "c=2bc");
    // OrchestrationStarted + 3 schedule/complete pairs + terminal event
    assert_eq!(without_markers(&final_history).len(), 8);
    rt.shutdown().await;
}

#[tokio::test]
async fn sequential_activity_chain_completes_fs() {
    let td = tempfile::tempdir().unwrap();
    let store = StdArc::new(FsHistoryStore::new(td.path(), true)) as StdArc<dyn HistoryStore>;
    sequential_activity_chain_completes_with(store).await;
}

#[tokio::test]
async fn rehydrated_instance_does_not_relive_code_it_already_ran() {
    use meeting_summz::config::RuntimeOptions;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    // Counts executions past "A" that were not flagged as replay; each one logs.
    let live_after_a = Arc::new(AtomicU32::new(0));
    let counter = live_after_a.clone();
    let orchestrator = move |ctx: OrchestrationContext, _input: String| {
        let counter = counter.clone();
        async move {
            ctx.schedule_activity("A", "1").into_activity().await?;
            if !ctx.is_replaying() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            ctx.log_info("A finished");
            ctx.schedule_timer(400).into_timer().await;
            Ok("done".to_string())
        }
    };
    let activities = ActivityRegistry::builder()
        .register("A", |input: String| async move { Ok(input) })
        .build();
    let reg = OrchestrationRegistry::builder().register("Dozer", orchestrator).build();
    let store = Arc::new(InMemoryHistoryStore::default()) as Arc<dyn HistoryStore>;
    let options = RuntimeOptions {
        idle_dehydrate_ms: 50,
        ..RuntimeOptions::default()
    };
    let rt = runtime::Runtime::start_with_options(store.clone(), Arc::new(activities), reg, options).await;

    // No result waiter: the instance dehydrates while the timer runs.
    let instance = rt.schedule_new_orchestration("Dozer", "").await.unwrap();
    match rt.wait_for_orchestration(&instance, Duration::from_secs(5)).await.unwrap() {
        runtime::OrchestrationStatus::Completed { output } => assert_eq!(output, "done"),
        other => panic!("unexpected status: {other:?}"),
    }
    let resumes = store
        .read(&instance)
        .await
        .iter()
        .filter(|e| matches!(e, Event::OrchestratorResumed { .. }))
        .count();
    assert_eq!(resumes, 2);
    assert_eq!(live_after_a.load(Ordering::SeqCst), 1);
    rt.shutdown().await;
}
