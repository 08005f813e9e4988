use std::sync::Arc;

use tracing::{debug, warn};

use crate::Event;
use crate::providers::{HistoryStore, QueueKind, WorkItem};
use crate::runtime::router::OrchestratorMsg;

fn has_event(history: &[Event], pred: impl Fn(&Event) -> bool) -> bool {
    history.iter().any(pred)
}

/// Fold one delivered message into `history`. Returns the message's ack
/// token and whether history changed. Duplicates, late firings of
/// cancelled timers and events without an open subscription are dropped.
pub(crate) fn append_completion(history: &mut Vec<Event>, msg: OrchestratorMsg) -> (Option<String>, bool) {
    let token = msg.ack_token().map(str::to_string);
    if history.iter().any(Event::is_terminal) {
        return (token, false);
    }
    let event = match msg {
        OrchestratorMsg::ActivityCompleted { id, result, .. } => {
            if has_event(history, |e| {
                matches!(e, Event::ActivityCompleted { id: cid, .. } | Event::ActivityFailed { id: cid, .. } if *cid == id)
            }) {
                debug!(id, "duplicate activity completion dropped");
                return (token, false);
            }
            Event::ActivityCompleted { id, result }
        }
        OrchestratorMsg::ActivityFailed {
            id, error, attempts, ..
        } => {
            if has_event(history, |e| {
                matches!(e, Event::ActivityCompleted { id: cid, .. } | Event::ActivityFailed { id: cid, .. } if *cid == id)
            }) {
                debug!(id, "duplicate activity failure dropped");
                return (token, false);
            }
            Event::ActivityFailed { id, error, attempts }
        }
        OrchestratorMsg::TimerFired { id, fire_at_ms, .. } => {
            if has_event(history, |e| {
                matches!(e, Event::TimerFired { id: cid, .. } | Event::TimerCancelled { id: cid } if *cid == id)
            }) {
                debug!(id, "timer already fired or cancelled; firing dropped");
                return (token, false);
            }
            Event::TimerFired { id, fire_at_ms }
        }
        OrchestratorMsg::ExternalByName {
            instance, name, data, ..
        } => {
            let Some(id) = latest_open_subscription(history, &name) else {
                warn!(instance, event_name = %name, "external event has no open subscription; dropped");
                return (token, false);
            };
            Event::ExternalEventReceived { id, name, data }
        }
        OrchestratorMsg::SubOrchCompleted { id, result, .. } => {
            if has_sub_outcome(history, id) {
                return (token, false);
            }
            Event::SubOrchestrationCompleted { id, result }
        }
        OrchestratorMsg::SubOrchFailed { id, error, .. } => {
            if has_sub_outcome(history, id) {
                return (token, false);
            }
            Event::SubOrchestrationFailed { id, error }
        }
        OrchestratorMsg::TerminateRequested { reason, .. } => Event::OrchestrationTerminated { reason },
    };
    history.push(event);
    (token, true)
}

fn has_sub_outcome(history: &[Event], id: u64) -> bool {
    has_event(history, |e| {
        matches!(e, Event::SubOrchestrationCompleted { id: cid, .. } | Event::SubOrchestrationFailed { id: cid, .. } if *cid == id)
    })
}

/// Most recent subscription to `name` that has not received an event yet.
fn latest_open_subscription(history: &[Event], name: &str) -> Option<u64> {
    history.iter().rev().find_map(|e| match e {
        Event::ExternalSubscribed { id, name: n }
            if n == name
                && !history
                    .iter()
                    .any(|r| matches!(r, Event::ExternalEventReceived { id: rid, .. } if rid == id)) =>
        {
            Some(*id)
        }
        _ => None,
    })
}

/// Re-enqueue work recorded in history that has no outcome yet: activities,
/// live timers and child orchestration starts. Enqueue is idempotent for
/// items still queued.
pub(crate) async fn rehydrate_pending(instance: &str, history: &[Event], store: &Arc<dyn HistoryStore>) {
    for e in history {
        let item = match e {
            Event::ActivityScheduled {
                id,
                name,
                input,
                retry,
            } if !has_event(history, |r| {
                matches!(r, Event::ActivityCompleted { id: cid, .. } | Event::ActivityFailed { id: cid, .. } if cid == id)
            }) =>
            {
                (
                    QueueKind::Worker,
                    WorkItem::ActivityExecute {
                        instance: instance.to_string(),
                        id: *id,
                        name: name.clone(),
                        input: input.clone(),
                        retry: retry.clone(),
                        backoff: None,
                    },
                )
            }
            Event::TimerCreated { id, fire_at_ms }
                if !has_event(history, |r| {
                    matches!(r, Event::TimerFired { id: cid, .. } | Event::TimerCancelled { id: cid } if cid == id)
                }) =>
            {
                (
                    QueueKind::Timer,
                    WorkItem::TimerSchedule {
                        instance: instance.to_string(),
                        id: *id,
                        fire_at_ms: *fire_at_ms,
                    },
                )
            }
            Event::SubOrchestrationScheduled {
                id,
                name,
                instance: child_suffix,
                input,
            } if !has_sub_outcome(history, *id) => (
                QueueKind::Orchestrator,
                WorkItem::StartOrchestration {
                    instance: format!("{instance}::{child_suffix}"),
                    orchestration: name.clone(),
                    input: input.clone(),
                    parent_instance: Some(instance.to_string()),
                    parent_id: Some(*id),
                },
            ),
            _ => continue,
        };
        let (kind, item) = item;
        if let Err(e) = store.enqueue_work(kind, item).await {
            warn!(instance, error = %e, "failed to re-enqueue pending work");
        }
    }
}
