use std::sync::Arc;

use tracing::{debug, warn};

use super::Runtime;
use crate::Action;
use crate::providers::{QueueKind, WorkItem};

/// Turn one decision of a replayed turn into provider work.
pub(crate) async fn dispatch_action(rt: &Arc<Runtime>, instance: &str, action: Action) {
    let (kind, item) = match action {
        Action::CallActivity { id, name, input, retry } => {
            debug!(instance, id, name = %name, "dispatch activity");
            (
                QueueKind::Worker,
                WorkItem::ActivityExecute {
                    instance: instance.to_string(),
                    id,
                    name,
                    input,
                    retry,
                    backoff: None,
                },
            )
        }
        Action::CreateTimer { id, fire_at_ms } => {
            debug!(instance, id, fire_at_ms, "dispatch timer");
            (
                QueueKind::Timer,
                WorkItem::TimerSchedule {
                    instance: instance.to_string(),
                    id,
                    fire_at_ms,
                },
            )
        }
        Action::CancelTimer { id } => {
            debug!(instance, id, "dispatch timer cancel");
            (
                QueueKind::Timer,
                WorkItem::TimerCancel {
                    instance: instance.to_string(),
                    id,
                },
            )
        }
        Action::WaitExternal { id, name } => {
            // The subscription lives in history; nothing to enqueue.
            debug!(instance, id, name = %name, "subscribed to external event");
            return;
        }
        Action::StartSubOrchestration {
            id,
            name,
            instance: child_suffix,
            input,
        } => {
            let child = format!("{instance}::{child_suffix}");
            debug!(instance, id, name = %name, child_instance = %child, "dispatch sub-orchestration");
            (
                QueueKind::Orchestrator,
                WorkItem::StartOrchestration {
                    instance: child,
                    orchestration: name,
                    input,
                    parent_instance: Some(instance.to_string()),
                    parent_id: Some(id),
                },
            )
        }
    };
    if let Err(e) = rt.history_store.enqueue_work(kind, item).await {
        warn!(instance, ?kind, error = %e, "failed to enqueue work item");
    }
}
