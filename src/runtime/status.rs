use super::{OrchestrationDescriptor, OrchestrationStatus, Runtime};
use crate::Event;

/// Derive the status from a history; the last terminal event wins.
pub fn status_from_history(history: &[Event]) -> OrchestrationStatus {
    if history.is_empty() {
        return OrchestrationStatus::NotFound;
    }
    for e in history.iter().rev() {
        match e {
            Event::OrchestrationCompleted { output } => {
                return OrchestrationStatus::Completed { output: output.clone() };
            }
            Event::OrchestrationFailed { error } => return OrchestrationStatus::Failed { error: error.clone() },
            Event::OrchestrationTerminated { reason } => {
                return OrchestrationStatus::Terminated { reason: reason.clone() };
            }
            _ => {}
        }
    }
    OrchestrationStatus::Running
}

pub fn descriptor_from_history(history: &[Event]) -> Option<OrchestrationDescriptor> {
    history.iter().find_map(|e| match e {
        Event::OrchestrationStarted {
            name,
            started_at_ms,
            parent_instance,
            parent_id,
            ..
        } => Some(OrchestrationDescriptor {
            name: name.clone(),
            parent_instance: parent_instance.clone(),
            parent_id: *parent_id,
            started_at_ms: *started_at_ms,
        }),
        _ => None,
    })
}

impl Runtime {
    pub async fn get_orchestration_status(&self, instance: &str) -> OrchestrationStatus {
        status_from_history(&self.history_store.read(instance).await)
    }

    /// Name, start time and parent linkage recorded when the instance started.
    pub async fn get_orchestration_descriptor(&self, instance: &str) -> Option<OrchestrationDescriptor> {
        descriptor_from_history(&self.history_store.read(instance).await)
    }

    pub async fn get_history(&self, instance: &str) -> Vec<Event> {
        self.history_store.read(instance).await
    }

    pub async fn list_instances(&self) -> Vec<String> {
        self.history_store.list_instances().await
    }
}
