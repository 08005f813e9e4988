//! Storage for instance histories and the three work queues.
//!
//! A provider persists each instance's append-only event log and offers
//! peek-lock queues for orchestrator messages, activity executions and
//! timers. Dequeued items stay invisible until acknowledged; abandoning a
//! token puts the item back at the front of its queue.
use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Event, RetryPolicy};

pub mod fs;
pub mod in_memory;

/// Retry progress carried by a re-enqueued `ActivityExecute`, so that the
/// attempt count and the retry budget survive a restart.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryBackoff {
    /// Attempts already made.
    pub attempts: u32,
    pub first_attempt_at_ms: u64,
    /// Wall-clock time before which the next attempt must not start.
    pub not_before_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Orchestrator,
    Worker,
    Timer,
}

/// Messages exchanged between the runtime's dispatchers through provider queues.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum WorkItem {
    StartOrchestration {
        instance: String,
        orchestration: String,
        input: String,
        parent_instance: Option<String>,
        parent_id: Option<u64>,
    },
    ActivityExecute {
        instance: String,
        id: u64,
        name: String,
        input: String,
        retry: Option<RetryPolicy>,
        /// Set once an attempt failed and the policy asked for another one.
        #[serde(default)]
        backoff: Option<RetryBackoff>,
    },
    ActivityCompleted {
        instance: String,
        id: u64,
        result: String,
    },
    ActivityFailed {
        instance: String,
        id: u64,
        error: String,
        attempts: u32,
    },
    TimerSchedule {
        instance: String,
        id: u64,
        fire_at_ms: u64,
    },
    TimerCancel {
        instance: String,
        id: u64,
    },
    TimerFired {
        instance: String,
        id: u64,
        fire_at_ms: u64,
    },
    ExternalRaised {
        instance: String,
        name: String,
        data: String,
    },
    SubOrchCompleted {
        parent_instance: String,
        parent_id: u64,
        result: String,
    },
    SubOrchFailed {
        parent_instance: String,
        parent_id: u64,
        error: String,
    },
    TerminateInstance {
        instance: String,
        reason: String,
    },
}

impl WorkItem {
    /// Whether `other` describes the same unit of work. An activity execution
    /// is identified by instance and id whatever its retry progress; other
    /// items by their full content.
    pub fn same_work(&self, other: &WorkItem) -> bool {
        match (self, other) {
            (
                WorkItem::ActivityExecute { instance, id, .. },
                WorkItem::ActivityExecute {
                    instance: other_instance,
                    id: other_id,
                    ..
                },
            ) => instance == other_instance && id == other_id,
            _ => self == other,
        }
    }

    /// Instance this item is addressed to.
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::StartOrchestration { instance, .. }
            | WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::TimerSchedule { instance, .. }
            | WorkItem::TimerCancel { instance, .. }
            | WorkItem::TimerFired { instance, .. }
            | WorkItem::ExternalRaised { instance, .. }
            | WorkItem::TerminateInstance { instance, .. } => instance,
            WorkItem::SubOrchCompleted { parent_instance, .. } | WorkItem::SubOrchFailed { parent_instance, .. } => {
                parent_instance
            }
        }
    }
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Full history of an instance; empty if unknown.
    async fn read(&self, instance: &str) -> Vec<Event>;
    /// Append events. Fails for unknown instances. A second completion for
    /// the same correlation id, or a second terminal event, is dropped.
    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), String>;
    async fn reset(&self);
    async fn list_instances(&self) -> Vec<String>;
    async fn dump_all_pretty(&self) -> String;
    /// Create an empty history; errors if the instance already exists.
    async fn create_instance(&self, instance: &str) -> Result<(), String>;
    async fn remove_instance(&self, instance: &str) -> Result<(), String>;

    /// Enqueue a work item. Enqueuing the same work as an item already
    /// waiting in the queue (see [`WorkItem::same_work`]) is a no-op.
    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), String>;
    /// Take the next visible item and a lock token for it.
    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)>;
    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), String>;
    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum OutcomeSlot {
    Activity(u64),
    Timer(u64),
    External(u64),
    SubOrchestration(u64),
    Terminal,
}

fn outcome_slot(ev: &Event) -> Option<OutcomeSlot> {
    match ev {
        Event::ActivityCompleted { id, .. } | Event::ActivityFailed { id, .. } => Some(OutcomeSlot::Activity(*id)),
        Event::TimerFired { id, .. } | Event::TimerCancelled { id } => Some(OutcomeSlot::Timer(*id)),
        Event::ExternalEventReceived { id, .. } => Some(OutcomeSlot::External(*id)),
        Event::SubOrchestrationCompleted { id, .. } | Event::SubOrchestrationFailed { id, .. } => {
            Some(OutcomeSlot::SubOrchestration(*id))
        }
        e if e.is_terminal() => Some(OutcomeSlot::Terminal),
        _ => None,
    }
}

/// Drop completions and terminal events whose slot is already filled, either
/// in `existing` or earlier in `new_events`. A cancelled timer counts as settled.
pub(crate) fn dedupe_outcomes(existing: &[Event], new_events: Vec<Event>) -> Vec<Event> {
    let mut seen: HashSet<OutcomeSlot> = existing.iter().filter_map(outcome_slot).collect();
    new_events
        .into_iter()
        .filter(|ev| match outcome_slot(ev) {
            Some(slot) => seen.insert(slot),
            None => true,
        })
        .collect()
}
