//! Nondeterminism checks run by the instance driver between turns.
use crate::{ClaimedIdsSnapshot, Event};

/// Completion kinds tracked between turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompletionKind {
    Activity,
    Timer,
    External,
    SubOrchestration,
}

impl CompletionKind {
    fn of(e: &Event) -> Option<(Self, u64)> {
        match e {
            Event::ActivityCompleted { id, .. } | Event::ActivityFailed { id, .. } => Some((Self::Activity, *id)),
            Event::TimerFired { id, .. } => Some((Self::Timer, *id)),
            Event::ExternalEventReceived { id, .. } => Some((Self::External, *id)),
            Event::SubOrchestrationCompleted { id, .. } | Event::SubOrchestrationFailed { id, .. } => {
                Some((Self::SubOrchestration, *id))
            }
            _ => None,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Activity => "activity",
            Self::Timer => "timer",
            Self::External => "external",
            Self::SubOrchestration => "sub-orchestration",
        }
    }

    fn scheduled_by(self, e: &Event, id: u64) -> bool {
        match (self, e) {
            (Self::Activity, Event::ActivityScheduled { id: sid, .. })
            | (Self::Timer, Event::TimerCreated { id: sid, .. })
            | (Self::External, Event::ExternalSubscribed { id: sid, .. })
            | (Self::SubOrchestration, Event::SubOrchestrationScheduled { id: sid, .. }) => *sid == id,
            _ => false,
        }
    }
}

fn is_schedule(e: &Event) -> bool {
    matches!(
        e,
        Event::ActivityScheduled { .. }
            | Event::TimerCreated { .. }
            | Event::ExternalSubscribed { .. }
            | Event::SubOrchestrationScheduled { .. }
    )
}

/// With prior schedules and no completions, a replay must reproduce the
/// same schedules; any net-new schedule means the code diverged.
pub(crate) fn detect_frontier_nondeterminism(prior: &[Event], deltas: &[Event]) -> Option<String> {
    let had_schedule = prior.iter().any(is_schedule);
    let had_completion = prior.iter().any(Event::is_completion);
    if !had_schedule || had_completion {
        return None;
    }
    deltas
        .iter()
        .find(|e| is_schedule(e))
        .map(|e| format!("nondeterministic: new schedule {e:?} at an unchanged decision frontier"))
}

/// Record the completions appended to `history` from `from` onwards.
pub(crate) fn collect_last_appended(history: &[Event], from: usize, out: &mut Vec<(CompletionKind, u64)>) {
    out.extend(history[from..].iter().filter_map(CompletionKind::of));
}

/// Each completion appended last iteration must belong to a future the
/// replayed code created.
pub(crate) fn detect_await_mismatch(last: &[(CompletionKind, u64)], claims: &ClaimedIdsSnapshot) -> Option<String> {
    last.iter().find_map(|(kind, id)| {
        let claimed = match kind {
            CompletionKind::Activity => &claims.activities,
            CompletionKind::Timer => &claims.timers,
            CompletionKind::External => &claims.externals,
            CompletionKind::SubOrchestration => &claims.sub_orchestrations,
        };
        (!claimed.contains(id)).then(|| {
            format!(
                "nondeterministic: {} completion for id {id} was not awaited by the orchestration",
                kind.label()
            )
        })
    })
}

/// Each appended completion must correlate to a schedule of the same kind.
pub(crate) fn detect_completion_kind_mismatch(prior: &[Event], last: &[(CompletionKind, u64)]) -> Option<String> {
    last.iter().find_map(|(kind, id)| {
        (!prior.iter().any(|e| kind.scheduled_by(e, *id))).then(|| {
            format!(
                "nondeterministic: {} completion for id {id} has no matching schedule",
                kind.label()
            )
        })
    })
}
