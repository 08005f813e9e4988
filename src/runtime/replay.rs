use std::sync::Arc;

use crate::runtime::OrchestrationHandler;
use crate::{Action, ClaimedIdsSnapshot, Event, LogLevel};

/// Everything one replayed turn produced.
pub struct ReplayOutcome {
    /// History after the turn, including schedule events recorded by it.
    pub history: Vec<Event>,
    pub decisions: Vec<Action>,
    pub logs: Vec<(LogLevel, String)>,
    /// `Some` once the orchestration function returned.
    pub output: Option<Result<String, String>>,
    pub claims: ClaimedIdsSnapshot,
}

pub trait ReplayEngine: Send + Sync {
    /// Run one turn. `replay_only` suppresses logging for the whole turn.
    fn replay(
        &self,
        history: Vec<Event>,
        turn_index: u64,
        replay_only: bool,
        handler: Arc<dyn OrchestrationHandler>,
        input: String,
    ) -> ReplayOutcome;
}

/// Replays by polling the handler once with a no-op waker.
#[derive(Default)]
pub struct DefaultReplayEngine;

impl ReplayEngine for DefaultReplayEngine {
    fn replay(
        &self,
        history: Vec<Event>,
        turn_index: u64,
        replay_only: bool,
        handler: Arc<dyn OrchestrationHandler>,
        input: String,
    ) -> ReplayOutcome {
        let orchestrator = |ctx: crate::OrchestrationContext| {
            let h = handler.clone();
            let inp = input.clone();
            async move { h.invoke(ctx, inp).await }
        };
        let (history, decisions, logs, output, claims) =
            crate::run_turn_in_mode(history, turn_index, replay_only, orchestrator);
        ReplayOutcome {
            history,
            decisions,
            logs,
            output,
            claims,
        }
    }
}
