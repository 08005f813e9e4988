use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::providers::{HistoryStore, QueueKind, WorkItem};

#[derive(Debug)]
pub(crate) enum TimerCommand {
    Schedule { instance: String, id: u64, fire_at_ms: u64 },
    Cancel { instance: String, id: u64 },
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(crate::duration_ms)
        .unwrap_or(0)
}

/// In-process timer wheel. Due timers become `TimerFired` items on the
/// orchestrator queue.
pub(crate) struct TimerService {
    store: Arc<dyn HistoryStore>,
    // (due, instance, id), ordered by due time.
    due: BTreeSet<(Instant, String, u64)>,
    by_key: HashMap<(String, u64), (Instant, u64)>,
}

impl TimerService {
    /// Spawn the service. It stops when the returned set is dropped.
    pub(crate) fn start(store: Arc<dyn HistoryStore>) -> (JoinSet<()>, mpsc::UnboundedSender<TimerCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let svc = TimerService {
            store,
            due: BTreeSet::new(),
            by_key: HashMap::new(),
        };
        let mut task = JoinSet::new();
        task.spawn(svc.run(rx));
        (task, tx)
    }

    fn schedule(&mut self, instance: String, id: u64, fire_at_ms: u64) {
        let key = (instance, id);
        if self.by_key.contains_key(&key) {
            return;
        }
        let delay = Duration::from_millis(fire_at_ms.saturating_sub(now_ms()));
        let at = Instant::now() + delay;
        self.due.insert((at, key.0.clone(), id));
        self.by_key.insert(key, (at, fire_at_ms));
    }

    fn cancel(&mut self, instance: String, id: u64) {
        if let Some((at, _)) = self.by_key.remove(&(instance.clone(), id)) {
            self.due.remove(&(at, instance, id));
        }
    }

    async fn fire_due(&mut self) {
        let now = Instant::now();
        while let Some((at, _, _)) = self.due.first()
            && *at <= now
        {
            let Some((_, instance, id)) = self.due.pop_first() else {
                break;
            };
            let Some((_, fire_at_ms)) = self.by_key.remove(&(instance.clone(), id)) else {
                continue;
            };
            debug!(instance, id, fire_at_ms, "timer due");
            if let Err(e) = self
                .store
                .enqueue_work(
                    QueueKind::Orchestrator,
                    WorkItem::TimerFired {
                        instance: instance.clone(),
                        id,
                        fire_at_ms,
                    },
                )
                .await
            {
                warn!(instance, id, error = %e, "failed to enqueue TimerFired");
            }
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<TimerCommand>) {
        loop {
            self.fire_due().await;
            let next = self.due.first().map(|(at, _, _)| *at);
            let cmd = match next {
                Some(at) => tokio::select! {
                    cmd = rx.recv() => cmd,
                    _ = tokio::time::sleep_until(at) => continue,
                },
                None => rx.recv().await,
            };
            match cmd {
                Some(TimerCommand::Schedule {
                    instance,
                    id,
                    fire_at_ms,
                }) => self.schedule(instance, id, fire_at_ms),
                Some(TimerCommand::Cancel { instance, id }) => self.cancel(instance, id),
                None => break,
            }
        }
    }
}
