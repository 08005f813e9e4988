use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;

use super::{HistoryStore, QueueKind, WorkItem, dedupe_outcomes};
use crate::Event;

#[derive(Default)]
struct Queue {
    ready: VecDeque<WorkItem>,
    locked: HashMap<String, WorkItem>,
}

/// Process-local store; everything is lost when it is dropped.
pub struct InMemoryHistoryStore {
    histories: Mutex<HashMap<String, Vec<Event>>>,
    queues: Mutex<HashMap<QueueKind, Queue>>,
    next_token: AtomicU64,
    cap: usize,
}

impl Default for InMemoryHistoryStore {
    fn default() -> Self {
        Self::with_cap(4096)
    }
}

impl InMemoryHistoryStore {
    pub fn with_cap(cap: usize) -> Self {
        Self {
            histories: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            cap,
        }
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn read(&self, instance: &str) -> Vec<Event> {
        self.histories.lock().await.get(instance).cloned().unwrap_or_default()
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), String> {
        let mut histories = self.histories.lock().await;
        let hist = histories
            .get_mut(instance)
            .ok_or_else(|| format!("instance not found: {instance}"))?;
        let mut to_add = dedupe_outcomes(hist, new_events);
        if hist.len() + to_add.len() > self.cap {
            return Err(format!(
                "history cap exceeded (cap={}, have={}, append={})",
                self.cap,
                hist.len(),
                to_add.len()
            ));
        }
        hist.append(&mut to_add);
        Ok(())
    }

    async fn reset(&self) {
        self.histories.lock().await.clear();
        self.queues.lock().await.clear();
    }

    async fn list_instances(&self) -> Vec<String> {
        let mut out: Vec<String> = self.histories.lock().await.keys().cloned().collect();
        out.sort();
        out
    }

    async fn dump_all_pretty(&self) -> String {
        let histories = self.histories.lock().await;
        let mut names: Vec<&String> = histories.keys().collect();
        names.sort();
        let mut out = String::new();
        for inst in names {
            out.push_str(&format!("instance={inst}\n"));
            for ev in &histories[inst] {
                out.push_str(&format!("  {ev:?}\n"));
            }
        }
        out
    }

    async fn create_instance(&self, instance: &str) -> Result<(), String> {
        let mut histories = self.histories.lock().await;
        if histories.contains_key(instance) {
            return Err(format!("instance already exists: {instance}"));
        }
        histories.insert(instance.to_string(), Vec::new());
        Ok(())
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), String> {
        self.histories
            .lock()
            .await
            .remove(instance)
            .map(|_| ())
            .ok_or_else(|| format!("instance not found: {instance}"))
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), String> {
        let mut queues = self.queues.lock().await;
        let q = queues.entry(kind).or_default();
        if !q.ready.iter().any(|queued| queued.same_work(&item)) {
            q.ready.push_back(item);
        }
        Ok(())
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let mut queues = self.queues.lock().await;
        let q = queues.get_mut(&kind)?;
        let item = q.ready.pop_front()?;
        let token = format!("mem-{}", self.next_token.fetch_add(1, Ordering::Relaxed));
        q.locked.insert(token.clone(), item.clone());
        Some((item, token))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        if let Some(q) = self.queues.lock().await.get_mut(&kind) {
            q.locked.remove(token);
        }
        Ok(())
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        if let Some(q) = self.queues.lock().await.get_mut(&kind)
            && let Some(item) = q.locked.remove(token)
        {
            q.ready.push_front(item);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fired(id: u64) -> WorkItem {
        WorkItem::TimerFired {
            instance: "i".into(),
            id,
            fire_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn peek_lock_hides_until_abandoned() {
        let store = InMemoryHistoryStore::default();
        store.enqueue_work(QueueKind::Orchestrator, fired(1)).await.unwrap();
        store.enqueue_work(QueueKind::Orchestrator, fired(1)).await.unwrap();
        store.enqueue_work(QueueKind::Orchestrator, fired(2)).await.unwrap();

        let (first, token) = store.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap();
        assert_eq!(first, fired(1));
        store.abandon(QueueKind::Orchestrator, &token).await.unwrap();

        let (again, token) = store.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap();
        assert_eq!(again, fired(1));
        store.ack(QueueKind::Orchestrator, &token).await.unwrap();
        let (second, _) = store.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap();
        assert_eq!(second, fired(2));
        assert!(store.dequeue_peek_lock(QueueKind::Orchestrator).await.is_none());
    }
}
