use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tokio::{fs, io::AsyncWriteExt};
use tracing::warn;

use super::{HistoryStore, QueueKind, WorkItem, dedupe_outcomes};
use crate::Event;

static LOCK_SEQ: AtomicU64 = AtomicU64::new(0);

/// Filesystem-backed store: one `history.jsonl` per instance directory and
/// one JSONL file per queue. Locked queue items live in sidecar files under
/// `.locks/` until acked or abandoned.
pub struct FsHistoryStore {
    root: PathBuf,
    orch_queue_file: PathBuf,
    work_queue_file: PathBuf,
    timer_queue_file: PathBuf,
    cap: usize,
    // Serializes read-modify-write cycles on queue files.
    queue_lock: Mutex<()>,
}

impl FsHistoryStore {
    /// Open a store rooted at `root`. With `reset_on_create` any existing
    /// data is deleted; otherwise items left locked by a previous process
    /// are returned to their queues.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Self {
        let path = root.as_ref().to_path_buf();
        if reset_on_create {
            let _ = std::fs::remove_dir_all(&path);
        }
        let _ = std::fs::create_dir_all(&path);
        let store = Self {
            orch_queue_file: path.join("orch-queue.jsonl"),
            work_queue_file: path.join("work-queue.jsonl"),
            timer_queue_file: path.join("timer-queue.jsonl"),
            root: path,
            cap: 4096,
            queue_lock: Mutex::new(()),
        };
        if !reset_on_create {
            for kind in [QueueKind::Orchestrator, QueueKind::Worker, QueueKind::Timer] {
                if let Err(e) = store.requeue_stale_locks(kind) {
                    warn!(?kind, error = %e, "failed to recover locked queue items");
                }
            }
        }
        store
    }

    /// Same as `new` with a custom per-instance history cap.
    pub fn new_with_cap(root: impl AsRef<Path>, reset_on_create: bool, cap: usize) -> Self {
        let mut s = Self::new(root, reset_on_create);
        s.cap = cap;
        s
    }

    fn inst_root(&self, instance: &str) -> PathBuf {
        self.root.join(instance)
    }

    fn history_path(&self, instance: &str) -> PathBuf {
        self.inst_root(instance).join("history.jsonl")
    }

    fn lock_dir(&self, kind: QueueKind) -> PathBuf {
        match kind {
            QueueKind::Orchestrator => self.root.join(".locks/orch"),
            QueueKind::Worker => self.root.join(".locks/work"),
            QueueKind::Timer => self.root.join(".locks/timer"),
        }
    }

    fn lock_path(&self, kind: QueueKind, token: &str) -> PathBuf {
        self.lock_dir(kind).join(format!("{token}.lock"))
    }

    fn queue_file(&self, kind: QueueKind) -> &Path {
        match kind {
            QueueKind::Orchestrator => &self.orch_queue_file,
            QueueKind::Worker => &self.work_queue_file,
            QueueKind::Timer => &self.timer_queue_file,
        }
    }

    fn read_queue(&self, kind: QueueKind) -> Vec<WorkItem> {
        std::fs::read_to_string(self.queue_file(kind))
            .unwrap_or_default()
            .lines()
            .filter_map(|l| serde_json::from_str::<WorkItem>(l).ok())
            .collect()
    }

    /// Rewrite a queue file through a temp file and rename.
    fn write_queue(&self, kind: QueueKind, items: &[WorkItem]) -> Result<(), String> {
        let qf = self.queue_file(kind);
        let tmp = qf.with_extension("jsonl.tmp");
        {
            let mut tf = std::fs::File::create(&tmp).map_err(|e| e.to_string())?;
            for it in items {
                let line = serde_json::to_string(it).map_err(|e| e.to_string())?;
                tf.write_all(line.as_bytes()).map_err(|e| e.to_string())?;
                tf.write_all(b"\n").map_err(|e| e.to_string())?;
            }
        }
        std::fs::rename(&tmp, qf).map_err(|e| e.to_string())
    }

    fn requeue_stale_locks(&self, kind: QueueKind) -> Result<(), String> {
        let Ok(rd) = std::fs::read_dir(self.lock_dir(kind)) else {
            return Ok(());
        };
        let mut recovered = Vec::new();
        for ent in rd.flatten() {
            let path = ent.path();
            let data = std::fs::read_to_string(&path).map_err(|e| e.to_string())?;
            if let Ok(item) = serde_json::from_str::<WorkItem>(&data) {
                recovered.push(item);
            }
            std::fs::remove_file(&path).map_err(|e| e.to_string())?;
        }
        if recovered.is_empty() {
            return Ok(());
        }
        let mut items = self.read_queue(kind);
        // Queued work, and the lock with the most retry progress, supersede older locks.
        let attempts = |it: &WorkItem| match it {
            WorkItem::ActivityExecute {
                backoff: Some(b), ..
            } => b.attempts,
            _ => 0,
        };
        recovered.sort_by_key(|it| std::cmp::Reverse(attempts(it)));
        let mut requeued: Vec<WorkItem> = Vec::new();
        for it in recovered {
            if !requeued.iter().chain(items.iter()).any(|queued| queued.same_work(&it)) {
                requeued.push(it);
            }
        }
        if requeued.is_empty() {
            return Ok(());
        }
        requeued.append(&mut items);
        self.write_queue(kind, &requeued)
    }

    fn new_token() -> String {
        let now_ns = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let seq = LOCK_SEQ.fetch_add(1, Ordering::Relaxed);
        format!("{now_ns:x}-{:x}-{seq:x}", std::process::id())
    }
}

#[async_trait::async_trait]
impl HistoryStore for FsHistoryStore {
    async fn read(&self, instance: &str) -> Vec<Event> {
        let data = fs::read_to_string(self.history_path(instance)).await.unwrap_or_default();
        data.lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str::<Event>(l).ok())
            .collect()
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), String> {
        let path = self.history_path(instance);
        if !fs::try_exists(&path).await.map_err(|e| e.to_string())? {
            return Err(format!("instance not found: {instance}"));
        }
        let existing = self.read(instance).await;
        let to_write = dedupe_outcomes(&existing, new_events);
        if existing.len() + to_write.len() > self.cap {
            return Err(format!(
                "history cap exceeded (cap={}, have={}, append={})",
                self.cap,
                existing.len(),
                to_write.len()
            ));
        }
        let mut buf = String::new();
        for ev in &to_write {
            buf.push_str(&serde_json::to_string(ev).map_err(|e| e.to_string())?);
            buf.push('\n');
        }
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|e| e.to_string())?;
        file.write_all(buf.as_bytes()).await.map_err(|e| e.to_string())?;
        file.flush().await.map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn reset(&self) {
        let _guard = self.queue_lock.lock().await;
        let _ = fs::remove_dir_all(&self.root).await;
        let _ = fs::create_dir_all(&self.root).await;
    }

    async fn list_instances(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Ok(mut rd) = fs::read_dir(&self.root).await {
            while let Ok(Some(ent)) = rd.next_entry().await {
                let is_dir = ent.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                if let Some(name) = ent.file_name().to_str()
                    && is_dir
                    && !name.starts_with('.')
                {
                    out.push(name.to_string());
                }
            }
        }
        out.sort();
        out
    }

    async fn dump_all_pretty(&self) -> String {
        let mut out = String::new();
        for inst in self.list_instances().await {
            out.push_str(&format!("instance={inst}\n"));
            for ev in self.read(&inst).await {
                out.push_str(&format!("  {ev:?}\n"));
            }
        }
        out
    }

    async fn create_instance(&self, instance: &str) -> Result<(), String> {
        let inst_dir = self.inst_root(instance);
        if fs::try_exists(&inst_dir).await.map_err(|e| e.to_string())? {
            return Err(format!("instance already exists: {instance}"));
        }
        fs::create_dir_all(&inst_dir).await.map_err(|e| e.to_string())?;
        fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(self.history_path(instance))
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), String> {
        let inst_dir = self.inst_root(instance);
        if !fs::try_exists(&inst_dir).await.map_err(|e| e.to_string())? {
            return Err(format!("instance not found: {instance}"));
        }
        fs::remove_dir_all(&inst_dir).await.map_err(|e| e.to_string())
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), String> {
        let _guard = self.queue_lock.lock().await;
        let mut items = self.read_queue(kind);
        if items.iter().any(|queued| queued.same_work(&item)) {
            return Ok(());
        }
        items.push(item);
        self.write_queue(kind, &items)
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let _guard = self.queue_lock.lock().await;
        let mut items = self.read_queue(kind);
        if items.is_empty() {
            return None;
        }
        let first = items.remove(0);
        let token = Self::new_token();
        std::fs::create_dir_all(self.lock_dir(kind)).ok()?;
        let line = serde_json::to_string(&first).ok()?;
        // Sidecar first, then shrink the queue.
        std::fs::write(self.lock_path(kind, &token), line).ok()?;
        if let Err(e) = self.write_queue(kind, &items) {
            warn!(?kind, error = %e, "failed to rewrite queue after dequeue");
            let _ = std::fs::remove_file(self.lock_path(kind, &token));
            return None;
        }
        Some((first, token))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        let _guard = self.queue_lock.lock().await;
        let path = self.lock_path(kind, token);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        let _guard = self.queue_lock.lock().await;
        let path = self.lock_path(kind, token);
        if !path.exists() {
            return Ok(());
        }
        let data = std::fs::read_to_string(&path).map_err(|e| e.to_string())?;
        let item: WorkItem = serde_json::from_str(&data).map_err(|e| e.to_string())?;
        let mut items = self.read_queue(kind);
        items.insert(0, item);
        self.write_queue(kind, &items)?;
        std::fs::remove_file(&path).map_err(|e| e.to_string())
    }
}
