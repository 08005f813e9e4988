use std::collections::HashMap;

use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Messages delivered from the orchestrator queue to a running instance
/// driver. `ack_token` is the peek-lock token to ack once the message is
/// persisted (or abandon if the driver dehydrates first).
#[derive(Debug, Clone)]
pub enum OrchestratorMsg {
    ActivityCompleted {
        instance: String,
        id: u64,
        result: String,
        ack_token: Option<String>,
    },
    ActivityFailed {
        instance: String,
        id: u64,
        error: String,
        attempts: u32,
        ack_token: Option<String>,
    },
    TimerFired {
        instance: String,
        id: u64,
        fire_at_ms: u64,
        ack_token: Option<String>,
    },
    ExternalByName {
        instance: String,
        name: String,
        data: String,
        ack_token: Option<String>,
    },
    SubOrchCompleted {
        instance: String,
        id: u64,
        result: String,
        ack_token: Option<String>,
    },
    SubOrchFailed {
        instance: String,
        id: u64,
        error: String,
        ack_token: Option<String>,
    },
    TerminateRequested {
        instance: String,
        reason: String,
        ack_token: Option<String>,
    },
}

impl OrchestratorMsg {
    pub fn instance(&self) -> &str {
        match self {
            OrchestratorMsg::ActivityCompleted { instance, .. }
            | OrchestratorMsg::ActivityFailed { instance, .. }
            | OrchestratorMsg::TimerFired { instance, .. }
            | OrchestratorMsg::ExternalByName { instance, .. }
            | OrchestratorMsg::SubOrchCompleted { instance, .. }
            | OrchestratorMsg::SubOrchFailed { instance, .. }
            | OrchestratorMsg::TerminateRequested { instance, .. } => instance,
        }
    }

    pub fn ack_token(&self) -> Option<&str> {
        match self {
            OrchestratorMsg::ActivityCompleted { ack_token, .. }
            | OrchestratorMsg::ActivityFailed { ack_token, .. }
            | OrchestratorMsg::TimerFired { ack_token, .. }
            | OrchestratorMsg::ExternalByName { ack_token, .. }
            | OrchestratorMsg::SubOrchCompleted { ack_token, .. }
            | OrchestratorMsg::SubOrchFailed { ack_token, .. }
            | OrchestratorMsg::TerminateRequested { ack_token, .. } => ack_token.as_deref(),
        }
    }
}

/// Per-instance inboxes for active instance drivers.
pub struct InstanceRouter {
    pub(crate) inboxes: Mutex<HashMap<String, mpsc::UnboundedSender<OrchestratorMsg>>>,
}

impl InstanceRouter {
    pub fn new() -> Self {
        Self {
            inboxes: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register(&self, instance: &str) -> mpsc::UnboundedReceiver<OrchestratorMsg> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.lock().await.insert(instance.to_string(), tx);
        rx
    }

    pub async fn unregister(&self, instance: &str) {
        self.inboxes.lock().await.remove(instance);
    }

    /// Deliver to the instance inbox, handing the message back if the
    /// instance has no live inbox.
    pub async fn try_send(&self, msg: OrchestratorMsg) -> Result<(), OrchestratorMsg> {
        let inboxes = self.inboxes.lock().await;
        match inboxes.get(msg.instance()) {
            Some(tx) => tx.send(msg).map_err(|e| e.0),
            None => {
                debug!(instance = %msg.instance(), "no inbox registered");
                Err(msg)
            }
        }
    }
}

impl Default for InstanceRouter {
    fn default() -> Self {
        Self::new()
    }
}
