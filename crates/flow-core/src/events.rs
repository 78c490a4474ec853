use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::kind::NodeId;

pub type RunId = Uuid;

/// Events emitted during graph execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    RunStarted {
        run_id: RunId,
        target: NodeId,
        timestamp: DateTime<Utc>,
    },
    RunCompleted {
        run_id: RunId,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeStarted {
        run_id: RunId,
        node_id: NodeId,
        name: String,
        timestamp: DateTime<Utc>,
    },
    /// The node's output was adopted from the value store; `process` was
    /// not called and the node was not initialized.
    NodeCached {
        run_id: RunId,
        node_id: NodeId,
        name: String,
        timestamp: DateTime<Utc>,
    },
    NodeCompleted {
        run_id: RunId,
        node_id: NodeId,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeFailed {
        run_id: RunId,
        node_id: NodeId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    ResourcesReleased {
        timestamp: DateTime<Utc>,
    },
    BatchStarted {
        run_id: RunId,
        items: usize,
        levels: usize,
        timestamp: DateTime<Utc>,
    },
    BatchItemFailed {
        run_id: RunId,
        item_index: usize,
        node_id: NodeId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    BatchCompleted {
        run_id: RunId,
        completed: usize,
        failed: usize,
        timestamp: DateTime<Utc>,
    },
}

/// Broadcast bus for execution events. Lossy: events sent with no
/// subscribers are dropped.
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
