use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::ErrorEnvelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Upload,
    Download,
    Delete,
    Rename,
    Copy,
    Move,
    CreateDir,
    Repair,
    MultiOperation,
}

/// Status notifications posted in operation-task order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StatusEvent {
    Started {
        op: OperationKind,
        allocation_id: String,
        path: String,
        size: u64,
    },
    Progress {
        op: OperationKind,
        allocation_id: String,
        path: String,
        completed: u64,
        total: u64,
    },
    Completed {
        op: OperationKind,
        allocation_id: String,
        path: String,
        size: u64,
    },
    Error {
        op: OperationKind,
        allocation_id: String,
        path: String,
        error: ErrorEnvelope,
    },
    RepairCompleted {
        allocation_id: String,
        files_repaired: u64,
    },
}

const CHANNEL_CAPACITY: usize = 1024;

/// Fan-out of status events. Posting with no subscriber is a no-op.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StatusEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    pub fn post(&self, event: StatusEvent) {
        if self.tx.send(event).is_err() {
            debug!("Status event dropped, no subscribers");
        }
    }
}
