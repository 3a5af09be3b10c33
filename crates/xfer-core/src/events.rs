//! Event channel between the engine and whoever drives it.
//!
//! The bus is an explicit `tokio::sync::broadcast` handle: the owner creates
//! one per application session and clones it into every component that
//! publishes. Publishing never blocks; slow subscribers observe `Lagged`.

use crate::error::ErrorKind;
use crate::types::{Direction, EntryMeta, RemoteEntry, TaskId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Counts describing a computed sync plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub create_dirs: usize,
    pub uploads: usize,
    pub downloads: usize,
    pub deletes: usize,
    pub conflicts: usize,
    pub skipped: usize,
    pub bytes: u64,
    pub dry_run: bool,
}

impl SyncSummary {
    pub fn is_empty(&self) -> bool {
        self.create_dirs + self.uploads + self.downloads + self.deletes + self.conflicts == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "kind",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum Event {
    Connected {
        profile_id: String,
    },
    Disconnected {
        profile_id: String,
        reason: String,
    },
    ListingUpdated {
        profile_id: String,
        path: String,
        entries: Vec<RemoteEntry>,
    },
    TransferQueued {
        task_id: TaskId,
        direction: Direction,
        remote_path: String,
    },
    TransferStarted {
        task_id: TaskId,
        attempt: u32,
        offset: u64,
    },
    TransferProgress {
        task_id: TaskId,
        bytes_done: u64,
        bytes_total: Option<u64>,
    },
    TransferCompleted {
        task_id: TaskId,
        bytes: u64,
    },
    TransferFailed {
        task_id: TaskId,
        error_kind: ErrorKind,
        reason: String,
    },
    TransferPaused {
        task_id: TaskId,
        offset: u64,
    },
    TransferCancelled {
        task_id: TaskId,
    },
    TransferRetryScheduled {
        task_id: TaskId,
        attempt: u32,
        delay_ms: u64,
    },
    /// Non-fatal degradation, e.g. resume unsupported.
    TransferWarning {
        task_id: Option<TaskId>,
        message: String,
    },
    SyncPlanReady {
        summary: SyncSummary,
    },
    ConflictDetected {
        path: String,
        local: Option<EntryMeta>,
        remote: Option<EntryMeta>,
    },
    SyncCompleted {
        summary: SyncSummary,
        failed: usize,
    },
}

impl Event {
    /// The kebab-case name subscribers match on.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Connected { .. } => "connected",
            Event::Disconnected { .. } => "disconnected",
            Event::ListingUpdated { .. } => "listing-updated",
            Event::TransferQueued { .. } => "transfer-queued",
            Event::TransferStarted { .. } => "transfer-started",
            Event::TransferProgress { .. } => "transfer-progress",
            Event::TransferCompleted { .. } => "transfer-completed",
            Event::TransferFailed { .. } => "transfer-failed",
            Event::TransferPaused { .. } => "transfer-paused",
            Event::TransferCancelled { .. } => "transfer-cancelled",
            Event::TransferRetryScheduled { .. } => "transfer-retry-scheduled",
            Event::TransferWarning { .. } => "transfer-warning",
            Event::SyncPlanReady { .. } => "sync-plan-ready",
            Event::ConflictDetected { .. } => "conflict-detected",
            Event::SyncCompleted { .. } => "sync-completed",
        }
    }

    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Event::TransferQueued { task_id, .. }
            | Event::TransferStarted { task_id, .. }
            | Event::TransferProgress { task_id, .. }
            | Event::TransferCompleted { task_id, .. }
            | Event::TransferFailed { task_id, .. }
            | Event::TransferPaused { task_id, .. }
            | Event::TransferCancelled { task_id }
            | Event::TransferRetryScheduled { task_id, .. } => Some(*task_id),
            Event::TransferWarning { task_id, .. } => *task_id,
            _ => None,
        }
    }
}

pub type EventReceiver = broadcast::Receiver<Event>;

/// Cloneable publish handle plus subscriber factory.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Fire-and-forget. An event with no subscriber is dropped.
    pub fn publish(&self, event: Event) {
        log::trace!("event {}", event.name());
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(Event::Connected {
            profile_id: "p".into(),
        });
        assert_eq!(a.recv().await.unwrap().name(), "connected");
        assert_eq!(b.recv().await.unwrap().name(), "connected");
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.publish(Event::TransferCancelled {
            task_id: Uuid::new_v4(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_serialised_shape() {
        let id = Uuid::nil();
        let json = serde_json::to_value(Event::TransferProgress {
            task_id: id,
            bytes_done: 10,
            bytes_total: Some(100),
        })
        .unwrap();
        assert_eq!(json["kind"], "transfer-progress");
        assert_eq!(json["bytesDone"], 10);
        assert_eq!(json["bytesTotal"], 100);
    }
}
