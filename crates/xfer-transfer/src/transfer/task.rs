//! Arena record behind each task id.

use crate::transfer::types::{TransferState, TransferTask};
use chrono::{DateTime, Utc};
use tokio::task::AbortHandle;
use xfer_core::{TaskId, TransferHandle, TransferRequest, XfrError};

pub(crate) struct TaskRecord {
    pub id: TaskId,
    pub request: TransferRequest,
    pub state: TransferState,
    pub offset: u64,
    pub total: Option<u64>,
    pub attempts: u32,
    pub last_error: Option<XfrError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Live while Active: pause flag and progress of the running attempt.
    pub handle: Option<TransferHandle>,
    /// Live while Active: aborts the running attempt.
    pub abort: Option<AbortHandle>,
    /// Bumped whenever the task is (re)queued so stale retry timers and
    /// finished attempts can tell they no longer own the task.
    pub generation: u64,
}

impl TaskRecord {
    pub fn new(id: TaskId, request: TransferRequest) -> Self {
        let now = Utc::now();
        Self {
            id,
            offset: request.offset,
            total: request.size_hint,
            request,
            state: TransferState::Queued,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            handle: None,
            abort: None,
            generation: 0,
        }
    }

    pub fn set_state(&mut self, state: TransferState) {
        self.state = state;
        self.updated_at = Utc::now();
        if state != TransferState::Active {
            self.handle = None;
            self.abort = None;
        }
    }

    pub fn snapshot(&self) -> TransferTask {
        TransferTask {
            id: self.id,
            profile_id: self.request.profile.id.clone(),
            direction: self.request.direction,
            local_path: self.request.local_path.clone(),
            remote_path: self.request.remote_path.clone(),
            offset: self
                .handle
                .as_ref()
                .map(|h| h.offset())
                .unwrap_or(self.offset),
            total: self
                .handle
                .as_ref()
                .and_then(|h| h.total())
                .or(self.total),
            state: self.state,
            attempts: self.attempts,
            last_error: self.last_error.as_ref().map(|e| e.message.clone()),
            last_error_kind: self.last_error.as_ref().map(|e| e.kind),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}
