//! The uniform session contract every protocol variant implements, plus the
//! per-transfer control handle shared between a worker and the session
//! driving its bytes.

use crate::error::{XfrError, XfrResult};
use crate::events::{Event, EventBus};
use crate::types::{ConnectionProfile, RemoteEntry, TaskId, TransferOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// One live connection to one remote endpoint.
///
/// Every operation takes `&mut self`, so a session can never have two
/// operations in flight.
#[async_trait]
pub trait RemoteSession: Send {
    fn profile_id(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn list(&mut self, path: &str) -> XfrResult<Vec<RemoteEntry>>;

    /// Download `remote` into `local` starting at `offset`.
    async fn get(
        &mut self,
        remote: &str,
        local: &Path,
        offset: u64,
        handle: &TransferHandle,
    ) -> XfrResult<TransferOutcome>;

    /// Upload `local` to `remote` starting at `offset`.
    async fn put(
        &mut self,
        local: &Path,
        remote: &str,
        offset: u64,
        handle: &TransferHandle,
    ) -> XfrResult<TransferOutcome>;

    /// Create `path` and any missing parents. Succeeds if it already exists.
    async fn mkdir(&mut self, path: &str) -> XfrResult<()>;

    /// Remove a file or an empty directory. Succeeds if it is already gone.
    async fn delete(&mut self, path: &str) -> XfrResult<()>;

    async fn rename(&mut self, from: &str, to: &str) -> XfrResult<()>;

    /// `None` when the path does not exist.
    async fn stat(&mut self, path: &str) -> XfrResult<Option<RemoteEntry>>;

    async fn set_modified(&mut self, path: &str, modified: DateTime<Utc>) -> XfrResult<()>;

    /// Release the transport. Safe to call more than once.
    async fn close(&mut self) -> XfrResult<()>;
}

/// Opens sessions for profiles. Implemented by the protocol factory and by
/// test doubles.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, profile: &ConnectionProfile) -> XfrResult<Box<dyn RemoteSession>>;
}

// ── Transfer handle ──────────────────────────────────────────────────

/// Default minimum spacing between two `transfer-progress` events.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

struct HandleInner {
    task_id: Option<TaskId>,
    events: Option<EventBus>,
    pause: AtomicBool,
    cancel: AtomicBool,
    offset: AtomicU64,
    interval: Duration,
    bandwidth_limit: Option<u64>,
    state: Mutex<ProgressState>,
}

struct ProgressState {
    total: Option<u64>,
    last_emit: Option<Instant>,
    started: Instant,
    start_offset: u64,
}

/// Shared between the transfer manager (pause requests, progress reads) and
/// the session moving the bytes (pause checks, progress writes).
#[derive(Clone)]
pub struct TransferHandle {
    inner: Arc<HandleInner>,
}

impl TransferHandle {
    pub fn new(task_id: TaskId, events: EventBus, interval: Duration) -> Self {
        Self::build(Some(task_id), Some(events), interval, None)
    }

    /// A handle that publishes nothing, for one-off calls outside the queue.
    pub fn detached() -> Self {
        Self::build(None, None, DEFAULT_PROGRESS_INTERVAL, None)
    }

    pub fn with_bandwidth_limit(self, bytes_per_sec: Option<u64>) -> Self {
        let inner = &self.inner;
        Self::build(
            inner.task_id,
            inner.events.clone(),
            inner.interval,
            bytes_per_sec.filter(|b| *b > 0),
        )
    }

    fn build(
        task_id: Option<TaskId>,
        events: Option<EventBus>,
        interval: Duration,
        bandwidth_limit: Option<u64>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                task_id,
                events,
                pause: AtomicBool::new(false),
                cancel: AtomicBool::new(false),
                offset: AtomicU64::new(0),
                interval,
                bandwidth_limit,
                state: Mutex::new(ProgressState {
                    total: None,
                    last_emit: None,
                    started: Instant::now(),
                    start_offset: 0,
                }),
            }),
        }
    }

    pub fn task_id(&self) -> Option<TaskId> {
        self.inner.task_id
    }

    // ── pause ────────────────────────────────────────────────────

    pub fn request_pause(&self) {
        self.inner.pause.store(true, Ordering::SeqCst);
    }

    /// Checked by sessions between chunks.
    pub fn pause_requested(&self) -> bool {
        self.inner.pause.load(Ordering::SeqCst)
    }

    // ── cancel ───────────────────────────────────────────────────

    /// Stop at the next chunk boundary. Sessions whose I/O runs on a
    /// blocking thread outlive the aborted future, so they poll this too.
    pub fn request_cancel(&self) {
        self.inner.cancel.store(true, Ordering::SeqCst);
    }

    pub fn cancel_requested(&self) -> bool {
        self.inner.cancel.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once a cancel was requested.
    pub fn check_cancelled(&self) -> XfrResult<()> {
        if self.cancel_requested() {
            Err(XfrError::cancelled("transfer cancelled"))
        } else {
            Ok(())
        }
    }

    // ── progress ─────────────────────────────────────────────────

    /// Called once the session knows where the transfer starts and how big
    /// the source is.
    pub fn begin(&self, offset: u64, total: Option<u64>) {
        self.inner.offset.store(offset, Ordering::SeqCst);
        if let Ok(mut st) = self.inner.state.lock() {
            st.total = total;
            st.started = Instant::now();
            st.start_offset = offset;
        }
    }

    /// Offset reached so far.
    pub fn offset(&self) -> u64 {
        self.inner.offset.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> Option<u64> {
        self.inner.state.lock().ok().and_then(|st| st.total)
    }

    /// Record progress after a chunk. Publishes at most once per interval.
    pub fn advance(&self, offset: u64) {
        self.inner.offset.store(offset, Ordering::SeqCst);
        let due = match self.inner.state.lock() {
            Ok(mut st) => {
                let now = Instant::now();
                let due = st
                    .last_emit
                    .map_or(true, |last| now.duration_since(last) >= self.inner.interval);
                if due {
                    st.last_emit = Some(now);
                }
                due.then_some(st.total)
            }
            Err(_) => None,
        };
        if let Some(total) = due {
            self.emit_progress(offset, total);
        }
    }

    /// Publish the final progress value regardless of the rate limit.
    pub fn finish(&self, offset: u64) {
        self.inner.offset.store(offset, Ordering::SeqCst);
        let total = self.total();
        self.emit_progress(offset, total);
    }

    fn emit_progress(&self, offset: u64, total: Option<u64>) {
        if self.cancel_requested() {
            return;
        }
        if let (Some(task_id), Some(bus)) = (self.inner.task_id, &self.inner.events) {
            bus.publish(Event::TransferProgress {
                task_id,
                bytes_done: offset,
                bytes_total: total,
            });
        }
    }

    /// Report a non-fatal degradation (e.g. resume not supported).
    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        log::warn!("{}", message);
        if let Some(bus) = &self.inner.events {
            bus.publish(Event::TransferWarning {
                task_id: self.inner.task_id,
                message,
            });
        }
    }

    // ── bandwidth ────────────────────────────────────────────────

    /// How long to sleep so the average rate stays under the configured limit.
    pub fn throttle_delay(&self) -> Option<Duration> {
        let limit = self.inner.bandwidth_limit?;
        let st = self.inner.state.lock().ok()?;
        let moved = self.offset().saturating_sub(st.start_offset);
        let expected = Duration::from_secs_f64(moved as f64 / limit as f64);
        expected.checked_sub(st.started.elapsed())
    }

    pub async fn throttle(&self) {
        if let Some(d) = self.throttle_delay() {
            tokio::time::sleep(d).await;
        }
    }

    /// Blocking variant for sessions driven from `spawn_blocking`.
    pub fn throttle_blocking(&self) {
        if let Some(d) = self.throttle_delay() {
            std::thread::sleep(d);
        }
    }
}
