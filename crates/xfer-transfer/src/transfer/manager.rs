//! Transfer manager: FIFO queue drained by a fixed worker pool.
//!
//! Tasks live in an arena keyed by id. A worker claims the queue head,
//! marks it Active, runs the attempt as its own tokio task (so `cancel` can
//! abort it outright) and records the outcome: Completed, Paused at an
//! offset, re-queued after a backoff delay, or Failed.

use crate::transfer::backoff::RetryPolicy;
use crate::transfer::pool::SessionPool;
use crate::transfer::task::TaskRecord;
use crate::transfer::types::{QueueStats, TransferConfig, TransferState, TransferTask};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;
use xfer_core::{
    local, Direction, Event, EventBus, TaskId, TransferHandle, TransferOutcome,
    TransferRequest, XfrError, XfrResult,
};

#[derive(Default)]
struct State {
    tasks: HashMap<TaskId, TaskRecord>,
    queue: VecDeque<TaskId>,
}

struct Inner {
    config: TransferConfig,
    policy: RetryPolicy,
    pool: Arc<SessionPool>,
    events: EventBus,
    state: Mutex<State>,
    work: Notify,
    changed: watch::Sender<u64>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

/// One claimed attempt, copied out of the arena so no lock is held while
/// bytes move.
struct Job {
    id: TaskId,
    generation: u64,
    request: TransferRequest,
    offset: u64,
    attempt: u32,
    handle: TransferHandle,
}

/// Cloneable handle to the queue. Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct TransferManager {
    inner: Arc<Inner>,
}

impl TransferManager {
    pub fn new(config: TransferConfig, pool: Arc<SessionPool>, events: EventBus) -> Self {
        let (changed, _) = watch::channel(0u64);
        let inner = Arc::new(Inner {
            policy: RetryPolicy::from_config(&config),
            config,
            pool,
            events,
            state: Mutex::new(State::default()),
            work: Notify::new(),
            changed,
            workers: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        });

        let count = inner.config.workers.max(1);
        let handles: Vec<JoinHandle<()>> = (0..count)
            .map(|n| tokio::spawn(worker_loop(inner.clone(), n)))
            .collect();
        if let Ok(mut w) = inner.workers.lock() {
            *w = handles;
        }
        info!(workers = count, "transfer manager started");
        Self { inner }
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.inner.pool
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    // ── Commands ─────────────────────────────────────────────────

    /// Append a transfer to the queue tail.
    pub fn enqueue(&self, request: TransferRequest) -> XfrResult<TaskId> {
        let id = Uuid::new_v4();
        let event = Event::TransferQueued {
            task_id: id,
            direction: request.direction,
            remote_path: request.remote_path.clone(),
        };
        {
            let mut st = self.inner.lock()?;
            st.tasks.insert(id, TaskRecord::new(id, request));
            st.queue.push_back(id);
        }
        debug!(task = %id, "transfer queued");
        self.inner.events.publish(event);
        self.inner.work.notify_one();
        self.inner.bump();
        Ok(id)
    }

    /// Active: cooperative, takes effect at the next chunk boundary.
    /// Queued: leaves the queue immediately.
    pub fn pause(&self, id: TaskId) -> XfrResult<()> {
        let event = {
            let mut st = self.inner.lock()?;
            let rec = st.tasks.get_mut(&id).ok_or_else(|| unknown(id))?;
            match rec.state {
                TransferState::Active => {
                    if let Some(h) = &rec.handle {
                        h.request_pause();
                    }
                    debug!(task = %id, "pause requested");
                    None
                }
                TransferState::Queued => {
                    rec.generation += 1;
                    rec.set_state(TransferState::Paused);
                    let offset = rec.offset;
                    st.queue.retain(|q| *q != id);
                    Some(Event::TransferPaused { task_id: id, offset })
                }
                TransferState::Paused => None,
                other => return Err(invalid(id, "pause", other)),
            }
        };
        if let Some(ev) = event {
            self.inner.events.publish(ev);
            self.inner.bump();
        }
        Ok(())
    }

    /// Paused → Queued at the tail; the recorded offset is kept.
    pub fn resume(&self, id: TaskId) -> XfrResult<()> {
        self.requeue(id, "resume", |s| s == TransferState::Paused, false)
    }

    /// Manually re-run a Failed or Cancelled task with a fresh attempt budget.
    pub fn retry(&self, id: TaskId) -> XfrResult<()> {
        self.requeue(
            id,
            "retry",
            |s| matches!(s, TransferState::Failed | TransferState::Cancelled),
            true,
        )
    }

    fn requeue(
        &self,
        id: TaskId,
        op: &str,
        allowed: impl Fn(TransferState) -> bool,
        reset_attempts: bool,
    ) -> XfrResult<()> {
        let event = {
            let mut st = self.inner.lock()?;
            let rec = st.tasks.get_mut(&id).ok_or_else(|| unknown(id))?;
            if matches!(rec.state, TransferState::Queued | TransferState::Active) && !reset_attempts {
                return Ok(());
            }
            if !allowed(rec.state) {
                return Err(invalid(id, op, rec.state));
            }
            if reset_attempts {
                rec.attempts = 0;
                rec.last_error = None;
            }
            rec.generation += 1;
            rec.set_state(TransferState::Queued);
            let ev = Event::TransferQueued {
                task_id: id,
                direction: rec.request.direction,
                remote_path: rec.request.remote_path.clone(),
            };
            st.queue.push_back(id);
            ev
        };
        debug!(task = %id, op, "transfer re-queued");
        self.inner.events.publish(event);
        self.inner.work.notify_one();
        self.inner.bump();
        Ok(())
    }

    /// Stop a task now. A running attempt is aborted and its session
    /// discarded; partial output is left in place.
    pub fn cancel(&self, id: TaskId) -> XfrResult<()> {
        {
            let mut st = self.inner.lock()?;
            let rec = st.tasks.get_mut(&id).ok_or_else(|| unknown(id))?;
            match rec.state {
                TransferState::Cancelled => return Ok(()),
                TransferState::Completed | TransferState::Failed => {
                    return Err(invalid(id, "cancel", rec.state))
                }
                TransferState::Active => {
                    if let Some(h) = &rec.handle {
                        h.request_cancel();
                        rec.offset = h.offset();
                    }
                    if let Some(abort) = rec.abort.take() {
                        abort.abort();
                    }
                }
                TransferState::Queued | TransferState::Paused => {}
            }
            rec.generation += 1;
            rec.set_state(TransferState::Cancelled);
            st.queue.retain(|q| *q != id);
        }
        info!(task = %id, "transfer cancelled");
        self.inner.events.publish(Event::TransferCancelled { task_id: id });
        self.inner.bump();
        Ok(())
    }

    // ── Housekeeping ─────────────────────────────────────────────

    /// Drop a task that is not Queued or Active from the arena and return
    /// its last snapshot. Running work has to be cancelled first.
    pub fn remove(&self, id: TaskId) -> XfrResult<TransferTask> {
        let removed = {
            let mut st = self.inner.lock()?;
            let state = st.tasks.get(&id).ok_or_else(|| unknown(id))?.state;
            if !state.is_settled() {
                return Err(invalid(id, "remove", state));
            }
            st.tasks.remove(&id).map(|rec| rec.snapshot())
        };
        debug!(task = %id, "transfer removed");
        self.inner.bump();
        removed.ok_or_else(|| unknown(id))
    }

    /// Drop every Completed and Cancelled task. Failed tasks stay so they
    /// can still be retried. Returns how many were removed.
    pub fn clear_finished(&self) -> usize {
        let removed = match self.inner.lock() {
            Ok(mut st) => {
                let before = st.tasks.len();
                st.tasks.retain(|_, rec| {
                    !matches!(rec.state, TransferState::Completed | TransferState::Cancelled)
                });
                before - st.tasks.len()
            }
            Err(_) => 0,
        };
        if removed > 0 {
            info!(removed, "finished transfers cleared");
            self.inner.bump();
        }
        removed
    }

    // ── Introspection ────────────────────────────────────────────

    pub fn task(&self, id: TaskId) -> Option<TransferTask> {
        self.inner
            .lock()
            .ok()
            .and_then(|st| st.tasks.get(&id).map(TaskRecord::snapshot))
    }

    /// All tasks, oldest first.
    pub fn tasks(&self) -> Vec<TransferTask> {
        let mut all: Vec<TransferTask> = match self.inner.lock() {
            Ok(st) => st.tasks.values().map(TaskRecord::snapshot).collect(),
            Err(_) => Vec::new(),
        };
        all.sort_by_key(|t| t.created_at);
        all
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        if let Ok(st) = self.inner.lock() {
            for rec in st.tasks.values() {
                stats.count(rec.state);
            }
        }
        stats
    }

    pub fn active_count(&self) -> usize {
        self.count(|s| s == TransferState::Active)
    }

    pub fn queued_count(&self) -> usize {
        self.count(|s| s == TransferState::Queued)
    }

    fn count(&self, pred: impl Fn(TransferState) -> bool) -> usize {
        self.inner
            .lock()
            .map(|st| st.tasks.values().filter(|r| pred(r.state)).count())
            .unwrap_or(0)
    }

    /// Wait until the task is Completed, Failed, Cancelled or Paused.
    pub async fn wait_terminal(&self, id: TaskId) -> XfrResult<TransferTask> {
        let mut rx = self.inner.changed.subscribe();
        loop {
            match self.task(id) {
                None => return Err(unknown(id)),
                Some(t) if t.state.is_settled() => return Ok(t),
                Some(_) => {}
            }
            rx.changed()
                .await
                .map_err(|_| XfrError::cancelled("transfer manager stopped"))?;
        }
    }

    /// Wait until nothing is Queued or Active.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.changed.subscribe();
        loop {
            let busy = self.count(|s| matches!(s, TransferState::Queued | TransferState::Active));
            if busy == 0 || rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stop the workers, abort running attempts and close pooled sessions.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let workers: Vec<JoinHandle<()>> = match self.inner.workers.lock() {
            Ok(mut w) => w.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for w in &workers {
            w.abort();
        }
        if let Ok(mut st) = self.inner.lock() {
            for rec in st.tasks.values_mut() {
                if let Some(h) = &rec.handle {
                    h.request_cancel();
                }
                if let Some(abort) = rec.abort.take() {
                    abort.abort();
                }
            }
        }
        self.inner.pool.close_all("shutdown").await;
        info!("transfer manager stopped");
    }
}

fn unknown(id: TaskId) -> XfrError {
    XfrError::protocol(format!("unknown transfer {}", id)).missing()
}

fn invalid(id: TaskId, op: &str, state: TransferState) -> XfrError {
    XfrError::protocol(format!("cannot {} transfer {} in state {:?}", op, id, state))
}

// ── Worker side ──────────────────────────────────────────────────────

async fn worker_loop(inner: Arc<Inner>, n: usize) {
    debug!(worker = n, "worker started");
    while !inner.shutdown.load(Ordering::SeqCst) {
        match inner.claim_next() {
            Some(job) => {
                if let Some(retry) = inner.run(job).await {
                    schedule_retry(&inner, retry);
                }
            }
            None => inner.work.notified().await,
        }
    }
}

impl Inner {
    fn lock(&self) -> XfrResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| XfrError::transfer("transfer state lock poisoned"))
    }

    fn bump(&self) {
        self.changed.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Pop the queue head and mark it Active.
    fn claim_next(&self) -> Option<Job> {
        let (job, more) = {
            let mut st = self.lock().ok()?;
            let mut job = None;
            while let Some(id) = st.queue.pop_front() {
                let rec = match st.tasks.get_mut(&id) {
                    Some(r) if r.state == TransferState::Queued => r,
                    _ => continue,
                };
                rec.attempts += 1;
                rec.set_state(TransferState::Active);
                let handle = TransferHandle::new(id, self.events.clone(), self.config.progress_interval())
                    .with_bandwidth_limit(self.config.bandwidth_limit);
                handle.begin(rec.offset, rec.total);
                rec.handle = Some(handle.clone());
                job = Some(Job {
                    id,
                    generation: rec.generation,
                    request: rec.request.clone(),
                    offset: rec.offset,
                    attempt: rec.attempts,
                    handle,
                });
                break;
            }
            (job, !st.queue.is_empty())
        };
        if more {
            // Hand the remaining work to another idle worker.
            self.work.notify_one();
        }
        let job = job?;
        self.events.publish(Event::TransferStarted {
            task_id: job.id,
            attempt: job.attempt,
            offset: job.offset,
        });
        self.bump();
        Some(job)
    }

    async fn run(&self, job: Job) -> Option<Retry> {
        info!(task = %job.id, attempt = job.attempt, offset = job.offset, "transfer started");
        let attempt = tokio::spawn(drive(
            self.pool.clone(),
            job.request.clone(),
            job.offset,
            job.handle.clone(),
        ));

        let registered = {
            let mut st = match self.lock() {
                Ok(st) => st,
                Err(_) => return None,
            };
            match st.tasks.get_mut(&job.id) {
                Some(rec) if rec.generation == job.generation && rec.state == TransferState::Active => {
                    rec.abort = Some(attempt.abort_handle());
                    true
                }
                _ => false,
            }
        };
        if !registered {
            // Cancelled between claim and spawn.
            attempt.abort();
        }

        let result = attempt.await;
        self.finish(job, result)
    }

    fn finish(
        &self,
        job: Job,
        result: Result<XfrResult<TransferOutcome>, JoinError>,
    ) -> Option<Retry> {
        let result = match result {
            Ok(r) => r,
            Err(e) if e.is_cancelled() => return None,
            Err(e) => Err(XfrError::from(e)),
        };

        let mut events = Vec::new();
        let mut retry_after = None;
        {
            let mut st = self.lock().ok()?;
            let rec = match st.tasks.get_mut(&job.id) {
                Some(r) if r.generation == job.generation && r.state == TransferState::Active => r,
                // Cancelled or otherwise superseded while running.
                _ => return None,
            };
            match result {
                Ok(TransferOutcome::Completed(bytes)) => {
                    rec.offset = bytes;
                    rec.total = job.handle.total().or(Some(bytes));
                    rec.last_error = None;
                    rec.set_state(TransferState::Completed);
                    info!(task = %job.id, bytes, "transfer completed");
                    events.push(Event::TransferCompleted {
                        task_id: job.id,
                        bytes,
                    });
                }
                Ok(TransferOutcome::Paused(offset)) => {
                    rec.offset = offset;
                    rec.total = job.handle.total().or(rec.total);
                    rec.set_state(TransferState::Paused);
                    info!(task = %job.id, offset, "transfer paused");
                    events.push(Event::TransferPaused {
                        task_id: job.id,
                        offset,
                    });
                }
                Err(err) => {
                    rec.offset = job.handle.offset();
                    rec.total = job.handle.total().or(rec.total);
                    if self.policy.should_retry(&err, rec.attempts) {
                        let delay = self.policy.delay(rec.attempts);
                        warn!(
                            task = %job.id,
                            attempt = rec.attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "transfer attempt failed, retrying"
                        );
                        rec.generation += 1;
                        rec.set_state(TransferState::Queued);
                        retry_after = Some(Retry {
                            id: job.id,
                            generation: rec.generation,
                            delay,
                        });
                        events.push(Event::TransferRetryScheduled {
                            task_id: job.id,
                            attempt: rec.attempts,
                            delay_ms: delay.as_millis() as u64,
                        });
                    } else {
                        warn!(task = %job.id, attempt = rec.attempts, error = %err, "transfer failed");
                        rec.set_state(TransferState::Failed);
                        events.push(Event::TransferFailed {
                            task_id: job.id,
                            error_kind: err.kind,
                            reason: err.message.clone(),
                        });
                    }
                    rec.last_error = Some(err);
                }
            }
        }

        for ev in events {
            self.events.publish(ev);
        }
        self.bump();

        retry_after
    }
}

struct Retry {
    id: TaskId,
    generation: u64,
    delay: Duration,
}

/// Put the task back on the queue once its backoff delay has passed, unless
/// it was paused, cancelled or re-queued in the meantime.
fn schedule_retry(inner: &Arc<Inner>, retry: Retry) {
    let inner = inner.clone();
    tokio::spawn(async move {
        tokio::time::sleep(retry.delay).await;
        let queued = match inner.lock() {
            Ok(mut st) => {
                let current = st
                    .tasks
                    .get(&retry.id)
                    .map(|r| r.generation == retry.generation && r.state == TransferState::Queued)
                    .unwrap_or(false);
                if current {
                    st.queue.push_back(retry.id);
                }
                current
            }
            Err(_) => false,
        };
        if queued {
            debug!(task = %retry.id, "retry due, re-queued");
            inner.work.notify_one();
        }
    });
}

/// One attempt: check out a session, move the bytes, hand the session back.
async fn drive(
    pool: Arc<SessionPool>,
    request: TransferRequest,
    offset: u64,
    handle: TransferHandle,
) -> XfrResult<TransferOutcome> {
    let mut pooled = pool.checkout(&request.profile).await?;
    let result = {
        let session = pooled.session()?;
        let outcome = match request.direction {
            Direction::Download => {
                session
                    .get(&request.remote_path, &request.local_path, offset, &handle)
                    .await
            }
            Direction::Upload => {
                session
                    .put(&request.local_path, &request.remote_path, offset, &handle)
                    .await
            }
        };
        if let (Ok(TransferOutcome::Completed(_)), Some(mtime)) = (&outcome, request.preserve_mtime) {
            let preserved = match request.direction {
                Direction::Download => local::set_modified(&request.local_path, mtime),
                Direction::Upload => session.set_modified(&request.remote_path, mtime).await,
            };
            if let Err(e) = preserved {
                handle.warn(format!(
                    "Could not preserve modification time of {}: {}",
                    request.remote_path, e.message
                ));
            }
        }
        outcome
    };
    // Broken sessions report !is_open and are dropped instead of pooled.
    pooled.release();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::types::PoolConfig;
    use std::future::Future;
    use std::time::SystemTime;
    use tempfile::TempDir;
    use tracing_test::traced_test;
    use xfer_core::testing::{epoch, MemoryConnector, MemoryFs};
    use xfer_core::{ConnectionProfile, ErrorKind, Scheme};

    struct Harness {
        connector: MemoryConnector,
        manager: TransferManager,
        bus: EventBus,
        profile: ConnectionProfile,
        dir: TempDir,
    }

    fn harness(connector: MemoryConnector, config: TransferConfig, max_sessions: usize) -> Harness {
        let bus = EventBus::new(1024);
        let pool = Arc::new(SessionPool::new(
            Arc::new(connector.clone()),
            PoolConfig {
                max_sessions_per_profile: max_sessions,
                idle_timeout_secs: 300,
            },
            bus.clone(),
        ));
        Harness {
            manager: TransferManager::new(config, pool, bus.clone()),
            connector,
            bus,
            profile: ConnectionProfile::new(Scheme::Sftp, "mem").with_username("u"),
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn fast_retries(max_attempts: u32) -> TransferConfig {
        TransferConfig {
            max_attempts,
            retry_base_ms: 1,
            retry_max_ms: 5,
            ..TransferConfig::default()
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn within<F: Future>(f: F) -> F::Output {
        tokio::time::timeout(Duration::from_secs(10), f)
            .await
            .expect("timed out")
    }

    async fn until(mut cond: impl FnMut() -> bool) {
        within(async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
    }

    fn drain_names(rx: &mut tokio::sync::broadcast::Receiver<Event>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            names.push(ev.name());
        }
        names
    }

    #[tokio::test]
    async fn test_download_completes_and_reports() {
        let fs = MemoryFs::new();
        fs.add_file("/inbox/a.txt", payload(100), epoch(1_000));
        let h = harness(MemoryConnector::new(fs), TransferConfig::default(), 2);
        let mut rx = h.bus.subscribe();
        let local = h.dir.path().join("a.txt");

        let id = h
            .manager
            .enqueue(TransferRequest::download(h.profile.clone(), "/inbox/a.txt", &local))
            .unwrap();
        let task = within(h.manager.wait_terminal(id)).await.unwrap();

        assert_eq!(task.state, TransferState::Completed);
        assert_eq!(task.offset, 100);
        assert_eq!(task.attempts, 1);
        assert_eq!(std::fs::read(&local).unwrap(), payload(100));

        let names = drain_names(&mut rx);
        assert_eq!(names.iter().filter(|n| **n == "transfer-completed").count(), 1);
        let pos = |name: &str| names.iter().position(|n| *n == name).unwrap();
        assert!(pos("transfer-queued") < pos("transfer-started"));
        assert!(pos("transfer-started") < pos("transfer-completed"));
    }

    #[tokio::test]
    async fn test_upload_writes_remote_file() {
        let fs = MemoryFs::new();
        let h = harness(MemoryConnector::new(fs.clone()), TransferConfig::default(), 2);
        let local = h.dir.path().join("up.bin");
        std::fs::write(&local, payload(300)).unwrap();

        let id = h
            .manager
            .enqueue(TransferRequest::upload(h.profile.clone(), &local, "/out/up.bin"))
            .unwrap();
        let task = within(h.manager.wait_terminal(id)).await.unwrap();

        assert_eq!(task.state, TransferState::Completed);
        assert_eq!(fs.read("/out/up.bin").unwrap(), payload(300));
    }

    #[tokio::test]
    async fn test_worker_count_bounds_concurrency() {
        let fs = MemoryFs::new();
        for i in 0..6 {
            fs.add_file(&format!("/f{}.bin", i), payload(64), epoch(0));
        }
        let connector = MemoryConnector::new(fs).with_chunking(8, Duration::from_millis(5));
        let config = TransferConfig {
            workers: 2,
            ..TransferConfig::default()
        };
        let h = harness(connector, config, 4);

        let ids: Vec<TaskId> = (0..6)
            .map(|i| {
                h.manager
                    .enqueue(TransferRequest::download(
                        h.profile.clone(),
                        format!("/f{}.bin", i),
                        h.dir.path().join(format!("f{}.bin", i)),
                    ))
                    .unwrap()
            })
            .collect();
        within(h.manager.wait_idle()).await;

        for id in ids {
            assert_eq!(h.manager.task(id).unwrap().state, TransferState::Completed);
        }
        assert!(h.connector.max_in_flight() <= 2);
        assert!(h.connector.max_in_flight() >= 1);
    }

    #[tokio::test]
    async fn test_session_limit_bounds_profile_concurrency() {
        let fs = MemoryFs::new();
        for i in 0..4 {
            fs.add_file(&format!("/f{}.bin", i), payload(48), epoch(0));
        }
        let connector = MemoryConnector::new(fs).with_chunking(8, Duration::from_millis(3));
        let config = TransferConfig {
            workers: 4,
            ..TransferConfig::default()
        };
        let h = harness(connector, config, 1);

        for i in 0..4 {
            h.manager
                .enqueue(TransferRequest::download(
                    h.profile.clone(),
                    format!("/f{}.bin", i),
                    h.dir.path().join(format!("f{}.bin", i)),
                ))
                .unwrap();
        }
        within(h.manager.wait_idle()).await;

        assert_eq!(h.connector.max_in_flight(), 1);
        assert!(h
            .manager
            .tasks()
            .iter()
            .all(|t| t.state == TransferState::Completed));
    }

    #[tokio::test]
    async fn test_pause_then_resume_is_byte_identical() {
        let fs = MemoryFs::new();
        fs.add_file("/big.bin", payload(4096), epoch(0));
        let connector = MemoryConnector::new(fs).with_chunking(64, Duration::from_millis(2));
        let h = harness(connector, TransferConfig::default(), 1);
        let mut rx = h.bus.subscribe();
        let local = h.dir.path().join("big.bin");

        let id = h
            .manager
            .enqueue(TransferRequest::download(h.profile.clone(), "/big.bin", &local))
            .unwrap();
        let m = h.manager.clone();
        until(move || m.task(id).map(|t| t.offset > 0).unwrap_or(false)).await;
        h.manager.pause(id).unwrap();

        let paused = within(h.manager.wait_terminal(id)).await.unwrap();
        assert_eq!(paused.state, TransferState::Paused);
        let b = paused.offset;
        assert!(b > 0 && b < 4096);
        assert_eq!(std::fs::metadata(&local).unwrap().len(), b);

        while rx.try_recv().is_ok() {}
        h.manager.resume(id).unwrap();
        let done = within(h.manager.wait_terminal(id)).await.unwrap();
        assert_eq!(done.state, TransferState::Completed);
        assert_eq!(std::fs::read(&local).unwrap(), payload(4096));

        let mut resumed_at = None;
        while let Ok(ev) = rx.try_recv() {
            if let Event::TransferStarted { offset, .. } = ev {
                resumed_at = Some(offset);
            }
        }
        assert_eq!(resumed_at, Some(b));
    }

    #[tokio::test]
    async fn test_pause_while_queued_leaves_queue() {
        let fs = MemoryFs::new();
        fs.add_file("/slow.bin", payload(512), epoch(0));
        fs.add_file("/next.bin", payload(32), epoch(0));
        let connector = MemoryConnector::new(fs).with_chunking(32, Duration::from_millis(3));
        let config = TransferConfig {
            workers: 1,
            ..TransferConfig::default()
        };
        let h = harness(connector, config, 1);

        let first = h
            .manager
            .enqueue(TransferRequest::download(h.profile.clone(), "/slow.bin", h.dir.path().join("slow.bin")))
            .unwrap();
        let second = h
            .manager
            .enqueue(TransferRequest::download(h.profile.clone(), "/next.bin", h.dir.path().join("next.bin")))
            .unwrap();
        h.manager.pause(second).unwrap();
        assert_eq!(h.manager.task(second).unwrap().state, TransferState::Paused);

        within(h.manager.wait_terminal(first)).await.unwrap();
        within(h.manager.wait_idle()).await;
        let still = h.manager.task(second).unwrap();
        assert_eq!(still.state, TransferState::Paused);
        assert_eq!(still.attempts, 0);

        h.manager.resume(second).unwrap();
        let done = within(h.manager.wait_terminal(second)).await.unwrap();
        assert_eq!(done.state, TransferState::Completed);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_retries_stop_at_max_attempts() {
        let fs = MemoryFs::new();
        fs.add_file("/a.bin", payload(10), epoch(0));
        let connector = MemoryConnector::new(fs);
        connector.fail_next_transfers(10, XfrError::connection("connection reset"));
        let h = harness(connector, fast_retries(3), 1);
        let mut rx = h.bus.subscribe();

        let id = h
            .manager
            .enqueue(TransferRequest::download(h.profile.clone(), "/a.bin", h.dir.path().join("a.bin")))
            .unwrap();
        let task = within(h.manager.wait_terminal(id)).await.unwrap();

        assert_eq!(task.state, TransferState::Failed);
        assert_eq!(task.attempts, 3);
        assert_eq!(task.last_error_kind, Some(ErrorKind::Connection));
        let names = drain_names(&mut rx);
        assert_eq!(names.iter().filter(|n| **n == "transfer-retry-scheduled").count(), 2);
        assert_eq!(names.iter().filter(|n| **n == "transfer-failed").count(), 1);
        // Worker tasks log outside the test span, so inspect every captured line.
        let task_id = id.to_string();
        logs_assert(|lines: &[&str]| {
            let retries = lines
                .iter()
                .filter(|l| l.contains(&task_id) && l.contains("transfer attempt failed, retrying"))
                .count();
            match retries {
                2 => Ok(()),
                n => Err(format!("expected 2 retry warnings, got {}", n)),
            }
        });
    }

    #[tokio::test]
    async fn test_transient_failure_recovers() {
        let fs = MemoryFs::new();
        fs.add_file("/a.bin", payload(40), epoch(0));
        let connector = MemoryConnector::new(fs);
        connector.fail_next_transfers(1, XfrError::transfer("426 connection closed"));
        let h = harness(connector, fast_retries(3), 1);
        let local = h.dir.path().join("a.bin");

        let id = h
            .manager
            .enqueue(TransferRequest::download(h.profile.clone(), "/a.bin", &local))
            .unwrap();
        let task = within(h.manager.wait_terminal(id)).await.unwrap();

        assert_eq!(task.state, TransferState::Completed);
        assert_eq!(task.attempts, 2);
        assert_eq!(task.last_error, None);
        assert_eq!(std::fs::read(&local).unwrap(), payload(40));
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_retried_until_asked() {
        let fs = MemoryFs::new();
        fs.add_file("/a.bin", payload(10), epoch(0));
        let connector = MemoryConnector::new(fs);
        connector.fail_next_transfers(1, XfrError::authentication("530 login incorrect"));
        let h = harness(connector, fast_retries(5), 1);

        let id = h
            .manager
            .enqueue(TransferRequest::download(h.profile.clone(), "/a.bin", h.dir.path().join("a.bin")))
            .unwrap();
        let failed = within(h.manager.wait_terminal(id)).await.unwrap();
        assert_eq!(failed.state, TransferState::Failed);
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.last_error_kind, Some(ErrorKind::Authentication));

        assert!(h.manager.resume(id).is_err());
        h.manager.retry(id).unwrap();
        let done = within(h.manager.wait_terminal(id)).await.unwrap();
        assert_eq!(done.state, TransferState::Completed);
        assert_eq!(done.attempts, 1);
    }

    #[tokio::test]
    async fn test_cancel_active_releases_session() {
        let fs = MemoryFs::new();
        fs.add_file("/big.bin", payload(4096), epoch(0));
        fs.add_file("/small.bin", payload(16), epoch(0));
        let connector = MemoryConnector::new(fs).with_chunking(64, Duration::from_millis(5));
        let h = harness(connector, TransferConfig::default(), 1);

        for round in 0..3 {
            let id = h
                .manager
                .enqueue(TransferRequest::download(
                    h.profile.clone(),
                    "/big.bin",
                    h.dir.path().join(format!("big{}.bin", round)),
                ))
                .unwrap();
            let m = h.manager.clone();
            until(move || m.task(id).map(|t| t.offset > 0).unwrap_or(false)).await;
            h.manager.cancel(id).unwrap();
            assert_eq!(h.manager.task(id).unwrap().state, TransferState::Cancelled);

            let c = h.connector.clone();
            until(move || c.live_sessions() == 0).await;
        }

        // The single session slot is free again.
        let id = h
            .manager
            .enqueue(TransferRequest::download(h.profile.clone(), "/small.bin", h.dir.path().join("small.bin")))
            .unwrap();
        let task = within(h.manager.wait_terminal(id)).await.unwrap();
        assert_eq!(task.state, TransferState::Completed);
    }

    #[tokio::test]
    async fn test_cancel_stops_blocking_io_and_retry_resumes_cleanly() {
        let fs = MemoryFs::new();
        let data = payload(4096);
        fs.add_file("/big.bin", data.clone(), epoch(0));
        let connector = MemoryConnector::new(fs)
            .with_chunking(64, Duration::from_millis(5))
            .with_blocking_io();
        let h = harness(connector, TransferConfig::default(), 1);
        let local = h.dir.path().join("big.bin");
        let id = h
            .manager
            .enqueue(TransferRequest::download(h.profile.clone(), "/big.bin", &local))
            .unwrap();
        let m = h.manager.clone();
        until(move || m.task(id).map(|t| t.offset >= 256).unwrap_or(false)).await;

        let mut rx = h.bus.subscribe();
        h.manager.cancel(id).unwrap();
        // At most the chunk already in progress lands after the cancel.
        let stats = h.connector.stats.clone();
        until(move || stats.in_flight.load(std::sync::atomic::Ordering::SeqCst) == 0).await;
        let settled = std::fs::metadata(&local).unwrap().len();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(std::fs::metadata(&local).unwrap().len(), settled);
        assert!(settled < 4096);
        let progressed = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|ev| matches!(ev, Event::TransferProgress { .. }))
            .count();
        assert_eq!(progressed, 0);

        h.manager.retry(id).unwrap();
        let task = within(h.manager.wait_terminal(id)).await.unwrap();
        assert_eq!(task.state, TransferState::Completed);
        assert_eq!(std::fs::read(&local).unwrap(), data);
    }

    #[tokio::test]
    async fn test_settled_tasks_can_be_removed_and_cleared() {
        let fs = MemoryFs::new();
        for name in ["a", "b", "c"] {
            fs.add_file(&format!("/{}.bin", name), payload(32), epoch(0));
        }
        let connector = MemoryConnector::new(fs);
        connector.fail_next_transfers(1, XfrError::authentication("denied"));
        let h = harness(connector, fast_retries(1), 1);
        let download = |name: &str| {
            h.manager
                .enqueue(TransferRequest::download(
                    h.profile.clone(),
                    format!("/{}.bin", name),
                    h.dir.path().join(name),
                ))
                .unwrap()
        };
        let failed = download("a");
        within(h.manager.wait_terminal(failed)).await.unwrap();
        let done = download("b");
        let cancelled = download("c");
        h.manager.cancel(cancelled).unwrap();
        within(h.manager.wait_idle()).await;

        let stats = h.manager.stats();
        assert_eq!(stats.total, 3);
        assert_eq!((stats.completed, stats.failed, stats.cancelled), (1, 1, 1));

        assert_eq!(h.manager.clear_finished(), 2);
        assert!(h.manager.task(done).is_none());
        assert!(h.manager.task(cancelled).is_none());
        assert_eq!(h.manager.tasks().len(), 1);

        let removed = h.manager.remove(failed).unwrap();
        assert_eq!(removed.state, TransferState::Failed);
        assert!(h.manager.tasks().is_empty());
        assert_eq!(h.manager.stats(), QueueStats::default());
        assert!(h.manager.remove(failed).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_running_task_cannot_be_removed() {
        let fs = MemoryFs::new();
        fs.add_file("/big.bin", payload(4096), epoch(0));
        let connector = MemoryConnector::new(fs).with_chunking(64, Duration::from_millis(5));
        let h = harness(connector, TransferConfig::default(), 1);
        let id = h
            .manager
            .enqueue(TransferRequest::download(h.profile.clone(), "/big.bin", h.dir.path().join("big.bin")))
            .unwrap();
        let m = h.manager.clone();
        until(move || m.task(id).map(|t| t.state == TransferState::Active).unwrap_or(false)).await;

        let err = h.manager.remove(id).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Protocol);
        h.manager.cancel(id).unwrap();
        h.manager.remove(id).unwrap();
        assert!(h.manager.task(id).is_none());
    }

    #[tokio::test]
    async fn test_cancel_rejects_finished_task() {
        let fs = MemoryFs::new();
        fs.add_file("/a.bin", payload(8), epoch(0));
        let h = harness(MemoryConnector::new(fs), TransferConfig::default(), 1);
        let id = h
            .manager
            .enqueue(TransferRequest::download(h.profile.clone(), "/a.bin", h.dir.path().join("a.bin")))
            .unwrap();
        within(h.manager.wait_terminal(id)).await.unwrap();

        let err = h.manager.cancel(id).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Protocol);
        assert!(h.manager.pause(Uuid::new_v4()).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_download_preserves_mtime() {
        let fs = MemoryFs::new();
        let stamp = epoch(1_600_000_000);
        fs.add_file("/a.bin", payload(20), stamp);
        let h = harness(MemoryConnector::new(fs), TransferConfig::default(), 1);
        let local = h.dir.path().join("a.bin");

        let mut request = TransferRequest::download(h.profile.clone(), "/a.bin", &local);
        request.preserve_mtime = Some(stamp);
        let id = h.manager.enqueue(request).unwrap();
        within(h.manager.wait_terminal(id)).await.unwrap();

        let modified = std::fs::metadata(&local).unwrap().modified().unwrap();
        assert_eq!(modified, SystemTime::from(stamp));
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_sessions() {
        let fs = MemoryFs::new();
        fs.add_file("/a.bin", payload(8), epoch(0));
        let h = harness(MemoryConnector::new(fs), TransferConfig::default(), 1);
        let id = h
            .manager
            .enqueue(TransferRequest::download(h.profile.clone(), "/a.bin", h.dir.path().join("a.bin")))
            .unwrap();
        within(h.manager.wait_terminal(id)).await.unwrap();
        let m = h.manager.clone();
        let pid = h.profile.id.clone();
        until(move || m.pool().idle_count(&pid) == 1).await;

        h.manager.shutdown().await;
        assert_eq!(h.connector.live_sessions(), 0);
    }
}
