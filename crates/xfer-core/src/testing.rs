//! In-memory remote used by tests across the workspace.
//!
//! `MemoryConnector` hands out `MemorySession`s that all share one
//! `MemoryFs`. Chunk size, per-chunk delay and injected failures are
//! configurable so queue, pause and retry behaviour can be exercised
//! without a network.

use crate::error::{XfrError, XfrResult};
use crate::local;
use crate::session::{Connector, RemoteSession, TransferHandle};
use crate::types::{join_remote, parent_remote, ConnectionProfile, EntryKind, RemoteEntry, TransferOutcome};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
enum Node {
    Dir { modified: DateTime<Utc> },
    File { data: Vec<u8>, modified: DateTime<Utc> },
}

/// Shared remote tree keyed by absolute path.
#[derive(Clone, Default)]
pub struct MemoryFs {
    nodes: Arc<Mutex<BTreeMap<String, Node>>>,
}

/// Fixed timestamp used for seeded entries.
pub fn epoch(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

impl MemoryFs {
    pub fn new() -> Self {
        let fs = Self::default();
        fs.lock().insert("/".into(), Node::Dir { modified: epoch(0) });
        fs
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Node>> {
        self.nodes.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn add_dir(&self, path: &str) {
        let mut nodes = self.lock();
        let mut cur = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            cur = join_remote(if cur.is_empty() { "/" } else { &cur }, part);
            nodes
                .entry(cur.clone())
                .or_insert(Node::Dir { modified: epoch(0) });
        }
    }

    pub fn add_file(&self, path: &str, data: impl Into<Vec<u8>>, modified: DateTime<Utc>) {
        if let Some(parent) = parent_remote(path) {
            self.add_dir(parent);
        }
        self.lock().insert(
            path.to_string(),
            Node::File {
                data: data.into(),
                modified,
            },
        );
    }

    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        match self.lock().get(path) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lock().contains_key(path)
    }

    pub fn paths(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn entry(path: &str, node: &Node) -> RemoteEntry {
        match node {
            Node::Dir { modified } => RemoteEntry {
                path: path.to_string(),
                size: 0,
                modified: Some(*modified),
                kind: EntryKind::Directory,
                permissions: Some(0o755),
            },
            Node::File { data, modified } => RemoteEntry {
                path: path.to_string(),
                size: data.len() as u64,
                modified: Some(*modified),
                kind: EntryKind::File,
                permissions: Some(0o644),
            },
        }
    }
}

/// Counters observed by tests.
#[derive(Default)]
pub struct MemoryStats {
    pub connects: AtomicUsize,
    pub live_sessions: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

#[derive(Clone)]
pub struct MemoryConnector {
    pub fs: MemoryFs,
    pub stats: Arc<MemoryStats>,
    chunk_size: usize,
    chunk_delay: Duration,
    supports_resume: bool,
    blocking_io: bool,
    connect_failures: Arc<Mutex<VecDeque<XfrError>>>,
    transfer_failures: Arc<Mutex<VecDeque<XfrError>>>,
}

impl MemoryConnector {
    pub fn new(fs: MemoryFs) -> Self {
        Self {
            fs,
            stats: Arc::new(MemoryStats::default()),
            chunk_size: 16,
            chunk_delay: Duration::ZERO,
            supports_resume: true,
            blocking_io: false,
            connect_failures: Arc::new(Mutex::new(VecDeque::new())),
            transfer_failures: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn with_chunking(mut self, chunk_size: usize, chunk_delay: Duration) -> Self {
        self.chunk_size = chunk_size.max(1);
        self.chunk_delay = chunk_delay;
        self
    }

    pub fn without_resume(mut self) -> Self {
        self.supports_resume = false;
        self
    }

    /// Run download chunk loops on a blocking thread, the way sessions over
    /// a synchronous transport do. Aborting the caller's future does not
    /// stop such a loop; only the handle's cancel flag does.
    pub fn with_blocking_io(mut self) -> Self {
        self.blocking_io = true;
        self
    }

    pub fn fail_next_connect(&self, err: XfrError) {
        self.connect_failures
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(err);
    }

    /// The next `n` calls to `get`/`put` fail with `err` before moving bytes.
    pub fn fail_next_transfers(&self, n: usize, err: XfrError) {
        let mut q = self.transfer_failures.lock().unwrap_or_else(|p| p.into_inner());
        for _ in 0..n {
            q.push_back(err.clone());
        }
    }

    pub fn live_sessions(&self) -> usize {
        self.stats.live_sessions.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.stats.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, profile: &ConnectionProfile) -> XfrResult<Box<dyn RemoteSession>> {
        if let Some(err) = self
            .connect_failures
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
        {
            return Err(err);
        }
        self.stats.connects.fetch_add(1, Ordering::SeqCst);
        self.stats.live_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            profile_id: profile.id.clone(),
            connector: self.clone(),
            open: true,
        }))
    }
}

pub struct MemorySession {
    profile_id: String,
    connector: MemoryConnector,
    open: bool,
}

struct InFlight<'a>(&'a MemoryStats);

impl<'a> InFlight<'a> {
    fn enter(stats: &'a MemoryStats) -> Self {
        let now = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(stats)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemorySession {
    fn fs(&self) -> &MemoryFs {
        &self.connector.fs
    }

    fn injected_failure(&self) -> Option<XfrError> {
        self.connector
            .transfer_failures
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
    }

    fn ensure_open(&self) -> XfrResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(XfrError::connection("session closed"))
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.connector.stats.live_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteSession for MemorySession {
    fn profile_id(&self) -> &str {
        &self.profile_id
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn list(&mut self, path: &str) -> XfrResult<Vec<RemoteEntry>> {
        self.ensure_open()?;
        let dir = norm_dir(path);
        let nodes = self.fs().lock();
        match nodes.get(dir) {
            Some(Node::Dir { .. }) => {}
            Some(Node::File { .. }) => {
                return Err(XfrError::protocol(format!("{} is not a directory", path)))
            }
            None => return Err(XfrError::protocol(format!("{}: no such directory", path)).missing()),
        }
        Ok(nodes
            .iter()
            .filter(|(p, _)| parent_remote(p) == Some(dir))
            .map(|(p, n)| MemoryFs::entry(p, n))
            .collect())
    }

    async fn get(
        &mut self,
        remote: &str,
        local: &Path,
        offset: u64,
        handle: &TransferHandle,
    ) -> XfrResult<TransferOutcome> {
        self.ensure_open()?;
        if let Some(err) = self.injected_failure() {
            return Err(err);
        }
        let data = self
            .fs()
            .read(remote)
            .ok_or_else(|| XfrError::protocol(format!("{}: no such file", remote)).missing())?;
        let mut start = offset;
        if start > 0 && !self.connector.supports_resume {
            handle.warn(format!("resume unsupported for {}, restarting from 0", remote));
            start = 0;
        }
        let start = start.min(data.len() as u64);
        let mut file = local::open_for_write_std(local, start)?;
        handle.begin(start, Some(data.len() as u64));
        if self.connector.blocking_io {
            let stats = self.connector.stats.clone();
            let (chunk, delay) = (self.connector.chunk_size, self.connector.chunk_delay);
            let handle = handle.clone();
            return tokio::task::spawn_blocking(move || {
                let _guard = InFlight::enter(&stats);
                write_chunks_blocking(&data, start as usize, &mut file, &handle, chunk, delay)
            })
            .await
            .map_err(|e| XfrError::transfer(format!("blocking transfer task failed: {}", e)))?;
        }
        let _guard = InFlight::enter(&self.connector.stats);
        let mut pos = start as usize;
        while pos < data.len() {
            handle.check_cancelled()?;
            if handle.pause_requested() {
                return Ok(TransferOutcome::Paused(pos as u64));
            }
            let end = (pos + self.connector.chunk_size).min(data.len());
            file.write_all(&data[pos..end])?;
            pos = end;
            handle.advance(pos as u64);
            if !self.connector.chunk_delay.is_zero() {
                tokio::time::sleep(self.connector.chunk_delay).await;
            }
        }
        file.flush()?;
        handle.finish(pos as u64);
        Ok(TransferOutcome::Completed(pos as u64))
    }

    async fn put(
        &mut self,
        local: &Path,
        remote: &str,
        offset: u64,
        handle: &TransferHandle,
    ) -> XfrResult<TransferOutcome> {
        self.ensure_open()?;
        let _guard = InFlight::enter(&self.connector.stats);
        if let Some(err) = self.injected_failure() {
            return Err(err);
        }
        let mut source = Vec::new();
        local::open_for_read_std(local, 0)?.read_to_end(&mut source)?;
        let mut start = offset;
        if start > 0 && !self.connector.supports_resume {
            handle.warn(format!("resume unsupported for {}, restarting from 0", remote));
            start = 0;
        }
        let mut existing = if start > 0 {
            self.fs().read(remote).unwrap_or_default()
        } else {
            Vec::new()
        };
        existing.truncate(start as usize);
        let mut pos = existing.len();
        handle.begin(pos as u64, Some(source.len() as u64));
        while pos < source.len() {
            handle.check_cancelled()?;
            if handle.pause_requested() {
                self.fs().add_file(remote, existing, Utc::now());
                return Ok(TransferOutcome::Paused(pos as u64));
            }
            let end = (pos + self.connector.chunk_size).min(source.len());
            existing.extend_from_slice(&source[pos..end]);
            pos = end;
            self.fs().add_file(remote, existing.clone(), Utc::now());
            handle.advance(pos as u64);
            if !self.connector.chunk_delay.is_zero() {
                tokio::time::sleep(self.connector.chunk_delay).await;
            }
        }
        self.fs().add_file(remote, existing, Utc::now());
        handle.finish(pos as u64);
        Ok(TransferOutcome::Completed(pos as u64))
    }

    async fn mkdir(&mut self, path: &str) -> XfrResult<()> {
        self.ensure_open()?;
        if let Some(Node::File { .. }) = self.fs().lock().get(path) {
            return Err(XfrError::protocol(format!("{} exists and is a file", path)));
        }
        self.fs().add_dir(path);
        Ok(())
    }

    async fn delete(&mut self, path: &str) -> XfrResult<()> {
        self.ensure_open()?;
        let mut nodes = self.fs().lock();
        let prefix = format!("{}/", path.trim_end_matches('/'));
        if nodes.keys().any(|k| k.starts_with(&prefix)) {
            return Err(XfrError::protocol(format!("{}: directory not empty", path)));
        }
        nodes.remove(path);
        Ok(())
    }

    async fn rename(&mut self, from: &str, to: &str) -> XfrResult<()> {
        self.ensure_open()?;
        let mut nodes = self.fs().lock();
        let node = nodes
            .remove(from)
            .ok_or_else(|| XfrError::protocol(format!("{}: no such file", from)).missing())?;
        nodes.insert(to.to_string(), node);
        Ok(())
    }

    async fn stat(&mut self, path: &str) -> XfrResult<Option<RemoteEntry>> {
        self.ensure_open()?;
        Ok(self.fs().lock().get(path).map(|n| MemoryFs::entry(path, n)))
    }

    async fn set_modified(&mut self, path: &str, when: DateTime<Utc>) -> XfrResult<()> {
        self.ensure_open()?;
        let mut nodes = self.fs().lock();
        match nodes.get_mut(path) {
            Some(Node::File { modified, .. }) | Some(Node::Dir { modified }) => {
                *modified = when;
                Ok(())
            }
            None => Err(XfrError::protocol(format!("{}: no such file", path)).missing()),
        }
    }

    async fn close(&mut self) -> XfrResult<()> {
        self.open = false;
        Ok(())
    }
}

fn write_chunks_blocking(
    data: &[u8],
    mut pos: usize,
    file: &mut std::fs::File,
    handle: &TransferHandle,
    chunk: usize,
    delay: Duration,
) -> XfrResult<TransferOutcome> {
    while pos < data.len() {
        handle.check_cancelled()?;
        if handle.pause_requested() {
            return Ok(TransferOutcome::Paused(pos as u64));
        }
        let end = (pos + chunk).min(data.len());
        file.write_all(&data[pos..end])?;
        pos = end;
        handle.advance(pos as u64);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }
    file.flush()?;
    handle.finish(pos as u64);
    Ok(TransferOutcome::Completed(pos as u64))
}

fn norm_dir(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}
