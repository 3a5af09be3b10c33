//! `RemoteSession` implementation for SFTP.
//!
//! libssh2 is blocking, so every call hops onto the blocking pool holding
//! the connection lock for its duration.

use crate::sftp::service::{connect_blocking, SftpConn};
use crate::sftp::types::SftpConnectionConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use xfer_core::{
    join_remote, ErrorKind, RemoteEntry, RemoteSession, TransferHandle, TransferOutcome,
    XfrError, XfrResult,
};

/// One authenticated SSH connection with an SFTP channel.
pub struct SftpSession {
    profile_id: String,
    conn: Option<Arc<Mutex<SftpConn>>>,
    current_directory: String,
    chunk_size: usize,
    broken: bool,
}

impl SftpSession {
    pub async fn connect(config: SftpConnectionConfig) -> XfrResult<Self> {
        let profile_id = config.profile_id.clone();
        let chunk_size = config.chunk_size;
        let conn = tokio::task::spawn_blocking(move || connect_blocking(&config)).await??;
        let current_directory = conn.info.current_directory.clone();
        Ok(Self {
            profile_id,
            conn: Some(Arc::new(Mutex::new(conn))),
            current_directory,
            chunk_size,
            broken: false,
        })
    }

    pub fn current_directory(&self) -> &str {
        &self.current_directory
    }

    /// Resolve `path` against the session's working directory.
    pub fn absolute(&self, path: &str) -> String {
        match path {
            "" | "." => self.current_directory.clone(),
            p if p.starts_with('/') => p.to_string(),
            p => join_remote(&self.current_directory, p),
        }
    }

    async fn run<T, F>(&mut self, op: F) -> XfrResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&SftpConn) -> XfrResult<T> + Send + 'static,
    {
        let conn = match (&self.conn, self.broken) {
            (Some(c), false) => c.clone(),
            _ => return Err(XfrError::connection("SFTP session is closed")),
        };
        let result = tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| XfrError::connection("SFTP connection lock poisoned"))?;
            op(&*guard)
        })
        .await?;
        if let Err(ref e) = result {
            if matches!(e.kind, ErrorKind::Connection) {
                debug!("Marking SFTP session {} broken: {}", self.profile_id, e);
                self.broken = true;
            }
        }
        result
    }
}

#[async_trait]
impl RemoteSession for SftpSession {
    fn profile_id(&self) -> &str {
        &self.profile_id
    }

    fn is_open(&self) -> bool {
        self.conn.is_some() && !self.broken
    }

    async fn list(&mut self, path: &str) -> XfrResult<Vec<RemoteEntry>> {
        let dir = self.absolute(path);
        self.run(move |c| c.list(&dir)).await
    }

    async fn get(
        &mut self,
        remote: &str,
        local: &Path,
        offset: u64,
        handle: &TransferHandle,
    ) -> XfrResult<TransferOutcome> {
        let remote = self.absolute(remote);
        let local: PathBuf = local.to_path_buf();
        let handle = handle.clone();
        let chunk = self.chunk_size;
        self.run(move |c| c.download(&remote, &local, offset, chunk, &handle))
            .await
    }

    async fn put(
        &mut self,
        local: &Path,
        remote: &str,
        offset: u64,
        handle: &TransferHandle,
    ) -> XfrResult<TransferOutcome> {
        let remote = self.absolute(remote);
        let local: PathBuf = local.to_path_buf();
        let handle = handle.clone();
        let chunk = self.chunk_size;
        self.run(move |c| c.upload(&local, &remote, offset, chunk, &handle))
            .await
    }

    async fn mkdir(&mut self, path: &str) -> XfrResult<()> {
        let path = self.absolute(path);
        self.run(move |c| c.mkdir_all(&path)).await
    }

    async fn delete(&mut self, path: &str) -> XfrResult<()> {
        let path = self.absolute(path);
        self.run(move |c| c.remove(&path)).await
    }

    async fn rename(&mut self, from: &str, to: &str) -> XfrResult<()> {
        let from = self.absolute(from);
        let to = self.absolute(to);
        self.run(move |c| c.rename(&from, &to)).await
    }

    async fn stat(&mut self, path: &str) -> XfrResult<Option<RemoteEntry>> {
        let path = self.absolute(path);
        self.run(move |c| c.stat(&path)).await
    }

    async fn set_modified(&mut self, path: &str, modified: DateTime<Utc>) -> XfrResult<()> {
        let path = self.absolute(path);
        self.run(move |c| c.set_modified(&path, modified)).await
    }

    async fn close(&mut self) -> XfrResult<()> {
        let conn = match self.conn.take() {
            Some(c) => c,
            None => return Ok(()),
        };
        let profile_id = self.profile_id.clone();
        tokio::task::spawn_blocking(move || {
            if let Ok(guard) = conn.lock() {
                let _ = guard
                    .session
                    .disconnect(None, "Client disconnecting", None);
            }
            info!("SFTP session {} disconnected", profile_id);
        })
        .await?;
        Ok(())
    }
}
