//! Closed set of protocol variants behind one session type.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use xfer_core::{RemoteEntry, RemoteSession, Scheme, TransferHandle, TransferOutcome, XfrResult};
use xfer_ftp::FtpSession;
use xfer_sftp::SftpSession;

/// One live connection of any supported protocol.
pub enum ProtocolSession {
    Ftp(FtpSession),
    Ftps(FtpSession),
    Sftp(SftpSession),
}

macro_rules! dispatch {
    ($self:expr, $s:ident => $body:expr) => {
        match $self {
            ProtocolSession::Ftp($s) | ProtocolSession::Ftps($s) => $body,
            ProtocolSession::Sftp($s) => $body,
        }
    };
}

impl ProtocolSession {
    pub fn scheme(&self) -> Scheme {
        match self {
            ProtocolSession::Ftp(_) => Scheme::Ftp,
            ProtocolSession::Ftps(_) => Scheme::Ftps,
            ProtocolSession::Sftp(_) => Scheme::Sftp,
        }
    }

    /// Listing lines the last FTP `list` could not parse. Always 0 for SFTP,
    /// whose listings are structured.
    pub fn last_skipped_lines(&self) -> usize {
        match self {
            ProtocolSession::Ftp(s) | ProtocolSession::Ftps(s) => s.last_skipped_lines(),
            ProtocolSession::Sftp(_) => 0,
        }
    }
}

#[async_trait]
impl RemoteSession for ProtocolSession {
    fn profile_id(&self) -> &str {
        dispatch!(self, s => s.profile_id())
    }

    fn is_open(&self) -> bool {
        dispatch!(self, s => s.is_open())
    }

    async fn list(&mut self, path: &str) -> XfrResult<Vec<RemoteEntry>> {
        dispatch!(self, s => s.list(path).await)
    }

    async fn get(
        &mut self,
        remote: &str,
        local: &Path,
        offset: u64,
        handle: &TransferHandle,
    ) -> XfrResult<TransferOutcome> {
        dispatch!(self, s => s.get(remote, local, offset, handle).await)
    }

    async fn put(
        &mut self,
        local: &Path,
        remote: &str,
        offset: u64,
        handle: &TransferHandle,
    ) -> XfrResult<TransferOutcome> {
        dispatch!(self, s => s.put(local, remote, offset, handle).await)
    }

    async fn mkdir(&mut self, path: &str) -> XfrResult<()> {
        dispatch!(self, s => s.mkdir(path).await)
    }

    async fn delete(&mut self, path: &str) -> XfrResult<()> {
        dispatch!(self, s => s.delete(path).await)
    }

    async fn rename(&mut self, from: &str, to: &str) -> XfrResult<()> {
        dispatch!(self, s => s.rename(from, to).await)
    }

    async fn stat(&mut self, path: &str) -> XfrResult<Option<RemoteEntry>> {
        dispatch!(self, s => s.stat(path).await)
    }

    async fn set_modified(&mut self, path: &str, modified: DateTime<Utc>) -> XfrResult<()> {
        dispatch!(self, s => s.set_modified(path, modified).await)
    }

    async fn close(&mut self) -> XfrResult<()> {
        dispatch!(self, s => s.close().await)
    }
}
