//! Shared data model: connection profiles, remote entries, transfer requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

// ─── Connection profile ──────────────────────────────────────────────

/// Wire protocol selected by the URL scheme.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Scheme {
    Ftp,
    Ftps,
    Sftp,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Ftp => "ftp",
            Scheme::Ftps => "ftps",
            Scheme::Sftp => "sftp",
        }
    }

    /// Well-known port for the scheme. FTPS depends on the TLS mode.
    pub fn default_port(&self, tls: Option<TlsMode>) -> u16 {
        match (self, tls) {
            (Scheme::Ftp, _) => 21,
            (Scheme::Ftps, Some(TlsMode::Explicit)) => 21,
            (Scheme::Ftps, _) => 990,
            (Scheme::Sftp, _) => 22,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How FTPS secures the control channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TlsMode {
    /// Plain connect, then `AUTH TLS`.
    Explicit,
    /// TLS handshake from the first byte.
    Implicit,
}

/// Everything needed to open a session, minus the secret itself.
///
/// The credential reference is the profile `id`; the secret is resolved
/// from the credential store on every connect attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionProfile {
    pub id: String,
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    /// FTPS only. `None` means implicit.
    #[serde(default)]
    pub tls_mode: Option<TlsMode>,
    /// Validate FTPS certificates against the system trust store.
    #[serde(default = "default_true")]
    pub verify_certificates: bool,
    /// Remote directory to change into after login.
    #[serde(default)]
    pub initial_path: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Read/write timeout for control and data operations.
    #[serde(default = "default_io_timeout")]
    pub io_timeout_secs: u64,
    /// FTP passive mode (EPSV when advertised, else PASV).
    #[serde(default = "default_true")]
    pub passive: bool,
    /// SFTP known-hosts file; defaults to the engine's own store.
    #[serde(default)]
    pub known_hosts_path: Option<PathBuf>,
    /// SFTP private key used before password authentication.
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
}

fn default_username() -> String {
    "anonymous".into()
}
fn default_true() -> bool {
    true
}
fn default_connect_timeout() -> u64 {
    30
}
fn default_io_timeout() -> u64 {
    60
}

impl ConnectionProfile {
    /// Build a profile with well-known defaults for `scheme`.
    pub fn new(scheme: Scheme, host: impl Into<String>) -> Self {
        let host = host.into();
        let tls_mode = match scheme {
            Scheme::Ftps => Some(TlsMode::Implicit),
            _ => None,
        };
        let port = scheme.default_port(tls_mode);
        let username = default_username();
        Self {
            id: Self::derive_id(scheme, &username, &host, port),
            scheme,
            host,
            port,
            username,
            tls_mode,
            verify_certificates: true,
            initial_path: None,
            connect_timeout_secs: default_connect_timeout(),
            io_timeout_secs: default_io_timeout(),
            passive: true,
            known_hosts_path: None,
            private_key_path: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self.refresh_id();
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self.refresh_id();
        self
    }

    pub fn with_tls_mode(mut self, mode: TlsMode) -> Self {
        self.tls_mode = Some(mode);
        self
    }

    pub fn with_initial_path(mut self, path: impl Into<String>) -> Self {
        self.initial_path = Some(path.into());
        self
    }

    /// Stable id: `scheme://user@host:port`.
    pub fn derive_id(scheme: Scheme, username: &str, host: &str, port: u16) -> String {
        format!("{}://{}@{}:{}", scheme, username, host, port)
    }

    fn refresh_id(&mut self) {
        self.id = Self::derive_id(self.scheme, &self.username, &self.host, self.port);
    }

    /// Opaque handle handed to the credential store.
    pub fn credential_ref(&self) -> &str {
        &self.id
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ─── Remote entries ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// One entry of a directory listing. Superseded by the next listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntry {
    /// Absolute remote path.
    pub path: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub kind: EntryKind,
    /// Unix mode bits when the server reports them.
    pub permissions: Option<u32>,
}

impl RemoteEntry {
    pub fn name(&self) -> &str {
        self.path
            .rsplit('/')
            .find(|s| !s.is_empty())
            .unwrap_or(self.path.as_str())
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn meta(&self) -> EntryMeta {
        EntryMeta {
            size: self.size,
            modified: self.modified,
            kind: self.kind,
        }
    }
}

/// Size / mtime / kind triple used for comparisons and conflict reports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EntryMeta {
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub kind: EntryKind,
}

// ─── Transfers ───────────────────────────────────────────────────────

pub type TaskId = Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    Upload,
    Download,
}

/// Result of a `get`/`put` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Transfer reached the end; value is the final byte offset.
    Completed(u64),
    /// A pause was requested; value is the offset reached so far.
    Paused(u64),
}

/// What the caller asks the transfer manager to move.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub profile: ConnectionProfile,
    pub direction: Direction,
    pub local_path: PathBuf,
    pub remote_path: String,
    /// Resume offset; 0 for a full transfer.
    #[serde(default)]
    pub offset: u64,
    /// Best-effort size hint for progress.
    #[serde(default)]
    pub size_hint: Option<u64>,
    /// Copy the source mtime to the destination after completion.
    #[serde(default)]
    pub preserve_mtime: Option<DateTime<Utc>>,
}

impl TransferRequest {
    pub fn download(
        profile: ConnectionProfile,
        remote_path: impl Into<String>,
        local_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            profile,
            direction: Direction::Download,
            local_path: local_path.into(),
            remote_path: remote_path.into(),
            offset: 0,
            size_hint: None,
            preserve_mtime: None,
        }
    }

    pub fn upload(
        profile: ConnectionProfile,
        local_path: impl Into<PathBuf>,
        remote_path: impl Into<String>,
    ) -> Self {
        Self {
            profile,
            direction: Direction::Upload,
            local_path: local_path.into(),
            remote_path: remote_path.into(),
            offset: 0,
            size_hint: None,
            preserve_mtime: None,
        }
    }
}

// ─── Remote path helpers ─────────────────────────────────────────────

/// Join a remote base directory and a relative path with exactly one `/`.
pub fn join_remote(base: &str, rel: &str) -> String {
    let rel = rel.trim_start_matches('/');
    if rel.is_empty() {
        return base.to_string();
    }
    if base.is_empty() {
        return rel.to_string();
    }
    if base.ends_with('/') {
        format!("{}{}", base, rel)
    } else {
        format!("{}/{}", base, rel)
    }
}

/// Parent directory of a remote path (`/` for top-level entries).
pub fn parent_remote(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) if trimmed.len() > 1 => Some("/"),
        Some(0) => None,
        Some(idx) => Some(&trimmed[..idx]),
        None => None,
    }
}
