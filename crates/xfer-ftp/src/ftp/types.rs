//! Shared types for the FTP crate.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use xfer_core::{ConnectionProfile, Scheme, TlsMode};

// ─── Connection / Session ────────────────────────────────────────────

/// Security mode for the control channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum FtpSecurityMode {
    /// Plain-text FTP (port 21).
    #[default]
    None,
    /// Explicit FTPS: starts plain then upgrades via AUTH TLS (port 21).
    Explicit,
    /// Implicit FTPS: TLS from the first byte (port 990).
    Implicit,
}

/// Transfer type (RFC 959 TYPE command).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum TransferType {
    Ascii,
    #[default]
    Binary,
}

/// Transfer mode selected for the data channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum DataChannelMode {
    #[default]
    Passive,
    ExtendedPassive,
    Active,
    ExtendedActive,
}

/// Everything the client needs to open one control connection.
///
/// Built per connect attempt from a profile plus the resolved secret and
/// dropped once the session is established.
#[derive(Debug, Clone)]
pub struct FtpConnectionConfig {
    pub profile_id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub security: FtpSecurityMode,
    /// Preferred data-channel family; EPSV/EPRT are used when the server
    /// advertises them.
    pub passive: bool,
    /// Initial remote directory to CWD into after login.
    pub initial_directory: Option<String>,
    pub connect_timeout: Duration,
    /// Applied to every control reply and data-channel read/write.
    pub io_timeout: Duration,
    /// Validate the server certificate against the system trust store.
    pub verify_certificates: bool,
    /// UTF-8 encoding (OPTS UTF8 ON).
    pub utf8: bool,
    /// Local address to bind for active-mode data connections.
    pub active_bind_address: Option<String>,
    pub chunk_size: usize,
}

/// Default chunk size for streaming transfers (64 KiB).
pub const DEFAULT_CHUNK: usize = 65_536;

impl FtpConnectionConfig {
    pub fn from_profile(profile: &ConnectionProfile, password: SecretString) -> Self {
        let security = match (profile.scheme, profile.tls_mode) {
            (Scheme::Ftps, Some(TlsMode::Explicit)) => FtpSecurityMode::Explicit,
            (Scheme::Ftps, _) => FtpSecurityMode::Implicit,
            _ => FtpSecurityMode::None,
        };
        Self {
            profile_id: profile.id.clone(),
            host: profile.host.clone(),
            port: profile.port,
            username: profile.username.clone(),
            password,
            security,
            passive: profile.passive,
            initial_directory: profile.initial_path.clone(),
            connect_timeout: profile.connect_timeout(),
            io_timeout: profile.io_timeout(),
            verify_certificates: profile.verify_certificates,
            utf8: true,
            active_bind_address: None,
            chunk_size: DEFAULT_CHUNK,
        }
    }
}

/// Information about an active FTP session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FtpSessionInfo {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub security: FtpSecurityMode,
    pub connected: bool,
    pub current_directory: String,
    pub server_banner: Option<String>,
    pub system_type: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub transfer_type: TransferType,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
}

// ─── Directory Listing ───────────────────────────────────────────────

/// Type of a remote filesystem entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FtpEntryKind {
    File,
    Directory,
    Symlink,
    Unknown,
}

/// One entry from a directory listing (parsed from LIST or MLSD output).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FtpEntry {
    pub name: String,
    pub kind: FtpEntryKind,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    /// `rwxr-xr-x` style or MLSD `unix.mode` octal string.
    pub permissions: Option<String>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub link_target: Option<String>,
}

/// Result of parsing a listing body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedListing {
    pub entries: Vec<FtpEntry>,
    /// Lines that matched no known format.
    pub skipped: usize,
}

// ─── Protocol ────────────────────────────────────────────────────────

/// A complete FTP reply (possibly multi-line).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpResponse {
    pub code: u16,
    pub lines: Vec<String>,
}

impl FtpResponse {
    /// Joined reply text including the code prefix.
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Text of the last line without the `NNN ` prefix.
    pub fn message(&self) -> &str {
        self.lines
            .last()
            .map(|l| l.get(4..).unwrap_or(""))
            .unwrap_or("")
    }

    /// 1xx
    pub fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// 3xx
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }
}

/// Capabilities advertised in the FEAT reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerFeatures {
    pub mlsd: bool,
    pub mlst: bool,
    pub size: bool,
    pub mdtm: bool,
    pub rest_stream: bool,
    pub utf8: bool,
    pub epsv: bool,
    pub eprt: bool,
    pub mfmt: bool,
    pub raw_features: Vec<String>,
}
