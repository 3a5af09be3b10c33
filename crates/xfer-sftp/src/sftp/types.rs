// ── Types ─────────────────────────────────────────────────────────────────────

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use xfer_core::{ConnectionProfile, EntryKind};

/// Default chunk size for streaming transfers (64 KiB).
pub const DEFAULT_CHUNK: usize = 65_536;

// ── Connection & Authentication ──────────────────────────────────────────────

/// Everything needed to open one SSH connection plus its SFTP channel.
#[derive(Debug, Clone)]
pub struct SftpConnectionConfig {
    pub profile_id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<SecretString>,
    pub private_key_path: Option<PathBuf>,
    /// Try identities held by a running ssh-agent.
    pub use_agent: bool,
    pub known_hosts_path: PathBuf,
    pub connect_timeout: Duration,
    /// libssh2 blocking-call timeout for every request after the handshake.
    pub io_timeout: Duration,
    pub initial_directory: Option<String>,
    pub chunk_size: usize,
}

impl SftpConnectionConfig {
    pub fn from_profile(
        profile: &ConnectionProfile,
        password: Option<SecretString>,
        default_known_hosts: PathBuf,
    ) -> Self {
        Self {
            profile_id: profile.id.clone(),
            host: profile.host.clone(),
            port: profile.port,
            username: profile.username.clone(),
            password,
            private_key_path: profile.private_key_path.clone(),
            use_agent: true,
            known_hosts_path: profile
                .known_hosts_path
                .clone()
                .unwrap_or(default_known_hosts),
            connect_timeout: profile.connect_timeout(),
            io_timeout: profile.io_timeout(),
            initial_directory: profile.initial_path.clone(),
            chunk_size: DEFAULT_CHUNK,
        }
    }
}

// ── Session info ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpSessionInfo {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_method: String,
    pub server_banner: Option<String>,
    pub remote_home: Option<String>,
    pub current_directory: String,
    pub host_key_fingerprint: String,
}

// ── Attribute decoding ───────────────────────────────────────────────────────

/// Map the `S_IFMT` bits of an attribute record to an entry kind.
/// Devices, sockets and pipes have no transferable content and yield `None`.
pub(crate) fn kind_from_perm(perm: Option<u32>) -> Option<EntryKind> {
    match perm.unwrap_or(0) & 0o170000 {
        0o040000 => Some(EntryKind::Directory),
        0o120000 => Some(EntryKind::Symlink),
        0o100000 => Some(EntryKind::File),
        // Servers that omit permissions are treated as plain files.
        0 => Some(EntryKind::File),
        _ => None,
    }
}
