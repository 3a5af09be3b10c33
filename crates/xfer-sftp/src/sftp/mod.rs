// ── SFTP session variant ─────────────────────────────────────────────────────
//
// - `types`       – connection config built from a profile
// - `known_hosts` – trust-on-first-use host key store
// - `service`     – blocking connect, host-key check and auth chain
// - `dir_ops`     – list / mkdir / delete / rename / stat / setstat
// - `transfer`    – chunked, resumable get & put
// - `session`     – async `RemoteSession` adapter over the blocking core

pub mod dir_ops;
pub mod known_hosts;
pub mod service;
pub mod session;
pub mod transfer;
pub mod types;

pub use known_hosts::{HostKeyStatus, KnownHosts};
pub use session::SftpSession;
pub use types::SftpConnectionConfig;
