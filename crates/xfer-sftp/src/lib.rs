//! SFTP sessions for the xfer transfer engine.

pub mod sftp;

pub use sftp::{HostKeyStatus, KnownHosts, SftpConnectionConfig, SftpSession};
