//! # xfer
//!
//! Unified FTP / FTPS / SFTP transfer engine. The workspace crates do the
//! work; this crate wires them together:
//!
//! - `client`: the [`Client`] command façade
//! - `config`: [`AppConfig`] loaded from JSON
//! - `logging`: `tracing-subscriber` initialisation with the `log` bridge

pub mod client;
pub mod config;
pub mod logging;

pub use client::Client;
pub use config::{AppConfig, ConfigError, LogConfig};

pub use xfer_core::{
    ConnectionProfile, CredentialStore, Direction, ErrorKind, Event, EventReceiver,
    MemoryCredentialStore, RemoteEntry, Scheme, SyncSummary, TaskId, TlsMode, TransferRequest,
    XfrError, XfrResult,
};
pub use xfer_protocols::{format_url, parse_url, ParsedUrl, ProtocolFactory, ProtocolSession};
pub use xfer_sync::{ConflictPolicy, SyncDirection, SyncPlan, SyncReport, SyncRequest};
pub use xfer_transfer::{QueueStats, TransferState, TransferTask};
