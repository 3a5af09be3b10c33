//! # xfer-core
//!
//! Vocabulary shared by every crate of the transfer engine:
//! - `types`: connection profiles, remote entries, transfer requests
//! - `error`: error taxonomy and result alias
//! - `events`: the explicit event channel and its payloads
//! - `credentials`: secret retrieval contract
//! - `session`: the uniform `RemoteSession` contract and `TransferHandle`
//! - `local`: local filesystem walk and offset-aware open helpers

pub mod credentials;
pub mod error;
pub mod events;
pub mod local;
pub mod session;
pub mod types;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use credentials::{CredentialError, CredentialStore, MemoryCredentialStore};
pub use error::{AuthFailure, ErrorKind, XfrError, XfrResult};
pub use events::{Event, EventBus, EventReceiver, SyncSummary};
pub use session::{Connector, RemoteSession, TransferHandle, DEFAULT_PROGRESS_INTERVAL};
pub use types::*;
