//! # xfer-ftp: FTP/FTPS session variant
//!
//! Implementation of the FTP protocol (RFC 959) with extensions:
//! - **RFC 2228 / 4217**: AUTH TLS / FTPS (Explicit & Implicit)
//! - **RFC 3659**: Extensions: MLSD/MLST, SIZE, MDTM, REST STREAM
//! - **RFC 2389**: FEAT negotiation
//! - **RFC 2428**: EPSV / EPRT (IPv6-ready)
//!
//! Architecture:
//! - `types`: data structures, enums, config
//! - `protocol`: low-level command/response codec
//! - `connection`: TCP + TLS transport
//! - `client`: stateful FTP client (login, CWD, TYPE, etc.)
//! - `parser`: Unix/Windows/MLSD LIST response parsing
//! - `transfer`: data channel management (PASV/EPSV/PORT/EPRT)
//! - `tls`: TLS upgrade and FTPS configuration
//! - `directory`: mkdir, delete, rename, stat, MFMT
//! - `file_ops`: download/upload with resume and pause
//! - `session`: `RemoteSession` adapter

pub mod client;
pub mod connection;
pub mod directory;
pub mod file_ops;
pub mod parser;
pub mod protocol;
pub mod session;
pub mod tls;
pub mod transfer;
pub mod types;

pub use client::FtpClient;
pub use session::FtpSession;
pub use types::*;
