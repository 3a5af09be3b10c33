//! FTP and FTPS sessions for the xfer transfer engine.

pub mod ftp;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use ftp::{FtpClient, FtpConnectionConfig, FtpSession};
