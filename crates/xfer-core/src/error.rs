//! Error taxonomy shared by the protocol variants, the transfer manager and
//! the sync engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Top-level error category. Drives the retry policy and is the value
/// carried by `transfer-failed` events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Unreachable host, timeout, reset. Transient.
    Connection,
    /// Bad credentials, rejected/unknown host key, certificate failure. Fatal.
    Authentication,
    /// Malformed server response, unsupported command or feature.
    Protocol,
    /// Local side: permission denied, disk full, path not found.
    FileSystem,
    /// Sync modification conflict awaiting an external decision.
    Conflict,
    /// Transient I/O failure in the middle of a data transfer.
    Transfer,
    /// Operation cancelled by the caller.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Protocol => "protocol",
            ErrorKind::FileSystem => "filesystem",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Transfer => "transfer",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an authentication attempt was refused.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "reason", rename_all = "camelCase")]
pub enum AuthFailure {
    BadCredentials,
    /// First contact with this host: the key must be accepted before a retry
    /// can succeed.
    #[serde(rename_all = "camelCase")]
    UnknownHostKey {
        host: String,
        port: u16,
        key_type: String,
        fingerprint: String,
    },
    /// The host presented a different key than the one on record.
    #[serde(rename_all = "camelCase")]
    HostKeyMismatch {
        host: String,
        port: u16,
        expected: String,
        actual: String,
    },
    Certificate,
}

/// Categorised engine error.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("[{kind}{}] {message}", fmt_code(.code))]
#[serde(rename_all = "camelCase")]
pub struct XfrError {
    pub kind: ErrorKind,
    pub message: String,
    /// Server reply code that triggered the error, if any.
    pub code: Option<u16>,
    #[serde(default)]
    pub auth: Option<AuthFailure>,
    /// The remote or local path does not exist.
    #[serde(default)]
    pub not_found: bool,
}

fn fmt_code(code: &Option<u16>) -> String {
    code.map(|c| format!(" {}", c)).unwrap_or_default()
}

pub type XfrResult<T> = Result<T, XfrError>;

// ── Construction helpers ─────────────────────────────────────────────

impl XfrError {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            code: None,
            auth: None,
            not_found: false,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn missing(mut self) -> Self {
        self.not_found = true;
        self
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, msg)
    }

    pub fn authentication(msg: impl Into<String>) -> Self {
        let mut e = Self::new(ErrorKind::Authentication, msg);
        e.auth = Some(AuthFailure::BadCredentials);
        e
    }

    pub fn unknown_host_key(
        host: &str,
        port: u16,
        key_type: impl Into<String>,
        fingerprint: impl Into<String>,
    ) -> Self {
        let fingerprint = fingerprint.into();
        let mut e = Self::new(
            ErrorKind::Authentication,
            format!(
                "Host key for [{}]:{} is not trusted yet ({})",
                host, port, fingerprint
            ),
        );
        e.auth = Some(AuthFailure::UnknownHostKey {
            host: host.to_string(),
            port,
            key_type: key_type.into(),
            fingerprint,
        });
        e
    }

    pub fn host_key_mismatch(
        host: &str,
        port: u16,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        let expected = expected.into();
        let actual = actual.into();
        let mut e = Self::new(
            ErrorKind::Authentication,
            format!(
                "Host key for [{}]:{} changed: expected {}, got {}",
                host, port, expected, actual
            ),
        );
        e.auth = Some(AuthFailure::HostKeyMismatch {
            host: host.to_string(),
            port,
            expected,
            actual,
        });
        e
    }

    pub fn certificate(msg: impl Into<String>) -> Self {
        let mut e = Self::new(ErrorKind::Authentication, msg);
        e.auth = Some(AuthFailure::Certificate);
        e
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, msg)
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, msg)
    }

    pub fn filesystem(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::FileSystem, msg)
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, msg)
    }

    pub fn transfer(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transfer, msg)
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, msg)
    }

    /// Classify an FTP reply code into the most appropriate error kind.
    pub fn from_reply(code: u16, text: &str) -> Self {
        let lower = text.to_lowercase();
        let mut err = match code {
            421 => Self::connection(text),
            425 | 426 => Self::transfer(text),
            430 | 530 | 532 => Self::authentication(text),
            450 | 550 => {
                let e = Self::protocol(text);
                if lower.contains("not found")
                    || lower.contains("no such")
                    || lower.contains("does not exist")
                    || lower.contains("not exist")
                {
                    e.missing()
                } else {
                    e
                }
            }
            451 | 452 | 552 => Self::transfer(text),
            _ => Self::protocol(text),
        };
        err.code = Some(code);
        err
    }

    /// Only transient network and transfer failures are retried automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::Connection | ErrorKind::Transfer)
    }

    pub fn is_not_found(&self) -> bool {
        self.not_found
    }

    /// True when the error is a TOFU prompt rather than a hard rejection.
    pub fn is_unknown_host_key(&self) -> bool {
        matches!(self.auth, Some(AuthFailure::UnknownHostKey { .. }))
    }
}

impl From<std::io::Error> for XfrError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        match e.kind() {
            Io::TimedOut => Self::timeout(format!("I/O timeout: {}", e)),
            Io::ConnectionRefused
            | Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::NotConnected
            | Io::AddrNotAvailable
            | Io::BrokenPipe
            | Io::UnexpectedEof => Self::connection(e.to_string()),
            Io::Interrupted | Io::WouldBlock => Self::transfer(e.to_string()),
            Io::InvalidData => Self::protocol(e.to_string()),
            Io::NotFound => Self::filesystem(e.to_string()).missing(),
            _ => Self::filesystem(e.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for XfrError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            Self::cancelled("Background task cancelled")
        } else {
            Self::transfer(format!("Background task failed: {}", e))
        }
    }
}

impl From<XfrError> for String {
    fn from(e: XfrError) -> String {
        e.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_classification() {
        assert_eq!(XfrError::from_reply(530, "Login incorrect").kind, ErrorKind::Authentication);
        assert_eq!(XfrError::from_reply(421, "Service closing").kind, ErrorKind::Connection);
        assert_eq!(XfrError::from_reply(426, "Connection closed").kind, ErrorKind::Transfer);
        assert_eq!(XfrError::from_reply(502, "Not implemented").kind, ErrorKind::Protocol);

        let missing = XfrError::from_reply(550, "No such file or directory");
        assert_eq!(missing.kind, ErrorKind::Protocol);
        assert!(missing.is_not_found());
        assert_eq!(missing.code, Some(550));

        let denied = XfrError::from_reply(550, "Permission denied");
        assert!(!denied.is_not_found());
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(XfrError::connection("reset").is_retryable());
        assert!(XfrError::transfer("short read").is_retryable());
        assert!(!XfrError::authentication("nope").is_retryable());
        assert!(!XfrError::protocol("garbage").is_retryable());
        assert!(!XfrError::conflict("both changed").is_retryable());
    }

    #[test]
    fn test_io_mapping() {
        let t: XfrError = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert_eq!(t.kind, ErrorKind::Connection);
        let f: XfrError = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "ro").into();
        assert_eq!(f.kind, ErrorKind::FileSystem);
        let n: XfrError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(n.is_not_found());
    }

    #[test]
    fn test_unknown_host_key_is_distinguishable() {
        let e = XfrError::unknown_host_key("h", 22, "ssh-ed25519", "SHA256:abc");
        assert_eq!(e.kind, ErrorKind::Authentication);
        assert!(e.is_unknown_host_key());
        assert!(!XfrError::authentication("bad password").is_unknown_host_key());
    }

    #[test]
    fn test_display_includes_code() {
        let e = XfrError::from_reply(550, "No such file");
        assert_eq!(e.to_string(), "[protocol 550] No such file");
        assert_eq!(XfrError::transfer("x").to_string(), "[transfer] x");
    }
}
