//! Trust-on-first-use host key store.
//!
//! One entry per line: `[host]:port key-type SHA256:<base64>`. Blank lines
//! and lines starting with `#` are ignored. A host seen for the first time
//! is reported as [`HostKeyStatus::Unknown`] and only becomes trusted once
//! the caller explicitly accepts it.

use base64::Engine;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use xfer_core::{XfrError, XfrResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyStatus {
    Trusted,
    Unknown,
    /// A different key is on record for this endpoint.
    Mismatch { expected: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct KnownHostLine {
    endpoint: String,
    key_type: String,
    fingerprint: String,
}

/// File-backed known-hosts store. Reads the file on every check so that
/// acceptances made by another session are picked up immediately.
#[derive(Debug, Clone)]
pub struct KnownHosts {
    path: PathBuf,
}

impl KnownHosts {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config dir>/xfer/known_hosts`, falling back to the working directory.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("xfer")
            .join("known_hosts")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// OpenSSH-style fingerprint of a raw public key blob.
    pub fn fingerprint(key: &[u8]) -> String {
        let digest = Sha256::digest(key);
        format!(
            "SHA256:{}",
            base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest)
        )
    }

    pub fn endpoint(host: &str, port: u16) -> String {
        format!("[{}]:{}", host.to_lowercase(), port)
    }

    fn load(&self) -> XfrResult<Vec<KnownHostLine>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(XfrError::filesystem(format!(
                    "Cannot read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        Ok(text.lines().filter_map(parse_line).collect())
    }

    /// Compare the presented key against the store.
    ///
    /// An endpoint on record under any key type with a different fingerprint
    /// is a mismatch, so a server cannot sidestep the check by negotiating a
    /// new algorithm.
    pub fn check(&self, host: &str, port: u16, key_type: &str, fingerprint: &str) -> XfrResult<HostKeyStatus> {
        let endpoint = Self::endpoint(host, port);
        let recorded: Vec<KnownHostLine> = self
            .load()?
            .into_iter()
            .filter(|l| l.endpoint == endpoint)
            .collect();
        if recorded.is_empty() {
            return Ok(HostKeyStatus::Unknown);
        }
        if recorded
            .iter()
            .any(|l| l.key_type == key_type && l.fingerprint == fingerprint)
        {
            return Ok(HostKeyStatus::Trusted);
        }
        let expected = recorded
            .iter()
            .find(|l| l.key_type == key_type)
            .unwrap_or(&recorded[0]);
        Ok(HostKeyStatus::Mismatch {
            expected: expected.fingerprint.clone(),
        })
    }

    /// Record `fingerprint` as the only trusted key for the endpoint,
    /// replacing whatever was stored before.
    pub fn accept(&self, host: &str, port: u16, key_type: &str, fingerprint: &str) -> XfrResult<()> {
        let endpoint = Self::endpoint(host, port);
        let mut lines: Vec<KnownHostLine> = self
            .load()?
            .into_iter()
            .filter(|l| l.endpoint != endpoint)
            .collect();
        lines.push(KnownHostLine {
            endpoint,
            key_type: key_type.to_string(),
            fingerprint: fingerprint.to_string(),
        });
        self.persist(&lines)?;
        log::info!("Trusted host key {} for [{}]:{}", fingerprint, host, port);
        Ok(())
    }

    /// Drop every key recorded for the endpoint.
    pub fn forget(&self, host: &str, port: u16) -> XfrResult<()> {
        let endpoint = Self::endpoint(host, port);
        let lines: Vec<KnownHostLine> = self
            .load()?
            .into_iter()
            .filter(|l| l.endpoint != endpoint)
            .collect();
        self.persist(&lines)
    }

    fn persist(&self, lines: &[KnownHostLine]) -> XfrResult<()> {
        let fs_err = |e: std::io::Error| {
            XfrError::filesystem(format!("Cannot write {}: {}", self.path.display(), e))
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(fs_err)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp).map_err(fs_err)?;
            for l in lines {
                writeln!(file, "{} {} {}", l.endpoint, l.key_type, l.fingerprint).map_err(fs_err)?;
            }
            file.sync_all().map_err(fs_err)?;
        }
        fs::rename(&tmp, &self.path).map_err(fs_err)
    }
}

fn parse_line(line: &str) -> Option<KnownHostLine> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let mut parts = line.split_whitespace();
    let endpoint = parts.next()?.to_lowercase();
    let key_type = parts.next()?.to_string();
    let fingerprint = parts.next()?.to_string();
    Some(KnownHostLine {
        endpoint,
        key_type,
        fingerprint,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, KnownHosts) {
        let dir = tempfile::tempdir().unwrap();
        let kh = KnownHosts::new(dir.path().join("nested").join("known_hosts"));
        (dir, kh)
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = KnownHosts::fingerprint(b"key");
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
        // 32-byte digest without padding
        assert_eq!(fp.len(), "SHA256:".len() + 43);
        assert_eq!(fp, KnownHosts::fingerprint(b"key"));
        assert_ne!(fp, KnownHosts::fingerprint(b"other"));
    }

    #[test]
    fn test_unknown_then_trusted_after_accept() {
        let (_dir, kh) = store();
        let status = kh.check("Host", 22, "ssh-ed25519", "SHA256:aaa").unwrap();
        assert_eq!(status, HostKeyStatus::Unknown);

        kh.accept("Host", 22, "ssh-ed25519", "SHA256:aaa").unwrap();
        assert_eq!(
            kh.check("host", 22, "ssh-ed25519", "SHA256:aaa").unwrap(),
            HostKeyStatus::Trusted
        );
        // Different port is a different endpoint.
        assert_eq!(
            kh.check("host", 2222, "ssh-ed25519", "SHA256:aaa").unwrap(),
            HostKeyStatus::Unknown
        );
    }

    #[test]
    fn test_changed_key_is_mismatch() {
        let (_dir, kh) = store();
        kh.accept("h", 22, "ssh-ed25519", "SHA256:old").unwrap();
        assert_eq!(
            kh.check("h", 22, "ssh-ed25519", "SHA256:new").unwrap(),
            HostKeyStatus::Mismatch {
                expected: "SHA256:old".into()
            }
        );
        assert_eq!(
            kh.check("h", 22, "ssh-rsa", "SHA256:new").unwrap(),
            HostKeyStatus::Mismatch {
                expected: "SHA256:old".into()
            }
        );
    }

    #[test]
    fn test_accept_replaces_and_forget_removes() {
        let (_dir, kh) = store();
        kh.accept("h", 22, "ssh-rsa", "SHA256:one").unwrap();
        kh.accept("other", 22, "ssh-rsa", "SHA256:x").unwrap();
        kh.accept("h", 22, "ssh-ed25519", "SHA256:two").unwrap();

        let text = std::fs::read_to_string(kh.path()).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("[h]:22 ssh-ed25519 SHA256:two"));

        kh.forget("h", 22).unwrap();
        assert_eq!(kh.check("h", 22, "ssh-ed25519", "SHA256:two").unwrap(), HostKeyStatus::Unknown);
        assert_eq!(kh.check("other", 22, "ssh-rsa", "SHA256:x").unwrap(), HostKeyStatus::Trusted);
    }

    #[test]
    fn test_comments_and_garbage_are_ignored() {
        let (_dir, kh) = store();
        std::fs::create_dir_all(kh.path().parent().unwrap()).unwrap();
        std::fs::write(kh.path(), "# comment\n\nbroken\n[h]:22 ssh-rsa SHA256:k\n").unwrap();
        assert_eq!(kh.check("h", 22, "ssh-rsa", "SHA256:k").unwrap(), HostKeyStatus::Trusted);
    }
}
