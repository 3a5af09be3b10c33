//! Directory operations: mkdir, delete, rename, stat, MFMT.

use crate::ftp::client::FtpClient;
use crate::ftp::parser;
use crate::ftp::types::*;
use chrono::{DateTime, Utc};
use xfer_core::{parent_remote, XfrError, XfrResult};

impl FtpClient {
    // ─── MKD ─────────────────────────────────────────────────────

    /// Create a directory and all missing parents (emulated – FTP has no MKDIRP).
    ///
    /// Already-existing components are not an error.
    pub async fn mkdir_all(&mut self, path: &str) -> XfrResult<()> {
        let path = self.absolute(path);
        let mut current = String::new();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current.push('/');
            current.push_str(component);

            let resp = self.codec.execute(&format!("MKD {}", current)).await?;
            // 521: "directory already exists" on some servers.
            if resp.is_success() || resp.code == 521 {
                continue;
            }
            if resp.code == 550 && self.dir_exists(&current).await? {
                continue;
            }
            return Err(XfrError::from_reply(resp.code, resp.message()));
        }
        self.touch();
        Ok(())
    }

    /// Probe a directory with CWD, then return to the working directory.
    async fn dir_exists(&mut self, path: &str) -> XfrResult<bool> {
        let resp = self.codec.execute(&format!("CWD {}", path)).await?;
        if !resp.is_success() {
            return Ok(false);
        }
        let back = self.info.current_directory.clone();
        self.codec.expect_ok(&format!("CWD {}", back)).await?;
        Ok(true)
    }

    // ─── RMD / DELE ──────────────────────────────────────────────

    /// Remove an empty directory.
    pub async fn rmdir(&mut self, path: &str) -> XfrResult<()> {
        self.codec.expect_ok(&format!("RMD {}", path)).await?;
        self.touch();
        Ok(())
    }

    /// Delete a remote file.
    pub async fn delete_file(&mut self, path: &str) -> XfrResult<()> {
        self.codec.expect_ok(&format!("DELE {}", path)).await?;
        self.touch();
        Ok(())
    }

    /// Remove a file or empty directory; a missing path is not an error.
    pub async fn remove(&mut self, path: &str) -> XfrResult<()> {
        let path = self.absolute(path);
        match self.stat_entry(&path).await? {
            None => Ok(()),
            Some(e) if e.kind == FtpEntryKind::Directory => self.rmdir(&path).await,
            Some(_) => self.delete_file(&path).await,
        }
    }

    // ─── RNFR / RNTO ────────────────────────────────────────────

    /// Rename (or move) a file or directory.
    pub async fn rename(&mut self, from: &str, to: &str) -> XfrResult<()> {
        let from = self.absolute(from);
        let to = self.absolute(to);
        let rnfr = self.codec.execute(&format!("RNFR {}", from)).await?;
        if !rnfr.is_intermediate() && !rnfr.is_success() {
            return Err(XfrError::from_reply(rnfr.code, rnfr.message()));
        }
        self.codec.expect_ok(&format!("RNTO {}", to)).await?;
        self.touch();
        Ok(())
    }

    // ─── Stat ────────────────────────────────────────────────────

    /// Facts about a single path; `None` when it does not exist.
    ///
    /// Uses MLST when advertised, otherwise lists the parent directory.
    pub async fn stat_entry(&mut self, path: &str) -> XfrResult<Option<FtpEntry>> {
        let path = self.absolute(path);
        let parent = match parent_remote(&path) {
            Some(p) => p.to_string(),
            None => {
                return Ok(Some(FtpEntry {
                    name: "/".into(),
                    kind: FtpEntryKind::Directory,
                    size: 0,
                    modified: None,
                    permissions: None,
                    owner: None,
                    group: None,
                    link_target: None,
                }))
            }
        };

        if self.features.mlst {
            let resp = self.codec.execute(&format!("MLST {}", path)).await?;
            if !resp.is_success() {
                if resp.code == 550 || resp.code == 450 {
                    return Ok(None);
                }
                return Err(XfrError::from_reply(resp.code, resp.message()));
            }
            // MLST facts come on the control channel between 250 lines:
            // 250-Listing /foo
            //  type=file;size=1234;modify=20260101120000; /foo
            // 250 End
            let entry = resp
                .lines
                .iter()
                .filter(|l| l.starts_with(' '))
                .find_map(|l| parser::parse_line(l.trim_start()))
                .ok_or_else(|| XfrError::protocol("MLST: no fact line in response"))?;
            return Ok(Some(entry));
        }

        let name = path.rsplit('/').find(|s| !s.is_empty()).unwrap_or("");
        let listing = match self.list(&parent).await {
            Ok(l) => l,
            Err(e) if e.code == Some(550) || e.code == Some(450) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(listing.entries.into_iter().find(|e| e.name == name))
    }

    // ─── MFMT (set modification time) ───────────────────────────

    /// Set the modification time of a remote file (RFC 3659 MFMT).
    pub async fn set_modified(&mut self, path: &str, modified: DateTime<Utc>) -> XfrResult<()> {
        if !self.features.mfmt {
            return Err(XfrError::unsupported("Server does not support MFMT"));
        }
        let path = self.absolute(path);
        self.codec
            .expect_ok(&format!("MFMT {} {}", parser::format_mlsd_time(&modified), path))
            .await?;
        self.touch();
        Ok(())
    }
}
