// ── Directory operations ─────────────────────────────────────────────────────

use crate::sftp::service::{map_ssh_err, SftpConn};
use crate::sftp::types::kind_from_perm;
use chrono::{DateTime, TimeZone, Utc};
use log::{debug, info};
use ssh2::FileStat;
use std::path::Path;
use xfer_core::{join_remote, parent_remote, EntryKind, RemoteEntry, XfrResult};

/// Turn an attribute record into a shared entry. Devices and other special
/// files yield `None`.
pub fn entry_from_stat(path: &str, stat: &FileStat) -> Option<RemoteEntry> {
    let kind = kind_from_perm(stat.perm)?;
    Some(RemoteEntry {
        path: path.to_string(),
        size: if kind == EntryKind::Directory {
            0
        } else {
            stat.size.unwrap_or(0)
        },
        modified: stat.mtime.and_then(from_unix),
        kind,
        permissions: stat.perm.map(|p| p & 0o7777),
    })
}

fn from_unix(secs: u64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(i64::try_from(secs).ok()?, 0).single()
}

impl SftpConn {
    // ── List directory ───────────────────────────────────────────────────────

    pub fn list(&self, dir: &str) -> XfrResult<Vec<RemoteEntry>> {
        let raw = self
            .sftp
            .readdir(Path::new(dir))
            .map_err(|e| map_ssh_err(e, &format!("readdir '{}' failed", dir)))?;

        let entries = raw
            .into_iter()
            .filter_map(|(entry_path, stat)| {
                let name = entry_path.file_name()?.to_string_lossy().to_string();
                if name == "." || name == ".." {
                    return None;
                }
                let entry = entry_from_stat(&join_remote(dir, &name), &stat);
                if entry.is_none() {
                    debug!("Skipping special file {} in {}", name, dir);
                }
                entry
            })
            .collect();
        Ok(entries)
    }

    // ── Stat ─────────────────────────────────────────────────────────────────

    /// `lstat` so that a symlink is reported as such. `None` if missing.
    pub fn stat(&self, path: &str) -> XfrResult<Option<RemoteEntry>> {
        match self.sftp.lstat(Path::new(path)) {
            Ok(stat) => Ok(entry_from_stat(path, &stat)),
            Err(e) => {
                let err = map_ssh_err(e, &format!("stat '{}' failed", path));
                if err.is_not_found() {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    // ── Create directory (with parents) ──────────────────────────────────────

    pub fn mkdir_all(&self, path: &str) -> XfrResult<()> {
        let mut missing = Vec::new();
        let mut cursor = Some(path.trim_end_matches('/'));
        while let Some(p) = cursor {
            if p.is_empty() || p == "/" {
                break;
            }
            match self.stat(p)? {
                Some(e) if e.is_dir() => break,
                Some(_) => {
                    return Err(xfer_core::XfrError::protocol(format!(
                        "'{}' exists and is not a directory",
                        p
                    )))
                }
                None => missing.push(p.to_string()),
            }
            cursor = parent_remote(p);
        }

        for dir in missing.iter().rev() {
            if let Err(e) = self.sftp.mkdir(Path::new(dir), 0o755) {
                // Lost a race with another client creating it.
                if matches!(self.stat(dir)?, Some(ref d) if d.is_dir()) {
                    continue;
                }
                return Err(map_ssh_err(e, &format!("mkdir '{}' failed", dir)));
            }
            info!("SFTP mkdir {}", dir);
        }
        Ok(())
    }

    // ── Delete ───────────────────────────────────────────────────────────────

    /// Remove a file, symlink or empty directory. Already gone is fine.
    pub fn remove(&self, path: &str) -> XfrResult<()> {
        let entry = match self.stat(path)? {
            Some(e) => e,
            None => return Ok(()),
        };
        let result = if entry.is_dir() {
            self.sftp.rmdir(Path::new(path))
        } else {
            self.sftp.unlink(Path::new(path))
        };
        match result {
            Ok(()) => {
                info!("SFTP removed {}", path);
                Ok(())
            }
            Err(e) => {
                let err = map_ssh_err(e, &format!("remove '{}' failed", path));
                if err.is_not_found() {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    // ── Rename ───────────────────────────────────────────────────────────────

    pub fn rename(&self, from: &str, to: &str) -> XfrResult<()> {
        self.sftp
            .rename(Path::new(from), Path::new(to), None)
            .map_err(|e| map_ssh_err(e, &format!("rename '{}' -> '{}' failed", from, to)))?;
        info!("SFTP renamed {} -> {}", from, to);
        Ok(())
    }

    // ── Timestamps ───────────────────────────────────────────────────────────

    pub fn set_modified(&self, path: &str, modified: DateTime<Utc>) -> XfrResult<()> {
        let secs = modified.timestamp().max(0) as u64;
        let stat = FileStat {
            size: None,
            uid: None,
            gid: None,
            perm: None,
            atime: Some(secs),
            mtime: Some(secs),
        };
        self.sftp
            .setstat(Path::new(path), stat)
            .map_err(|e| map_ssh_err(e, &format!("setstat '{}' failed", path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(perm: u32, size: u64, mtime: u64) -> FileStat {
        FileStat {
            size: Some(size),
            uid: None,
            gid: None,
            perm: Some(perm),
            atime: None,
            mtime: Some(mtime),
        }
    }

    #[test]
    fn test_entry_from_file_stat() {
        let e = entry_from_stat("/d/a.txt", &stat(0o100640, 12, 1_700_000_000)).unwrap();
        assert_eq!(e.kind, EntryKind::File);
        assert_eq!(e.size, 12);
        assert_eq!(e.permissions, Some(0o640));
        assert_eq!(e.modified.unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_directory_size_is_zero() {
        let e = entry_from_stat("/d", &stat(0o040755, 4096, 0)).unwrap();
        assert!(e.is_dir());
        assert_eq!(e.size, 0);
    }

    #[test]
    fn test_special_files_are_skipped() {
        assert!(entry_from_stat("/dev/null", &stat(0o020666, 0, 0)).is_none());
        assert!(entry_from_stat("/run/s", &stat(0o140777, 0, 0)).is_none());
    }
}
