//! Local filesystem collaborator: tree walk and offset-aware open helpers.
//!
//! The walk is blocking and should run on `spawn_blocking`; `walk_async`
//! does that for callers on the runtime.

use crate::error::{XfrError, XfrResult};
use crate::types::EntryKind;
use chrono::{DateTime, Utc};
use filetime::FileTime;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// One local filesystem entry, keyed by its `/`-separated path relative to
/// the walk root.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalEntry {
    pub rel_path: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub kind: EntryKind,
}

/// Walk `root` recursively without following symlinks. The root itself is
/// not included. A missing root yields an empty list.
pub fn walk(root: &Path) -> XfrResult<Vec<LocalEntry>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for item in WalkDir::new(root).min_depth(1).follow_links(false) {
        let item = item.map_err(|e| XfrError::filesystem(format!("walk {}: {}", root.display(), e)))?;
        let meta = item
            .path()
            .symlink_metadata()
            .map_err(|e| XfrError::filesystem(format!("stat {}: {}", item.path().display(), e)))?;
        let kind = if meta.file_type().is_symlink() {
            EntryKind::Symlink
        } else if meta.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        let rel = item
            .path()
            .strip_prefix(root)
            .map_err(|e| XfrError::filesystem(e.to_string()))?;
        let rel_path = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        out.push(LocalEntry {
            rel_path,
            path: item.path().to_path_buf(),
            size: if kind == EntryKind::File { meta.len() } else { 0 },
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
            kind,
        });
    }
    Ok(out)
}

pub async fn walk_async(root: PathBuf) -> XfrResult<Vec<LocalEntry>> {
    tokio::task::spawn_blocking(move || walk(&root)).await?
}

/// Open `path` for reading positioned at `offset`.
pub fn open_for_read_std(path: &Path, offset: u64) -> XfrResult<File> {
    let mut file = File::open(path)
        .map_err(|e| with_path(e, "open", path))?;
    if offset > 0 {
        file.seek(SeekFrom::Start(offset))?;
    }
    Ok(file)
}

/// Open `path` for writing positioned at `offset`.
///
/// Anything past `offset` is truncated so a resumed transfer never leaves
/// stale trailing bytes. Missing parent directories are created.
pub fn open_for_write_std(path: &Path, offset: u64) -> XfrResult<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| with_path(e, "create", parent))?;
        }
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| with_path(e, "open", path))?;
    let current = file.metadata()?.len();
    if current < offset {
        return Err(XfrError::filesystem(format!(
            "{} holds {} bytes, cannot resume at {}",
            path.display(),
            current,
            offset
        )));
    }
    file.set_len(offset)?;
    file.seek(SeekFrom::Start(offset))?;
    Ok(file)
}

pub async fn open_for_read(path: &Path, offset: u64) -> XfrResult<tokio::fs::File> {
    let p = path.to_path_buf();
    let file = tokio::task::spawn_blocking(move || open_for_read_std(&p, offset)).await??;
    Ok(tokio::fs::File::from_std(file))
}

pub async fn open_for_write(path: &Path, offset: u64) -> XfrResult<tokio::fs::File> {
    let p = path.to_path_buf();
    let file = tokio::task::spawn_blocking(move || open_for_write_std(&p, offset)).await??;
    Ok(tokio::fs::File::from_std(file))
}

pub fn file_size(path: &Path) -> XfrResult<u64> {
    Ok(fs::metadata(path).map_err(|e| with_path(e, "stat", path))?.len())
}

pub fn set_modified(path: &Path, modified: DateTime<Utc>) -> XfrResult<()> {
    let ft = FileTime::from_unix_time(modified.timestamp(), modified.timestamp_subsec_nanos());
    filetime::set_file_mtime(path, ft).map_err(|e| with_path(e, "set mtime", path))
}

/// Remove a file or an empty directory. Missing paths are not an error.
pub fn remove(path: &Path) -> XfrResult<()> {
    let meta = match path.symlink_metadata() {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(with_path(e, "stat", path)),
    };
    let res = if meta.is_dir() {
        fs::remove_dir(path)
    } else {
        fs::remove_file(path)
    };
    match res {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(with_path(e, "remove", path)),
    }
}

pub fn mkdir_all(path: &Path) -> XfrResult<()> {
    fs::create_dir_all(path).map_err(|e| with_path(e, "create", path))
}

fn with_path(e: std::io::Error, op: &str, path: &Path) -> XfrError {
    let mut err = XfrError::from(e);
    err.message = format!("{} {}: {}", op, path.display(), err.message);
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_walk_reports_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub/deeper")).unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        fs::write(dir.path().join("sub/deeper/b.bin"), vec![0u8; 42]).unwrap();

        let mut entries = walk(dir.path()).unwrap();
        entries.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        let rels: Vec<_> = entries.iter().map(|e| e.rel_path.as_str()).collect();
        assert_eq!(rels, vec!["a.txt", "sub", "sub/deeper", "sub/deeper/b.bin"]);
        assert_eq!(entries[0].size, 5);
        assert_eq!(entries[1].kind, EntryKind::Directory);
        assert_eq!(entries[3].size, 42);
    }

    #[test]
    fn test_walk_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(walk(&dir.path().join("nope")).unwrap().is_empty());
    }

    #[test]
    fn test_open_for_write_truncates_past_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/part.bin");
        {
            let mut f = open_for_write_std(&path, 0).unwrap();
            f.write_all(b"0123456789").unwrap();
        }
        {
            let mut f = open_for_write_std(&path, 4).unwrap();
            f.write_all(b"xy").unwrap();
        }
        assert_eq!(fs::read(&path).unwrap(), b"0123xy");
        assert!(open_for_write_std(&path, 100).is_err());
    }

    #[test]
    fn test_open_for_read_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.txt");
        fs::write(&path, b"abcdef").unwrap();
        let mut f = open_for_read_std(&path, 2).unwrap();
        let mut s = String::new();
        f.read_to_string(&mut s).unwrap();
        assert_eq!(s, "cdef");
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.txt");
        fs::write(&path, b"x").unwrap();
        remove(&path).unwrap();
        remove(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_set_modified() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.txt");
        fs::write(&path, b"x").unwrap();
        let when = DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        set_modified(&path, when).unwrap();
        let entries = walk(dir.path()).unwrap();
        assert_eq!(entries[0].modified, Some(when));
    }
}
