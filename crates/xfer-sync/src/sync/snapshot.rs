//! Directory snapshots keyed by relative path.

use crate::sync::filter::PathFilter;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;
use xfer_core::{join_remote, local, EntryKind, EntryMeta, RemoteSession, XfrResult};

/// Relative `/`-separated path → metadata. Symlinks are never recorded.
pub type Snapshot = BTreeMap<String, EntryMeta>;

/// Walk the local tree on a blocking thread.
pub async fn local_snapshot(root: &Path, filter: &PathFilter) -> XfrResult<Snapshot> {
    let entries = local::walk_async(root.to_path_buf()).await?;
    let mut snap = Snapshot::new();
    for e in entries {
        if e.kind == EntryKind::Symlink {
            continue;
        }
        if !filter.allows(&e.rel_path, e.kind == EntryKind::Directory) {
            continue;
        }
        snap.insert(
            e.rel_path,
            EntryMeta {
                size: e.size,
                modified: e.modified,
                kind: e.kind,
            },
        );
    }
    debug!(root = %root.display(), entries = snap.len(), "local snapshot");
    Ok(snap)
}

/// List `root` recursively. A missing root yields an empty snapshot.
pub async fn remote_snapshot(
    session: &mut dyn RemoteSession,
    root: &str,
    filter: &PathFilter,
) -> XfrResult<Snapshot> {
    let mut snap = Snapshot::new();
    let mut pending = vec![String::new()];
    while let Some(rel_dir) = pending.pop() {
        let dir = join_remote(root, &rel_dir);
        let listing = match session.list(&dir).await {
            Ok(l) => l,
            Err(e) if e.is_not_found() && rel_dir.is_empty() => break,
            Err(e) => return Err(e),
        };
        for entry in listing {
            let name = entry.name();
            if name.is_empty() || name == "." || name == ".." {
                continue;
            }
            if entry.kind == EntryKind::Symlink {
                continue;
            }
            let rel = if rel_dir.is_empty() {
                name.to_string()
            } else {
                format!("{}/{}", rel_dir, name)
            };
            let is_dir = entry.is_dir();
            if !filter.allows(&rel, is_dir) {
                continue;
            }
            if is_dir {
                pending.push(rel.clone());
            }
            snap.insert(rel, entry.meta());
        }
    }
    debug!(root, entries = snap.len(), "remote snapshot");
    Ok(snap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use xfer_core::testing::{epoch, MemoryConnector, MemoryFs};
    use xfer_core::{ConnectionProfile, Connector, Scheme};

    #[tokio::test]
    async fn test_local_snapshot_applies_filter() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("keep/cache")).unwrap();
        fs::write(dir.path().join("keep/a.txt"), b"abc").unwrap();
        fs::write(dir.path().join("keep/cache/junk.bin"), b"x").unwrap();
        fs::write(dir.path().join("b.tmp"), b"y").unwrap();

        let filter = PathFilter::new(&[], &["cache".into(), "*.tmp".into()]).unwrap();
        let snap = local_snapshot(dir.path(), &filter).await.unwrap();
        let keys: Vec<&str> = snap.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["keep", "keep/a.txt"]);
        assert_eq!(snap["keep/a.txt"].size, 3);
        assert_eq!(snap["keep"].kind, EntryKind::Directory);
    }

    #[tokio::test]
    async fn test_remote_snapshot_recurses() {
        let tree = MemoryFs::new();
        tree.add_file("/site/index.html", b"<html>".to_vec(), epoch(100));
        tree.add_file("/site/img/logo.png", vec![0u8; 64], epoch(200));
        tree.add_file("/elsewhere/x", b"x".to_vec(), epoch(0));
        let connector = MemoryConnector::new(tree);
        let mut session = connector
            .connect(&ConnectionProfile::new(Scheme::Ftp, "h"))
            .await
            .unwrap();

        let snap = remote_snapshot(session.as_mut(), "/site", &PathFilter::default())
            .await
            .unwrap();
        let keys: Vec<&str> = snap.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["img", "img/logo.png", "index.html"]);
        assert_eq!(snap["img/logo.png"].size, 64);
        assert_eq!(snap["index.html"].modified, Some(epoch(100)));
    }

    #[tokio::test]
    async fn test_missing_remote_root_is_empty() {
        let connector = MemoryConnector::new(MemoryFs::new());
        let mut session = connector
            .connect(&ConnectionProfile::new(Scheme::Ftp, "h"))
            .await
            .unwrap();
        let snap = remote_snapshot(session.as_mut(), "/nope", &PathFilter::default())
            .await
            .unwrap();
        assert!(snap.is_empty());
    }
}
