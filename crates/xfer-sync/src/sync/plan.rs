//! Diff two snapshots into an ordered plan.
//!
//! Order: create-dir actions shallow first, then transfers, then deletes
//! deepest first so children go before their parent directory.

use crate::sync::snapshot::Snapshot;
use crate::sync::types::{
    ActionReason, ConflictPolicy, ConflictReason, Side, SyncAction, SyncConflict, SyncDirection,
    SyncPlan,
};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::time::Duration;
use xfer_core::{Direction, EntryKind, EntryMeta, SyncSummary};

/// Inputs of the diff that are not part of the snapshots.
#[derive(Debug, Clone, Copy)]
pub struct DiffOptions {
    pub direction: SyncDirection,
    pub policy: ConflictPolicy,
    pub delete_extra: bool,
    pub tolerance: Duration,
}

fn depth(rel_path: &str) -> usize {
    rel_path.matches('/').count()
}

/// `a` compared to `b`, `Equal` when within `tolerance` or either is unknown.
fn compare_mtime(
    a: Option<DateTime<Utc>>,
    b: Option<DateTime<Utc>>,
    tolerance: Duration,
) -> Ordering {
    let (a, b) = match (a, b) {
        (Some(a), Some(b)) => (a, b),
        _ => return Ordering::Equal,
    };
    let delta = a.signed_duration_since(b);
    let tol = chrono::Duration::from_std(tolerance).unwrap_or_else(|_| chrono::Duration::zero());
    if delta > tol {
        Ordering::Greater
    } else if -delta > tol {
        Ordering::Less
    } else {
        Ordering::Equal
    }
}

fn differs(local: &EntryMeta, remote: &EntryMeta, tolerance: Duration) -> bool {
    local.size != remote.size
        || compare_mtime(local.modified, remote.modified, tolerance) != Ordering::Equal
}

fn is_under(rel_path: &str, dirs: &BTreeSet<String>) -> bool {
    rel_path
        .match_indices('/')
        .any(|(i, _)| dirs.contains(&rel_path[..i]))
}

#[derive(Default)]
struct Builder {
    mkdirs: Vec<SyncAction>,
    transfers: Vec<SyncAction>,
    deletes: Vec<SyncAction>,
    conflicts: Vec<SyncConflict>,
    skipped: usize,
    summary: SyncSummary,
}

impl Builder {
    fn mkdir(&mut self, side: Side, rel: &str, reason: ActionReason) {
        self.summary.create_dirs += 1;
        self.mkdirs.push(SyncAction::CreateDir {
            side,
            rel_path: rel.to_string(),
            reason,
        });
    }

    fn transfer(&mut self, direction: Direction, rel: &str, src: &EntryMeta, reason: ActionReason) {
        match direction {
            Direction::Upload => self.summary.uploads += 1,
            Direction::Download => self.summary.downloads += 1,
        }
        self.summary.bytes += src.size;
        self.transfers.push(SyncAction::Transfer {
            direction,
            rel_path: rel.to_string(),
            size: src.size,
            modified: src.modified,
            reason,
        });
    }

    fn delete(&mut self, side: Side, rel: &str, kind: EntryKind) {
        self.summary.deletes += 1;
        self.deletes.push(SyncAction::Delete {
            side,
            rel_path: rel.to_string(),
            kind,
            reason: ActionReason::Removed,
        });
    }

    /// Copy `src` over the other side, or create the directory there.
    fn add(&mut self, direction: Direction, rel: &str, src: &EntryMeta) {
        if src.kind == EntryKind::Directory {
            let side = match direction {
                Direction::Upload => Side::Remote,
                Direction::Download => Side::Local,
            };
            self.mkdir(side, rel, ActionReason::Added);
        } else {
            self.transfer(direction, rel, src, ActionReason::Added);
        }
    }

    fn conflict(
        &mut self,
        rel: &str,
        reason: ConflictReason,
        local: Option<&EntryMeta>,
        remote: Option<&EntryMeta>,
    ) {
        self.summary.conflicts += 1;
        self.conflicts.push(SyncConflict {
            rel_path: rel.to_string(),
            reason,
            local: local.copied(),
            remote: remote.copied(),
        });
    }

    fn finish(mut self, dry_run: bool) -> SyncPlan {
        let shallow_first = |a: &SyncAction, b: &SyncAction| {
            depth(a.rel_path())
                .cmp(&depth(b.rel_path()))
                .then_with(|| a.rel_path().cmp(b.rel_path()))
        };
        self.mkdirs.sort_by(shallow_first);
        self.transfers.sort_by(|a, b| a.rel_path().cmp(b.rel_path()));
        self.deletes.sort_by(|a, b| shallow_first(b, a));
        self.summary.skipped = self.skipped;
        self.summary.dry_run = dry_run;

        let mut actions = self.mkdirs;
        actions.extend(self.transfers);
        actions.extend(self.deletes);
        SyncPlan {
            actions,
            conflicts: self.conflicts,
            skipped: self.skipped,
            summary: self.summary,
        }
    }
}

/// Classify every relative path present on either side.
pub fn diff(local: &Snapshot, remote: &Snapshot, opts: &DiffOptions, dry_run: bool) -> SyncPlan {
    let mut b = Builder::default();
    let keys: BTreeSet<&String> = local.keys().chain(remote.keys()).collect();
    // Paths below a file/directory clash are left alone.
    let mut clashed: BTreeSet<String> = BTreeSet::new();

    for rel in keys {
        if is_under(rel, &clashed) {
            b.skipped += 1;
            continue;
        }
        match (local.get(rel), remote.get(rel)) {
            (Some(l), None) => only_one_side(&mut b, opts, rel, l, Direction::Upload),
            (None, Some(r)) => only_one_side(&mut b, opts, rel, r, Direction::Download),
            (Some(l), Some(r)) => {
                let l_dir = l.kind == EntryKind::Directory;
                let r_dir = r.kind == EntryKind::Directory;
                if l_dir != r_dir {
                    b.conflict(rel, ConflictReason::KindMismatch, Some(l), Some(r));
                    clashed.insert(rel.clone());
                } else if l_dir {
                    // Both directories; their contents are compared on their own.
                } else if !differs(l, r, opts.tolerance) {
                    b.skipped += 1;
                } else {
                    both_files(&mut b, opts, rel, l, r);
                }
            }
            (None, None) => {}
        }
    }

    b.finish(dry_run)
}

fn only_one_side(b: &mut Builder, opts: &DiffOptions, rel: &str, meta: &EntryMeta, toward: Direction) {
    if opts.direction.permits(toward) {
        b.add(toward, rel, meta);
    } else if opts.delete_extra {
        let side = match toward {
            Direction::Upload => Side::Local,
            Direction::Download => Side::Remote,
        };
        b.delete(side, rel, meta.kind);
    } else {
        b.skipped += 1;
    }
}

fn both_files(b: &mut Builder, opts: &DiffOptions, rel: &str, l: &EntryMeta, r: &EntryMeta) {
    let newer = compare_mtime(l.modified, r.modified, opts.tolerance);
    let resolved = match opts.policy {
        ConflictPolicy::SkipAndReport => {
            b.conflict(rel, ConflictReason::Modified, Some(l), Some(r));
            return;
        }
        ConflictPolicy::AlwaysUpload => Direction::Upload,
        ConflictPolicy::AlwaysDownload => Direction::Download,
        ConflictPolicy::NewerWins => match newer {
            Ordering::Greater => Direction::Upload,
            Ordering::Less => Direction::Download,
            Ordering::Equal => {
                b.conflict(rel, ConflictReason::Ambiguous, Some(l), Some(r));
                return;
            }
        },
    };
    if !opts.direction.permits(resolved) {
        b.skipped += 1;
        return;
    }
    let (src, overwrites_newer) = match resolved {
        Direction::Upload => (l, newer == Ordering::Less),
        Direction::Download => (r, newer == Ordering::Greater),
    };
    let reason = if overwrites_newer {
        ActionReason::Conflict
    } else {
        ActionReason::Modified
    };
    b.transfer(resolved, rel, src, reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use xfer_core::testing::epoch;

    fn file(size: u64, secs: i64) -> EntryMeta {
        EntryMeta {
            size,
            modified: Some(epoch(secs)),
            kind: EntryKind::File,
        }
    }

    fn dir() -> EntryMeta {
        EntryMeta {
            size: 0,
            modified: Some(epoch(0)),
            kind: EntryKind::Directory,
        }
    }

    fn snap(entries: &[(&str, EntryMeta)]) -> Snapshot {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn opts(direction: SyncDirection, policy: ConflictPolicy) -> DiffOptions {
        DiffOptions {
            direction,
            policy,
            delete_extra: false,
            tolerance: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_local_only_file_uploads_once() {
        let local = snap(&[("new.txt", file(5, 100))]);
        let plan = diff(&local, &Snapshot::new(), &opts(SyncDirection::Upload, ConflictPolicy::NewerWins), false);

        assert_eq!(plan.transfers().count(), 1);
        assert_eq!(plan.deletes().count(), 0);
        assert_eq!(
            plan.actions[0],
            SyncAction::Transfer {
                direction: Direction::Upload,
                rel_path: "new.txt".into(),
                size: 5,
                modified: Some(epoch(100)),
                reason: ActionReason::Added,
            }
        );
        assert_eq!(plan.summary.uploads, 1);
        assert_eq!(plan.summary.bytes, 5);
    }

    #[test]
    fn test_equal_within_tolerance_is_skipped() {
        let local = snap(&[("a", file(10, 1_000))]);
        let remote = snap(&[("a", file(10, 1_001))]);
        let plan = diff(&local, &remote, &opts(SyncDirection::Bidirectional, ConflictPolicy::NewerWins), false);
        assert!(plan.is_empty());
        assert_eq!(plan.skipped, 1);
        assert!(plan.summary.is_empty());
    }

    #[test]
    fn test_newer_wins_picks_direction() {
        let local = snap(&[("l", file(1, 500)), ("r", file(1, 100))]);
        let remote = snap(&[("l", file(2, 100)), ("r", file(2, 500))]);
        let plan = diff(&local, &remote, &opts(SyncDirection::Bidirectional, ConflictPolicy::NewerWins), false);

        let dirs: Vec<(String, Direction)> = plan
            .transfers()
            .map(|a| match a {
                SyncAction::Transfer { rel_path, direction, .. } => (rel_path.clone(), *direction),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(
            dirs,
            vec![("l".into(), Direction::Upload), ("r".into(), Direction::Download)]
        );
    }

    #[test]
    fn test_newer_wins_without_clear_winner_reports() {
        let local = snap(&[("a", file(1, 100))]);
        let remote = snap(&[("a", file(2, 101))]);
        let plan = diff(&local, &remote, &opts(SyncDirection::Bidirectional, ConflictPolicy::NewerWins), false);
        assert!(plan.actions.is_empty());
        assert_eq!(plan.conflicts.len(), 1);
        assert_eq!(plan.conflicts[0].reason, ConflictReason::Ambiguous);
    }

    #[test]
    fn test_forced_policy_tags_overwrite_of_newer() {
        let local = snap(&[("a", file(1, 100))]);
        let remote = snap(&[("a", file(2, 900))]);
        let plan = diff(&local, &remote, &opts(SyncDirection::Bidirectional, ConflictPolicy::AlwaysUpload), false);
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.actions[0].reason(), ActionReason::Conflict);

        let plan = diff(&local, &remote, &opts(SyncDirection::Bidirectional, ConflictPolicy::AlwaysDownload), false);
        assert_eq!(plan.actions[0].reason(), ActionReason::Modified);
    }

    #[test]
    fn test_skip_and_report_never_guesses() {
        let local = snap(&[("a", file(1, 100))]);
        let remote = snap(&[("a", file(2, 900))]);
        let plan = diff(&local, &remote, &opts(SyncDirection::Bidirectional, ConflictPolicy::SkipAndReport), false);
        assert!(plan.actions.is_empty());
        assert_eq!(plan.conflicts[0].reason, ConflictReason::Modified);
        assert_eq!(plan.conflicts[0].local, Some(file(1, 100)));
        assert_eq!(plan.summary.conflicts, 1);
    }

    #[test]
    fn test_one_way_resolution_against_direction_is_skipped() {
        let local = snap(&[("a", file(1, 100))]);
        let remote = snap(&[("a", file(2, 900))]);
        let plan = diff(&local, &remote, &opts(SyncDirection::Upload, ConflictPolicy::NewerWins), false);
        assert!(plan.is_empty());
        assert_eq!(plan.skipped, 1);
    }

    #[test]
    fn test_delete_extra_mirrors_deepest_first() {
        let remote = snap(&[
            ("old", dir()),
            ("old/deep", dir()),
            ("old/deep/x.bin", file(3, 0)),
            ("old/y.bin", file(3, 0)),
        ]);
        let mut o = opts(SyncDirection::Upload, ConflictPolicy::NewerWins);
        let plan = diff(&Snapshot::new(), &remote, &o, false);
        assert!(plan.actions.is_empty());
        assert_eq!(plan.skipped, 4);

        o.delete_extra = true;
        let plan = diff(&Snapshot::new(), &remote, &o, false);
        let order: Vec<&str> = plan.actions.iter().map(|a| a.rel_path()).collect();
        assert_eq!(order, vec!["old/deep/x.bin", "old/y.bin", "old/deep", "old"]);
        assert!(plan
            .actions
            .iter()
            .all(|a| matches!(a, SyncAction::Delete { side: Side::Remote, .. })));
    }

    #[test]
    fn test_dirs_created_shallow_first_before_transfers() {
        let remote = snap(&[
            ("a", dir()),
            ("a/b", dir()),
            ("a/b/c.txt", file(1, 0)),
            ("a/top.txt", file(1, 0)),
        ]);
        let plan = diff(&Snapshot::new(), &remote, &opts(SyncDirection::Download, ConflictPolicy::NewerWins), false);
        let order: Vec<&str> = plan.actions.iter().map(|a| a.rel_path()).collect();
        assert_eq!(order, vec!["a", "a/b", "a/b/c.txt", "a/top.txt"]);
        assert!(matches!(plan.actions[0], SyncAction::CreateDir { side: Side::Local, .. }));
        assert_eq!(plan.summary.create_dirs, 2);
        assert_eq!(plan.summary.downloads, 2);
    }

    #[test]
    fn test_file_dir_clash_is_conflict_and_subtree_left_alone() {
        let local = snap(&[("x", file(1, 0))]);
        let remote = snap(&[("x", dir()), ("x/inner.txt", file(1, 0))]);
        let plan = diff(&local, &remote, &opts(SyncDirection::Bidirectional, ConflictPolicy::NewerWins), false);
        assert!(plan.actions.is_empty());
        assert_eq!(plan.conflicts.len(), 1);
        assert_eq!(plan.conflicts[0].reason, ConflictReason::KindMismatch);
        assert_eq!(plan.skipped, 1);
    }

    #[test]
    fn test_unknown_mtime_compares_size_only() {
        let mut l = file(10, 0);
        l.modified = None;
        let local = snap(&[("a", l)]);
        let remote = snap(&[("a", file(10, 5_000))]);
        let plan = diff(&local, &remote, &opts(SyncDirection::Bidirectional, ConflictPolicy::NewerWins), true);
        assert!(plan.is_empty());
        assert!(plan.summary.dry_run);
    }
}
