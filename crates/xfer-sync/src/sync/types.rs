// ─── Sync types ──────────────────────────────────────────────────────

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use xfer_core::{ConnectionProfile, Direction, EntryKind, EntryMeta, SyncSummary, TaskId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SyncDirection {
    /// Local is the source of truth.
    Upload,
    /// Remote is the source of truth.
    Download,
    Bidirectional,
}

impl SyncDirection {
    /// Whether a transfer in `dir` is allowed by this sync direction.
    pub fn permits(&self, dir: Direction) -> bool {
        match self {
            SyncDirection::Bidirectional => true,
            SyncDirection::Upload => dir == Direction::Upload,
            SyncDirection::Download => dir == Direction::Download,
        }
    }
}

/// How a file present on both sides with different size or mtime is resolved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    #[default]
    NewerWins,
    AlwaysDownload,
    AlwaysUpload,
    SkipAndReport,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Side {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ActionReason {
    /// Present on the source side only.
    Added,
    /// Present on both sides and different.
    Modified,
    /// Present on the destination side only (mirror delete).
    Removed,
    /// Forced by policy over a destination that is newer than the source.
    Conflict,
}

/// One step of a plan. Paths are relative to the sync roots, `/`-separated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SyncAction {
    CreateDir {
        side: Side,
        rel_path: String,
        reason: ActionReason,
    },
    Transfer {
        direction: Direction,
        rel_path: String,
        size: u64,
        /// Source mtime, copied to the destination after the transfer.
        modified: Option<DateTime<Utc>>,
        reason: ActionReason,
    },
    Delete {
        side: Side,
        rel_path: String,
        kind: EntryKind,
        reason: ActionReason,
    },
}

impl SyncAction {
    pub fn rel_path(&self) -> &str {
        match self {
            SyncAction::CreateDir { rel_path, .. }
            | SyncAction::Transfer { rel_path, .. }
            | SyncAction::Delete { rel_path, .. } => rel_path,
        }
    }

    pub fn reason(&self) -> ActionReason {
        match self {
            SyncAction::CreateDir { reason, .. }
            | SyncAction::Transfer { reason, .. }
            | SyncAction::Delete { reason, .. } => *reason,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ConflictReason {
    /// Both sides differ and the policy is skip-and-report.
    Modified,
    /// Sizes differ but neither side is measurably newer.
    Ambiguous,
    /// A file on one side, a directory on the other.
    KindMismatch,
}

/// A difference the engine refuses to resolve on its own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncConflict {
    pub rel_path: String,
    pub reason: ConflictReason,
    pub local: Option<EntryMeta>,
    pub remote: Option<EntryMeta>,
}

/// Ordered, immutable result of diffing two snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SyncPlan {
    pub actions: Vec<SyncAction>,
    pub conflicts: Vec<SyncConflict>,
    pub skipped: usize,
    pub summary: SyncSummary,
}

impl SyncPlan {
    /// Nothing to do and nothing to report.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.conflicts.is_empty()
    }

    pub fn transfers(&self) -> impl Iterator<Item = &SyncAction> {
        self.actions
            .iter()
            .filter(|a| matches!(a, SyncAction::Transfer { .. }))
    }

    pub fn deletes(&self) -> impl Iterator<Item = &SyncAction> {
        self.actions
            .iter()
            .filter(|a| matches!(a, SyncAction::Delete { .. }))
    }
}

/// `start_sync` arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub profile: ConnectionProfile,
    pub local_root: PathBuf,
    pub remote_root: String,
    pub direction: SyncDirection,
    #[serde(default)]
    pub policy: ConflictPolicy,
    /// Delete destination-only entries in a one-way sync.
    #[serde(default)]
    pub delete_extra: bool,
    /// Glob patterns a file must match (relative path or base name).
    #[serde(default)]
    pub include: Vec<String>,
    /// Glob patterns that drop a file or a whole directory subtree.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Compute and publish the plan without applying it.
    #[serde(default)]
    pub dry_run: bool,
}

impl SyncRequest {
    pub fn new(
        profile: ConnectionProfile,
        local_root: impl Into<PathBuf>,
        remote_root: impl Into<String>,
        direction: SyncDirection,
    ) -> Self {
        Self {
            profile,
            local_root: local_root.into(),
            remote_root: remote_root.into(),
            direction,
            policy: ConflictPolicy::default(),
            delete_extra: false,
            include: Vec::new(),
            exclude: Vec::new(),
            dry_run: false,
        }
    }

    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Outcome of one `SyncEngine::run`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub plan: SyncPlan,
    /// Transfer tasks submitted, in plan order.
    pub tasks: Vec<TaskId>,
    /// Actions (direct or transferred) that did not complete.
    pub failed: usize,
}

// ─── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// Two mtimes closer than this are treated as equal.
    #[serde(default = "default_tolerance_secs")]
    pub tolerance_secs: u64,
    /// Copy source mtimes onto transferred files.
    #[serde(default = "default_true")]
    pub preserve_timestamps: bool,
}

fn default_tolerance_secs() -> u64 {
    2
}
fn default_true() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tolerance_secs: default_tolerance_secs(),
            preserve_timestamps: default_true(),
        }
    }
}

impl SyncConfig {
    pub fn tolerance(&self) -> Duration {
        Duration::from_secs(self.tolerance_secs)
    }
}
