// ─── Transfer types ──────────────────────────────────────────────────

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use xfer_core::{Direction, ErrorKind, TaskId};

/// Lifecycle of a queued transfer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum TransferState {
    Queued,
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TransferState {
    /// No further state change happens without a caller request.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Failed | TransferState::Cancelled
        )
    }

    /// Terminal, or paused and waiting for `resume`.
    pub fn is_settled(&self) -> bool {
        self.is_terminal() || *self == TransferState::Paused
    }
}

/// Read-only snapshot of a task record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransferTask {
    pub id: TaskId,
    pub profile_id: String,
    pub direction: Direction,
    pub local_path: PathBuf,
    pub remote_path: String,
    /// Bytes already present at the destination; the next attempt resumes here.
    pub offset: u64,
    pub total: Option<u64>,
    pub state: TransferState,
    /// Attempts started since the last manual enqueue or retry.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub last_error_kind: Option<ErrorKind>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Task counts per state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub total: usize,
    pub queued: usize,
    pub active: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl QueueStats {
    pub(crate) fn count(&mut self, state: TransferState) {
        self.total += 1;
        let slot = match state {
            TransferState::Queued => &mut self.queued,
            TransferState::Active => &mut self.active,
            TransferState::Paused => &mut self.paused,
            TransferState::Completed => &mut self.completed,
            TransferState::Failed => &mut self.failed,
            TransferState::Cancelled => &mut self.cancelled,
        };
        *slot += 1;
    }
}

// ─── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransferConfig {
    /// Worker count, i.e. transfers active at once across all profiles.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Attempts per task before it fails for good.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first automatic retry.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Upper bound for the doubled delay.
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    /// Minimum gap between two progress events of one task.
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// Per-transfer bandwidth cap in bytes per second.
    #[serde(default)]
    pub bandwidth_limit: Option<u64>,
}

fn default_workers() -> usize {
    3
}
fn default_max_attempts() -> u32 {
    5
}
fn default_retry_base_ms() -> u64 {
    1_000
}
fn default_retry_max_ms() -> u64 {
    60_000
}
fn default_progress_interval_ms() -> u64 {
    250
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            progress_interval_ms: default_progress_interval_ms(),
            bandwidth_limit: None,
        }
    }
}

impl TransferConfig {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// Sessions open at once per profile.
    #[serde(default = "default_max_sessions")]
    pub max_sessions_per_profile: usize,
    /// Idle sessions older than this are closed instead of reused.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

fn default_max_sessions() -> usize {
    2
}
fn default_idle_timeout() -> u64 {
    300
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_profile: default_max_sessions(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_from_empty_json() {
        let t: TransferConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(t, TransferConfig::default());
        assert_eq!(t.workers, 3);
        assert_eq!(t.progress_interval(), Duration::from_millis(250));

        let p: PoolConfig = serde_json::from_str(r#"{"maxSessionsPerProfile": 4}"#).unwrap();
        assert_eq!(p.max_sessions_per_profile, 4);
        assert_eq!(p.idle_timeout_secs, 300);
    }

    #[test]
    fn test_settled_states() {
        assert!(TransferState::Paused.is_settled());
        assert!(!TransferState::Paused.is_terminal());
        assert!(TransferState::Cancelled.is_terminal());
        assert!(!TransferState::Queued.is_settled());
        assert!(!TransferState::Active.is_settled());
    }
}
