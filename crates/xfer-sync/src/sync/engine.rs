//! SyncEngine: snapshot both trees, publish the plan, apply it.
//!
//! Apply runs in three phases so the ordering constraints hold even though
//! transfers execute concurrently: directories are created first, then the
//! transfers are queued in plan order and awaited, then deletes run deepest
//! first. Directory creation and deletes go straight through one pooled
//! session; transfers become ordinary TransferManager tasks.

use crate::sync::filter::PathFilter;
use crate::sync::plan::{diff, DiffOptions};
use crate::sync::snapshot::{local_snapshot, remote_snapshot};
use crate::sync::types::{Side, SyncAction, SyncConfig, SyncPlan, SyncReport, SyncRequest};
use tracing::{info, warn};
use xfer_core::{
    join_remote, local, Direction, Event, EventBus, TaskId, TransferRequest, XfrError, XfrResult,
};
use xfer_transfer::{TransferManager, TransferState};

#[derive(Clone)]
pub struct SyncEngine {
    manager: TransferManager,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(manager: TransferManager, config: SyncConfig) -> Self {
        Self { manager, config }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn events(&self) -> &EventBus {
        self.manager.events()
    }

    /// Compute the plan and publish `sync-plan-ready` plus one
    /// `conflict-detected` per conflict.
    pub async fn plan(&self, request: &SyncRequest) -> XfrResult<SyncPlan> {
        let filter = PathFilter::new(&request.include, &request.exclude)?;
        let local = local_snapshot(&request.local_root, &filter).await?;
        let remote = {
            let mut pooled = self.manager.pool().checkout(&request.profile).await?;
            let snap = remote_snapshot(pooled.session()?, &request.remote_root, &filter).await;
            pooled.release();
            snap?
        };

        let opts = DiffOptions {
            direction: request.direction,
            policy: request.policy,
            delete_extra: request.delete_extra,
            tolerance: self.config.tolerance(),
        };
        let plan = diff(&local, &remote, &opts, request.dry_run);
        info!(
            profile = %request.profile.id,
            local_entries = local.len(),
            remote_entries = remote.len(),
            actions = plan.actions.len(),
            conflicts = plan.conflicts.len(),
            skipped = plan.skipped,
            "sync plan ready"
        );

        self.events().publish(Event::SyncPlanReady {
            summary: plan.summary.clone(),
        });
        for c in &plan.conflicts {
            self.events().publish(Event::ConflictDetected {
                path: c.rel_path.clone(),
                local: c.local,
                remote: c.remote,
            });
        }
        Ok(plan)
    }

    /// Plan, then apply unless the request is a dry run.
    pub async fn run(&self, request: &SyncRequest) -> XfrResult<SyncReport> {
        let plan = self.plan(request).await?;
        if request.dry_run {
            self.events().publish(Event::SyncCompleted {
                summary: plan.summary.clone(),
                failed: 0,
            });
            return Ok(SyncReport {
                plan,
                tasks: Vec::new(),
                failed: 0,
            });
        }
        self.apply(request, plan).await
    }

    /// Execute a previously computed plan. A failing action is counted and
    /// logged; the remaining actions still run.
    pub async fn apply(&self, request: &SyncRequest, plan: SyncPlan) -> XfrResult<SyncReport> {
        let mut failed = 0usize;

        // ── Phase 1: directories ─────────────────────────────────────
        let touches_local = plan.actions.iter().any(|a| {
            matches!(
                a,
                SyncAction::CreateDir { side: Side::Local, .. }
                    | SyncAction::Transfer { direction: Direction::Download, .. }
            )
        });
        let touches_remote = plan.actions.iter().any(|a| {
            matches!(
                a,
                SyncAction::CreateDir { side: Side::Remote, .. }
                    | SyncAction::Transfer { direction: Direction::Upload, .. }
            )
        });
        if touches_local {
            local::mkdir_all(&request.local_root)?;
        }
        if touches_remote {
            let mut pooled = self.manager.pool().checkout(&request.profile).await?;
            let session = pooled.session()?;
            if session.stat(&request.remote_root).await?.is_none() {
                session.mkdir(&request.remote_root).await?;
            }
            for action in &plan.actions {
                if let SyncAction::CreateDir { side: Side::Remote, rel_path, .. } = action {
                    let path = join_remote(&request.remote_root, rel_path);
                    if let Err(e) = session.mkdir(&path).await {
                        warn!(path = %path, error = %e, "remote mkdir failed");
                        failed += 1;
                    }
                }
            }
            pooled.release();
        }
        for action in &plan.actions {
            if let SyncAction::CreateDir { side: Side::Local, rel_path, .. } = action {
                let path = request.local_root.join(rel_path);
                if let Err(e) = local::mkdir_all(&path) {
                    warn!(path = %path.display(), error = %e, "local mkdir failed");
                    failed += 1;
                }
            }
        }

        // ── Phase 2: transfers ───────────────────────────────────────
        let mut tasks: Vec<TaskId> = Vec::new();
        for action in &plan.actions {
            if let SyncAction::Transfer {
                direction,
                rel_path,
                size,
                modified,
                ..
            } = action
            {
                let local_path = request.local_root.join(rel_path);
                let remote_path = join_remote(&request.remote_root, rel_path);
                let mut transfer = match direction {
                    Direction::Upload => {
                        TransferRequest::upload(request.profile.clone(), local_path, remote_path)
                    }
                    Direction::Download => {
                        TransferRequest::download(request.profile.clone(), remote_path, local_path)
                    }
                };
                transfer.size_hint = Some(*size);
                if self.config.preserve_timestamps {
                    transfer.preserve_mtime = *modified;
                }
                tasks.push(self.manager.enqueue(transfer)?);
            }
        }
        for id in &tasks {
            let task = self.manager.wait_terminal(*id).await?;
            if task.state != TransferState::Completed {
                warn!(task = %id, state = ?task.state, path = %task.remote_path, "sync transfer did not complete");
                failed += 1;
            }
        }

        // ── Phase 3: deletes ─────────────────────────────────────────
        let has_remote_deletes = plan
            .deletes()
            .any(|a| matches!(a, SyncAction::Delete { side: Side::Remote, .. }));
        let mut pooled = if has_remote_deletes {
            Some(self.manager.pool().checkout(&request.profile).await?)
        } else {
            None
        };
        for action in plan.deletes() {
            if let SyncAction::Delete { side, rel_path, .. } = action {
                let result = match side {
                    Side::Local => local::remove(&request.local_root.join(rel_path)),
                    Side::Remote => match pooled.as_mut() {
                        Some(p) => {
                            let path = join_remote(&request.remote_root, rel_path);
                            match p.session() {
                                Ok(s) => s.delete(&path).await,
                                Err(e) => Err(e),
                            }
                        }
                        None => Err(XfrError::connection("no session for remote delete")),
                    },
                };
                if let Err(e) = result {
                    warn!(path = %rel_path, side = ?side, error = %e, "sync delete failed");
                    failed += 1;
                }
            }
        }
        if let Some(p) = pooled {
            p.release();
        }

        info!(
            profile = %request.profile.id,
            transfers = tasks.len(),
            failed,
            "sync applied"
        );
        self.events().publish(Event::SyncCompleted {
            summary: plan.summary.clone(),
            failed,
        });
        Ok(SyncReport {
            plan,
            tasks,
            failed,
        })
    }
}
