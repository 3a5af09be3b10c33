// ── Sync module ──────────────────────────────────────────────────────
//
// types     request, policy, plan and report shapes
// filter    include / exclude glob matching on relative paths
// snapshot  local walk and recursive remote listing keyed by relative path
// plan      diff classification and plan ordering
// engine    SyncEngine: plan, publish, apply through the transfer manager

pub mod engine;
pub mod filter;
pub mod plan;
pub mod snapshot;
pub mod types;

pub use engine::SyncEngine;
pub use types::*;
