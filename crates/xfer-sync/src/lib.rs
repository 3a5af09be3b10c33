pub mod sync;

pub use sync::{
    ActionReason, ConflictPolicy, ConflictReason, Side, SyncAction, SyncConfig, SyncConflict,
    SyncDirection, SyncEngine, SyncPlan, SyncReport, SyncRequest,
};
