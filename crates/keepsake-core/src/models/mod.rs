//! Data models for Keepsake sync

mod association;
mod constraint;
mod entity;
mod operation;
mod status;
mod sync_conflict;

pub use association::Association;
pub use constraint::VersionConstraint;
pub use entity::{new_entity_id, EntityType, LocalEntity, Timestamp, Tombstone, VersionedEntity};
pub use operation::{PendingChange, PendingOperation};
pub use status::{
    PendingCounts, SyncError, SyncErrorKind, SyncPhase, SyncResult, SyncStatus,
};
pub use sync_conflict::{ConflictResolution, SyncConflict};
