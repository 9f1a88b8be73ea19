//! Sync conflict model

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::EntityType;

/// Server-winning state recorded for an entity whose local edit is still pending.
///
/// Conflicts are never merged automatically; they stay open until the user
/// picks a [`ConflictResolution`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict row identifier
    pub id: i64,
    pub entity_type: EntityType,
    pub entity_id: String,
    /// Server version the local edit was based on
    pub local_version: Option<u64>,
    /// Server's current version (`None` when the server never had the entity)
    pub server_version: Option<u64>,
    /// Server's current payload, absent when deleted or unknown
    pub server_payload: Option<Value>,
    /// Whether the server side is a tombstone
    pub server_deleted: bool,
    /// Short reason label (`version_mismatch`, `already_exists`, `deleted`, ...)
    pub reason: String,
    /// Detection timestamp (unix ms)
    pub detected_at: i64,
}

/// How the user settles an open conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Rebase the pending local edit onto the server version and upload it again.
    KeepLocal,
    /// Discard the local edit and adopt the server state.
    TakeServer,
}
