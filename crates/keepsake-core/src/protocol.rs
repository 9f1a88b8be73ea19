//! Request and response bodies of the sync HTTP API.
//!
//! Shared by the client ([`crate::sync::HttpRemoteClient`]) and the server so
//! both sides agree on one camelCase JSON shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{EntityType, Timestamp, Tombstone, VersionConstraint, VersionedEntity};

/// `POST /sync/{entityType}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    /// Client-assigned id; the server generates one when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub device_id: String,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub id: String,
    pub server_version: u64,
    pub last_updated: Timestamp,
}

/// `POST /sync/{entityType}/{id}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    pub payload: Value,
    pub version_constraint: VersionConstraint,
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResponse {
    pub server_version: u64,
    pub last_updated: Timestamp,
}

/// Why the server rejected a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ConflictReason {
    /// `known(expected)` did not match the stored version.
    VersionMismatch { expected: u64, actual: u64 },
    /// A `none` constraint targeted an id that is already live.
    AlreadyExists { actual: u64 },
    /// The id is tombstoned.
    Deleted {
        #[serde(rename = "deletedAt")]
        deleted_at: Timestamp,
    },
    /// The id was never created (or its tombstone was purged).
    NotFound,
}

impl ConflictReason {
    pub const fn label(&self) -> &'static str {
        match self {
            Self::VersionMismatch { .. } => "version_mismatch",
            Self::AlreadyExists { .. } => "already_exists",
            Self::Deleted { .. } => "deleted",
            Self::NotFound => "not_found",
        }
    }
}

/// Body of a `409 Conflict` response: the reason plus current server state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictBody {
    #[serde(flatten)]
    pub reason: ConflictReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<VersionedEntity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tombstone: Option<Tombstone>,
}

impl ConflictBody {
    /// Server version the conflict was raised against, if the entity exists.
    pub fn server_version(&self) -> Option<u64> {
        self.current
            .as_ref()
            .map(|entity| entity.server_version)
            .or_else(|| self.tombstone.as_ref().map(|tombstone| tombstone.last_version))
    }
}

/// `GET /sync/{entityType}/changes?since=`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesQuery {
    #[serde(default)]
    pub since: Timestamp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesResponse {
    pub changes: Vec<VersionedEntity>,
    pub deletions: Vec<Tombstone>,
    pub server_timestamp: Timestamp,
    /// Tombstones older than `since` were purged; `changes` holds every live
    /// entity and the client must drop synced entities missing from it.
    #[serde(default)]
    pub resync_required: bool,
}

/// Counts for one entity type in `GET /sync/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityTypeStatus {
    pub entity_type: EntityType,
    pub live: usize,
    pub tombstones: usize,
    pub last_updated: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatusResponse {
    pub entity_types: Vec<EntityTypeStatus>,
    pub server_timestamp: Timestamp,
}

/// JSON error body for non-conflict failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
