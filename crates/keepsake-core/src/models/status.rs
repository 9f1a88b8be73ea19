//! Sync outcome and status models

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::{EntityType, Timestamp};

/// Failure taxonomy surfaced through [`SyncResult::errors`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    /// Transient transport failure or timeout; retried with backoff.
    Network,
    /// Credential rejected after one refresh.
    Auth,
    /// Version constraint rejected; waits for user resolution.
    Conflict,
    /// Server-side failure (5xx, throttling); retried with backoff.
    Server,
    /// Payload rejected; the pending operation is dropped.
    Validation,
    /// Local store read or write failed.
    Storage,
}

impl SyncErrorKind {
    /// Whether the failure should put the entity type into backoff.
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Network | Self::Server)
    }
}

impl fmt::Display for SyncErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Network => "network",
            Self::Auth => "auth",
            Self::Conflict => "conflict",
            Self::Server => "server",
            Self::Validation => "validation",
            Self::Storage => "storage",
        };
        f.write_str(label)
    }
}

/// One failed entity or operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncError {
    pub kind: SyncErrorKind,
    pub entity_type: EntityType,
    /// Offending id; `None` for failures affecting the whole entity type.
    pub entity_id: Option<String>,
    pub message: String,
}

impl SyncError {
    pub fn new(
        kind: SyncErrorKind,
        entity_type: EntityType,
        entity_id: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            entity_type,
            entity_id,
            message: message.into(),
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entity_id {
            Some(id) => write!(
                f,
                "[{}] {}/{}: {}",
                self.kind, self.entity_type, id, self.message
            ),
            None => write!(f, "[{}] {}: {}", self.kind, self.entity_type, self.message),
        }
    }
}

/// Aggregated outcome of a sync operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub success: bool,
    pub uploaded_items: usize,
    pub downloaded_items: usize,
    pub errors: Vec<SyncError>,
    /// Newest watermark across the entity types touched.
    pub last_sync_time: Option<Timestamp>,
    /// The pass stopped early at an entity-type boundary.
    #[serde(default)]
    pub cancelled: bool,
}

impl SyncResult {
    /// Empty, successful result.
    pub fn empty() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    /// Fold another partial result into this one.
    pub fn absorb(&mut self, other: Self) {
        self.uploaded_items += other.uploaded_items;
        self.downloaded_items += other.downloaded_items;
        self.errors.extend(other.errors);
        self.last_sync_time = match (self.last_sync_time, other.last_sync_time) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.cancelled |= other.cancelled;
        self.success =
            self.success && other.success && self.errors.is_empty() && !self.cancelled;
    }

    pub fn push_error(&mut self, error: SyncError) {
        self.errors.push(error);
        self.success = false;
    }

    pub fn has_conflicts(&self) -> bool {
        self.errors
            .iter()
            .any(|error| error.kind == SyncErrorKind::Conflict)
    }
}

/// Per-entity-type pass state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Uploading,
    Downloading,
    /// Network unreachable; stays here until the retry interval elapses.
    Failed,
}

/// Pending operation counts per entity type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCounts {
    pub by_type: BTreeMap<EntityType, usize>,
}

impl PendingCounts {
    pub fn total(&self) -> usize {
        self.by_type.values().sum()
    }

    pub fn get(&self, entity_type: EntityType) -> usize {
        self.by_type.get(&entity_type).copied().unwrap_or(0)
    }
}

/// Read-only status snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub is_enabled: bool,
    pub last_sync_time: Option<Timestamp>,
    pub pending_uploads: usize,
    pub is_syncing: bool,
    pub has_errors: bool,
}
