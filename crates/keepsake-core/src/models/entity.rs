//! Synchronized entity models

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unix timestamp in milliseconds.
pub type Timestamp = i64;

/// The four synchronized record kinds.
///
/// Each type has its own watermark and its own pending-operation set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Content,
    Journal,
    Association,
    Media,
}

impl EntityType {
    /// Every entity type, in the order a full sync visits them.
    ///
    /// Containers and entries go before associations so links never precede
    /// the records they point at within one pass.
    pub const ALL: [Self; 4] = [Self::Content, Self::Journal, Self::Media, Self::Association];

    /// Path segment / storage label.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::Journal => "journal",
            Self::Association => "association",
            Self::Media => "media",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "content" => Ok(Self::Content),
            "journal" => Ok(Self::Journal),
            "association" => Ok(Self::Association),
            "media" => Ok(Self::Media),
            other => Err(format!("unknown entity type `{other}`")),
        }
    }
}

/// Generate a new time-sortable entity id (UUID v7).
pub fn new_entity_id() -> String {
    Uuid::now_v7().to_string()
}

/// An entity as held in the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalEntity {
    pub id: String,
    pub entity_type: EntityType,
    pub payload: Value,
    /// Last server version this device observed; `None` until first upload/download.
    pub server_version: Option<u64>,
    /// Server `lastUpdated` stamp matching `server_version`.
    pub last_updated: Option<Timestamp>,
    /// Local modification time (Unix ms)
    pub updated_at: Timestamp,
}

/// An entity as held by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionedEntity {
    pub id: String,
    pub entity_type: EntityType,
    pub payload: Value,
    pub server_version: u64,
    pub last_updated: Timestamp,
    pub device_id: String,
}

/// Durable marker recording that an entity was deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    pub id: String,
    pub entity_type: EntityType,
    pub deleted_at: Timestamp,
    /// Version the entity had when it was deleted.
    #[serde(default)]
    pub last_version: u64,
}
