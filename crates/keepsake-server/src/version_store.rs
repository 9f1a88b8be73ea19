//! Server-side authoritative entity store.
//!
//! Each entity type is its own `DashMap` partition. A mutation holds only the
//! shard lock of its id while it compares versions, takes a commit stamp, and
//! writes the slot, so unrelated ids never contend.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use keepsake_core::models::{
    new_entity_id, EntityType, Timestamp, Tombstone, VersionConstraint, VersionedEntity,
};
use keepsake_core::protocol::{
    ConflictBody, ConflictReason, EntityTypeStatus, ServerStatusResponse,
};
use keepsake_core::util::now_millis;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::clock::CommitClock;

const MAX_ID_LEN: usize = 256;
/// Path segment of the change feed under `/sync/{type}`.
const FEED_SEGMENT: &str = "changes";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("version conflict: {}", .0.reason.label())]
    Conflict(Box<ConflictBody>),
    #[error("{entity_type} {id} not found")]
    NotFound { entity_type: EntityType, id: String },
    #[error("invalid entity: {0}")]
    Invalid(String),
}

/// Version and commit stamp of an accepted mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    pub server_version: u64,
    pub last_updated: Timestamp,
}

/// One id holds either its live value or its tombstone, never both.
#[derive(Debug, Clone)]
pub(crate) enum Slot {
    Live(VersionedEntity),
    Deleted(Tombstone),
}

#[derive(Debug, Default)]
pub(crate) struct Partition {
    pub(crate) slots: DashMap<String, Slot>,
    /// Newest `deleted_at` among purged tombstones.
    pub(crate) purged_before: AtomicI64,
}

#[derive(Debug, Default)]
pub struct VersionStore {
    partitions: [Partition; 4],
    clock: CommitClock,
}

impl VersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) const fn partition(&self, entity_type: EntityType) -> &Partition {
        let index = match entity_type {
            EntityType::Content => 0,
            EntityType::Journal => 1,
            EntityType::Media => 2,
            EntityType::Association => 3,
        };
        &self.partitions[index]
    }

    pub(crate) const fn clock(&self) -> &CommitClock {
        &self.clock
    }

    /// First write of an entity; generates an id when the client sent none.
    pub fn upload(
        &self,
        entity_type: EntityType,
        id: Option<String>,
        payload: Value,
        device_id: &str,
    ) -> Result<(String, Accepted), StoreError> {
        let id = id.unwrap_or_else(new_entity_id);
        let accepted = self.apply(entity_type, &id, payload, VersionConstraint::None, device_id)?;
        Ok((id, accepted))
    }

    /// Compare-and-swap write of one entity.
    ///
    /// `none` creates version 1 for an unknown id. `known(v)` replaces the live
    /// value at version `v`, or revives a tombstone whose last version is `v`.
    pub fn apply(
        &self,
        entity_type: EntityType,
        id: &str,
        payload: Value,
        constraint: VersionConstraint,
        device_id: &str,
    ) -> Result<Accepted, StoreError> {
        validate(id, &payload)?;
        let partition = self.partition(entity_type);

        match partition.slots.entry(id.to_string()) {
            Entry::Vacant(vacant) => {
                if constraint != VersionConstraint::None {
                    return Err(StoreError::NotFound {
                        entity_type,
                        id: id.to_string(),
                    });
                }
                let ticket = self.clock.begin();
                let entity = live(entity_type, id, payload, 1, ticket.stamp(), device_id);
                vacant.insert(Slot::Live(entity));
                Ok(Accepted {
                    server_version: 1,
                    last_updated: ticket.stamp(),
                })
            }
            Entry::Occupied(mut occupied) => {
                let next = match (constraint, occupied.get()) {
                    (VersionConstraint::None, Slot::Live(current)) => {
                        return Err(conflict(
                            ConflictReason::AlreadyExists {
                                actual: current.server_version,
                            },
                            Some(current.clone()),
                            None,
                        ));
                    }
                    (VersionConstraint::Known { server_version }, Slot::Live(current)) => {
                        if current.server_version != server_version {
                            return Err(conflict(
                                ConflictReason::VersionMismatch {
                                    expected: server_version,
                                    actual: current.server_version,
                                },
                                Some(current.clone()),
                                None,
                            ));
                        }
                        server_version + 1
                    }
                    (VersionConstraint::Known { server_version }, Slot::Deleted(tombstone))
                        if tombstone.last_version == server_version =>
                    {
                        server_version + 1
                    }
                    (_, Slot::Deleted(tombstone)) => {
                        return Err(conflict(
                            ConflictReason::Deleted {
                                deleted_at: tombstone.deleted_at,
                            },
                            None,
                            Some(tombstone.clone()),
                        ));
                    }
                };

                let ticket = self.clock.begin();
                let entity = live(entity_type, id, payload, next, ticket.stamp(), device_id);
                occupied.insert(Slot::Live(entity));
                Ok(Accepted {
                    server_version: next,
                    last_updated: ticket.stamp(),
                })
            }
        }
    }

    /// Replace the live entity with a tombstone stamped now.
    pub fn delete(&self, entity_type: EntityType, id: &str) -> Result<Tombstone, StoreError> {
        let not_found = || StoreError::NotFound {
            entity_type,
            id: id.to_string(),
        };
        let mut slot = self.partition(entity_type).slots.get_mut(id).ok_or_else(not_found)?;
        let Slot::Live(current) = &*slot else {
            return Err(not_found());
        };

        let ticket = self.clock.begin();
        let tombstone = Tombstone {
            id: id.to_string(),
            entity_type,
            deleted_at: ticket.stamp(),
            last_version: current.server_version,
        };
        *slot = Slot::Deleted(tombstone.clone());
        Ok(tombstone)
    }

    pub fn get(&self, entity_type: EntityType, id: &str) -> Option<VersionedEntity> {
        match self.partition(entity_type).slots.get(id)?.value() {
            Slot::Live(entity) => Some(entity.clone()),
            Slot::Deleted(_) => None,
        }
    }

    pub fn tombstone(&self, entity_type: EntityType, id: &str) -> Option<Tombstone> {
        match self.partition(entity_type).slots.get(id)?.value() {
            Slot::Deleted(tombstone) => Some(tombstone.clone()),
            Slot::Live(_) => None,
        }
    }

    /// Drop tombstones deleted before `older_than`. Returns how many were removed.
    pub fn purge_tombstones(&self, older_than: Timestamp) -> usize {
        let mut removed = 0;
        for entity_type in EntityType::ALL {
            let partition = self.partition(entity_type);
            let mut newest = None::<Timestamp>;
            partition.slots.retain(|_, slot| match slot {
                Slot::Deleted(tombstone) if tombstone.deleted_at < older_than => {
                    let deleted_at = tombstone.deleted_at;
                    newest = Some(newest.map_or(deleted_at, |at| at.max(deleted_at)));
                    removed += 1;
                    false
                }
                _ => true,
            });
            if let Some(newest) = newest {
                partition.purged_before.fetch_max(newest, Ordering::SeqCst);
            }
        }
        removed
    }

    /// Per-type counts for `GET /sync/status`.
    pub fn status(&self) -> ServerStatusResponse {
        let entity_types = EntityType::ALL
            .into_iter()
            .map(|entity_type| {
                let mut status = EntityTypeStatus {
                    entity_type,
                    live: 0,
                    tombstones: 0,
                    last_updated: None,
                };
                for slot in self.partition(entity_type).slots.iter() {
                    let stamp = match slot.value() {
                        Slot::Live(entity) => {
                            status.live += 1;
                            entity.last_updated
                        }
                        Slot::Deleted(tombstone) => {
                            status.tombstones += 1;
                            tombstone.deleted_at
                        }
                    };
                    status.last_updated =
                        Some(status.last_updated.map_or(stamp, |at| at.max(stamp)));
                }
                status
            })
            .collect();

        ServerStatusResponse {
            entity_types,
            server_timestamp: self.clock.snapshot(),
        }
    }
}

fn live(
    entity_type: EntityType,
    id: &str,
    payload: Value,
    server_version: u64,
    last_updated: Timestamp,
    device_id: &str,
) -> VersionedEntity {
    VersionedEntity {
        id: id.to_string(),
        entity_type,
        payload,
        server_version,
        last_updated,
        device_id: device_id.to_string(),
    }
}

fn conflict(
    reason: ConflictReason,
    current: Option<VersionedEntity>,
    tombstone: Option<Tombstone>,
) -> StoreError {
    StoreError::Conflict(Box::new(ConflictBody {
        reason,
        current,
        tombstone,
    }))
}

fn validate(id: &str, payload: &Value) -> Result<(), StoreError> {
    if id.trim().is_empty() {
        return Err(StoreError::Invalid("id cannot be empty".to_string()));
    }
    if id.len() > MAX_ID_LEN {
        return Err(StoreError::Invalid(format!(
            "id must be at most {MAX_ID_LEN} bytes"
        )));
    }
    // `POST /sync/{type}/changes` would hit the feed route instead of the update.
    if id == FEED_SEGMENT {
        return Err(StoreError::Invalid(format!("`{FEED_SEGMENT}` is a reserved id")));
    }
    if !payload.is_object() {
        return Err(StoreError::Invalid("payload must be a JSON object".to_string()));
    }
    Ok(())
}

/// One [`VersionStore`] per authenticated account.
#[derive(Debug, Default)]
pub struct StoreRegistry {
    stores: DashMap<String, Arc<VersionStore>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store_for(&self, user_id: &str) -> Arc<VersionStore> {
        if let Some(store) = self.stores.get(user_id) {
            return Arc::clone(store.value());
        }
        Arc::clone(
            self.stores
                .entry(user_id.to_string())
                .or_insert_with(|| Arc::new(VersionStore::new()))
                .value(),
        )
    }

    pub fn accounts(&self) -> usize {
        self.stores.len()
    }

    pub fn purge_tombstones(&self, older_than: Timestamp) -> usize {
        let stores: Vec<Arc<VersionStore>> = self
            .stores
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        stores
            .iter()
            .map(|store| store.purge_tombstones(older_than))
            .sum()
    }
}

/// Purge tombstones older than `retention` every `interval`.
pub fn spawn_purge_task(
    registry: Arc<StoreRegistry>,
    retention: Duration,
    interval: Duration,
) -> JoinHandle<()> {
    let retention_ms = i64::try_from(retention.as_millis()).unwrap_or(i64::MAX);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let horizon = now_millis().saturating_sub(retention_ms);
            let purged = registry.purge_tombstones(horizon);
            if purged > 0 {
                tracing::info!(purged, horizon, "Purged expired tombstones");
            }
        }
    })
}
