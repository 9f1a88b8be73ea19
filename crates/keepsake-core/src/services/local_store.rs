//! Shared local store used by the sync engine and every client surface.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, watch, Mutex};

use crate::db::{
    self, ChangeQueueRepository, ConflictRepository, Database, EntityRepository,
    LibSqlChangeQueueRepository, LibSqlConflictRepository, LibSqlEntityRepository,
    LibSqlMetadataRepository, MetadataRepository,
};
use crate::models::{
    new_entity_id, Association, EntityType, LocalEntity, PendingChange, PendingCounts,
    PendingOperation, SyncConflict, Timestamp, VersionedEntity,
};
use crate::util::now_millis;
use crate::{Error, Result};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Who produced an [`EntityChange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOrigin {
    Local,
    Remote,
}

/// Notification that an entity was written or removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityChange {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub origin: ChangeOrigin,
    pub deleted: bool,
}

/// Result of [`LocalStore::set_journal_members`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

/// Outcome of [`LocalStore::apply_remote_change`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteApply {
    /// The server copy was stored.
    Applied,
    /// Already applied, or older than the local state.
    Stale,
    /// The pending local edit already matched the server copy and was acknowledged.
    Converged,
    /// A pending local operation holds the entity; nothing was written.
    Blocked {
        pending: PendingChange,
        known_version: Option<u64>,
    },
}

/// Outcome of [`LocalStore::apply_remote_deletion`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteDeletion {
    Removed,
    Absent,
    /// The tombstone acknowledged a pending local DELETE.
    Acknowledged,
    /// A pending local edit holds the entity; nothing was removed.
    Blocked {
        pending: PendingChange,
        known_version: Option<u64>,
    },
}

/// Thread-safe service for local entities, the change queue, and sync metadata.
///
/// Every local write stores the entity and enqueues its pending operation in
/// one transaction. Pending counts are pushed through a `watch` channel.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
    pending: Arc<watch::Sender<PendingCounts>>,
    changes: broadcast::Sender<EntityChange>,
}

impl LocalStore {
    /// Open a local store at the given filesystem path.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::open(&db_path).await?;
        Self::from_database(db, Some(db_path)).await
    }

    /// Open an in-memory local store (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Self::from_database(db, None).await
    }

    async fn from_database(db: Database, db_path: Option<PathBuf>) -> Result<Self> {
        let counts = LibSqlChangeQueueRepository::new(db.connection())
            .counts()
            .await?;
        let (pending, _) = watch::channel(counts);
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path,
            pending: Arc::new(pending),
            changes,
        })
    }

    /// Filesystem path of the database, `None` when in memory.
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Observe pending operation counts.
    pub fn subscribe_pending(&self) -> watch::Receiver<PendingCounts> {
        self.pending.subscribe()
    }

    /// Latest pending operation counts without touching the database.
    pub fn pending_counts(&self) -> PendingCounts {
        self.pending.borrow().clone()
    }

    /// Observe entity writes and removals.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<EntityChange> {
        self.changes.subscribe()
    }

    async fn publish_pending(&self, conn: &libsql::Connection) -> Result<()> {
        let counts = LibSqlChangeQueueRepository::new(conn).counts().await?;
        self.pending.send_if_modified(|current| {
            if *current == counts {
                false
            } else {
                *current = counts;
                true
            }
        });
        Ok(())
    }

    fn notify(&self, entity_type: EntityType, entity_id: &str, origin: ChangeOrigin, deleted: bool) {
        // No subscribers is fine.
        self.changes
            .send(EntityChange {
                entity_type,
                entity_id: entity_id.to_string(),
                origin,
                deleted,
            })
            .ok();
    }

    // ----- local entity writes -----

    /// Create an entity and enqueue its upload.
    ///
    /// Associations take their id from the pair they link; every other type
    /// gets a fresh UUID v7.
    pub async fn create_entity(&self, entity_type: EntityType, payload: Value) -> Result<LocalEntity> {
        let id = if entity_type == EntityType::Association {
            Association::from_payload(&payload)
                .ok_or_else(|| {
                    Error::InvalidInput(
                        "association payload needs contentId and journalId".to_string(),
                    )
                })?
                .entity_id()
        } else {
            new_entity_id()
        };

        let db = self.db.lock().await;
        let conn = db.connection();
        let entities = LibSqlEntityRepository::new(conn);
        if entities.get(entity_type, &id).await?.is_some() {
            return Err(Error::InvalidInput(format!("{entity_type} {id} already exists")));
        }

        db::begin(conn).await?;
        let result: Result<LocalEntity> = async {
            let now = now_millis();
            entities.put_local(entity_type, &id, &payload, now).await?;
            LibSqlChangeQueueRepository::new(conn)
                .enqueue(entity_type, &id, PendingOperation::Create, None)
                .await?;
            entities
                .get(entity_type, &id)
                .await?
                .ok_or_else(|| Error::NotFound(id.clone()))
        }
        .await;
        let entity = db::finish(conn, result).await?;

        self.publish_pending(conn).await?;
        drop(db);
        self.notify(entity_type, &entity.id, ChangeOrigin::Local, false);
        tracing::debug!(entity_type = %entity_type, entity_id = %entity.id, "Created entity");
        Ok(entity)
    }

    /// Replace an entity's payload and enqueue the update.
    pub async fn update_entity(
        &self,
        entity_type: EntityType,
        id: &str,
        payload: Value,
    ) -> Result<LocalEntity> {
        if entity_type == EntityType::Association {
            return Err(Error::InvalidInput(
                "associations are immutable; remove and re-add the pair".to_string(),
            ));
        }

        let db = self.db.lock().await;
        let conn = db.connection();
        let entities = LibSqlEntityRepository::new(conn);
        let existing = entities
            .get(entity_type, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{entity_type} {id}")))?;

        db::begin(conn).await?;
        let result: Result<LocalEntity> = async {
            entities
                .put_local(entity_type, id, &payload, now_millis())
                .await?;
            LibSqlChangeQueueRepository::new(conn)
                .enqueue(
                    entity_type,
                    id,
                    PendingOperation::Update,
                    existing.server_version,
                )
                .await?;
            entities
                .get(entity_type, id)
                .await?
                .ok_or_else(|| Error::NotFound(id.to_string()))
        }
        .await;
        let entity = db::finish(conn, result).await?;

        self.publish_pending(conn).await?;
        drop(db);
        self.notify(entity_type, id, ChangeOrigin::Local, false);
        Ok(entity)
    }

    /// Remove an entity locally and enqueue its deletion.
    pub async fn delete_entity(&self, entity_type: EntityType, id: &str) -> Result<()> {
        let db = self.db.lock().await;
        let conn = db.connection();
        Self::delete_within(conn, entity_type, id).await?;
        self.publish_pending(conn).await?;
        drop(db);
        self.notify(entity_type, id, ChangeOrigin::Local, true);
        Ok(())
    }

    async fn delete_within(
        conn: &libsql::Connection,
        entity_type: EntityType,
        id: &str,
    ) -> Result<()> {
        let entities = LibSqlEntityRepository::new(conn);
        let existing = entities
            .get(entity_type, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{entity_type} {id}")))?;

        db::begin(conn).await?;
        let result: Result<()> = async {
            entities.remove(entity_type, id).await?;
            LibSqlChangeQueueRepository::new(conn)
                .enqueue(
                    entity_type,
                    id,
                    PendingOperation::Delete,
                    existing.server_version,
                )
                .await?;
            Ok(())
        }
        .await;
        db::finish(conn, result).await
    }

    /// Fetch an entity by id.
    pub async fn get_entity(&self, entity_type: EntityType, id: &str) -> Result<Option<LocalEntity>> {
        let db = self.db.lock().await;
        LibSqlEntityRepository::new(db.connection())
            .get(entity_type, id)
            .await
    }

    /// List entities of one type, most recently modified first.
    pub async fn list_entities(
        &self,
        entity_type: EntityType,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LocalEntity>> {
        let db = self.db.lock().await;
        LibSqlEntityRepository::new(db.connection())
            .list(entity_type, limit, offset)
            .await
    }

    // ----- association sets -----

    /// Content ids linked to a journal.
    pub async fn journal_members(&self, journal_id: &str) -> Result<Vec<String>> {
        let db = self.db.lock().await;
        let associations = LibSqlEntityRepository::new(db.connection())
            .journal_associations(journal_id)
            .await?;
        Ok(associations
            .into_iter()
            .map(|association| association.content_id)
            .collect())
    }

    /// Make `content_ids` the exact membership of a journal.
    ///
    /// Added pairs enqueue a CREATE, removed pairs a DELETE, all in one transaction.
    pub async fn set_journal_members(
        &self,
        journal_id: &str,
        content_ids: &[String],
    ) -> Result<MembershipDiff> {
        let journal_id = journal_id.trim();
        if journal_id.is_empty() {
            return Err(Error::InvalidInput("journal id cannot be empty".to_string()));
        }

        let desired: BTreeSet<&str> = content_ids
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .collect();

        let db = self.db.lock().await;
        let conn = db.connection();
        let entities = LibSqlEntityRepository::new(conn);
        let current: BTreeSet<String> = entities
            .journal_associations(journal_id)
            .await?
            .into_iter()
            .map(|association| association.content_id)
            .collect();

        let diff = MembershipDiff {
            added: desired
                .iter()
                .filter(|id| !current.contains(**id))
                .map(|id| (*id).to_string())
                .collect(),
            removed: current
                .iter()
                .filter(|id| !desired.contains(id.as_str()))
                .cloned()
                .collect(),
        };
        if diff.added.is_empty() && diff.removed.is_empty() {
            return Ok(diff);
        }

        db::begin(conn).await?;
        let result: Result<()> = async {
            let queue = LibSqlChangeQueueRepository::new(conn);
            let now = now_millis();
            for content_id in &diff.added {
                let association = Association::new(journal_id, content_id.as_str());
                let id = association.entity_id();
                entities
                    .put_local(EntityType::Association, &id, &association.to_payload(), now)
                    .await?;
                queue
                    .enqueue(EntityType::Association, &id, PendingOperation::Create, None)
                    .await?;
            }
            for content_id in &diff.removed {
                let id = Association::new(journal_id, content_id.as_str()).entity_id();
                let base = entities
                    .get(EntityType::Association, &id)
                    .await?
                    .and_then(|entity| entity.server_version);
                entities.remove(EntityType::Association, &id).await?;
                queue
                    .enqueue(EntityType::Association, &id, PendingOperation::Delete, base)
                    .await?;
            }
            Ok(())
        }
        .await;
        db::finish(conn, result).await?;

        self.publish_pending(conn).await?;
        drop(db);

        for content_id in &diff.added {
            let id = Association::new(journal_id, content_id.as_str()).entity_id();
            self.notify(EntityType::Association, &id, ChangeOrigin::Local, false);
        }
        for content_id in &diff.removed {
            let id = Association::new(journal_id, content_id.as_str()).entity_id();
            self.notify(EntityType::Association, &id, ChangeOrigin::Local, true);
        }
        tracing::debug!(
            journal_id,
            added = diff.added.len(),
            removed = diff.removed.len(),
            "Updated journal membership"
        );
        Ok(diff)
    }

    // ----- change queue -----

    /// Enqueue a pending operation for an entity, collapsing with any existing one.
    pub async fn enqueue(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        operation: PendingOperation,
    ) -> Result<PendingChange> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let base = LibSqlEntityRepository::new(conn)
            .get(entity_type, entity_id)
            .await?
            .and_then(|entity| entity.server_version);

        db::begin(conn).await?;
        let result = LibSqlChangeQueueRepository::new(conn)
            .enqueue(entity_type, entity_id, operation, base)
            .await;
        let change = db::finish(conn, result).await?;

        self.publish_pending(conn).await?;
        Ok(change)
    }

    /// Stable snapshot of the pending operations for one entity type.
    ///
    /// Entries stay queued until acknowledged.
    pub async fn dequeue_all(&self, entity_type: EntityType) -> Result<Vec<PendingChange>> {
        let db = self.db.lock().await;
        LibSqlChangeQueueRepository::new(db.connection())
            .snapshot(entity_type)
            .await
    }

    /// Pending operation for one entity.
    pub async fn pending_change(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<PendingChange>> {
        let db = self.db.lock().await;
        LibSqlChangeQueueRepository::new(db.connection())
            .get(entity_type, entity_id)
            .await
    }

    /// Remove a snapshot entry unless it was re-enqueued after the snapshot.
    pub async fn acknowledge(&self, entity_type: EntityType, change: &PendingChange) -> Result<bool> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let removed = LibSqlChangeQueueRepository::new(conn)
            .acknowledge(entity_type, &change.entity_id, change.revision)
            .await?;
        if removed {
            self.publish_pending(conn).await?;
        }
        Ok(removed)
    }

    // ----- sync metadata -----

    /// Last download watermark; `None` means never synced.
    pub async fn last_sync_time(&self, entity_type: EntityType) -> Result<Option<Timestamp>> {
        let db = self.db.lock().await;
        LibSqlMetadataRepository::new(db.connection())
            .last_sync_time(entity_type)
            .await
    }

    /// Advance the watermark; never moves it backwards.
    pub async fn update_last_sync_time(
        &self,
        entity_type: EntityType,
        timestamp: Timestamp,
    ) -> Result<Timestamp> {
        let db = self.db.lock().await;
        LibSqlMetadataRepository::new(db.connection())
            .update_last_sync_time(entity_type, timestamp)
            .await
    }

    /// Watermarks of every entity type synced at least once.
    pub async fn watermarks(&self) -> Result<BTreeMap<EntityType, Timestamp>> {
        let db = self.db.lock().await;
        LibSqlMetadataRepository::new(db.connection()).all().await
    }

    // ----- applying server state -----

    /// Server version the local state of an entity is based on.
    ///
    /// Falls back to the pending operation's base when the entity was removed locally.
    pub async fn known_version(&self, entity_type: EntityType, entity_id: &str) -> Result<Option<u64>> {
        let db = self.db.lock().await;
        Self::known_version_within(db.connection(), entity_type, entity_id).await
    }

    async fn known_version_within(
        conn: &libsql::Connection,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<u64>> {
        let local = LibSqlEntityRepository::new(conn)
            .get(entity_type, entity_id)
            .await?
            .and_then(|entity| entity.server_version);
        match local {
            Some(version) => Ok(Some(version)),
            None => {
                LibSqlChangeQueueRepository::new(conn)
                    .base_version(entity_type, entity_id)
                    .await
            }
        }
    }

    /// Store the server's copy of an entity unless a pending local operation
    /// holds it.
    ///
    /// The pending check and the write happen under one lock, so a local edit
    /// can never be overwritten by a change fetched before it was made.
    pub async fn apply_remote_change(&self, entity: &VersionedEntity) -> Result<RemoteApply> {
        let entity_type = entity.entity_type;
        let id = entity.id.as_str();

        let db = self.db.lock().await;
        let conn = db.connection();
        let entities = LibSqlEntityRepository::new(conn);
        let queue = LibSqlChangeQueueRepository::new(conn);
        let pending = queue.get(entity_type, id).await?;
        let known_version = Self::known_version_within(conn, entity_type, id).await?;

        let Some(pending) = pending else {
            if known_version.is_some_and(|known| entity.server_version < known) {
                return Ok(RemoteApply::Stale);
            }
            entities.put_remote(entity, now_millis()).await?;
            drop(db);
            self.notify(entity_type, id, ChangeOrigin::Remote, false);
            return Ok(RemoteApply::Applied);
        };

        if entity.server_version <= known_version.unwrap_or(0) {
            return Ok(RemoteApply::Stale);
        }

        if pending.operation != PendingOperation::Delete {
            let local = entities.get(entity_type, id).await?;
            if local.is_some_and(|local| local.payload == entity.payload) {
                db::begin(conn).await?;
                let result = Self::settle_upload_within(
                    conn,
                    entity_type,
                    &pending,
                    entity.server_version,
                    entity.last_updated,
                )
                .await;
                db::finish(conn, result).await?;
                self.publish_pending(conn).await?;
                return Ok(RemoteApply::Converged);
            }
        }

        Ok(RemoteApply::Blocked {
            pending,
            known_version,
        })
    }

    /// Remove an entity deleted on the server unless a pending local edit holds it.
    ///
    /// A pending DELETE is acknowledged by the tombstone.
    pub async fn apply_remote_deletion(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<RemoteDeletion> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let queue = LibSqlChangeQueueRepository::new(conn);

        let outcome = match queue.get(entity_type, entity_id).await? {
            None => {
                if LibSqlEntityRepository::new(conn)
                    .remove(entity_type, entity_id)
                    .await?
                {
                    RemoteDeletion::Removed
                } else {
                    RemoteDeletion::Absent
                }
            }
            Some(pending) if pending.operation == PendingOperation::Delete => {
                db::begin(conn).await?;
                let result: Result<()> = async {
                    LibSqlEntityRepository::new(conn)
                        .remove(entity_type, entity_id)
                        .await?;
                    queue
                        .acknowledge(entity_type, entity_id, pending.revision)
                        .await?;
                    Ok(())
                }
                .await;
                db::finish(conn, result).await?;
                self.publish_pending(conn).await?;
                RemoteDeletion::Acknowledged
            }
            Some(pending) => {
                let known_version = Self::known_version_within(conn, entity_type, entity_id).await?;
                return Ok(RemoteDeletion::Blocked {
                    pending,
                    known_version,
                });
            }
        };

        drop(db);
        if outcome == RemoteDeletion::Removed {
            self.notify(entity_type, entity_id, ChangeOrigin::Remote, true);
        }
        Ok(outcome)
    }

    /// Record the version the server assigned to an accepted upload and
    /// acknowledge its snapshot entry, in one transaction.
    ///
    /// An entry re-enqueued while the upload was in flight stays queued, based
    /// on `server_version`; a pending CREATE becomes an UPDATE. Returns whether
    /// the entry was removed.
    pub async fn complete_upload(
        &self,
        entity_type: EntityType,
        change: &PendingChange,
        server_version: u64,
        last_updated: Timestamp,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let conn = db.connection();
        db::begin(conn).await?;
        let result =
            Self::settle_upload_within(conn, entity_type, change, server_version, last_updated)
                .await;
        let removed = db::finish(conn, result).await?;
        self.publish_pending(conn).await?;
        Ok(removed)
    }

    async fn settle_upload_within(
        conn: &libsql::Connection,
        entity_type: EntityType,
        change: &PendingChange,
        server_version: u64,
        last_updated: Timestamp,
    ) -> Result<bool> {
        let id = change.entity_id.as_str();
        let queue = LibSqlChangeQueueRepository::new(conn);
        LibSqlEntityRepository::new(conn)
            .set_server_version(entity_type, id, server_version, Some(last_updated))
            .await?;
        if queue.acknowledge(entity_type, id, change.revision).await? {
            return Ok(true);
        }
        if let Some(carried) = queue
            .carry_forward(entity_type, id, Some(server_version))
            .await?
        {
            tracing::debug!(
                entity_type = %entity_type,
                entity_id = id,
                operation = %carried.operation,
                server_version,
                "Carried newer local write onto accepted upload"
            );
        }
        Ok(false)
    }

    /// Remove synced entities absent from `keep` that have no pending operation.
    ///
    /// Returns the removed ids.
    pub async fn retain_synced(
        &self,
        entity_type: EntityType,
        keep: &HashSet<String>,
    ) -> Result<Vec<String>> {
        let removed = {
            let db = self.db.lock().await;
            let conn = db.connection();
            let entities = LibSqlEntityRepository::new(conn);
            let queue = LibSqlChangeQueueRepository::new(conn);

            let mut removed = Vec::new();
            for id in entities.synced_ids(entity_type).await? {
                if keep.contains(&id) || queue.get(entity_type, &id).await?.is_some() {
                    continue;
                }
                if entities.remove(entity_type, &id).await? {
                    removed.push(id);
                }
            }
            removed
        };

        for id in &removed {
            self.notify(entity_type, id, ChangeOrigin::Remote, true);
        }
        Ok(removed)
    }

    // ----- conflicts -----

    /// Record a server-winning value for an entity with a pending local edit.
    pub async fn record_conflict(&self, conflict: &SyncConflict) -> Result<i64> {
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection())
            .record(conflict)
            .await
    }

    /// Open conflict for one entity.
    pub async fn open_conflict(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<SyncConflict>> {
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection())
            .get_open(entity_type, entity_id)
            .await
    }

    /// List open sync conflicts, newest first.
    pub async fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection())
            .list_open(limit)
            .await
    }

    /// Number of open sync conflicts.
    pub async fn open_conflict_count(&self) -> Result<usize> {
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection())
            .count_open()
            .await
    }

    /// Close an open conflict without touching entity state.
    pub async fn close_conflict(&self, entity_type: EntityType, entity_id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection())
            .resolve(entity_type, entity_id, now_millis())
            .await
    }

    /// Adopt the server side of a conflict: overwrite or remove the local
    /// entity, drop the pending operation, and close the conflict.
    pub async fn take_server(&self, conflict: &SyncConflict) -> Result<()> {
        let entity_type = conflict.entity_type;
        let entity_id = conflict.entity_id.as_str();

        let db = self.db.lock().await;
        let conn = db.connection();
        db::begin(conn).await?;
        let result: Result<()> = async {
            let entities = LibSqlEntityRepository::new(conn);
            match (&conflict.server_payload, conflict.server_version) {
                (Some(payload), Some(version)) if !conflict.server_deleted => {
                    let now = now_millis();
                    entities.put_local(entity_type, entity_id, payload, now).await?;
                    entities
                        .set_server_version(entity_type, entity_id, version, None)
                        .await?;
                }
                _ => {
                    entities.remove(entity_type, entity_id).await?;
                }
            }
            LibSqlChangeQueueRepository::new(conn)
                .discard(entity_type, entity_id)
                .await?;
            LibSqlConflictRepository::new(conn)
                .resolve(entity_type, entity_id, now_millis())
                .await?;
            Ok(())
        }
        .await;
        db::finish(conn, result).await?;

        self.publish_pending(conn).await?;
        drop(db);
        self.notify(
            entity_type,
            entity_id,
            ChangeOrigin::Remote,
            conflict.server_deleted || conflict.server_payload.is_none(),
        );
        Ok(())
    }

    /// Keep the local side of a conflict: base the pending edit on the server
    /// version so the next upload asserts `known(server_version)`.
    ///
    /// When the server has no record of the entity at all, the edit is sent
    /// again as a CREATE.
    pub async fn keep_local(&self, conflict: &SyncConflict) -> Result<()> {
        let entity_type = conflict.entity_type;
        let entity_id = conflict.entity_id.as_str();

        // A tombstoned server side is revived on top of its last version.
        let version = match conflict.server_version {
            Some(version) => Some(version),
            None if conflict.server_deleted => None,
            None => {
                return Err(Error::InvalidInput(format!(
                    "server version of {entity_type} {entity_id} is unknown; take the server side"
                )));
            }
        };

        let db = self.db.lock().await;
        let conn = db.connection();
        let queue = LibSqlChangeQueueRepository::new(conn);
        if queue.get(entity_type, entity_id).await?.is_none() {
            return Err(Error::NotFound(format!(
                "no pending change for {entity_type} {entity_id}"
            )));
        }

        db::begin(conn).await?;
        let result: Result<()> = async {
            let entities = LibSqlEntityRepository::new(conn);
            match version {
                Some(version) => {
                    entities
                        .set_server_version(entity_type, entity_id, version, None)
                        .await?;
                }
                None => {
                    entities.forget_server_version(entity_type, entity_id).await?;
                }
            }
            queue.carry_forward(entity_type, entity_id, version).await?;
            LibSqlConflictRepository::new(conn)
                .resolve(entity_type, entity_id, now_millis())
                .await?;
            Ok(())
        }
        .await;
        db::finish(conn, result).await?;

        self.publish_pending(conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn remote(id: &str, version: u64) -> VersionedEntity {
        VersionedEntity {
            id: id.to_string(),
            entity_type: EntityType::Content,
            payload: json!({"text": format!("v{version}")}),
            server_version: version,
            last_updated: 10,
            device_id: "other".to_string(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_then_update_collapses_to_create() {
        let store = LocalStore::open_in_memory().await.unwrap();

        let entity = store
            .create_entity(EntityType::Content, json!({"text": "hello"}))
            .await
            .unwrap();
        store
            .update_entity(EntityType::Content, &entity.id, json!({"text": "hello again"}))
            .await
            .unwrap();

        let pending = store.dequeue_all(EntityType::Content).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation, PendingOperation::Create);
        assert_eq!(store.pending_counts().total(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pending_count_is_pushed_to_subscribers() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let mut counts = store.subscribe_pending();

        let entity = store
            .create_entity(EntityType::Journal, json!({"title": "Trip"}))
            .await
            .unwrap();
        counts.changed().await.unwrap();
        assert_eq!(counts.borrow().get(EntityType::Journal), 1);

        let snapshot = store.dequeue_all(EntityType::Journal).await.unwrap();
        assert!(store
            .acknowledge(EntityType::Journal, &snapshot[0])
            .await
            .unwrap());
        counts.changed().await.unwrap();
        assert_eq!(counts.borrow().total(), 0);
        assert!(store.get_entity(EntityType::Journal, &entity.id).await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_records_base_version() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store.apply_remote_change(&remote("n1", 4)).await.unwrap();

        store.delete_entity(EntityType::Content, "n1").await.unwrap();

        assert!(store.get_entity(EntityType::Content, "n1").await.unwrap().is_none());
        assert_eq!(
            store.known_version(EntityType::Content, "n1").await.unwrap(),
            Some(4)
        );
        let pending = store.pending_change(EntityType::Content, "n1").await.unwrap().unwrap();
        assert_eq!(pending.operation, PendingOperation::Delete);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_missing_entity_is_not_found() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let error = store.delete_entity(EntityType::Media, "nope").await.unwrap_err();
        assert!(matches!(error, Error::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn set_journal_members_diffs_membership() {
        let store = LocalStore::open_in_memory().await.unwrap();

        let first = store
            .set_journal_members("j1", &["c1".to_string(), "c2".to_string()])
            .await
            .unwrap();
        assert_eq!(first.added, vec!["c1".to_string(), "c2".to_string()]);
        assert!(first.removed.is_empty());

        let second = store
            .set_journal_members("j1", &["c2".to_string(), "c3".to_string()])
            .await
            .unwrap();
        assert_eq!(second.added, vec!["c3".to_string()]);
        assert_eq!(second.removed, vec!["c1".to_string()]);

        assert_eq!(
            store.journal_members("j1").await.unwrap(),
            vec!["c2".to_string(), "c3".to_string()]
        );

        // c1 was created and removed before any upload: one pending DELETE.
        let pending = store
            .pending_change(EntityType::Association, "j1:c1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pending.operation, PendingOperation::Delete);
        assert_eq!(store.pending_counts().get(EntityType::Association), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn association_create_requires_pair_payload() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let error = store
            .create_entity(EntityType::Association, json!({"journalId": "j1"}))
            .await
            .unwrap_err();
        assert!(matches!(error, Error::InvalidInput(_)));

        let entity = store
            .create_entity(
                EntityType::Association,
                json!({"journalId": "j1", "contentId": "c1"}),
            )
            .await
            .unwrap();
        assert_eq!(entity.id, "j1:c1");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn retain_synced_skips_pending_and_unsynced_entities() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store.apply_remote_change(&remote("keep", 1)).await.unwrap();
        store.apply_remote_change(&remote("gone", 1)).await.unwrap();
        store.apply_remote_change(&remote("edited", 1)).await.unwrap();
        store
            .update_entity(EntityType::Content, "edited", json!({"text": "mine"}))
            .await
            .unwrap();
        let unsynced = store
            .create_entity(EntityType::Content, json!({"text": "new"}))
            .await
            .unwrap();

        let keep: HashSet<String> = ["keep".to_string()].into_iter().collect();
        let removed = store.retain_synced(EntityType::Content, &keep).await.unwrap();

        assert_eq!(removed, vec!["gone".to_string()]);
        assert!(store.get_entity(EntityType::Content, "edited").await.unwrap().is_some());
        assert!(store
            .get_entity(EntityType::Content, &unsynced.id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn take_server_overwrites_and_drops_pending() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store.apply_remote_change(&remote("n1", 1)).await.unwrap();
        store
            .update_entity(EntityType::Content, "n1", json!({"text": "mine"}))
            .await
            .unwrap();

        let conflict = SyncConflict {
            id: 0,
            entity_type: EntityType::Content,
            entity_id: "n1".to_string(),
            local_version: Some(1),
            server_version: Some(2),
            server_payload: Some(json!({"text": "theirs"})),
            server_deleted: false,
            reason: "version_mismatch".to_string(),
            detected_at: 1,
        };
        store.record_conflict(&conflict).await.unwrap();
        store.take_server(&conflict).await.unwrap();

        let entity = store.get_entity(EntityType::Content, "n1").await.unwrap().unwrap();
        assert_eq!(entity.payload, json!({"text": "theirs"}));
        assert_eq!(entity.server_version, Some(2));
        assert!(store.pending_change(EntityType::Content, "n1").await.unwrap().is_none());
        assert_eq!(store.open_conflict_count().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn keep_local_rebases_and_requires_known_server_version() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store.apply_remote_change(&remote("n1", 1)).await.unwrap();
        store
            .update_entity(EntityType::Content, "n1", json!({"text": "mine"}))
            .await
            .unwrap();

        let mut conflict = SyncConflict {
            id: 0,
            entity_type: EntityType::Content,
            entity_id: "n1".to_string(),
            local_version: Some(1),
            server_version: Some(3),
            server_payload: Some(json!({"text": "theirs"})),
            server_deleted: false,
            reason: "version_mismatch".to_string(),
            detected_at: 1,
        };
        store.record_conflict(&conflict).await.unwrap();
        store.keep_local(&conflict).await.unwrap();

        let entity = store.get_entity(EntityType::Content, "n1").await.unwrap().unwrap();
        assert_eq!(entity.payload, json!({"text": "mine"}));
        assert_eq!(entity.server_version, Some(3));
        assert!(store.pending_change(EntityType::Content, "n1").await.unwrap().is_some());

        store.record_conflict(&conflict).await.unwrap();
        conflict.server_version = None;
        let error = store.keep_local(&conflict).await.unwrap_err();
        assert!(matches!(error, Error::InvalidInput(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn keep_local_over_tombstone_turns_create_into_update() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let journal = store
            .create_entity(EntityType::Journal, json!({"title": "again"}))
            .await
            .unwrap();

        let conflict = SyncConflict {
            id: 0,
            entity_type: EntityType::Journal,
            entity_id: journal.id.clone(),
            local_version: None,
            server_version: Some(4),
            server_payload: None,
            server_deleted: true,
            reason: "deleted".to_string(),
            detected_at: 1,
        };
        store.record_conflict(&conflict).await.unwrap();
        store.keep_local(&conflict).await.unwrap();

        let pending = store
            .pending_change(EntityType::Journal, &journal.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pending.operation, PendingOperation::Update);
        assert_eq!(
            store.known_version(EntityType::Journal, &journal.id).await.unwrap(),
            Some(4)
        );
        assert_eq!(store.open_conflict_count().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn complete_upload_carries_write_made_during_upload() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let entity = store
            .create_entity(EntityType::Content, json!({"text": "draft"}))
            .await
            .unwrap();
        let snapshot = store.dequeue_all(EntityType::Content).await.unwrap();

        // Edited while the CREATE is on the wire.
        store
            .update_entity(EntityType::Content, &entity.id, json!({"text": "final"}))
            .await
            .unwrap();

        let removed = store
            .complete_upload(EntityType::Content, &snapshot[0], 1, 20)
            .await
            .unwrap();
        assert!(!removed);

        let pending = store
            .pending_change(EntityType::Content, &entity.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pending.operation, PendingOperation::Update);
        let stored = store
            .get_entity(EntityType::Content, &entity.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.server_version, Some(1));
        assert_eq!(stored.payload, json!({"text": "final"}));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn complete_upload_rebases_delete_made_during_upload() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let entity = store
            .create_entity(EntityType::Journal, json!({"title": "short-lived"}))
            .await
            .unwrap();
        let snapshot = store.dequeue_all(EntityType::Journal).await.unwrap();
        store.delete_entity(EntityType::Journal, &entity.id).await.unwrap();

        assert!(!store
            .complete_upload(EntityType::Journal, &snapshot[0], 1, 20)
            .await
            .unwrap());
        let pending = store
            .pending_change(EntityType::Journal, &entity.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pending.operation, PendingOperation::Delete);
        assert_eq!(
            store.known_version(EntityType::Journal, &entity.id).await.unwrap(),
            Some(1)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_change_is_held_by_pending_edit() {
        let store = LocalStore::open_in_memory().await.unwrap();
        assert_eq!(
            store.apply_remote_change(&remote("n1", 1)).await.unwrap(),
            RemoteApply::Applied
        );
        store
            .update_entity(EntityType::Content, "n1", json!({"text": "mine"}))
            .await
            .unwrap();

        let outcome = store.apply_remote_change(&remote("n1", 2)).await.unwrap();
        assert!(matches!(
            outcome,
            RemoteApply::Blocked { known_version: Some(1), .. }
        ));
        assert_eq!(
            store.apply_remote_change(&remote("n1", 1)).await.unwrap(),
            RemoteApply::Stale
        );

        let entity = store.get_entity(EntityType::Content, "n1").await.unwrap().unwrap();
        assert_eq!(entity.payload, json!({"text": "mine"}));
        assert_eq!(entity.server_version, Some(1));
        assert!(store.pending_change(EntityType::Content, "n1").await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_change_matching_pending_edit_converges() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store.apply_remote_change(&remote("n1", 1)).await.unwrap();
        store
            .update_entity(EntityType::Content, "n1", json!({"text": "v2"}))
            .await
            .unwrap();

        assert_eq!(
            store.apply_remote_change(&remote("n1", 2)).await.unwrap(),
            RemoteApply::Converged
        );
        assert!(store.pending_change(EntityType::Content, "n1").await.unwrap().is_none());
        assert_eq!(
            store.known_version(EntityType::Content, "n1").await.unwrap(),
            Some(2)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_deletion_is_held_by_pending_edit() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store.apply_remote_change(&remote("n1", 1)).await.unwrap();
        store
            .update_entity(EntityType::Content, "n1", json!({"text": "mine"}))
            .await
            .unwrap();

        let outcome = store
            .apply_remote_deletion(EntityType::Content, "n1")
            .await
            .unwrap();
        assert!(matches!(outcome, RemoteDeletion::Blocked { .. }));
        assert!(store.get_entity(EntityType::Content, "n1").await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_deletion_acknowledges_pending_delete() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store.apply_remote_change(&remote("n1", 1)).await.unwrap();
        store.delete_entity(EntityType::Content, "n1").await.unwrap();

        assert_eq!(
            store
                .apply_remote_deletion(EntityType::Content, "n1")
                .await
                .unwrap(),
            RemoteDeletion::Acknowledged
        );
        assert_eq!(store.pending_counts().total(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn keep_local_without_server_record_restarts_as_create() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store.apply_remote_change(&remote("n1", 2)).await.unwrap();
        store
            .update_entity(EntityType::Content, "n1", json!({"text": "mine"}))
            .await
            .unwrap();

        let conflict = SyncConflict {
            id: 0,
            entity_type: EntityType::Content,
            entity_id: "n1".to_string(),
            local_version: Some(2),
            server_version: None,
            server_payload: None,
            server_deleted: true,
            reason: "not_found".to_string(),
            detected_at: 1,
        };
        store.record_conflict(&conflict).await.unwrap();
        store.keep_local(&conflict).await.unwrap();

        let pending = store.pending_change(EntityType::Content, "n1").await.unwrap().unwrap();
        assert_eq!(pending.operation, PendingOperation::Create);
        let entity = store.get_entity(EntityType::Content, "n1").await.unwrap().unwrap();
        assert_eq!(entity.server_version, None);
        assert_eq!(entity.payload, json!({"text": "mine"}));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_writes_are_broadcast() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let mut changes = store.subscribe_changes();

        store.apply_remote_change(&remote("n1", 1)).await.unwrap();
        let change = changes.recv().await.unwrap();
        assert_eq!(change.origin, ChangeOrigin::Remote);
        assert!(!change.deleted);

        assert_eq!(
            store
                .apply_remote_deletion(EntityType::Content, "n1")
                .await
                .unwrap(),
            RemoteDeletion::Removed
        );
        assert!(changes.recv().await.unwrap().deleted);
    }
}
