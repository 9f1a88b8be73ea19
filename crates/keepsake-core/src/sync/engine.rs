//! Sync Orchestrator.
//!
//! Each pass visits entity types in [`EntityType::ALL`] order and, per type,
//! drains the change queue before pulling the change feed. Passes for one
//! type are serialized; identical requests arriving while a pass runs join it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{stream, FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use super::backoff::{RetryPolicy, TypeState};
use super::remote::{RemoteError, RemoteSync};
use super::single_flight::SingleFlight;
use crate::models::{
    ConflictResolution, EntityType, LocalEntity, PendingChange, PendingOperation, SyncConflict,
    SyncError, SyncErrorKind, SyncPhase, SyncResult, SyncStatus, Timestamp, Tombstone,
    VersionConstraint, VersionedEntity,
};
use crate::protocol::{ConflictBody, UpdateRequest, UploadRequest};
use crate::services::{LocalStore, RemoteApply, RemoteDeletion};
use crate::util::now_millis;
use crate::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Stamped on every mutation this device uploads.
    pub device_id: String,
    /// Whether scheduled syncs run at all.
    pub enabled: bool,
    /// Uploads in flight at once within one entity type.
    pub upload_concurrency: usize,
    pub retry: RetryPolicy,
    pub sync_interval: Duration,
    /// Delay applied by `sync(false)` before starting.
    pub schedule_delay: Duration,
}

impl EngineConfig {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            enabled: true,
            upload_concurrency: 4,
            retry: RetryPolicy::default(),
            sync_interval: Duration::from_secs(60),
            schedule_delay: Duration::from_millis(500),
        }
    }
}

/// Single-flight key: what a pass covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncScope {
    Full,
    Upload,
    Download,
    EntityType(EntityType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Upload,
    Download,
    Both,
}

impl Pass {
    const fn uploads(self) -> bool {
        matches!(self, Self::Upload | Self::Both)
    }

    const fn downloads(self) -> bool {
        matches!(self, Self::Download | Self::Both)
    }
}

/// Client-side sync orchestrator over a [`LocalStore`] and a [`RemoteSync`].
pub struct SyncEngine<R> {
    inner: Arc<Inner<R>>,
}

impl<R> Clone for SyncEngine<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<R> {
    store: LocalStore,
    remote: R,
    config: EngineConfig,
    flights: SingleFlight<SyncScope, SyncResult>,
    type_locks: [AsyncMutex<()>; 4],
    states: Mutex<HashMap<EntityType, TypeState>>,
    cancel_epoch: AtomicU64,
    active: AtomicUsize,
    last_result: watch::Sender<Option<SyncResult>>,
    last_sync_time: watch::Sender<Option<Timestamp>>,
}

/// Handle of the task started by [`SyncEngine::spawn_periodic`]; dropping it stops the task.
pub struct PeriodicSync {
    handle: JoinHandle<()>,
}

impl PeriodicSync {
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for PeriodicSync {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

const fn type_index(entity_type: EntityType) -> usize {
    match entity_type {
        EntityType::Content => 0,
        EntityType::Journal => 1,
        EntityType::Media => 2,
        EntityType::Association => 3,
    }
}

fn storage_error(entity_type: EntityType, entity_id: Option<&str>, error: &Error) -> SyncError {
    SyncError::new(
        SyncErrorKind::Storage,
        entity_type,
        entity_id.map(str::to_string),
        error.to_string(),
    )
}

impl<R: RemoteSync> SyncEngine<R> {
    pub async fn new(store: LocalStore, remote: R, config: EngineConfig) -> crate::Result<Self> {
        let watermark = store.watermarks().await?.into_values().max();
        let (last_result, _) = watch::channel(None);
        let (last_sync_time, _) = watch::channel(watermark);

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                remote,
                config,
                flights: SingleFlight::new(),
                type_locks: Default::default(),
                states: Mutex::new(HashMap::new()),
                cancel_epoch: AtomicU64::new(0),
                active: AtomicUsize::new(0),
                last_result,
                last_sync_time,
            }),
        })
    }

    pub fn store(&self) -> &LocalStore {
        &self.inner.store
    }

    pub fn remote(&self) -> &R {
        &self.inner.remote
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Upload every entity type's pending operations.
    pub async fn upload_pending_changes(&self) -> SyncResult {
        self.run_scope(SyncScope::Upload).await
    }

    /// Pull the change feed of every entity type and apply it locally.
    pub async fn download_remote_changes(&self) -> SyncResult {
        self.run_scope(SyncScope::Download).await
    }

    /// Upload then download a single entity type.
    pub async fn sync_entity_type(&self, entity_type: EntityType) -> SyncResult {
        self.run_scope(SyncScope::EntityType(entity_type)).await
    }

    pub async fn sync_content(&self) -> SyncResult {
        self.sync_entity_type(EntityType::Content).await
    }

    pub async fn sync_journals(&self) -> SyncResult {
        self.sync_entity_type(EntityType::Journal).await
    }

    pub async fn sync_associations(&self) -> SyncResult {
        self.sync_entity_type(EntityType::Association).await
    }

    pub async fn sync_media(&self) -> SyncResult {
        self.sync_entity_type(EntityType::Media).await
    }

    /// Upload then download every entity type, one type at a time.
    pub async fn full_sync(&self) -> SyncResult {
        self.run_scope(SyncScope::Full).await
    }

    /// Trigger a full sync in the background.
    ///
    /// With `start_now == false` the pass starts after the configured
    /// schedule delay. Returns `None` when sync is disabled.
    pub fn sync(&self, start_now: bool) -> Option<JoinHandle<SyncResult>> {
        if !self.inner.config.enabled {
            tracing::debug!("Sync disabled; ignoring sync request");
            return None;
        }

        let engine = self.clone();
        let delay = if start_now {
            Duration::ZERO
        } else {
            self.inner.config.schedule_delay
        };
        Some(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            engine.full_sync().await
        }))
    }

    /// Run `full_sync` every `sync_interval` until the handle is dropped.
    pub fn spawn_periodic(&self) -> Option<PeriodicSync> {
        if !self.inner.config.enabled {
            return None;
        }

        let engine = self.clone();
        let interval = self.inner.config.sync_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let result = engine.full_sync().await;
                tracing::debug!(
                    success = result.success,
                    errors = result.errors.len(),
                    "Periodic sync finished"
                );
            }
        });
        Some(PeriodicSync { handle })
    }

    /// Stop the in-flight pass before its next entity type.
    pub fn cancel(&self) {
        self.inner.cancel_epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Observe the result of every finished pass.
    pub fn subscribe_results(&self) -> watch::Receiver<Option<SyncResult>> {
        self.inner.last_result.subscribe()
    }

    /// Current pass state of one entity type.
    pub fn phase(&self, entity_type: EntityType) -> SyncPhase {
        self.inner
            .states
            .lock()
            .get(&entity_type)
            .map_or(SyncPhase::Idle, |state| state.phase)
    }

    /// Read-only snapshot; never waits on an in-flight pass.
    pub fn get_sync_status(&self) -> SyncStatus {
        let inner = &self.inner;
        let last_failed = inner
            .last_result
            .borrow()
            .as_ref()
            .is_some_and(|result| !result.errors.is_empty());
        let any_failed = inner
            .states
            .lock()
            .values()
            .any(|state| state.phase == SyncPhase::Failed);

        SyncStatus {
            is_enabled: inner.config.enabled,
            last_sync_time: *inner.last_sync_time.borrow(),
            pending_uploads: inner.store.pending_counts().total(),
            is_syncing: inner.active.load(Ordering::SeqCst) > 0,
            has_errors: last_failed || any_failed,
        }
    }

    /// Settle an open conflict recorded by a previous pass.
    pub async fn resolve_conflict(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        resolution: ConflictResolution,
    ) -> crate::Result<()> {
        let _guard = self.inner.type_locks[type_index(entity_type)].lock().await;
        let conflict = self
            .inner
            .store
            .open_conflict(entity_type, entity_id)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("no open conflict for {entity_type} {entity_id}"))
            })?;

        match resolution {
            ConflictResolution::TakeServer => self.inner.store.take_server(&conflict).await?,
            ConflictResolution::KeepLocal => self.inner.store.keep_local(&conflict).await?,
        }
        tracing::info!(
            entity_type = %entity_type,
            entity_id,
            ?resolution,
            "Resolved sync conflict"
        );
        Ok(())
    }

    async fn run_scope(&self, scope: SyncScope) -> SyncResult {
        let inner = Arc::clone(&self.inner);
        self.inner
            .flights
            .run(scope, move || async move { inner.execute(scope).await }.boxed())
            .await
    }
}

impl<R: RemoteSync> Inner<R> {
    async fn execute(&self, scope: SyncScope) -> SyncResult {
        let _active = ActiveGuard::enter(&self.active);
        let epoch = self.cancel_epoch.load(Ordering::SeqCst);
        let started = Instant::now();

        let (types, pass): (Vec<EntityType>, Pass) = match scope {
            SyncScope::Full => (EntityType::ALL.to_vec(), Pass::Both),
            SyncScope::Upload => (EntityType::ALL.to_vec(), Pass::Upload),
            SyncScope::Download => (EntityType::ALL.to_vec(), Pass::Download),
            SyncScope::EntityType(entity_type) => (vec![entity_type], Pass::Both),
        };

        let mut total = SyncResult::empty();
        for entity_type in types {
            if self.cancel_epoch.load(Ordering::SeqCst) != epoch {
                tracing::info!(?scope, next = %entity_type, "Sync pass cancelled");
                total.cancelled = true;
                total.success = false;
                break;
            }
            let partial = self.run_type(entity_type, pass).await;
            total.absorb(partial);
        }

        tracing::info!(
            ?scope,
            success = total.success,
            uploaded = total.uploaded_items,
            downloaded = total.downloaded_items,
            errors = total.errors.len(),
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Sync pass finished"
        );
        self.last_result.send_replace(Some(total.clone()));
        total
    }

    async fn run_type(&self, entity_type: EntityType, pass: Pass) -> SyncResult {
        let _guard = self.type_locks[type_index(entity_type)].lock().await;

        let ready = self
            .states
            .lock()
            .get(&entity_type)
            .map_or(true, |state| state.ready(Instant::now()));
        if !ready {
            tracing::debug!(entity_type = %entity_type, "Skipping entity type in backoff");
            let mut deferred = SyncResult::empty();
            deferred.push_error(SyncError::new(
                SyncErrorKind::Network,
                entity_type,
                None,
                "retry deferred",
            ));
            return deferred;
        }

        let mut result = SyncResult::empty();
        if pass.uploads() {
            self.set_phase(entity_type, SyncPhase::Uploading);
            result.absorb(self.upload_type(entity_type).await);
        }
        if pass.downloads() {
            self.set_phase(entity_type, SyncPhase::Downloading);
            result.absorb(self.download_type(entity_type).await);
        }

        let transient = result.errors.iter().any(|error| error.kind.is_transient());
        let mut states = self.states.lock();
        let state = states.entry(entity_type).or_default();
        if transient {
            state.fail(Instant::now(), &self.config.retry);
            tracing::warn!(
                entity_type = %entity_type,
                failures = state.failures,
                "Entity type sync failed; backing off"
            );
        } else {
            state.succeed();
        }
        result
    }

    fn set_phase(&self, entity_type: EntityType, phase: SyncPhase) {
        self.states.lock().entry(entity_type).or_default().phase = phase;
    }

    // ----- upload -----

    async fn upload_type(&self, entity_type: EntityType) -> SyncResult {
        let mut result = SyncResult::empty();
        let snapshot = match self.store.dequeue_all(entity_type).await {
            Ok(snapshot) => snapshot,
            Err(error) => {
                result.push_error(storage_error(entity_type, None, &error));
                return result;
            }
        };
        if snapshot.is_empty() {
            return result;
        }

        tracing::debug!(
            entity_type = %entity_type,
            pending = snapshot.len(),
            "Uploading pending changes"
        );
        let uploads: Vec<_> = snapshot
            .into_iter()
            .map(|change| self.upload_one(entity_type, change))
            .collect();
        let outcomes: Vec<Result<bool, SyncError>> = stream::iter(uploads)
            .buffer_unordered(self.config.upload_concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Ok(true) => result.uploaded_items += 1,
                Ok(false) => {}
                Err(error) => result.push_error(error),
            }
        }
        result
    }

    /// Upload one snapshot entry. `Ok(true)` when the server accepted it.
    async fn upload_one(
        &self,
        entity_type: EntityType,
        change: PendingChange,
    ) -> Result<bool, SyncError> {
        let id = change.entity_id.as_str();

        if change.operation == PendingOperation::Delete {
            return match self.remote.delete(entity_type, id).await {
                Ok(()) | Err(RemoteError::NotFound(_)) => {
                    self.acknowledge(entity_type, &change).await?;
                    Ok(true)
                }
                Err(error) => self.upload_failed(entity_type, &change, error).await,
            };
        }

        let entity = self
            .store
            .get_entity(entity_type, id)
            .await
            .map_err(|error| storage_error(entity_type, Some(id), &error))?;
        let Some(entity) = entity else {
            // Removed locally after the snapshot; the newer DELETE is queued.
            return Ok(false);
        };

        let is_create = change.operation == PendingOperation::Create;
        let accepted = if is_create {
            let request = UploadRequest {
                id: Some(entity.id.clone()),
                device_id: self.config.device_id.clone(),
                payload: entity.payload.clone(),
            };
            self.remote
                .upload(entity_type, &request)
                .await
                .map(|response| {
                    if response.id != entity.id {
                        tracing::warn!(
                            entity_type = %entity_type,
                            sent = %entity.id,
                            assigned = %response.id,
                            "Server assigned a different id"
                        );
                    }
                    (response.server_version, response.last_updated)
                })
        } else {
            let request = UpdateRequest {
                payload: entity.payload.clone(),
                version_constraint: VersionConstraint::from_observed(entity.server_version),
                device_id: self.config.device_id.clone(),
            };
            self.remote
                .update(entity_type, id, &request)
                .await
                .map(|response| (response.server_version, response.last_updated))
        };

        match accepted {
            Ok((server_version, last_updated)) => {
                self.store
                    .complete_upload(entity_type, &change, server_version, last_updated)
                    .await
                    .map_err(|error| storage_error(entity_type, Some(id), &error))?;
                tracing::debug!(
                    entity_type = %entity_type,
                    entity_id = id,
                    server_version,
                    "Uploaded change"
                );
                Ok(true)
            }
            Err(RemoteError::Conflict(body)) => {
                self.upload_conflict(entity_type, &change, &entity, *body)
                    .await
            }
            Err(RemoteError::NotFound(message)) if !is_create => {
                self.update_target_missing(entity_type, &change, &entity, &message)
                    .await
            }
            Err(error) => self.upload_failed(entity_type, &change, error).await,
        }
    }

    /// The server has no record of an entity this device edited, live or
    /// tombstoned. The edit stays queued behind a server-deleted conflict.
    async fn update_target_missing(
        &self,
        entity_type: EntityType,
        change: &PendingChange,
        entity: &LocalEntity,
        message: &str,
    ) -> Result<bool, SyncError> {
        let id = change.entity_id.as_str();
        self.record_conflict(&SyncConflict {
            id: 0,
            entity_type,
            entity_id: id.to_string(),
            local_version: entity.server_version,
            server_version: None,
            server_payload: None,
            server_deleted: true,
            reason: "not_found".to_string(),
            detected_at: now_millis(),
        })
        .await?;

        tracing::warn!(
            entity_type = %entity_type,
            entity_id = id,
            message,
            "Server has no record of edited entity"
        );
        Err(SyncError::new(
            SyncErrorKind::Conflict,
            entity_type,
            Some(id.to_string()),
            format!("{} rejected (not_found); the server has no record of it", change.operation),
        ))
    }

    async fn upload_conflict(
        &self,
        entity_type: EntityType,
        change: &PendingChange,
        entity: &LocalEntity,
        body: ConflictBody,
    ) -> Result<bool, SyncError> {
        let id = change.entity_id.as_str();

        // The server already holds exactly this payload: adopt its version.
        if let Some(current) = body
            .current
            .as_ref()
            .filter(|current| current.payload == entity.payload)
        {
            self.store
                .complete_upload(entity_type, change, current.server_version, current.last_updated)
                .await
                .map_err(|error| storage_error(entity_type, Some(id), &error))?;
            return Ok(false);
        }

        let reason = body.reason.label();
        let server_version = body.server_version();
        let conflict = SyncConflict {
            id: 0,
            entity_type,
            entity_id: id.to_string(),
            local_version: entity.server_version,
            server_version,
            server_deleted: body.tombstone.is_some(),
            server_payload: body.current.map(|current| current.payload),
            reason: reason.to_string(),
            detected_at: now_millis(),
        };
        self.record_conflict(&conflict).await?;

        tracing::warn!(
            entity_type = %entity_type,
            entity_id = id,
            reason,
            "Server rejected pending change"
        );
        Err(SyncError::new(
            SyncErrorKind::Conflict,
            entity_type,
            Some(id.to_string()),
            format!(
                "{} rejected ({reason}); server version {}",
                change.operation,
                server_version.map_or_else(|| "unknown".to_string(), |v| v.to_string())
            ),
        ))
    }

    async fn upload_failed(
        &self,
        entity_type: EntityType,
        change: &PendingChange,
        error: RemoteError,
    ) -> Result<bool, SyncError> {
        let kind = error.kind();
        if kind == SyncErrorKind::Validation {
            tracing::warn!(
                entity_type = %entity_type,
                entity_id = %change.entity_id,
                %error,
                "Dropping pending change rejected by the server"
            );
            self.acknowledge(entity_type, change).await?;
        }
        Err(SyncError::new(
            kind,
            entity_type,
            Some(change.entity_id.clone()),
            error.to_string(),
        ))
    }

    async fn acknowledge(
        &self,
        entity_type: EntityType,
        change: &PendingChange,
    ) -> Result<(), SyncError> {
        self.store
            .acknowledge(entity_type, change)
            .await
            .map(|_| ())
            .map_err(|error| storage_error(entity_type, Some(&change.entity_id), &error))
    }

    async fn record_conflict(&self, conflict: &SyncConflict) -> Result<(), SyncError> {
        self.store
            .record_conflict(conflict)
            .await
            .map(|_| ())
            .map_err(|error| {
                storage_error(conflict.entity_type, Some(&conflict.entity_id), &error)
            })
    }

    // ----- download -----

    async fn download_type(&self, entity_type: EntityType) -> SyncResult {
        let mut result = SyncResult::empty();
        let since = match self.store.last_sync_time(entity_type).await {
            Ok(since) => since.unwrap_or(0),
            Err(error) => {
                result.push_error(storage_error(entity_type, None, &error));
                return result;
            }
        };

        let response = match self.remote.fetch_changes(entity_type, since).await {
            Ok(response) => response,
            Err(error) => {
                result.push_error(SyncError::new(
                    error.kind(),
                    entity_type,
                    None,
                    error.to_string(),
                ));
                return result;
            }
        };

        let mut clean = true;
        if response.resync_required {
            let keep: HashSet<String> = response
                .changes
                .iter()
                .map(|entity| entity.id.clone())
                .collect();
            match self.store.retain_synced(entity_type, &keep).await {
                Ok(removed) => {
                    tracing::info!(
                        entity_type = %entity_type,
                        removed = removed.len(),
                        "Resynced after tombstone purge"
                    );
                    result.downloaded_items += removed.len();
                }
                Err(error) => {
                    result.push_error(storage_error(entity_type, None, &error));
                    clean = false;
                }
            }
        }

        for entity in &response.changes {
            match self.apply_change(entity_type, entity).await {
                Ok(true) => result.downloaded_items += 1,
                Ok(false) => {}
                Err(error) => {
                    result.push_error(error);
                    clean = false;
                }
            }
        }
        for tombstone in &response.deletions {
            match self.apply_deletion(entity_type, tombstone).await {
                Ok(true) => result.downloaded_items += 1,
                Ok(false) => {}
                Err(error) => {
                    result.push_error(error);
                    clean = false;
                }
            }
        }

        if clean {
            match self
                .store
                .update_last_sync_time(entity_type, response.server_timestamp)
                .await
            {
                Ok(stored) => {
                    result.last_sync_time = Some(stored);
                    self.last_sync_time.send_modify(|current| {
                        *current = Some(current.map_or(stored, |value| value.max(stored)));
                    });
                }
                Err(error) => result.push_error(storage_error(entity_type, None, &error)),
            }
        } else {
            tracing::info!(
                entity_type = %entity_type,
                since,
                "Holding watermark until skipped entities are resolved"
            );
        }

        tracing::debug!(
            entity_type = %entity_type,
            changes = response.changes.len(),
            deletions = response.deletions.len(),
            downloaded = result.downloaded_items,
            "Applied change feed"
        );
        result
    }

    /// Apply one incoming change. `Ok(false)` when it was already applied or stale.
    async fn apply_change(
        &self,
        entity_type: EntityType,
        entity: &VersionedEntity,
    ) -> Result<bool, SyncError> {
        let id = entity.id.as_str();

        let (pending, known) = match self.store.apply_remote_change(entity).await {
            Ok(RemoteApply::Applied | RemoteApply::Converged) => return Ok(true),
            Ok(RemoteApply::Stale) => return Ok(false),
            Ok(RemoteApply::Blocked {
                pending,
                known_version,
            }) => (pending, known_version),
            Err(error) => return Err(storage_error(entity_type, Some(id), &error)),
        };

        self.record_conflict(&SyncConflict {
            id: 0,
            entity_type,
            entity_id: id.to_string(),
            local_version: known,
            server_version: Some(entity.server_version),
            server_payload: Some(entity.payload.clone()),
            server_deleted: false,
            reason: "remote_change".to_string(),
            detected_at: now_millis(),
        })
        .await?;

        tracing::info!(
            entity_type = %entity_type,
            entity_id = id,
            server_version = entity.server_version,
            "Skipped remote change for entity with pending local edit"
        );
        Err(SyncError::new(
            SyncErrorKind::Conflict,
            entity_type,
            Some(id.to_string()),
            format!(
                "server has version {}; local {} is pending",
                entity.server_version, pending.operation
            ),
        ))
    }

    /// Apply one incoming tombstone. `Ok(true)` when local state changed.
    async fn apply_deletion(
        &self,
        entity_type: EntityType,
        tombstone: &Tombstone,
    ) -> Result<bool, SyncError> {
        let id = tombstone.id.as_str();

        match self.store.apply_remote_deletion(entity_type, id).await {
            Ok(RemoteDeletion::Removed | RemoteDeletion::Acknowledged) => Ok(true),
            Ok(RemoteDeletion::Absent) => Ok(false),
            Ok(RemoteDeletion::Blocked {
                pending,
                known_version: known,
            }) => {
                let rebased = known.is_some_and(|known| {
                    tombstone.last_version != 0 && tombstone.last_version <= known
                });
                if rebased {
                    // The pending edit was already rebased past this deletion.
                    return Ok(false);
                }

                self.record_conflict(&SyncConflict {
                    id: 0,
                    entity_type,
                    entity_id: id.to_string(),
                    local_version: known,
                    server_version: Some(tombstone.last_version),
                    server_payload: None,
                    server_deleted: true,
                    reason: "deleted".to_string(),
                    detected_at: now_millis(),
                })
                .await?;

                Err(SyncError::new(
                    SyncErrorKind::Conflict,
                    entity_type,
                    Some(id.to_string()),
                    format!("deleted on the server; local {} is pending", pending.operation),
                ))
            }
            Err(error) => Err(storage_error(entity_type, Some(id), &error)),
        }
    }
}
