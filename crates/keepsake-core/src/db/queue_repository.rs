//! Change Queue repository
//!
//! One row per `(entity_type, entity_id)`. Every enqueue stamps the row with a
//! fresh revision from `queue_sequence`, so an acknowledgement carrying the
//! revision of an older snapshot leaves a newer pending write untouched.
//!
//! [`ChangeQueueRepository::enqueue`] issues several statements; callers run
//! it inside a transaction (see [`crate::services::LocalStore`]).

use std::collections::BTreeMap;

use libsql::Connection;

use super::{nullable_version, optional_version, parse_entity_type};
use crate::error::{Error, Result};
use crate::models::{EntityType, PendingChange, PendingCounts, PendingOperation};
use crate::util::now_millis;

/// Trait for Change Queue storage operations (async)
#[allow(async_fn_in_trait)]
pub trait ChangeQueueRepository {
    /// Record a pending operation, collapsing it into any existing one for the same key.
    ///
    /// `base_version` is the server version the local edit was made against; an
    /// existing pending row keeps its own base.
    async fn enqueue(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        operation: PendingOperation,
        base_version: Option<u64>,
    ) -> Result<PendingChange>;

    /// Stable snapshot of every pending operation for one entity type, oldest first.
    async fn snapshot(&self, entity_type: EntityType) -> Result<Vec<PendingChange>>;

    /// Pending operation for a single key.
    async fn get(&self, entity_type: EntityType, entity_id: &str)
        -> Result<Option<PendingChange>>;

    /// Server version the pending edit for this key was based on.
    async fn base_version(&self, entity_type: EntityType, entity_id: &str) -> Result<Option<u64>>;

    /// Move the base of a pending edit to a newer server version.
    async fn rebase(&self, entity_type: EntityType, entity_id: &str, version: u64)
        -> Result<bool>;

    /// Base a pending operation on the server's current state of the entity.
    ///
    /// With `Some(version)` the server knows the id, so a pending CREATE becomes
    /// an UPDATE. With `None` the server has no record of it, so a pending
    /// UPDATE becomes a CREATE. A pending DELETE stays a DELETE. The entry gets a
    /// fresh revision.
    async fn carry_forward(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        version: Option<u64>,
    ) -> Result<Option<PendingChange>>;

    /// Remove the entry only if it still carries `revision`.
    async fn acknowledge(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        revision: i64,
    ) -> Result<bool>;

    /// Remove the entry regardless of revision.
    async fn discard(&self, entity_type: EntityType, entity_id: &str) -> Result<bool>;

    /// Pending operation counts for every entity type.
    async fn counts(&self) -> Result<PendingCounts>;
}

/// libSQL implementation of `ChangeQueueRepository`
pub struct LibSqlChangeQueueRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlChangeQueueRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    async fn next_revision(&self) -> Result<i64> {
        let mut rows = self
            .conn
            .query(
                "UPDATE queue_sequence SET value = value + 1 WHERE id = 1 RETURNING value",
                (),
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(row.get::<i64>(0)?),
            None => Err(Error::Database("queue sequence row is missing".to_string())),
        }
    }

    fn parse_change(row: &libsql::Row) -> Result<PendingChange> {
        let operation: String = row.get(1)?;
        Ok(PendingChange {
            entity_id: row.get(0)?,
            operation: operation.parse().map_err(Error::Database)?,
            revision: row.get(2)?,
        })
    }
}

impl ChangeQueueRepository for LibSqlChangeQueueRepository<'_> {
    async fn enqueue(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        operation: PendingOperation,
        base_version: Option<u64>,
    ) -> Result<PendingChange> {
        let existing = self.get(entity_type, entity_id).await?;
        let collapsed = PendingOperation::collapse(existing.map(|change| change.operation), operation);
        let revision = self.next_revision().await?;

        self.conn
            .execute(
                "INSERT INTO pending_operations
                    (entity_type, entity_id, operation, revision, base_version, enqueued_at)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(entity_type, entity_id) DO UPDATE SET
                    operation = excluded.operation,
                    revision = excluded.revision,
                    base_version = COALESCE(pending_operations.base_version, excluded.base_version),
                    enqueued_at = excluded.enqueued_at",
                libsql::params![
                    entity_type.as_str(),
                    entity_id,
                    collapsed.as_str(),
                    revision,
                    nullable_version(base_version)?,
                    now_millis(),
                ],
            )
            .await?;

        Ok(PendingChange {
            entity_id: entity_id.to_string(),
            operation: collapsed,
            revision,
        })
    }

    async fn snapshot(&self, entity_type: EntityType) -> Result<Vec<PendingChange>> {
        let mut rows = self
            .conn
            .query(
                "SELECT entity_id, operation, revision
                 FROM pending_operations
                 WHERE entity_type = ?
                 ORDER BY revision ASC",
                [entity_type.as_str()],
            )
            .await?;

        let mut changes = Vec::new();
        while let Some(row) = rows.next().await? {
            changes.push(Self::parse_change(&row)?);
        }
        Ok(changes)
    }

    async fn get(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<PendingChange>> {
        let mut rows = self
            .conn
            .query(
                "SELECT entity_id, operation, revision
                 FROM pending_operations
                 WHERE entity_type = ? AND entity_id = ?",
                [entity_type.as_str(), entity_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_change(&row)?)),
            None => Ok(None),
        }
    }

    async fn base_version(&self, entity_type: EntityType, entity_id: &str) -> Result<Option<u64>> {
        let mut rows = self
            .conn
            .query(
                "SELECT base_version FROM pending_operations
                 WHERE entity_type = ? AND entity_id = ?",
                [entity_type.as_str(), entity_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => optional_version(&row, 0),
            None => Ok(None),
        }
    }

    async fn rebase(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        version: u64,
    ) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE pending_operations SET base_version = ?
                 WHERE entity_type = ? AND entity_id = ?",
                libsql::params![
                    super::version_to_sql(version)?,
                    entity_type.as_str(),
                    entity_id
                ],
            )
            .await?;
        Ok(rows > 0)
    }

    async fn carry_forward(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        version: Option<u64>,
    ) -> Result<Option<PendingChange>> {
        let Some(existing) = self.get(entity_type, entity_id).await? else {
            return Ok(None);
        };
        let operation = match (existing.operation, version) {
            (PendingOperation::Create, Some(_)) => PendingOperation::Update,
            (PendingOperation::Update, None) => PendingOperation::Create,
            (operation, _) => operation,
        };
        let revision = self.next_revision().await?;

        self.conn
            .execute(
                "UPDATE pending_operations
                 SET operation = ?, revision = ?, base_version = ?
                 WHERE entity_type = ? AND entity_id = ?",
                libsql::params![
                    operation.as_str(),
                    revision,
                    nullable_version(version)?,
                    entity_type.as_str(),
                    entity_id
                ],
            )
            .await?;

        Ok(Some(PendingChange {
            entity_id: entity_id.to_string(),
            operation,
            revision,
        }))
    }

    async fn acknowledge(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        revision: i64,
    ) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "DELETE FROM pending_operations
                 WHERE entity_type = ? AND entity_id = ? AND revision = ?",
                libsql::params![entity_type.as_str(), entity_id, revision],
            )
            .await?;
        Ok(rows > 0)
    }

    async fn discard(&self, entity_type: EntityType, entity_id: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "DELETE FROM pending_operations WHERE entity_type = ? AND entity_id = ?",
                [entity_type.as_str(), entity_id],
            )
            .await?;
        Ok(rows > 0)
    }

    async fn counts(&self) -> Result<PendingCounts> {
        let mut rows = self
            .conn
            .query(
                "SELECT entity_type, COUNT(*) FROM pending_operations GROUP BY entity_type",
                (),
            )
            .await?;

        let mut by_type = BTreeMap::new();
        while let Some(row) = rows.next().await? {
            let entity_type = parse_entity_type(&row.get::<String>(0)?)?;
            let count = usize::try_from(row.get::<i64>(1)?).unwrap_or(0);
            by_type.insert(entity_type, count);
        }
        Ok(PendingCounts { by_type })
    }
}
