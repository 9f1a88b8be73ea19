//! Conflict side channel repository

use libsql::{Connection, Value};

use super::{nullable_version, optional_text, optional_version, parse_entity_type, sql_limit};
use crate::error::Result;
use crate::models::{EntityType, SyncConflict, Timestamp};

/// Trait for conflict storage operations (async)
#[allow(async_fn_in_trait)]
pub trait ConflictRepository {
    /// Record an open conflict, replacing any open one for the same entity.
    ///
    /// `conflict.id` is ignored; the stored row id is returned.
    async fn record(&self, conflict: &SyncConflict) -> Result<i64>;

    /// Open conflict for one entity, if any.
    async fn get_open(&self, entity_type: EntityType, entity_id: &str)
        -> Result<Option<SyncConflict>>;

    /// Most recent open conflicts first.
    async fn list_open(&self, limit: usize) -> Result<Vec<SyncConflict>>;

    /// Mark the open conflict for an entity resolved.
    async fn resolve(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        resolved_at: Timestamp,
    ) -> Result<bool>;

    /// Number of open conflicts.
    async fn count_open(&self) -> Result<usize>;
}

/// libSQL implementation of `ConflictRepository`
pub struct LibSqlConflictRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlConflictRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_conflict(row: &libsql::Row) -> Result<SyncConflict> {
        let server_payload = optional_text(row, 5)?
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?;
        Ok(SyncConflict {
            id: row.get(0)?,
            entity_type: parse_entity_type(&row.get::<String>(1)?)?,
            entity_id: row.get(2)?,
            local_version: optional_version(row, 3)?,
            server_version: optional_version(row, 4)?,
            server_payload,
            server_deleted: row.get::<i64>(6)? != 0,
            reason: row.get(7)?,
            detected_at: row.get(8)?,
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT id, entity_type, entity_id, local_version, server_version,
        server_payload, server_deleted, reason, detected_at
 FROM sync_conflicts";

impl ConflictRepository for LibSqlConflictRepository<'_> {
    async fn record(&self, conflict: &SyncConflict) -> Result<i64> {
        self.conn
            .execute(
                "DELETE FROM sync_conflicts
                 WHERE entity_type = ? AND entity_id = ? AND resolved_at IS NULL",
                [conflict.entity_type.as_str(), conflict.entity_id.as_str()],
            )
            .await?;

        let server_payload = match &conflict.server_payload {
            Some(payload) => Value::Text(serde_json::to_string(payload)?),
            None => Value::Null,
        };

        self.conn
            .execute(
                "INSERT INTO sync_conflicts (
                    entity_type, entity_id, local_version, server_version,
                    server_payload, server_deleted, reason, detected_at
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                libsql::params![
                    conflict.entity_type.as_str(),
                    conflict.entity_id.as_str(),
                    nullable_version(conflict.local_version)?,
                    nullable_version(conflict.server_version)?,
                    server_payload,
                    i64::from(conflict.server_deleted),
                    conflict.reason.as_str(),
                    conflict.detected_at,
                ],
            )
            .await?;

        Ok(self.conn.last_insert_rowid())
    }

    async fn get_open(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<SyncConflict>> {
        let sql = format!(
            "{SELECT_COLUMNS}
             WHERE entity_type = ? AND entity_id = ? AND resolved_at IS NULL
             ORDER BY id DESC LIMIT 1"
        );
        let mut rows = self
            .conn
            .query(&sql, [entity_type.as_str(), entity_id])
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_conflict(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_open(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let sql = format!(
            "{SELECT_COLUMNS}
             WHERE resolved_at IS NULL
             ORDER BY detected_at DESC, id DESC
             LIMIT ?"
        );
        let mut rows = self.conn.query(&sql, [sql_limit(limit)]).await?;

        let mut conflicts = Vec::new();
        while let Some(row) = rows.next().await? {
            conflicts.push(Self::parse_conflict(&row)?);
        }
        Ok(conflicts)
    }

    async fn resolve(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        resolved_at: Timestamp,
    ) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE sync_conflicts SET resolved_at = ?
                 WHERE entity_type = ? AND entity_id = ? AND resolved_at IS NULL",
                libsql::params![resolved_at, entity_type.as_str(), entity_id],
            )
            .await?;
        Ok(rows > 0)
    }

    async fn count_open(&self) -> Result<usize> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM sync_conflicts WHERE resolved_at IS NULL",
                (),
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(usize::try_from(row.get::<i64>(0)?).unwrap_or(0)),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn conflict(entity_id: &str, server_version: u64, detected_at: i64) -> SyncConflict {
        SyncConflict {
            id: 0,
            entity_type: EntityType::Content,
            entity_id: entity_id.to_string(),
            local_version: Some(1),
            server_version: Some(server_version),
            server_payload: Some(json!({"text": "server"})),
            server_deleted: false,
            reason: "version_mismatch".to_string(),
            detected_at,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_record_and_fetch_open_conflict() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlConflictRepository::new(db.connection());

        let id = repo.record(&conflict("n1", 2, 100)).await.unwrap();
        let stored = repo
            .get_open(EntityType::Content, "n1")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(stored.id, id);
        assert_eq!(stored.server_version, Some(2));
        assert_eq!(stored.server_payload, Some(json!({"text": "server"})));
        assert!(!stored.server_deleted);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_record_replaces_open_conflict_for_same_entity() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlConflictRepository::new(db.connection());

        repo.record(&conflict("n1", 2, 100)).await.unwrap();
        repo.record(&conflict("n1", 3, 200)).await.unwrap();

        assert_eq!(repo.count_open().await.unwrap(), 1);
        let stored = repo
            .get_open(EntityType::Content, "n1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.server_version, Some(3));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resolve_closes_conflict() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlConflictRepository::new(db.connection());

        repo.record(&conflict("n1", 2, 100)).await.unwrap();
        repo.record(&conflict("n2", 4, 300)).await.unwrap();

        assert!(repo.resolve(EntityType::Content, "n1", 400).await.unwrap());
        assert!(!repo.resolve(EntityType::Content, "n1", 500).await.unwrap());

        let open = repo.list_open(10).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].entity_id, "n2");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_deleted_server_side_has_no_payload() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlConflictRepository::new(db.connection());

        let mut deleted = conflict("n1", 2, 100);
        deleted.server_payload = None;
        deleted.server_deleted = true;
        deleted.reason = "deleted".to_string();
        repo.record(&deleted).await.unwrap();

        let stored = repo
            .get_open(EntityType::Content, "n1")
            .await
            .unwrap()
            .unwrap();
        assert!(stored.server_deleted);
        assert_eq!(stored.server_payload, None);
    }
}
