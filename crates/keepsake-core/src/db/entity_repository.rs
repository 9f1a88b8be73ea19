//! Local entity repository

use libsql::Connection;
use serde_json::Value;

use super::{nullable_integer, nullable_version, optional_i64, optional_version, sql_limit};
use crate::error::Result;
use crate::models::{Association, EntityType, LocalEntity, Timestamp, VersionedEntity};

/// Trait for local entity storage operations (async)
#[allow(async_fn_in_trait)]
pub trait EntityRepository {
    /// Get an entity by type and id
    async fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<LocalEntity>>;

    /// List entities of one type, most recently modified first
    async fn list(
        &self,
        entity_type: EntityType,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LocalEntity>>;

    /// Insert or replace the payload of a locally authored entity.
    ///
    /// The known server version is left as it was.
    async fn put_local(
        &self,
        entity_type: EntityType,
        id: &str,
        payload: &Value,
        updated_at: Timestamp,
    ) -> Result<()>;

    /// Store the server's copy of an entity, overwriting the local payload.
    async fn put_remote(&self, entity: &VersionedEntity, applied_at: Timestamp) -> Result<()>;

    /// Record the server version assigned to an entity after an accepted upload.
    async fn set_server_version(
        &self,
        entity_type: EntityType,
        id: &str,
        server_version: u64,
        last_updated: Option<Timestamp>,
    ) -> Result<bool>;

    /// Mark an entity as unknown to the server.
    async fn forget_server_version(&self, entity_type: EntityType, id: &str) -> Result<bool>;

    /// Remove an entity. Returns whether a row existed.
    async fn remove(&self, entity_type: EntityType, id: &str) -> Result<bool>;

    /// Ids of every entity of one type that the server has acknowledged.
    async fn synced_ids(&self, entity_type: EntityType) -> Result<Vec<String>>;

    /// Associations linking content to `journal_id`.
    async fn journal_associations(&self, journal_id: &str) -> Result<Vec<Association>>;
}

/// libSQL implementation of `EntityRepository`
pub struct LibSqlEntityRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlEntityRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_entity(row: &libsql::Row) -> Result<LocalEntity> {
        let entity_type: String = row.get(1)?;
        let payload: String = row.get(2)?;
        Ok(LocalEntity {
            id: row.get(0)?,
            entity_type: super::parse_entity_type(&entity_type)?,
            payload: serde_json::from_str(&payload)?,
            server_version: optional_version(row, 3)?,
            last_updated: optional_i64(row, 4)?,
            updated_at: row.get(5)?,
        })
    }
}

impl EntityRepository for LibSqlEntityRepository<'_> {
    async fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<LocalEntity>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, entity_type, payload, server_version, last_updated, updated_at
                 FROM local_entities
                 WHERE entity_type = ? AND id = ?",
                [entity_type.as_str(), id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_entity(&row)?)),
            None => Ok(None),
        }
    }

    async fn list(
        &self,
        entity_type: EntityType,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LocalEntity>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, entity_type, payload, server_version, last_updated, updated_at
                 FROM local_entities
                 WHERE entity_type = ?
                 ORDER BY updated_at DESC, id ASC
                 LIMIT ? OFFSET ?",
                libsql::params![entity_type.as_str(), sql_limit(limit), sql_limit(offset)],
            )
            .await?;

        let mut entities = Vec::new();
        while let Some(row) = rows.next().await? {
            entities.push(Self::parse_entity(&row)?);
        }
        Ok(entities)
    }

    async fn put_local(
        &self,
        entity_type: EntityType,
        id: &str,
        payload: &Value,
        updated_at: Timestamp,
    ) -> Result<()> {
        let payload = serde_json::to_string(payload)?;
        self.conn
            .execute(
                "INSERT INTO local_entities (entity_type, id, payload, server_version, last_updated, updated_at)
                 VALUES (?, ?, ?, NULL, NULL, ?)
                 ON CONFLICT(entity_type, id) DO UPDATE SET
                    payload = excluded.payload,
                    updated_at = excluded.updated_at",
                libsql::params![entity_type.as_str(), id, payload, updated_at],
            )
            .await?;
        Ok(())
    }

    async fn put_remote(&self, entity: &VersionedEntity, applied_at: Timestamp) -> Result<()> {
        let payload = serde_json::to_string(&entity.payload)?;
        self.conn
            .execute(
                "INSERT INTO local_entities (entity_type, id, payload, server_version, last_updated, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(entity_type, id) DO UPDATE SET
                    payload = excluded.payload,
                    server_version = excluded.server_version,
                    last_updated = excluded.last_updated,
                    updated_at = excluded.updated_at",
                libsql::params![
                    entity.entity_type.as_str(),
                    entity.id.as_str(),
                    payload,
                    nullable_version(Some(entity.server_version))?,
                    entity.last_updated,
                    applied_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn set_server_version(
        &self,
        entity_type: EntityType,
        id: &str,
        server_version: u64,
        last_updated: Option<Timestamp>,
    ) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE local_entities
                 SET server_version = ?, last_updated = COALESCE(?, last_updated)
                 WHERE entity_type = ? AND id = ?",
                libsql::params![
                    nullable_version(Some(server_version))?,
                    nullable_integer(last_updated),
                    entity_type.as_str(),
                    id,
                ],
            )
            .await?;
        Ok(rows > 0)
    }

    async fn forget_server_version(&self, entity_type: EntityType, id: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE local_entities SET server_version = NULL
                 WHERE entity_type = ? AND id = ?",
                [entity_type.as_str(), id],
            )
            .await?;
        Ok(rows > 0)
    }

    async fn remove(&self, entity_type: EntityType, id: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "DELETE FROM local_entities WHERE entity_type = ? AND id = ?",
                [entity_type.as_str(), id],
            )
            .await?;
        Ok(rows > 0)
    }

    async fn synced_ids(&self, entity_type: EntityType) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id FROM local_entities
                 WHERE entity_type = ? AND server_version IS NOT NULL
                 ORDER BY id",
                [entity_type.as_str()],
            )
            .await?;

        let mut ids = Vec::new();
        while let Some(row) = rows.next().await? {
            ids.push(row.get::<String>(0)?);
        }
        Ok(ids)
    }

    async fn journal_associations(&self, journal_id: &str) -> Result<Vec<Association>> {
        let mut rows = self
            .conn
            .query(
                "SELECT payload FROM local_entities
                 WHERE entity_type = ? AND json_extract(payload, '$.journalId') = ?
                 ORDER BY id",
                [EntityType::Association.as_str(), journal_id],
            )
            .await?;

        let mut associations = Vec::new();
        while let Some(row) = rows.next().await? {
            let payload: Value = serde_json::from_str(&row.get::<String>(0)?)?;
            if let Some(association) = Association::from_payload(&payload) {
                associations.push(association);
            }
        }
        Ok(associations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn remote(id: &str, version: u64, text: &str) -> VersionedEntity {
        VersionedEntity {
            id: id.to_string(),
            entity_type: EntityType::Content,
            payload: json!({ "text": text }),
            server_version: version,
            last_updated: 1_000 + i64::try_from(version).unwrap(),
            device_id: "other".to_string(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_put_local_keeps_server_version() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlEntityRepository::new(db.connection());

        repo.put_remote(&remote("n1", 3, "server"), 10).await.unwrap();
        repo.put_local(EntityType::Content, "n1", &json!({"text": "local"}), 20)
            .await
            .unwrap();

        let entity = repo.get(EntityType::Content, "n1").await.unwrap().unwrap();
        assert_eq!(entity.payload, json!({"text": "local"}));
        assert_eq!(entity.server_version, Some(3));
        assert_eq!(entity.updated_at, 20);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_new_local_entity_has_no_server_version() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlEntityRepository::new(db.connection());

        repo.put_local(EntityType::Journal, "j1", &json!({"title": "Trip"}), 5)
            .await
            .unwrap();

        let entity = repo.get(EntityType::Journal, "j1").await.unwrap().unwrap();
        assert_eq!(entity.server_version, None);
        assert_eq!(entity.last_updated, None);
        assert!(repo.synced_ids(EntityType::Journal).await.unwrap().is_empty());

        assert!(repo
            .set_server_version(EntityType::Journal, "j1", 1, Some(99))
            .await
            .unwrap());
        assert_eq!(
            repo.synced_ids(EntityType::Journal).await.unwrap(),
            vec!["j1".to_string()]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_list_is_scoped_and_ordered() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlEntityRepository::new(db.connection());

        repo.put_local(EntityType::Content, "a", &json!({}), 1).await.unwrap();
        repo.put_local(EntityType::Content, "b", &json!({}), 2).await.unwrap();
        repo.put_local(EntityType::Media, "m", &json!({}), 3).await.unwrap();

        let ids: Vec<String> = repo
            .list(EntityType::Content, 10, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|entity| entity.id)
            .collect();
        assert_eq!(ids, vec!["b".to_string(), "a".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_remove_reports_existence() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlEntityRepository::new(db.connection());

        repo.put_remote(&remote("n1", 1, "x"), 1).await.unwrap();
        assert!(repo.remove(EntityType::Content, "n1").await.unwrap());
        assert!(!repo.remove(EntityType::Content, "n1").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_journal_associations_filters_by_journal() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlEntityRepository::new(db.connection());

        for association in [
            Association::new("j1", "c1"),
            Association::new("j1", "c2"),
            Association::new("j2", "c1"),
        ] {
            repo.put_local(
                EntityType::Association,
                &association.entity_id(),
                &association.to_payload(),
                1,
            )
            .await
            .unwrap();
        }

        let members = repo.journal_associations("j1").await.unwrap();
        assert_eq!(
            members,
            vec![Association::new("j1", "c1"), Association::new("j1", "c2")]
        );
    }
}
