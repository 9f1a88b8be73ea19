//! Sync Metadata Store: per-entity-type watermarks

use std::collections::BTreeMap;

use libsql::Connection;

use super::parse_entity_type;
use crate::error::Result;
use crate::models::{EntityType, Timestamp};

/// Trait for watermark storage (async)
#[allow(async_fn_in_trait)]
pub trait MetadataRepository {
    /// Last successful download watermark; `None` means never synced.
    async fn last_sync_time(&self, entity_type: EntityType) -> Result<Option<Timestamp>>;

    /// Move the watermark forward. Older timestamps are ignored.
    ///
    /// Returns the stored value after the update.
    async fn update_last_sync_time(
        &self,
        entity_type: EntityType,
        timestamp: Timestamp,
    ) -> Result<Timestamp>;

    /// Watermarks for every entity type that has synced at least once.
    async fn all(&self) -> Result<BTreeMap<EntityType, Timestamp>>;
}

/// libSQL implementation of `MetadataRepository`
pub struct LibSqlMetadataRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlMetadataRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl MetadataRepository for LibSqlMetadataRepository<'_> {
    async fn last_sync_time(&self, entity_type: EntityType) -> Result<Option<Timestamp>> {
        let mut rows = self
            .conn
            .query(
                "SELECT last_sync_at FROM sync_metadata WHERE entity_type = ?",
                [entity_type.as_str()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row.get::<i64>(0)?)),
            None => Ok(None),
        }
    }

    async fn update_last_sync_time(
        &self,
        entity_type: EntityType,
        timestamp: Timestamp,
    ) -> Result<Timestamp> {
        let mut rows = self
            .conn
            .query(
                "INSERT INTO sync_metadata (entity_type, last_sync_at) VALUES (?, ?)
                 ON CONFLICT(entity_type) DO UPDATE SET
                    last_sync_at = MAX(sync_metadata.last_sync_at, excluded.last_sync_at)
                 RETURNING last_sync_at",
                libsql::params![entity_type.as_str(), timestamp],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(row.get::<i64>(0)?),
            None => Ok(timestamp),
        }
    }

    async fn all(&self) -> Result<BTreeMap<EntityType, Timestamp>> {
        let mut rows = self
            .conn
            .query("SELECT entity_type, last_sync_at FROM sync_metadata", ())
            .await?;

        let mut watermarks = BTreeMap::new();
        while let Some(row) = rows.next().await? {
            let entity_type = parse_entity_type(&row.get::<String>(0)?)?;
            watermarks.insert(entity_type, row.get::<i64>(1)?);
        }
        Ok(watermarks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_never_synced_is_none() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlMetadataRepository::new(db.connection());

        assert_eq!(repo.last_sync_time(EntityType::Content).await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_watermark_never_moves_backwards() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlMetadataRepository::new(db.connection());

        for timestamp in [500, 200, 900, 100] {
            repo.update_last_sync_time(EntityType::Journal, timestamp)
                .await
                .unwrap();
        }

        assert_eq!(
            repo.last_sync_time(EntityType::Journal).await.unwrap(),
            Some(900)
        );
        assert_eq!(
            repo.update_last_sync_time(EntityType::Journal, 10).await.unwrap(),
            900
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_watermarks_are_independent_per_type() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlMetadataRepository::new(db.connection());

        repo.update_last_sync_time(EntityType::Content, 10).await.unwrap();
        repo.update_last_sync_time(EntityType::Media, 20).await.unwrap();

        let all = repo.all().await.unwrap();
        assert_eq!(all.get(&EntityType::Content), Some(&10));
        assert_eq!(all.get(&EntityType::Media), Some(&20));
        assert_eq!(all.get(&EntityType::Journal), None);
    }
}
