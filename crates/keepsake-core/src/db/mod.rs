//! Database layer for Keepsake

mod conflict_repository;
mod connection;
mod entity_repository;
mod metadata_repository;
mod migrations;
mod queue_repository;

use libsql::{Connection, Row, Value};

use crate::error::{Error, Result};

pub use conflict_repository::{ConflictRepository, LibSqlConflictRepository};
pub use connection::Database;
pub use entity_repository::{EntityRepository, LibSqlEntityRepository};
pub use metadata_repository::{LibSqlMetadataRepository, MetadataRepository};
pub use queue_repository::{ChangeQueueRepository, LibSqlChangeQueueRepository};

/// Start a write transaction on `conn`.
pub(crate) async fn begin(conn: &Connection) -> Result<()> {
    conn.execute("BEGIN IMMEDIATE", ()).await?;
    Ok(())
}

/// Commit when `result` is `Ok`, roll back otherwise.
pub(crate) async fn finish<T>(conn: &Connection, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            if let Err(e) = conn.execute("COMMIT", ()).await {
                conn.execute("ROLLBACK", ()).await.ok();
                return Err(e.into());
            }
            Ok(value)
        }
        Err(e) => {
            conn.execute("ROLLBACK", ()).await.ok();
            Err(e)
        }
    }
}

pub(crate) fn optional_i64(row: &Row, idx: i32) -> Result<Option<i64>> {
    match row.get_value(idx)? {
        Value::Null => Ok(None),
        Value::Integer(value) => Ok(Some(value)),
        other => Err(Error::Database(format!(
            "expected integer in column {idx}, found {other:?}"
        ))),
    }
}

pub(crate) fn optional_text(row: &Row, idx: i32) -> Result<Option<String>> {
    match row.get_value(idx)? {
        Value::Null => Ok(None),
        Value::Text(value) => Ok(Some(value)),
        other => Err(Error::Database(format!(
            "expected text in column {idx}, found {other:?}"
        ))),
    }
}

pub(crate) fn optional_version(row: &Row, idx: i32) -> Result<Option<u64>> {
    optional_i64(row, idx)?.map(version_from_sql).transpose()
}

pub(crate) fn version_from_sql(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| Error::Database(format!("negative server version {value}")))
}

pub(crate) fn version_to_sql(version: u64) -> Result<i64> {
    i64::try_from(version)
        .map_err(|_| Error::InvalidInput(format!("server version {version} out of range")))
}

pub(crate) fn nullable_version(version: Option<u64>) -> Result<Value> {
    Ok(match version {
        Some(version) => Value::Integer(version_to_sql(version)?),
        None => Value::Null,
    })
}

pub(crate) fn nullable_integer(value: Option<i64>) -> Value {
    value.map_or(Value::Null, Value::Integer)
}

pub(crate) fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

pub(crate) fn parse_entity_type(raw: &str) -> Result<crate::models::EntityType> {
    raw.parse().map_err(Error::Database)
}
