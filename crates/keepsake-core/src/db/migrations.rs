//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        migrate_v1(conn).await?;
    }
    if version < 2 {
        migrate_v2(conn).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Run migration statements in one transaction, rolling back on the first failure.
async fn apply(conn: &Connection, version: i32, statements: &[&str]) -> Result<()> {
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn
        .execute(
            "INSERT INTO schema_version (version) VALUES (?)",
            [i64::from(version)],
        )
        .await
    {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!("Migrated database to version {version}");
    Ok(())
}

/// Migration to version 1: entities, change queue, and watermarks
async fn migrate_v1(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        "CREATE TABLE IF NOT EXISTS local_entities (
            entity_type TEXT NOT NULL,
            id TEXT NOT NULL,
            payload TEXT NOT NULL,
            server_version INTEGER,
            last_updated INTEGER,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (entity_type, id)
        )",
        "CREATE INDEX IF NOT EXISTS idx_local_entities_updated
            ON local_entities(entity_type, updated_at DESC)",
        // At most one pending operation per (entity_type, entity_id)
        "CREATE TABLE IF NOT EXISTS pending_operations (
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            revision INTEGER NOT NULL,
            base_version INTEGER,
            enqueued_at INTEGER NOT NULL,
            PRIMARY KEY (entity_type, entity_id)
        )",
        "CREATE TABLE IF NOT EXISTS queue_sequence (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            value INTEGER NOT NULL
        )",
        "INSERT OR IGNORE INTO queue_sequence (id, value) VALUES (1, 0)",
        "CREATE TABLE IF NOT EXISTS sync_metadata (
            entity_type TEXT PRIMARY KEY,
            last_sync_at INTEGER NOT NULL
        )",
    ];

    apply(conn, 1, &statements).await
}

/// Migration to version 2: conflict side channel
async fn migrate_v2(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS sync_conflicts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            local_version INTEGER,
            server_version INTEGER,
            server_payload TEXT,
            server_deleted INTEGER NOT NULL DEFAULT 0,
            reason TEXT NOT NULL,
            detected_at INTEGER NOT NULL,
            resolved_at INTEGER
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_entity
            ON sync_conflicts(entity_type, entity_id)",
        "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_detected_at
            ON sync_conflicts(detected_at DESC)",
    ];

    apply(conn, CURRENT_VERSION, &statements).await
}
