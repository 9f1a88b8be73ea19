use std::path::Path;

use keepsake_core::models::ConflictResolution;
use keepsake_core::{EntityType, LocalStore};

use crate::commands::common::{normalize_entity_identifier, open_store};
use crate::error::CliError;

pub async fn run_resolve(
    entity_type: EntityType,
    id: &str,
    resolution: ConflictResolution,
    db_path: &Path,
) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    resolve_conflict(&store, entity_type, id, resolution).await?;

    let next_step = match resolution {
        ConflictResolution::KeepLocal => "; run `keepsake sync` to upload the local version",
        ConflictResolution::TakeServer => "",
    };
    println!("Resolved {entity_type} {id}{next_step}");
    Ok(())
}

pub async fn resolve_conflict(
    store: &LocalStore,
    entity_type: EntityType,
    id: &str,
    resolution: ConflictResolution,
) -> Result<(), CliError> {
    let id = normalize_entity_identifier(id)?;
    let conflict = store
        .open_conflict(entity_type, &id)
        .await?
        .ok_or_else(|| CliError::ConflictNotFound(entity_type.to_string(), id.clone()))?;

    match resolution {
        ConflictResolution::KeepLocal => store.keep_local(&conflict).await?,
        ConflictResolution::TakeServer => store.take_server(&conflict).await?,
    }
    tracing::debug!(entity_type = %entity_type, entity_id = %id, ?resolution, "Resolved conflict");
    Ok(())
}
