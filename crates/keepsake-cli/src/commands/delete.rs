use std::path::Path;

use keepsake_core::EntityType;

use crate::commands::common::{open_store, resolve_entity};
use crate::error::CliError;

pub async fn run_delete(entity_type: EntityType, id: &str, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let entity = resolve_entity(&store, entity_type, id).await?;

    store.delete_entity(entity_type, &entity.id).await?;
    println!("Deleted {entity_type} {}", entity.id);
    Ok(())
}
