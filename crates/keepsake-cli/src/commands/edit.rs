use std::path::Path;

use keepsake_core::EntityType;

use crate::commands::common::{open_store, resolve_entity, resolve_payload};
use crate::error::CliError;

pub async fn run_edit(
    entity_type: EntityType,
    id: &str,
    payload: Option<&str>,
    db_path: &Path,
) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let entity = resolve_entity(&store, entity_type, id).await?;
    let payload = resolve_payload(payload)?;

    if payload == entity.payload {
        println!("No changes");
        return Ok(());
    }

    let updated = store.update_entity(entity_type, &entity.id, payload).await?;
    println!("{}", updated.id);
    Ok(())
}
