use std::path::Path;

use keepsake_core::EntityType;

use crate::commands::common::{open_store, resolve_payload};
use crate::error::CliError;

pub async fn run_add(
    entity_type: EntityType,
    payload: Option<&str>,
    db_path: &Path,
) -> Result<(), CliError> {
    let payload = resolve_payload(payload)?;

    let store = open_store(db_path).await?;
    let entity = store.create_entity(entity_type, payload).await?;

    println!("{}", entity.id);
    Ok(())
}
