use std::path::Path;

use keepsake_core::EntityType;

use crate::commands::common::{
    entity_to_list_item, format_entity_lines, open_store, EntityListItem,
};
use crate::error::CliError;

pub async fn run_list(
    entity_type: EntityType,
    limit: usize,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let entities = store.list_entities(entity_type, limit, 0).await?;

    if as_json {
        let json_items = entities
            .iter()
            .map(entity_to_list_item)
            .collect::<Vec<EntityListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
    } else if entities.is_empty() {
        println!("No {entity_type} entities.");
    } else {
        for line in format_entity_lines(&entities) {
            println!("{line}");
        }
    }

    Ok(())
}
