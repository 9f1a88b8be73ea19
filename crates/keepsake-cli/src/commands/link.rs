use std::path::Path;

use crate::commands::common::{normalize_entity_identifier, open_store};
use crate::error::CliError;

pub async fn run_link(journal: &str, content: &[String], db_path: &Path) -> Result<(), CliError> {
    let journal = normalize_entity_identifier(journal)?;

    let store = open_store(db_path).await?;
    let diff = store.set_journal_members(&journal, content).await?;

    for id in &diff.added {
        println!("+ {id}");
    }
    for id in &diff.removed {
        println!("- {id}");
    }
    if diff.added.is_empty() && diff.removed.is_empty() {
        println!("Journal {journal} already has that membership");
    }
    Ok(())
}
