use std::path::Path;

use keepsake_core::{EntityType, SyncResult};

use crate::commands::common::{format_sync_timestamp, open_engine};
use crate::error::CliError;

pub async fn run_sync(entity_type: Option<EntityType>, db_path: &Path) -> Result<(), CliError> {
    let engine = open_engine(db_path).await?;
    let result = match entity_type {
        Some(entity_type) => engine.sync_entity_type(entity_type).await,
        None => engine.full_sync().await,
    };

    for line in format_sync_result_lines(&result) {
        println!("{line}");
    }
    if result.errors.is_empty() {
        Ok(())
    } else {
        Err(CliError::SyncIncomplete(result.errors.len()))
    }
}

pub fn format_sync_result_lines(result: &SyncResult) -> Vec<String> {
    let mut lines = vec![format!(
        "Sync {}: uploaded {}, downloaded {}",
        if result.cancelled {
            "cancelled"
        } else if result.success {
            "completed"
        } else {
            "incomplete"
        },
        result.uploaded_items,
        result.downloaded_items
    )];
    if let Some(last_sync_time) = result.last_sync_time {
        lines.push(format!(
            "Watermark: {}",
            format_sync_timestamp(last_sync_time)
        ));
    }
    lines.extend(result.errors.iter().map(|error| format!("  {error}")));
    if result.has_conflicts() {
        lines.push("Run `keepsake conflicts` to review, then `keepsake resolve`.".to_string());
    }
    lines
}
