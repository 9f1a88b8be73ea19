use std::collections::BTreeMap;
use std::path::Path;

use keepsake_core::config::SyncSettings;
use keepsake_core::protocol::ServerStatusResponse;
use keepsake_core::sync::HttpRemoteClient;
use keepsake_core::{EntityType, LocalStore};
use serde::Serialize;

use crate::commands::common::{credentials_from_settings, format_sync_timestamp, open_store};
use crate::error::CliError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalStatus {
    pub db_path: String,
    pub pending: BTreeMap<EntityType, usize>,
    pub watermarks: BTreeMap<EntityType, i64>,
    pub open_conflicts: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerStatusResponse>,
}

pub async fn run_status(remote: bool, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let mut status = local_status(&store, db_path).await?;
    if remote {
        status.server = Some(fetch_server_status().await?);
    }

    if as_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        for line in format_status_lines(&status) {
            println!("{line}");
        }
    }
    Ok(())
}

pub async fn local_status(store: &LocalStore, db_path: &Path) -> Result<LocalStatus, CliError> {
    Ok(LocalStatus {
        db_path: db_path.display().to_string(),
        pending: store.pending_counts().by_type,
        watermarks: store.watermarks().await?,
        open_conflicts: store.open_conflict_count().await?,
        server: None,
    })
}

async fn fetch_server_status() -> Result<ServerStatusResponse, CliError> {
    let settings = SyncSettings::from_env()?;
    let credentials = credentials_from_settings(&settings.credentials)?;
    let client = HttpRemoteClient::new(settings.api_base_url, settings.http_timeout, credentials)?;
    Ok(client.fetch_status().await?)
}

pub fn format_status_lines(status: &LocalStatus) -> Vec<String> {
    let mut lines = vec![format!("Database: {}", status.db_path)];
    for entity_type in EntityType::ALL {
        let pending = status.pending.get(&entity_type).copied().unwrap_or(0);
        let watermark = status
            .watermarks
            .get(&entity_type)
            .map_or_else(|| "never".to_string(), |time| format_sync_timestamp(*time));
        lines.push(format!(
            "{:<12} pending={pending:<4} last sync={watermark}",
            entity_type.as_str()
        ));
    }
    lines.push(format!("Open conflicts: {}", status.open_conflicts));

    if let Some(server) = &status.server {
        lines.push(format!(
            "Server time: {}",
            format_sync_timestamp(server.server_timestamp)
        ));
        for entry in &server.entity_types {
            lines.push(format!(
                "  {:<12} live={} tombstones={}",
                entry.entity_type.as_str(),
                entry.live,
                entry.tombstones
            ));
        }
    }
    lines
}
