use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};

use chrono::Utc;
use keepsake_core::config::{CredentialSettings, SyncSettings};
use keepsake_core::models::SyncConflict;
use keepsake_core::sync::{
    CredentialProvider, CredentialResult, HttpRemoteClient, StaticCredentials,
    TokenExchangeCredentials,
};
use keepsake_core::util::compact_text;
use keepsake_core::{EntityType, LocalEntity, LocalStore, SyncEngine};
use serde::Serialize;
use serde_json::Value;

use crate::error::CliError;

pub type CliEngine = SyncEngine<HttpRemoteClient<CliCredentials>>;

/// Bearer credential chosen from the environment.
pub enum CliCredentials {
    Static(StaticCredentials),
    TokenExchange(TokenExchangeCredentials),
}

impl CredentialProvider for CliCredentials {
    async fn access_token(&self) -> CredentialResult<String> {
        match self {
            Self::Static(credentials) => credentials.access_token().await,
            Self::TokenExchange(credentials) => credentials.access_token().await,
        }
    }

    async fn refresh(&self) -> CredentialResult<String> {
        match self {
            Self::Static(credentials) => credentials.refresh().await,
            Self::TokenExchange(credentials) => credentials.refresh().await,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityListItem {
    pub id: String,
    pub entity_type: EntityType,
    pub preview: String,
    pub payload: Value,
    pub server_version: Option<u64>,
    pub updated_at: i64,
    pub relative_time: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConflictItem {
    pub id: i64,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub reason: String,
    pub local_version: Option<u64>,
    pub server_version: Option<u64>,
    pub server_deleted: bool,
    pub server_payload: Option<Value>,
    pub detected_at: i64,
    pub detected_at_iso: String,
}

pub async fn open_store(db_path: &Path) -> Result<LocalStore, CliError> {
    Ok(LocalStore::open_path(db_path).await?)
}

/// Build a sync engine over the store at `db_path` using environment settings.
pub async fn open_engine(db_path: &Path) -> Result<CliEngine, CliError> {
    let settings = SyncSettings::from_env()?;
    if !settings.enabled {
        return Err(CliError::SyncDisabled);
    }
    let credentials = credentials_from_settings(&settings.credentials)?;
    let device_id = match settings.device_id.clone() {
        Some(device_id) => device_id,
        None => load_or_create_device_id(&device_id_path(db_path))?,
    };

    let store = open_store(db_path).await?;
    let remote = HttpRemoteClient::new(
        settings.api_base_url.clone(),
        settings.http_timeout,
        credentials,
    )?;
    let engine = SyncEngine::new(store, remote, settings.engine_config(device_id)).await?;
    Ok(engine)
}

pub fn credentials_from_settings(
    settings: &CredentialSettings,
) -> Result<CliCredentials, CliError> {
    match settings {
        CredentialSettings::None => Err(CliError::CredentialsNotConfigured),
        CredentialSettings::Static { access_token } => Ok(CliCredentials::Static(
            StaticCredentials::new(access_token.clone())?,
        )),
        CredentialSettings::TokenExchange {
            endpoint,
            refresh_token,
        } => Ok(CliCredentials::TokenExchange(TokenExchangeCredentials::new(
            endpoint.clone(),
            refresh_token.clone(),
        )?)),
    }
}

/// Device id file kept next to the database.
pub fn device_id_path(db_path: &Path) -> PathBuf {
    db_path.with_extension("device-id")
}

/// Read the persisted device id, generating and saving a UUID v7 on first use.
pub fn load_or_create_device_id(path: &Path) -> Result<String, CliError> {
    match std::fs::read_to_string(path) {
        Ok(existing) => {
            let trimmed = existing.trim();
            if !trimmed.is_empty() {
                return Ok(trimmed.to_string());
            }
        }
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => return Err(error.into()),
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let device_id = uuid::Uuid::now_v7().to_string();
    std::fs::write(path, &device_id)?;
    tracing::info!(device_id, "Generated device id");
    Ok(device_id)
}

/// Parse the payload argument, falling back to piped stdin.
pub fn resolve_payload(raw: Option<&str>) -> Result<Value, CliError> {
    let text = match raw.and_then(normalize_payload_text) {
        Some(text) => text,
        None => read_piped_stdin()?.ok_or(CliError::EmptyPayload)?,
    };
    parse_payload(&text)
}

pub fn parse_payload(text: &str) -> Result<Value, CliError> {
    let value: Value =
        serde_json::from_str(text).map_err(|error| CliError::InvalidPayload(error.to_string()))?;
    if value.is_object() {
        Ok(value)
    } else {
        Err(CliError::InvalidPayload(format!(
            "expected an object, got {}",
            json_kind(&value)
        )))
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn normalize_payload_text(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn read_piped_stdin() -> Result<Option<String>, CliError> {
    if io::stdin().is_terminal() {
        return Ok(None);
    }

    let mut input = String::new();
    io::stdin().read_to_string(&mut input)?;
    Ok(normalize_payload_text(&input))
}

pub fn normalize_entity_identifier(id: &str) -> Result<String, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyEntityId)
    } else {
        Ok(trimmed.to_string())
    }
}

/// Find an entity by exact id, then by unique id prefix.
pub async fn resolve_entity(
    store: &LocalStore,
    entity_type: EntityType,
    query: &str,
) -> Result<LocalEntity, CliError> {
    const PAGE_SIZE: usize = 500;

    let query = normalize_entity_identifier(query)?;
    if let Some(entity) = store.get_entity(entity_type, &query).await? {
        return Ok(entity);
    }

    let mut matches = Vec::new();
    let mut offset = 0usize;
    loop {
        let batch = store.list_entities(entity_type, PAGE_SIZE, offset).await?;
        let count = batch.len();
        matches.extend(
            batch
                .into_iter()
                .filter(|entity| entity.id.starts_with(&query)),
        );
        if count < PAGE_SIZE || matches.len() > 1 {
            break;
        }
        offset += count;
    }

    match matches.len() {
        0 => Err(CliError::EntityNotFound(entity_type.to_string(), query)),
        1 => Ok(matches.remove(0)),
        _ => {
            let options = matches
                .iter()
                .take(3)
                .map(|entity| short_id(&entity.id))
                .collect::<Vec<_>>()
                .join(", ");
            Err(CliError::AmbiguousEntityId(format!(
                "ID prefix '{query}' is ambiguous; matches: {options}"
            )))
        }
    }
}

pub fn short_id(id: &str) -> String {
    id.chars().take(13).collect()
}

pub fn payload_preview(payload: &Value, max_chars: usize) -> String {
    let collapsed = compact_text(&payload.to_string());
    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let take_len = max_chars.saturating_sub(3);
        let mut truncated = collapsed.chars().take(take_len).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

pub fn format_entity_lines(entities: &[LocalEntity]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    entities
        .iter()
        .map(|entity| {
            let short_id = short_id(&entity.id);
            let preview = payload_preview(&entity.payload, 40);
            let relative_time = format_relative_time(entity.updated_at, now_ms);
            let version = entity
                .server_version
                .map_or_else(|| "local".to_string(), |version| format!("v{version}"));
            format!("{short_id:<13}  {preview:<40}  {relative_time:<10}  {version}")
        })
        .collect()
}

pub fn entity_to_list_item(entity: &LocalEntity) -> EntityListItem {
    let now_ms = Utc::now().timestamp_millis();
    EntityListItem {
        id: entity.id.clone(),
        entity_type: entity.entity_type,
        preview: payload_preview(&entity.payload, 80),
        payload: entity.payload.clone(),
        server_version: entity.server_version,
        updated_at: entity.updated_at,
        relative_time: format_relative_time(entity.updated_at, now_ms),
    }
}

pub fn sync_conflict_to_item(conflict: &SyncConflict) -> SyncConflictItem {
    SyncConflictItem {
        id: conflict.id,
        entity_type: conflict.entity_type,
        entity_id: conflict.entity_id.clone(),
        reason: conflict.reason.clone(),
        local_version: conflict.local_version,
        server_version: conflict.server_version,
        server_deleted: conflict.server_deleted,
        server_payload: conflict.server_payload.clone(),
        detected_at: conflict.detected_at,
        detected_at_iso: format_sync_timestamp(conflict.detected_at),
    }
}

pub fn format_sync_conflict_lines(conflicts: &[SyncConflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            let server = if conflict.server_deleted {
                "deleted".to_string()
            } else {
                conflict
                    .server_version
                    .map_or_else(|| "none".to_string(), |version| format!("v{version}"))
            };
            let local = conflict
                .local_version
                .map_or_else(|| "new".to_string(), |version| format!("v{version}"));
            format!(
                "{}  {:<16}  {}={}  local={} server={}",
                format_sync_timestamp(conflict.detected_at),
                conflict.reason,
                conflict.entity_type,
                conflict.entity_id,
                local,
                server
            )
        })
        .collect()
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else {
        format!("{}w ago", diff / week)
    }
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path.unwrap_or_else(default_db_path)
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("keepsake")
        .join("keepsake.db")
}
