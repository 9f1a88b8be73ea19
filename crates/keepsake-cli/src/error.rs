use std::io;

use keepsake_core::config::ConfigError;
use keepsake_core::sync::{CredentialError, RemoteError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] keepsake_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Credential error: {0}")]
    Credentials(#[from] CredentialError),
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("No payload provided; pass a JSON object or pipe one on stdin")]
    EmptyPayload,
    #[error("Payload must be a JSON object: {0}")]
    InvalidPayload(String),
    #[error("Entity ID cannot be empty")]
    EmptyEntityId,
    #[error("{0} not found for id/prefix: {1}")]
    EntityNotFound(String, String),
    #[error("{0}")]
    AmbiguousEntityId(String),
    #[error("No open conflict for {0} {1}")]
    ConflictNotFound(String, String),
    #[error("Sync is disabled (KEEPSAKE_SYNC_ENABLED=false)")]
    SyncDisabled,
    #[error(
        "Sync credentials are not configured. Set KEEPSAKE_ACCESS_TOKEN, or KEEPSAKE_TOKEN_ENDPOINT and KEEPSAKE_REFRESH_TOKEN."
    )]
    CredentialsNotConfigured,
    #[error("Sync finished with {0} error(s)")]
    SyncIncomplete(usize),
}
