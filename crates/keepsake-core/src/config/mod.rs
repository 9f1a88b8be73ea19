//! Client sync configuration loaded from environment variables.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::sync::{EngineConfig, RetryPolicy};
use crate::util::{is_http_url, normalize_text_option};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Where the bearer credential comes from.
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialSettings {
    /// No credential configured; sync requests will be rejected.
    None,
    /// `KEEPSAKE_ACCESS_TOKEN`
    Static { access_token: String },
    /// `KEEPSAKE_TOKEN_ENDPOINT` + `KEEPSAKE_REFRESH_TOKEN`
    TokenExchange {
        endpoint: String,
        refresh_token: String,
    },
}

impl fmt::Debug for CredentialSettings {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => formatter.write_str("None"),
            Self::Static { .. } => formatter
                .debug_struct("Static")
                .field("access_token", &"[REDACTED]")
                .finish(),
            Self::TokenExchange { endpoint, .. } => formatter
                .debug_struct("TokenExchange")
                .field("endpoint", endpoint)
                .field("refresh_token", &"[REDACTED]")
                .finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub api_base_url: String,
    pub device_id: Option<String>,
    pub enabled: bool,
    pub http_timeout: Duration,
    pub retry: RetryPolicy,
    pub upload_concurrency: usize,
    pub sync_interval: Duration,
    pub schedule_delay: Duration,
    pub credentials: CredentialSettings,
}

impl SyncSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_base_url = required_trimmed(&lookup, "KEEPSAKE_API_BASE_URL")?;
        if !is_http_url(&api_base_url) {
            return Err(ConfigError::Invalid(
                "KEEPSAKE_API_BASE_URL must start with http:// or https://".to_string(),
            ));
        }
        let api_base_url = api_base_url.trim_end_matches('/').to_string();

        let device_id = optional_trimmed(&lookup, "KEEPSAKE_DEVICE_ID");

        let enabled = match optional_trimmed(&lookup, "KEEPSAKE_SYNC_ENABLED") {
            None => true,
            Some(value) => parse_bool(&value).ok_or_else(|| {
                ConfigError::Invalid("KEEPSAKE_SYNC_ENABLED must be true or false".to_string())
            })?,
        };

        let http_timeout_secs = ranged(&lookup, "KEEPSAKE_HTTP_TIMEOUT_SECS", 15, 1, 120)?;
        let retry_base_secs = ranged(&lookup, "KEEPSAKE_RETRY_BASE_SECS", 5, 1, 3_600)?;
        let retry_max_secs = ranged(
            &lookup,
            "KEEPSAKE_RETRY_MAX_SECS",
            300.max(retry_base_secs),
            retry_base_secs,
            86_400,
        )?;
        let upload_concurrency = ranged(&lookup, "KEEPSAKE_UPLOAD_CONCURRENCY", 4, 1, 32)?;
        let sync_interval_secs = ranged(&lookup, "KEEPSAKE_SYNC_INTERVAL_SECS", 60, 10, 86_400)?;
        let schedule_delay_ms = ranged(&lookup, "KEEPSAKE_SCHEDULE_DELAY_MS", 500, 0, 60_000)?;

        let credentials = parse_credentials(&lookup)?;

        Ok(Self {
            api_base_url,
            device_id,
            enabled,
            http_timeout: Duration::from_secs(http_timeout_secs),
            retry: RetryPolicy {
                base: Duration::from_secs(retry_base_secs),
                max: Duration::from_secs(retry_max_secs),
            },
            upload_concurrency: usize::try_from(upload_concurrency).unwrap_or(1),
            sync_interval: Duration::from_secs(sync_interval_secs),
            schedule_delay: Duration::from_millis(schedule_delay_ms),
            credentials,
        })
    }

    /// Engine configuration for this device.
    pub fn engine_config(&self, device_id: impl Into<String>) -> EngineConfig {
        EngineConfig {
            device_id: device_id.into(),
            enabled: self.enabled,
            upload_concurrency: self.upload_concurrency,
            retry: self.retry,
            sync_interval: self.sync_interval,
            schedule_delay: self.schedule_delay,
        }
    }
}

fn parse_credentials(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<CredentialSettings, ConfigError> {
    let endpoint = optional_trimmed(&lookup, "KEEPSAKE_TOKEN_ENDPOINT");
    let refresh_token = optional_trimmed(&lookup, "KEEPSAKE_REFRESH_TOKEN");

    match (endpoint, refresh_token) {
        (Some(endpoint), Some(refresh_token)) => {
            if !is_http_url(&endpoint) {
                return Err(ConfigError::Invalid(
                    "KEEPSAKE_TOKEN_ENDPOINT must start with http:// or https://".to_string(),
                ));
            }
            Ok(CredentialSettings::TokenExchange {
                endpoint,
                refresh_token,
            })
        }
        (Some(_), None) => Err(ConfigError::MissingVar("KEEPSAKE_REFRESH_TOKEN")),
        (None, Some(_)) => Err(ConfigError::MissingVar("KEEPSAKE_TOKEN_ENDPOINT")),
        (None, None) => Ok(optional_trimmed(&lookup, "KEEPSAKE_ACCESS_TOKEN").map_or(
            CredentialSettings::None,
            |access_token| CredentialSettings::Static { access_token },
        )),
    }
}

fn ranged(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
    min: u64,
    max: u64,
) -> Result<u64, ConfigError> {
    let Some(raw) = optional_trimmed(lookup, name) else {
        return Ok(default);
    };
    let value = raw.parse::<u64>().map_err(|_| {
        ConfigError::Invalid(format!("{name} must be an integer in [{min}, {max}]"))
    })?;
    if !(min..=max).contains(&value) {
        return Err(ConfigError::Invalid(format!(
            "{name} must be in [{min}, {max}]"
        )));
    }
    Ok(value)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    normalize_text_option(lookup(name))
}
