use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

const MIN_JWT_SECRET_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub jwt_secret: String,
    pub jwt_issuer: Option<String>,
    pub auth_clock_skew: Duration,
    pub rate_limit_window: Duration,
    pub mutation_rate_limit_per_window: u32,
    pub feed_rate_limit_per_window: u32,
    /// `None` keeps tombstones forever.
    pub tombstone_retention: Option<Duration>,
    pub tombstone_purge_interval: Duration,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("jwt_secret", &"[REDACTED]")
            .field("jwt_issuer", &self.jwt_issuer)
            .field("auth_clock_skew", &self.auth_clock_skew)
            .field("rate_limit_window", &self.rate_limit_window)
            .field(
                "mutation_rate_limit_per_window",
                &self.mutation_rate_limit_per_window,
            )
            .field("feed_rate_limit_per_window", &self.feed_rate_limit_per_window)
            .field("tombstone_retention", &self.tombstone_retention)
            .field("tombstone_purge_interval", &self.tombstone_purge_interval)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "KEEPSAKE_BIND_ADDR", "127.0.0.1:8080");

        let jwt_secret = required_trimmed(&lookup, "KEEPSAKE_JWT_SECRET")?;
        if jwt_secret.len() < MIN_JWT_SECRET_LEN {
            return Err(ConfigError::Invalid(format!(
                "KEEPSAKE_JWT_SECRET must be at least {MIN_JWT_SECRET_LEN} bytes"
            )));
        }
        let jwt_issuer = optional_trimmed(&lookup, "KEEPSAKE_JWT_ISSUER");

        let auth_clock_skew_secs = ranged(&lookup, "AUTH_CLOCK_SKEW_SECS", 60, 0, 300)?;
        let rate_limit_window_secs = ranged(&lookup, "RATE_LIMIT_WINDOW_SECS", 60, 10, 3_600)?;
        let mutation_rate_limit_per_window =
            ranged(&lookup, "MUTATION_RATE_LIMIT_PER_WINDOW", 600, 1, 100_000)?;
        let feed_rate_limit_per_window =
            ranged(&lookup, "FEED_RATE_LIMIT_PER_WINDOW", 240, 1, 100_000)?;

        let tombstone_retention = match optional_trimmed(&lookup, "TOMBSTONE_RETENTION_SECS") {
            None => None,
            Some(_) => Some(Duration::from_secs(ranged(
                &lookup,
                "TOMBSTONE_RETENTION_SECS",
                0,
                3_600,
                u64::from(u32::MAX),
            )?)),
        };
        let tombstone_purge_interval_secs =
            ranged(&lookup, "TOMBSTONE_PURGE_INTERVAL_SECS", 3_600, 60, 86_400)?;

        Ok(Self {
            bind_addr,
            jwt_secret,
            jwt_issuer,
            auth_clock_skew: Duration::from_secs(auth_clock_skew_secs),
            rate_limit_window: Duration::from_secs(rate_limit_window_secs),
            mutation_rate_limit_per_window: u32::try_from(mutation_rate_limit_per_window)
                .unwrap_or(u32::MAX),
            feed_rate_limit_per_window: u32::try_from(feed_rate_limit_per_window)
                .unwrap_or(u32::MAX),
            tombstone_retention,
            tombstone_purge_interval: Duration::from_secs(tombstone_purge_interval_secs),
        })
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

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
