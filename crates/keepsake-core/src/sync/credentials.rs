//! Bearer credentials for the sync API.
//!
//! The session itself is issued elsewhere; this module only supplies a token
//! and asks for a fresh one after a `401`.

use std::future::Future;

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::util::{is_http_url, normalize_text_option, unix_timestamp_now};

/// Refresh this many seconds before the advertised expiry.
const EXPIRY_SKEW_SECS: i64 = 30;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Invalid credential configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Credential refresh is not available")]
    RefreshUnavailable,
    #[error("Token exchange HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Token exchange API error: {0}")]
    Api(String),
    #[error("Invalid token payload: {0}")]
    InvalidPayload(String),
}

pub type CredentialResult<T> = Result<T, CredentialError>;

/// Supplies the bearer token carried by every sync request.
pub trait CredentialProvider: Send + Sync + 'static {
    /// Current token, possibly cached.
    fn access_token(&self) -> impl Future<Output = CredentialResult<String>> + Send;

    /// Obtain a new token after the server rejected the current one.
    fn refresh(&self) -> impl Future<Output = CredentialResult<String>> + Send;
}

/// A fixed token that cannot be refreshed.
#[derive(Clone)]
pub struct StaticCredentials {
    token: String,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> CredentialResult<Self> {
        let token = normalize_text_option(Some(token.into())).ok_or_else(|| {
            CredentialError::InvalidConfiguration("access token must not be empty".to_string())
        })?;
        Ok(Self { token })
    }
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("StaticCredentials")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

impl CredentialProvider for StaticCredentials {
    async fn access_token(&self) -> CredentialResult<String> {
        Ok(self.token.clone())
    }

    async fn refresh(&self) -> CredentialResult<String> {
        Err(CredentialError::RefreshUnavailable)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: i64,
}

impl AccessToken {
    fn is_fresh(&self, now: i64) -> bool {
        self.expires_at.saturating_sub(EXPIRY_SKEW_SECS) > now
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("AccessToken")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Exchanges a long-lived refresh token for short-lived access tokens.
pub struct TokenExchangeCredentials {
    endpoint: String,
    refresh_token: String,
    client: reqwest::Client,
    cached: Mutex<Option<AccessToken>>,
}

impl std::fmt::Debug for TokenExchangeCredentials {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("TokenExchangeCredentials")
            .field("endpoint", &self.endpoint)
            .field("refresh_token", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl TokenExchangeCredentials {
    pub fn new(
        endpoint: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> CredentialResult<Self> {
        let endpoint = normalize_endpoint(endpoint.into())?;
        let refresh_token = normalize_text_option(Some(refresh_token.into())).ok_or_else(|| {
            CredentialError::InvalidConfiguration("refresh token must not be empty".to_string())
        })?;
        Ok(Self {
            endpoint,
            refresh_token,
            client: reqwest::Client::builder().build()?,
            cached: Mutex::new(None),
        })
    }

    async fn exchange(&self) -> CredentialResult<AccessToken> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.refresh_token)
            .header("Accept", "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialError::Api(parse_api_error(status, &body)));
        }

        let payload = response.json::<TokenResponse>().await?;
        let token: AccessToken = payload.try_into()?;
        tracing::debug!(expires_at = token.expires_at, "Exchanged sync access token");
        Ok(token)
    }
}

impl CredentialProvider for TokenExchangeCredentials {
    async fn access_token(&self) -> CredentialResult<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.is_fresh(unix_timestamp_now()) {
                return Ok(token.token.clone());
            }
        }

        let token = self.exchange().await?;
        let value = token.token.clone();
        *cached = Some(token);
        Ok(value)
    }

    async fn refresh(&self) -> CredentialResult<String> {
        let mut cached = self.cached.lock().await;
        let token = self.exchange().await?;
        let value = token.token.clone();
        *cached = Some(token);
        Ok(value)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    token: Option<String>,
    expires_at: Option<i64>,
    expires_in: Option<i64>,
}

impl TryFrom<TokenResponse> for AccessToken {
    type Error = CredentialError;

    fn try_from(value: TokenResponse) -> CredentialResult<Self> {
        let token = value
            .access_token
            .or(value.token)
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                CredentialError::InvalidPayload(
                    "response did not include access_token/token".to_string(),
                )
            })?;

        let expires_at = value
            .expires_at
            .or_else(|| {
                value
                    .expires_in
                    .map(|expires_in| unix_timestamp_now().saturating_add(expires_in))
            })
            .ok_or_else(|| {
                CredentialError::InvalidPayload(
                    "response did not include expires_at/expires_in".to_string(),
                )
            })?;

        Ok(Self { token, expires_at })
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

fn normalize_endpoint(raw: String) -> CredentialResult<String> {
    let endpoint = normalize_text_option(Some(raw)).ok_or_else(|| {
        CredentialError::InvalidConfiguration("endpoint must not be empty".to_string())
    })?;
    if is_http_url(&endpoint) {
        Ok(endpoint.trim_end_matches('/').to_string())
    } else {
        Err(CredentialError::InvalidConfiguration(
            "endpoint must include http:// or https://".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_endpoint_rejects_invalid_values() {
        assert!(normalize_endpoint(String::new()).is_err());
        assert!(normalize_endpoint("auth.example.com".to_string()).is_err());
        assert_eq!(
            normalize_endpoint(" https://auth.example.com/token/ ".to_string()).unwrap(),
            "https://auth.example.com/token"
        );
    }

    #[test]
    fn access_token_debug_redacts_token() {
        let token = AccessToken {
            token: "secret".to_string(),
            expires_at: 123,
        };
        let debug = format!("{token:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn token_response_accepts_either_field_name() {
        let parsed: AccessToken = TokenResponse {
            access_token: None,
            token: Some(" abc ".to_string()),
            expires_at: Some(500),
            expires_in: None,
        }
        .try_into()
        .unwrap();
        assert_eq!(parsed.token, "abc");
        assert_eq!(parsed.expires_at, 500);

        let missing_expiry: CredentialResult<AccessToken> = TokenResponse {
            access_token: Some("abc".to_string()),
            token: None,
            expires_at: None,
            expires_in: None,
        }
        .try_into();
        assert!(matches!(
            missing_expiry,
            Err(CredentialError::InvalidPayload(_))
        ));
    }

    #[test]
    fn token_freshness_honours_skew() {
        let token = AccessToken {
            token: "t".to_string(),
            expires_at: 1_000,
        };
        assert!(token.is_fresh(900));
        assert!(!token.is_fresh(975));
    }

    #[tokio::test]
    async fn static_credentials_cannot_refresh() {
        let credentials = StaticCredentials::new("token").unwrap();
        assert_eq!(credentials.access_token().await.unwrap(), "token");
        assert!(matches!(
            credentials.refresh().await,
            Err(CredentialError::RefreshUnavailable)
        ));
        assert!(StaticCredentials::new("  ").is_err());
        assert!(!format!("{credentials:?}").contains("\"token\""));
    }

    #[test]
    fn api_error_prefers_message_field() {
        assert_eq!(
            parse_api_error(StatusCode::UNAUTHORIZED, r#"{"message":"expired"}"#),
            "expired (401)"
        );
        assert_eq!(parse_api_error(StatusCode::BAD_GATEWAY, ""), "HTTP 502");
    }
}
