//! Remote Sync Client: typed operations against the sync HTTP API.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{header, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use super::credentials::CredentialProvider;
use crate::models::{EntityType, SyncErrorKind, Timestamp};
use crate::protocol::{
    ChangesResponse, ConflictBody, ErrorBody, ServerStatusResponse, UpdateRequest,
    UpdateResponse, UploadRequest, UploadResponse,
};
use crate::util::{compact_text, is_http_url, normalize_text_option};

/// Typed failure of a remote call.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("conflict: {}", .0.reason.label())]
    Conflict(Box<ConflictBody>),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },
}

impl RemoteError {
    /// Position in the sync failure taxonomy.
    pub const fn kind(&self) -> SyncErrorKind {
        match self {
            Self::Network(_) => SyncErrorKind::Network,
            Self::Auth(_) => SyncErrorKind::Auth,
            Self::Conflict(_) => SyncErrorKind::Conflict,
            Self::NotFound(_) | Self::Validation(_) => SyncErrorKind::Validation,
            Self::Server { .. } => SyncErrorKind::Server,
        }
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// One method family per entity type, selected by `entity_type`.
pub trait RemoteSync: Send + Sync + 'static {
    /// `POST /sync/{entityType}`: first write of an entity (no version constraint).
    fn upload(
        &self,
        entity_type: EntityType,
        request: &UploadRequest,
    ) -> impl Future<Output = RemoteResult<UploadResponse>> + Send;

    /// `POST /sync/{entityType}/{id}`: constrained write.
    fn update(
        &self,
        entity_type: EntityType,
        id: &str,
        request: &UpdateRequest,
    ) -> impl Future<Output = RemoteResult<UpdateResponse>> + Send;

    /// `POST /sync/{entityType}/{id}/delete`
    fn delete(
        &self,
        entity_type: EntityType,
        id: &str,
    ) -> impl Future<Output = RemoteResult<()>> + Send;

    /// `GET /sync/{entityType}/changes?since=`
    fn fetch_changes(
        &self,
        entity_type: EntityType,
        since: Timestamp,
    ) -> impl Future<Output = RemoteResult<ChangesResponse>> + Send;
}

/// `RemoteSync` over HTTP with bearer auth and one refresh-and-retry on `401`.
pub struct HttpRemoteClient<C> {
    base_url: String,
    base: reqwest::Url,
    client: reqwest::Client,
    credentials: Arc<C>,
}

impl<C> std::fmt::Debug for HttpRemoteClient<C> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpRemoteClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl<C: CredentialProvider> HttpRemoteClient<C> {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        credentials: C,
    ) -> RemoteResult<Self> {
        let base_url = normalize_text_option(Some(base_url.into()))
            .filter(|url| is_http_url(url))
            .ok_or_else(|| {
                RemoteError::Validation("base URL must include http:// or https://".to_string())
            })?
            .trim_end_matches('/')
            .to_string();
        let base = reqwest::Url::parse(&base_url)
            .map_err(|error| RemoteError::Validation(format!("invalid base URL: {error}")))?;
        if base.cannot_be_a_base() {
            return Err(RemoteError::Validation(format!(
                "base URL cannot carry a path: {base_url}"
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| RemoteError::Network(error.to_string()))?;

        Ok(Self {
            base_url,
            base,
            client,
            credentials: Arc::new(credentials),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET /sync/status`: per-entity-type counts on the server.
    pub async fn fetch_status(&self) -> RemoteResult<ServerStatusResponse> {
        let url = self.endpoint(&["sync", "status"]);
        let response = self.send::<()>(Method::GET, url, None).await?;
        decode(response).await
    }

    /// URL under the base with every segment percent-encoded, so entity ids
    /// holding `/`, `?` or `#` stay inside their own segment.
    fn endpoint(&self, segments: &[&str]) -> reqwest::Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn send<B: Serialize + Sync>(
        &self,
        method: Method,
        url: reqwest::Url,
        body: Option<&B>,
    ) -> RemoteResult<reqwest::Response> {
        let path = url.path().to_string();
        let token = self
            .credentials
            .access_token()
            .await
            .map_err(|error| RemoteError::Auth(error.to_string()))?;
        let response = self.dispatch(method.clone(), &url, body, &token).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        tracing::debug!(%path, "Sync request unauthorized; refreshing credentials");
        let token = self
            .credentials
            .refresh()
            .await
            .map_err(|error| RemoteError::Auth(error.to_string()))?;
        let response = self.dispatch(method, &url, body, &token).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(RemoteError::Auth(error_message(response).await));
        }
        Ok(response)
    }

    async fn dispatch<B: Serialize + Sync>(
        &self,
        method: Method,
        url: &reqwest::Url,
        body: Option<&B>,
        token: &str,
    ) -> RemoteResult<reqwest::Response> {
        let mut request = self
            .client
            .request(method, url.clone())
            .bearer_auth(token)
            .header(header::ACCEPT, "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }
        request.send().await.map_err(transport_error)
    }
}

impl<C: CredentialProvider> RemoteSync for HttpRemoteClient<C> {
    async fn upload(
        &self,
        entity_type: EntityType,
        request: &UploadRequest,
    ) -> RemoteResult<UploadResponse> {
        let url = self.endpoint(&["sync", entity_type.as_str()]);
        let response = self.send(Method::POST, url, Some(request)).await?;
        decode(response).await
    }

    async fn update(
        &self,
        entity_type: EntityType,
        id: &str,
        request: &UpdateRequest,
    ) -> RemoteResult<UpdateResponse> {
        let url = self.endpoint(&["sync", entity_type.as_str(), id]);
        let response = self.send(Method::POST, url, Some(request)).await?;
        decode(response).await
    }

    async fn delete(&self, entity_type: EntityType, id: &str) -> RemoteResult<()> {
        let url = self.endpoint(&["sync", entity_type.as_str(), id, "delete"]);
        let response = self.send::<()>(Method::POST, url, None).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(error_from_response(response).await)
        }
    }

    async fn fetch_changes(
        &self,
        entity_type: EntityType,
        since: Timestamp,
    ) -> RemoteResult<ChangesResponse> {
        let mut url = self.endpoint(&["sync", entity_type.as_str(), "changes"]);
        url.query_pairs_mut().append_pair("since", &since.to_string());
        let response = self.send::<()>(Method::GET, url, None).await?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> RemoteResult<T> {
    let status = response.status();
    if !status.is_success() {
        return Err(error_from_response(response).await);
    }
    response.json::<T>().await.map_err(|error| RemoteError::Server {
        status: status.as_u16(),
        message: format!("invalid response body: {error}"),
    })
}

fn transport_error(error: reqwest::Error) -> RemoteError {
    if error.is_timeout() {
        RemoteError::Network("request timed out".to_string())
    } else if error.is_connect() {
        RemoteError::Network(format!("connection failed: {error}"))
    } else {
        RemoteError::Network(error.to_string())
    }
}

async fn error_message(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    message_from_body(status, &body)
}

fn message_from_body(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ErrorBody>(body) {
        return payload.error;
    }
    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        trimmed
    }
}

async fn error_from_response(response: reqwest::Response) -> RemoteError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    classify(status, &body)
}

/// Map a non-success status and body onto the sync failure taxonomy.
fn classify(status: StatusCode, body: &str) -> RemoteError {
    match status {
        StatusCode::CONFLICT => match serde_json::from_str::<ConflictBody>(body) {
            Ok(conflict) => RemoteError::Conflict(Box::new(conflict)),
            Err(error) => RemoteError::Server {
                status: status.as_u16(),
                message: format!("unreadable conflict body: {error}"),
            },
        },
        StatusCode::NOT_FOUND => RemoteError::NotFound(message_from_body(status, body)),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            RemoteError::Auth(message_from_body(status, body))
        }
        StatusCode::TOO_MANY_REQUESTS => RemoteError::Server {
            status: status.as_u16(),
            message: message_from_body(status, body),
        },
        status if status.is_client_error() => {
            RemoteError::Validation(message_from_body(status, body))
        }
        status => RemoteError::Server {
            status: status.as_u16(),
            message: message_from_body(status, body),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ConflictReason;
    use crate::sync::StaticCredentials;

    #[test]
    fn classify_conflict_parses_body() {
        let body = r#"{"reason":"version_mismatch","expected":1,"actual":2}"#;
        match classify(StatusCode::CONFLICT, body) {
            RemoteError::Conflict(conflict) => assert_eq!(
                conflict.reason,
                ConflictReason::VersionMismatch {
                    expected: 1,
                    actual: 2
                }
            ),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn classify_maps_statuses_to_taxonomy() {
        assert_eq!(
            classify(StatusCode::BAD_REQUEST, r#"{"error":"bad payload"}"#).kind(),
            SyncErrorKind::Validation
        );
        assert_eq!(
            classify(StatusCode::UNPROCESSABLE_ENTITY, "").kind(),
            SyncErrorKind::Validation
        );
        assert_eq!(
            classify(StatusCode::TOO_MANY_REQUESTS, "").kind(),
            SyncErrorKind::Server
        );
        assert_eq!(
            classify(StatusCode::BAD_GATEWAY, "").kind(),
            SyncErrorKind::Server
        );
        assert_eq!(
            classify(StatusCode::FORBIDDEN, "").kind(),
            SyncErrorKind::Auth
        );
        assert!(matches!(
            classify(StatusCode::NOT_FOUND, ""),
            RemoteError::NotFound(_)
        ));
    }

    #[test]
    fn error_body_message_is_extracted() {
        assert_eq!(
            message_from_body(StatusCode::BAD_REQUEST, r#"{"error":"payload too large"}"#),
            "payload too large"
        );
        assert_eq!(message_from_body(StatusCode::BAD_GATEWAY, "  "), "HTTP 502");
    }

    #[test]
    fn new_rejects_non_http_base_url() {
        let credentials = StaticCredentials::new("token").unwrap();
        assert!(HttpRemoteClient::new("ftp://sync", Duration::from_secs(1), credentials).is_err());

        let credentials = StaticCredentials::new("token").unwrap();
        let client =
            HttpRemoteClient::new("https://sync.example.com/", Duration::from_secs(1), credentials)
                .unwrap();
        assert_eq!(client.base_url(), "https://sync.example.com");
    }

    #[test]
    fn endpoint_encodes_each_segment() {
        let credentials = StaticCredentials::new("token").unwrap();
        let client =
            HttpRemoteClient::new("https://sync.example.com/api/", Duration::from_secs(1), credentials)
                .unwrap();

        let url = client.endpoint(&["sync", "association", "j1:a?b/c#d", "delete"]);
        assert_eq!(url.path(), "/api/sync/association/j1:a%3Fb%2Fc%23d/delete");
        assert_eq!(url.query(), None);
        assert_eq!(
            client.endpoint(&["sync", "status"]).as_str(),
            "https://sync.example.com/api/sync/status"
        );
    }

    #[tokio::test]
    async fn unreachable_server_is_a_network_error() {
        let credentials = StaticCredentials::new("token").unwrap();
        let client = HttpRemoteClient::new(
            "http://127.0.0.1:9",
            Duration::from_millis(500),
            credentials,
        )
        .unwrap();

        let error = client
            .fetch_changes(EntityType::Content, 0)
            .await
            .unwrap_err();
        assert_eq!(error.kind(), SyncErrorKind::Network);
    }
}
