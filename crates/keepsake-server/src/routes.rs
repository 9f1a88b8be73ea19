use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use keepsake_core::models::EntityType;
use keepsake_core::protocol::{
    ChangesQuery, ChangesResponse, ServerStatusResponse, UpdateRequest, UpdateResponse,
    UploadRequest, UploadResponse,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{extract_bearer_token, AuthenticatedUser, JwtVerifier};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::feed;
use crate::rate_limit::{
    user_fingerprint, EndpointClass, EndpointRateLimiter, RateLimitMetricsSnapshot,
};
use crate::version_store::{StoreRegistry, VersionStore};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<StoreRegistry>,
    jwt_verifier: Arc<JwtVerifier>,
    endpoint_rate_limiter: Arc<EndpointRateLimiter>,
}

impl AppState {
    pub fn from_config(config: Arc<AppConfig>) -> Self {
        Self {
            jwt_verifier: Arc::new(JwtVerifier::new(&config)),
            endpoint_rate_limiter: Arc::new(EndpointRateLimiter::from_config(config.as_ref())),
            registry: Arc::new(StoreRegistry::new()),
            config,
        }
    }

    fn authorize(
        &self,
        class: EndpointClass,
        user: &AuthenticatedUser,
    ) -> Result<Arc<VersionStore>, AppError> {
        self.endpoint_rate_limiter.check(class, &user.user_id)?;
        Ok(self.registry.store_for(&user.user_id))
    }
}

pub fn app_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/status", get(sync_status))
        .route("/{entity_type}", post(upload))
        .route("/{entity_type}/changes", get(changes))
        .route("/{entity_type}/{id}", post(update))
        .route("/{entity_type}/{id}/delete", post(delete))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/sync", protected_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    accounts: usize,
    rate_limit: RateLimitMetricsSnapshot,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        accounts: state.registry.accounts(),
        rate_limit: state.endpoint_rate_limiter.metrics_snapshot(),
    })
}

async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_bearer_token(request.headers())?;
    let user = state.jwt_verifier.verify_access_token(token)?;
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

fn parse_entity_type(segment: &str) -> Result<EntityType, AppError> {
    segment
        .parse::<EntityType>()
        .map_err(AppError::not_found)
}

async fn sync_status(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<ServerStatusResponse>, AppError> {
    let store = state.authorize(EndpointClass::Feed, &user)?;
    Ok(Json(store.status()))
}

async fn upload(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(segment): Path<String>,
    Json(request): Json<UploadRequest>,
) -> Result<Json<UploadResponse>, AppError> {
    let entity_type = parse_entity_type(&segment)?;
    let store = state.authorize(EndpointClass::Mutation, &user)?;

    let (id, accepted) = store.upload(entity_type, request.id, request.payload, &request.device_id)?;
    tracing::info!(
        endpoint = "upload",
        user = user_fingerprint(&user.user_id),
        entity_type = %entity_type,
        entity_id = %id,
        server_version = accepted.server_version,
        "Accepted entity upload"
    );
    Ok(Json(UploadResponse {
        id,
        server_version: accepted.server_version,
        last_updated: accepted.last_updated,
    }))
}

async fn update(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path((segment, id)): Path<(String, String)>,
    Json(request): Json<UpdateRequest>,
) -> Result<Json<UpdateResponse>, AppError> {
    let entity_type = parse_entity_type(&segment)?;
    let store = state.authorize(EndpointClass::Mutation, &user)?;

    let constraint = request.version_constraint;
    let result = store.apply(
        entity_type,
        &id,
        request.payload,
        constraint,
        &request.device_id,
    );
    let accepted = match result {
        Ok(accepted) => accepted,
        Err(error) => {
            tracing::info!(
                endpoint = "update",
                user = user_fingerprint(&user.user_id),
                entity_type = %entity_type,
                entity_id = %id,
                ?constraint,
                %error,
                "Rejected entity update"
            );
            return Err(error.into());
        }
    };

    tracing::info!(
        endpoint = "update",
        user = user_fingerprint(&user.user_id),
        entity_type = %entity_type,
        entity_id = %id,
        server_version = accepted.server_version,
        "Accepted entity update"
    );
    Ok(Json(UpdateResponse {
        server_version: accepted.server_version,
        last_updated: accepted.last_updated,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteResponse {
    deleted_at: i64,
}

async fn delete(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path((segment, id)): Path<(String, String)>,
) -> Result<Json<DeleteResponse>, AppError> {
    let entity_type = parse_entity_type(&segment)?;
    let store = state.authorize(EndpointClass::Mutation, &user)?;

    let tombstone = store.delete(entity_type, &id)?;
    tracing::info!(
        endpoint = "delete",
        user = user_fingerprint(&user.user_id),
        entity_type = %entity_type,
        entity_id = %id,
        last_version = tombstone.last_version,
        "Deleted entity"
    );
    Ok(Json(DeleteResponse {
        deleted_at: tombstone.deleted_at,
    }))
}

async fn changes(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(segment): Path<String>,
    Query(query): Query<ChangesQuery>,
) -> Result<Json<ChangesResponse>, AppError> {
    let entity_type = parse_entity_type(&segment)?;
    if query.since < 0 {
        return Err(AppError::bad_request("`since` must be a non-negative epoch millisecond value"));
    }
    let store = state.authorize(EndpointClass::Feed, &user)?;

    let response = feed::changes_since(&store, entity_type, query.since);
    tracing::debug!(
        endpoint = "changes",
        user = user_fingerprint(&user.user_id),
        entity_type = %entity_type,
        since = query.since,
        changes = response.changes.len(),
        deletions = response.deletions.len(),
        resync_required = response.resync_required,
        "Served change feed"
    );
    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request, StatusCode};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn router() -> Router {
        let config = AppConfig::from_lookup(|key| match key {
            "KEEPSAKE_JWT_SECRET" => Some(SECRET.to_string()),
            "MUTATION_RATE_LIMIT_PER_WINDOW" => Some("5".to_string()),
            _ => None,
        })
        .unwrap();
        app_router(AppState::from_config(Arc::new(config)))
    }

    fn token(sub: &str) -> String {
        let now = Utc::now().timestamp();
        encode(
            &Header::default(),
            &json!({"sub": sub, "exp": now + 300, "iat": now}),
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    async fn call(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", token("user-1")));
        let body = match body {
            Some(body) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };
        let response = router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn healthz_is_public() {
        let response = router()
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn sync_routes_require_bearer_token() {
        let response = router()
            .oneshot(Request::get("/sync/content/changes").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn upload_update_and_conflict_flow() {
        let router = router();
        let (status, body) = call(
            &router,
            Method::POST,
            "/sync/content",
            Some(json!({"id": "n1", "deviceId": "a", "payload": {"text": "v1"}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["serverVersion"], 1);

        let update = |version: u64, text: &str| {
            json!({
                "payload": {"text": text},
                "versionConstraint": {"kind": "known", "serverVersion": version},
                "deviceId": "b",
            })
        };
        let (status, body) = call(&router, Method::POST, "/sync/content/n1", Some(update(1, "v2"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["serverVersion"], 2);

        let (status, body) = call(&router, Method::POST, "/sync/content/n1", Some(update(1, "stale"))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["reason"], "version_mismatch");
        assert_eq!(body["current"]["payload"]["text"], "v2");
    }

    #[tokio::test]
    async fn delete_then_feed_reports_tombstone() {
        let router = router();
        call(
            &router,
            Method::POST,
            "/sync/journal",
            Some(json!({"id": "j1", "deviceId": "a", "payload": {"title": "t"}})),
        )
        .await;

        let (status, _) = call(&router, Method::POST, "/sync/journal/j1/delete", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = call(&router, Method::POST, "/sync/journal/j1/delete", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());

        let (status, body) = call(&router, Method::GET, "/sync/journal/changes?since=0", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["changes"], json!([]));
        assert_eq!(body["deletions"][0]["id"], "j1");
        assert!(body["serverTimestamp"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn feed_segment_is_rejected_as_an_id() {
        let router = router();
        let (status, body) = call(
            &router,
            Method::POST,
            "/sync/content",
            Some(json!({"id": "changes", "deviceId": "a", "payload": {}})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("reserved"));
    }

    #[tokio::test]
    async fn encoded_ids_round_trip_through_the_path() {
        let router = router();
        call(
            &router,
            Method::POST,
            "/sync/association",
            Some(json!({"id": "j1:a?b/c", "deviceId": "a", "payload": {}})),
        )
        .await;

        let (status, _) = call(
            &router,
            Method::POST,
            "/sync/association/j1:a%3Fb%2Fc/delete",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = call(&router, Method::GET, "/sync/association/changes?since=0", None).await;
        assert_eq!(body["deletions"][0]["id"], "j1:a?b/c");
    }

    #[tokio::test]
    async fn unknown_entity_type_is_not_found() {
        let (status, _) = call(&router(), Method::GET, "/sync/notes/changes?since=0", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn update_of_unknown_id_is_not_found() {
        let body = json!({
            "payload": {},
            "versionConstraint": {"kind": "known", "serverVersion": 1},
            "deviceId": "a",
        });
        let (status, _) = call(&router(), Method::POST, "/sync/media/ghost", Some(body)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn status_counts_entities() {
        let router = router();
        call(
            &router,
            Method::POST,
            "/sync/media",
            Some(json!({"deviceId": "a", "payload": {"uri": "file://x"}})),
        )
        .await;
        let (status, body) = call(&router, Method::GET, "/sync/status", None).await;
        assert_eq!(status, StatusCode::OK);
        let media = body["entityTypes"]
            .as_array()
            .unwrap()
            .iter()
            .find(|entry| entry["entityType"] == "media")
            .unwrap();
        assert_eq!(media["live"], 1);
    }

    #[tokio::test]
    async fn mutations_are_rate_limited() {
        let router = router();
        for index in 0..5 {
            let (status, _) = call(
                &router,
                Method::POST,
                "/sync/content",
                Some(json!({"deviceId": "a", "payload": {"n": index}})),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, _) = call(
            &router,
            Method::POST,
            "/sync/content",
            Some(json!({"deviceId": "a", "payload": {}})),
        )
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    }
}
