use std::sync::Arc;

use keepsake_server::version_store::spawn_purge_task;
use keepsake_server::{app_router, AppConfig, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development; production uses platform-native env injection.
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("keepsake_server=info".parse().expect("valid directive")),
        )
        .init();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!("Starting keepsake-server with config: {:?}", config);

    let state = AppState::from_config(config);
    let _purge = state.config.tombstone_retention.map(|retention| {
        tracing::info!(
            retention_secs = retention.as_secs(),
            interval_secs = state.config.tombstone_purge_interval.as_secs(),
            "Tombstone purge enabled"
        );
        spawn_purge_task(
            Arc::clone(&state.registry),
            retention,
            state.config.tombstone_purge_interval,
        )
    });

    let bind_addr = state.config.bind_addr.clone();
    let router = app_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("keepsake-server listening on {}", bind_addr);
    axum::serve(listener, router).await?;
    Ok(())
}
