//! keepsake-server - authoritative version store and change feed for Keepsake sync.

pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod feed;
pub mod rate_limit;
pub mod routes;
pub mod version_store;

pub use config::AppConfig;
pub use routes::{app_router, AppState};
pub use version_store::{StoreRegistry, VersionStore};
