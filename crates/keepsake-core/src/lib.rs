//! keepsake-core - Core library for Keepsake
//!
//! This crate contains the shared models, wire protocol, local store, and
//! sync engine used by the Keepsake server and CLI.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod protocol;
pub mod services;
pub mod sync;
pub mod util;

pub use error::{Error, Result};
pub use models::{EntityType, LocalEntity, SyncResult, SyncStatus, VersionedEntity};
pub use services::LocalStore;
pub use sync::{EngineConfig, SyncEngine};
