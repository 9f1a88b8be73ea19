//! Client-side synchronization: remote client, credentials, and orchestrator.

mod backoff;
mod credentials;
mod engine;
mod remote;
mod single_flight;

pub use backoff::{RetryPolicy, TypeState};
pub use credentials::{
    AccessToken, CredentialError, CredentialProvider, CredentialResult, StaticCredentials,
    TokenExchangeCredentials,
};
pub use engine::{EngineConfig, PeriodicSync, SyncEngine, SyncScope};
pub use remote::{HttpRemoteClient, RemoteError, RemoteResult, RemoteSync};
pub use single_flight::SingleFlight;
