//! Authentication: token model, acquisition, per-scope caching (in-memory
//! and encrypted on disk), refresh-ahead renewal with single-flight
//! coalescing, and a signing HTTP client.

pub mod cache;
pub mod client;
pub mod provider;
pub mod refresh;
pub mod token;

pub use cache::{EncryptedFileCache, MemoryTokenCache, TokenCache, AUTH_CACHE_FILE};
pub use client::AuthedClient;
pub use provider::{ApiTokenProvider, TokenProvider};
pub use refresh::{RefreshConfig, RefreshManager, TokenSource};
pub use token::AuthToken;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("network error: {0}")]
    Network(String),

    #[error("token endpoint returned {status}: {body}")]
    TokenEndpoint { status: u16, body: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("token cache error: {0}")]
    Cache(String),

    #[error("could not obtain a valid token for scope {0:?}")]
    RefreshFailed(String),

    #[error("cancelled")]
    Cancelled,
}
