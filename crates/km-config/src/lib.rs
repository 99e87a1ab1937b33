//! Configuration discovery and resolution for the `km` CLI.

pub mod loader;
pub mod schema;

pub use loader::{CliOverrides, ConfigLoader};
pub use schema::{FilterSettings, MonitorConfig, Tier};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid api endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("api key is required (set --api-key or KM_API_KEY)")]
    MissingApiKey,

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to read config file: {0}")]
    Io(String),

    #[error("failed to parse config file: {0}")]
    Parse(String),
}
