//! Out-of-process analysis plugins: discovery, a handshake-authenticated
//! subprocess RPC channel, tier gating, and the per-event fan-out chains.

pub mod descriptor;
pub mod host;
pub mod protocol;
pub mod subprocess;

pub use descriptor::{discover, PluginDescriptor, PluginSource};
pub use host::{PluginHandle, PluginHost, PluginReports};
pub use protocol::{
    Capability, HandshakeResult, PluginMessage, SecurityReport, SecurityVerdict, PROTOCOL_MAGIC,
};
pub use subprocess::{PluginChannel, PluginSubprocess};

use km_config::Tier;

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("plugin I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("plugin JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("plugin RPC error ({code}): {message}")]
    Rpc { code: i64, message: String },

    #[error("plugin handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("plugin authentication failed: {0}")]
    AuthFailed(String),

    #[error("plugin {plugin} requires tier {required}, current tier is {current}")]
    TierGated {
        plugin: String,
        required: Tier,
        current: Tier,
    },

    #[error("plugin {plugin} requires disabled feature {feature:?}")]
    FeatureDisabled { plugin: String, feature: String },

    #[error("plugin subprocess not running")]
    NotRunning,

    #[error("plugin response timeout")]
    Timeout,

    #[error("plugin protocol error: {0}")]
    Protocol(String),
}
