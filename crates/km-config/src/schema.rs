//! Resolved configuration schema for a monitor run.

use km_core::{Direction, RiskLevel};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_api_endpoint() -> String {
    "https://api.kilometers.ai".to_string()
}

fn default_buffer_size() -> usize {
    1024 * 1024
}

fn default_batch_size() -> usize {
    10
}

fn default_flush_interval_secs() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

/// Subscription tier, ordered: every tier includes the ones below it.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Free,
    Pro,
    Enterprise,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Free => write!(f, "free"),
            Tier::Pro => write!(f, "pro"),
            Tier::Enterprise => write!(f, "enterprise"),
        }
    }
}

/// Capture filter settings as they appear in the config file; the monitor
/// maps them onto the pipeline's rule set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterSettings {
    #[serde(default)]
    pub method_whitelist: Vec<String>,
    #[serde(default)]
    pub method_blacklist: Vec<String>,
    #[serde(default = "default_true")]
    pub exclude_ping_messages: bool,
    #[serde(default)]
    pub directions: Vec<Direction>,
    #[serde(default)]
    pub payload_size_limit: usize,
    #[serde(default)]
    pub min_risk_level: Option<RiskLevel>,
    #[serde(default)]
    pub high_risk_only: bool,
    #[serde(default)]
    pub content_blacklist: Vec<String>,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            method_whitelist: Vec::new(),
            method_blacklist: Vec::new(),
            exclude_ping_messages: true,
            directions: Vec::new(),
            payload_size_limit: 0,
            min_risk_level: None,
            high_risk_only: false,
            content_blacklist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Maximum wire line length accepted by the framer, in bytes.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Seconds between time-based flushes; 0 disables.
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub debug: bool,
    /// Per-call plugin RPC timeout, seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub filters: FilterSettings,
    /// Directory holding installed plugin binaries; defaults to
    /// `<config dir>/plugins`.
    #[serde(default)]
    pub plugin_dir: Option<PathBuf>,
    #[serde(default)]
    pub tier: Tier,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            api_endpoint: default_api_endpoint(),
            api_key: None,
            buffer_size: default_buffer_size(),
            batch_size: default_batch_size(),
            flush_interval_secs: default_flush_interval_secs(),
            log_level: default_log_level(),
            debug: false,
            timeout_secs: default_timeout_secs(),
            filters: FilterSettings::default(),
            plugin_dir: None,
            tier: Tier::Free,
        }
    }
}

impl MonitorConfig {
    /// Parse and validate the collector endpoint.
    pub fn endpoint(&self) -> Result<url::Url, crate::ConfigError> {
        let url = url::Url::parse(&self.api_endpoint)
            .map_err(|e| crate::ConfigError::InvalidEndpoint(format!("{}: {e}", self.api_endpoint)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(crate::ConfigError::InvalidEndpoint(format!(
                "{}: unsupported scheme",
                self.api_endpoint
            )));
        }
        Ok(url)
    }
}
