//! The plugin host: starts signed plugin binaries, gates them by
//! subscription tier, authenticates them, and fans captured messages through
//! the filter/security/analytics chains.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use km_config::Tier;
use km_core::Event;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::descriptor::{self, PluginDescriptor};
use crate::protocol::{
    AuthenticateResult, Capability, FilterVerdict, HandshakeResult, PluginMessage, SecurityReport,
    SecurityVerdict,
};
use crate::subprocess::{PluginChannel, PluginSubprocess};
use crate::PluginError;

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// One live plugin: its RPC channel plus the identity and capabilities it
/// presented at handshake.
pub struct PluginHandle {
    pub info: HandshakeResult,
    pub descriptor: PluginDescriptor,
    channel: Arc<dyn PluginChannel>,
}

impl PluginHandle {
    pub fn name(&self) -> &str {
        &self.info.name
    }

    async fn authenticate(&self, token: &str) -> Result<(), PluginError> {
        let result = self
            .channel
            .call("authenticate", Some(serde_json::json!({ "token": token })))
            .await?;
        let parsed: AuthenticateResult = serde_json::from_value(result)
            .map_err(|e| PluginError::Protocol(format!("malformed authenticate result: {e}")))?;
        if !parsed.ok {
            return Err(PluginError::AuthFailed(
                parsed.reason.unwrap_or_else(|| "rejected".into()),
            ));
        }
        Ok(())
    }

    async fn filter_apply(
        &self,
        message: &PluginMessage,
    ) -> Result<Option<PluginMessage>, PluginError> {
        let result = self
            .channel
            .call(
                "filter.apply",
                Some(serde_json::json!({ "message": message })),
            )
            .await?;
        let verdict: FilterVerdict = serde_json::from_value(result)
            .map_err(|e| PluginError::Protocol(format!("malformed filter verdict: {e}")))?;
        Ok(verdict.message)
    }

    async fn security_analyze(
        &self,
        message: &PluginMessage,
    ) -> Result<SecurityVerdict, PluginError> {
        let result = self
            .channel
            .call(
                "security.analyze",
                Some(serde_json::json!({ "message": message })),
            )
            .await?;
        serde_json::from_value(result)
            .map_err(|e| PluginError::Protocol(format!("malformed security verdict: {e}")))
    }

    async fn analytics_record(&self, message: &PluginMessage) -> Result<(), PluginError> {
        self.channel
            .notify(
                "analytics.record",
                Some(serde_json::json!({ "message": message })),
            )
            .await
    }

    async fn report(&self) -> Result<Value, PluginError> {
        self.channel.call("report", None).await
    }

    async fn shutdown(&self) -> Result<(), PluginError> {
        self.channel.shutdown().await
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct PluginReports {
    pub security: Vec<(String, SecurityReport)>,
    pub analytics: Vec<(String, Value)>,
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

pub struct PluginHost {
    tier: Tier,
    enabled_features: HashSet<String>,
    rpc_timeout: Duration,
    /// Every registered plugin, plus per-capability chains. Chains hold
    /// clones of the same `Arc`s; snapshots are taken under the read lock
    /// and iterated lock-free.
    handles: RwLock<Vec<Arc<PluginHandle>>>,
    filters: RwLock<Vec<Arc<PluginHandle>>>,
    security: RwLock<Vec<Arc<PluginHandle>>>,
    analytics: RwLock<Vec<Arc<PluginHandle>>>,
}

impl PluginHost {
    pub fn new(tier: Tier, enabled_features: HashSet<String>, rpc_timeout: Duration) -> Self {
        Self {
            tier,
            enabled_features,
            rpc_timeout,
            handles: RwLock::new(Vec::new()),
            filters: RwLock::new(Vec::new()),
            security: RwLock::new(Vec::new()),
            analytics: RwLock::new(Vec::new()),
        }
    }

    pub async fn plugin_count(&self) -> usize {
        self.handles.read().await.len()
    }

    pub async fn plugin_names(&self) -> Vec<String> {
        self.handles
            .read()
            .await
            .iter()
            .map(|h| h.name().to_string())
            .collect()
    }

    /// Discover and start every installed plugin. Individual failures are
    /// logged and skipped; the monitor runs with whatever came up.
    pub async fn start_installed(&self, plugin_dir: &Path, token: &str) -> usize {
        let descriptors = match descriptor::discover(plugin_dir) {
            Ok(descriptors) => descriptors,
            Err(error) => {
                tracing::warn!(target: "km::monitor", %error, dir = %plugin_dir.display(), "plugin discovery failed");
                return 0;
            }
        };

        let mut started = 0;
        for descriptor in descriptors {
            match self.start_plugin(&descriptor, token).await {
                Ok(()) => started += 1,
                Err(error) => {
                    tracing::warn!(
                        target: "km::monitor",
                        plugin = %descriptor.name,
                        %error,
                        "excluding plugin"
                    );
                }
            }
        }
        started
    }

    /// Spawn, gate, authenticate and register one plugin.
    pub async fn start_plugin(
        &self,
        descriptor: &PluginDescriptor,
        token: &str,
    ) -> Result<(), PluginError> {
        let (subprocess, info) = PluginSubprocess::spawn(descriptor, self.rpc_timeout).await?;
        let channel: Arc<dyn PluginChannel> = Arc::new(subprocess);
        self.register(descriptor.clone(), info, channel, token).await
    }

    /// Register a pre-established channel (spawned subprocess or a test
    /// double) after tier gating and authentication.
    pub async fn register(
        &self,
        mut descriptor: PluginDescriptor,
        info: HandshakeResult,
        channel: Arc<dyn PluginChannel>,
        token: &str,
    ) -> Result<(), PluginError> {
        if info.required_tier > self.tier {
            let _ = channel.shutdown().await;
            return Err(PluginError::TierGated {
                plugin: info.name.clone(),
                required: info.required_tier,
                current: self.tier,
            });
        }
        if let Some(feature) = &info.feature {
            if !self.enabled_features.contains(feature) {
                let _ = channel.shutdown().await;
                return Err(PluginError::FeatureDisabled {
                    plugin: info.name.clone(),
                    feature: feature.clone(),
                });
            }
        }

        descriptor.version = Some(info.version.clone());
        let handle = Arc::new(PluginHandle {
            info,
            descriptor,
            channel,
        });

        if let Err(error) = handle.authenticate(token).await {
            let _ = handle.shutdown().await;
            return Err(error);
        }

        for capability in handle.info.capabilities.clone() {
            let chain = match capability {
                Capability::Filter => &self.filters,
                Capability::Security => &self.security,
                Capability::Analytics => &self.analytics,
            };
            chain.write().await.push(Arc::clone(&handle));
        }
        tracing::info!(
            target: "km::monitor",
            plugin = %handle.name(),
            version = %handle.info.version,
            capabilities = ?handle.info.capabilities,
            "plugin started"
        );
        self.handles.write().await.push(handle);
        Ok(())
    }

    // -- Event fan-out -------------------------------------------------------

    /// Run one captured event through the plugin chains.
    ///
    /// Returns the (possibly transformed) message, or `None` when a filter
    /// plugin rejected it. Security issues are logged, never blocking;
    /// analytics calls are fire-and-forget notifications.
    pub async fn process_event(&self, event: &Event) -> Option<PluginMessage> {
        let mut message = PluginMessage::from_event(event);

        let filters = self.filters.read().await.clone();
        for handle in &filters {
            match handle.filter_apply(&message).await {
                Ok(Some(transformed)) => message = transformed,
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(
                        target: "km::monitor",
                        plugin = %handle.name(),
                        event = %message.id,
                        %error,
                        "filter plugin rejected message"
                    );
                    return None;
                }
            }
        }

        let security = self.security.read().await.clone();
        for handle in &security {
            match handle.security_analyze(&message).await {
                Ok(verdict) => {
                    if !verdict.is_secure {
                        tracing::warn!(
                            target: "km::security",
                            plugin = %handle.name(),
                            event = %message.id,
                            risk = %verdict.risk_level,
                            issues = ?verdict.issues,
                            "security issues detected"
                        );
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        target: "km::security",
                        plugin = %handle.name(),
                        %error,
                        "security plugin failed"
                    );
                }
            }
        }

        let analytics = self.analytics.read().await.clone();
        for handle in &analytics {
            if let Err(error) = handle.analytics_record(&message).await {
                tracing::warn!(
                    target: "km::analytics",
                    plugin = %handle.name(),
                    %error,
                    "analytics plugin failed"
                );
            }
        }

        Some(message)
    }

    // -- Shutdown ------------------------------------------------------------

    /// Poll every security and analytics plugin for its end-of-run report.
    pub async fn collect_reports(&self) -> PluginReports {
        let mut reports = PluginReports::default();

        for handle in self.security.read().await.iter() {
            match handle.report().await {
                Ok(value) => match serde_json::from_value::<SecurityReport>(value) {
                    Ok(report) => reports.security.push((handle.name().to_string(), report)),
                    Err(error) => {
                        tracing::debug!(plugin = %handle.name(), %error, "unparsable security report");
                    }
                },
                Err(error) => {
                    tracing::debug!(plugin = %handle.name(), %error, "no security report");
                }
            }
        }

        for handle in self.analytics.read().await.iter() {
            match handle.report().await {
                Ok(value) => reports.analytics.push((handle.name().to_string(), value)),
                Err(error) => {
                    tracing::debug!(plugin = %handle.name(), %error, "no analytics report");
                }
            }
        }

        reports
    }

    /// Stop every plugin and clear the chains.
    pub async fn shutdown_all(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.handles.write().await);
        self.filters.write().await.clear();
        self.security.write().await.clear();
        self.analytics.write().await.clear();

        for handle in handles {
            if let Err(error) = handle.shutdown().await {
                tracing::debug!(plugin = %handle.name(), %error, "plugin shutdown failed");
            }
        }
    }
}
