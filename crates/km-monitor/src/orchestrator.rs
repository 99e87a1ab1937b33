//! Wires one `monitor` invocation together: configuration, auth, plugins,
//! the child process, the stream proxy, and the drain sequence.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use km_auth::{
    ApiTokenProvider, AuthedClient, EncryptedFileCache, MemoryTokenCache, RefreshConfig,
    RefreshManager, TokenCache, TokenSource,
};
use km_config::{FilterSettings, MonitorConfig};
use km_pipeline::{
    BatchUploader, FileBatchStore, FilterChain, FilterRules, FilterStatistics, HttpCollector,
    RiskConfig, RiskScorer, SessionAggregator, UploaderConfig, UPLOAD_CHANNEL_CAPACITY,
};
use km_plugin::{PluginHost, PluginReports};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::child::ChildProcess;
use crate::pipeline::EventPipeline;
use crate::proxy::StreamProxy;
use crate::{replay, MonitorError};

const CHILD_GRACE: Duration = Duration::from_secs(5);
const FINAL_FLUSH_BUDGET: Duration = Duration::from_secs(10);

pub const DEFAULT_SCOPE: &str = "default";

#[derive(Debug, Clone)]
pub struct MonitorOptions {
    /// The child command; everything after `--` on the CLI.
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Replay a capture file instead of spawning a child.
    pub replay: Option<PathBuf>,
}

#[derive(Debug)]
pub struct MonitoringResult {
    pub session_id: String,
    pub child_exit_code: Option<i32>,
    pub total_events: u64,
    pub batched_events: u64,
    pub uploaded_batches: u64,
    pub uploaded_events: u64,
    pub failed_batches: u64,
    pub filter_stats: FilterStatistics,
    pub plugin_reports: PluginReports,
}

pub struct MonitorOrchestrator {
    config: MonitorConfig,
}

impl MonitorOrchestrator {
    pub fn new(config: MonitorConfig) -> Self {
        Self { config }
    }

    /// Run one monitoring session to completion.
    ///
    /// `cancel` is the root context for the invocation; the CLI cancels it
    /// on SIGINT. The final flush runs under its own fresh budget regardless
    /// of the root token's state.
    pub async fn run(
        &self,
        options: MonitorOptions,
        cancel: CancellationToken,
    ) -> Result<MonitoringResult, MonitorError> {
        let endpoint = self.config.endpoint()?;
        let api_key = self
            .config
            .api_key
            .clone()
            .ok_or(km_config::ConfigError::MissingApiKey)?;

        // -- Auth ------------------------------------------------------------

        let cache: Arc<dyn TokenCache> = match EncryptedFileCache::open_default().await {
            Ok(cache) => Arc::new(cache),
            Err(error) => {
                tracing::warn!(target: "km::monitor", %error, "falling back to in-memory token cache");
                Arc::new(MemoryTokenCache::new())
            }
        };
        let provider = Arc::new(ApiTokenProvider::new(&endpoint, api_key));
        let refresh = Arc::new(RefreshManager::new(cache, provider, RefreshConfig::default()));
        Arc::clone(&refresh).start_background(vec![DEFAULT_SCOPE.to_string()]);

        let token = refresh.get_valid_token(DEFAULT_SCOPE).await?;

        // -- Plugins ---------------------------------------------------------

        let plugin_host = Arc::new(PluginHost::new(
            self.config.tier,
            HashSet::new(),
            Duration::from_secs(self.config.timeout_secs),
        ));
        let plugin_dir = self
            .config
            .plugin_dir
            .clone()
            .unwrap_or_else(|| kilometers_dir().join("plugins"));
        let plugins_started = plugin_host
            .start_installed(&plugin_dir, &token.access_token)
            .await;
        if plugins_started > 0 {
            tracing::info!(target: "km::monitor", count = plugins_started, "plugins running");
        }

        // -- Pipeline --------------------------------------------------------

        let scorer = RiskScorer::new(RiskConfig {
            payload_size_limit: self.config.filters.payload_size_limit,
        });
        let filter = Arc::new(FilterChain::new(
            filter_rules(&self.config.filters),
            scorer,
        ));
        let flush_interval = (self.config.flush_interval_secs > 0)
            .then(|| Duration::from_secs(self.config.flush_interval_secs));
        let aggregator = Arc::new(SessionAggregator::new(self.config.batch_size, flush_interval));
        let session_id = aggregator.session_id();

        let store = Arc::new(FileBatchStore::new(kilometers_dir().join("staging")));
        let collector = Arc::new(HttpCollector::new(
            AuthedClient::new(
                Arc::clone(&refresh) as Arc<dyn TokenSource>,
                DEFAULT_SCOPE,
            ),
            &endpoint,
        ));
        let uploader_cancel = CancellationToken::new();
        let uploader = Arc::new(BatchUploader::new(
            Arc::clone(&collector) as Arc<dyn km_pipeline::CollectorTransport>,
            Arc::clone(&store) as Arc<dyn km_pipeline::BatchStore>,
            UploaderConfig::default(),
            uploader_cancel.clone(),
        ));

        let (batch_tx, batch_rx) = mpsc::channel(UPLOAD_CHANNEL_CAPACITY);
        let uploader_task = {
            let uploader = Arc::clone(&uploader);
            tokio::spawn(async move { uploader.run(batch_rx).await })
        };

        let sink = Arc::new(EventPipeline::new(
            Arc::clone(&filter),
            Arc::clone(&aggregator),
            (plugins_started > 0).then(|| Arc::clone(&plugin_host)),
            batch_tx,
        ));

        // -- Run -------------------------------------------------------------

        let child_exit_code = if let Some(replay_path) = &options.replay {
            let replayed = replay::replay_file(replay_path, sink.clone()).await?;
            tracing::info!(target: "km::monitor", replayed, "replay complete");
            None
        } else {
            self.run_proxied(&options, sink.clone(), cancel.clone())
                .await?
        };

        // -- Drain -----------------------------------------------------------

        // Abort any retry sleep still in flight; the staged copies survive.
        if cancel.is_cancelled() {
            uploader_cancel.cancel();
        }

        // Close the channel so the uploader finishes the queued batches in
        // order, then flush the remainder under a fresh budget.
        drop(sink);
        if tokio::time::timeout(FINAL_FLUSH_BUDGET, uploader_task)
            .await
            .is_err()
        {
            tracing::warn!(target: "km::monitor", "uploader did not drain in time");
        }

        let final_batch = match aggregator.end() {
            Ok(batch) => batch,
            Err(error) => {
                tracing::debug!(target: "km::monitor", %error, "session already closed");
                None
            }
        };
        let final_uploader = BatchUploader::new(
            collector,
            store,
            UploaderConfig::default(),
            CancellationToken::new(),
        );
        if let Some(batch) = final_batch {
            match tokio::time::timeout(FINAL_FLUSH_BUDGET, final_uploader.process(batch)).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    tracing::warn!(target: "km::monitor", %error, "final batch upload failed");
                }
                Err(_) => {
                    tracing::warn!(target: "km::monitor", "final batch upload timed out");
                }
            }
        }

        // -- Reports and teardown -------------------------------------------

        let plugin_reports = if plugins_started > 0 {
            let reports = plugin_host.collect_reports().await;
            plugin_host.shutdown_all().await;
            reports
        } else {
            PluginReports::default()
        };

        refresh.stop().await;

        let snapshot = aggregator.snapshot();
        Ok(MonitoringResult {
            session_id,
            child_exit_code,
            total_events: snapshot.total_events,
            batched_events: snapshot.batched_events,
            uploaded_batches: uploader.uploaded_batches() + final_uploader.uploaded_batches(),
            uploaded_events: uploader.uploaded_events() + final_uploader.uploaded_events(),
            failed_batches: uploader.failed_batches() + final_uploader.failed_batches(),
            filter_stats: filter.stats(),
            plugin_reports,
        })
    }

    /// Spawn the child and pump its stdio until it exits or the run is
    /// cancelled. Returns the child's exit code when observed.
    async fn run_proxied(
        &self,
        options: &MonitorOptions,
        sink: Arc<EventPipeline>,
        cancel: CancellationToken,
    ) -> Result<Option<i32>, MonitorError> {
        let mut child = ChildProcess::spawn(&options.command, &options.args, &options.env)?;
        let child_stdin = child
            .take_stdin()
            .ok_or_else(|| MonitorError::Spawn("child stdin unavailable".into()))?;
        let child_stdout = child
            .take_stdout()
            .ok_or_else(|| MonitorError::Spawn("child stdout unavailable".into()))?;
        let child_stderr = child
            .take_stderr()
            .ok_or_else(|| MonitorError::Spawn("child stderr unavailable".into()))?;

        let proxy = Arc::new(StreamProxy::new(
            self.config.buffer_size,
            cancel.child_token(),
        ));

        let mut proxy_task = {
            let proxy = Arc::clone(&proxy);
            let sink: Arc<dyn crate::proxy::EventSink> = sink;
            tokio::spawn(async move {
                proxy
                    .run(
                        tokio::io::stdin(),
                        child_stdin,
                        child_stdout,
                        tokio::io::stdout(),
                        child_stderr,
                        tokio::io::stderr(),
                        sink,
                    )
                    .await
            })
        };

        let mut child_exit_code = None;
        let mut proxy_done = false;
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(target: "km::monitor", "shutdown requested");
            }
            status = child.wait() => {
                child_exit_code = status.ok().and_then(|s| s.code());
                tracing::info!(target: "km::monitor", code = ?child_exit_code, "child exited");
            }
            result = &mut proxy_task => {
                proxy_done = true;
                if let Ok(Err(error)) = result {
                    tracing::warn!(target: "km::monitor", %error, "proxy ended with error");
                }
            }
        }

        proxy.stop();
        let code = child.shutdown_with_grace(CHILD_GRACE).await;
        if child_exit_code.is_none() {
            child_exit_code = code;
        }

        if !proxy_done {
            // The pumps break once the cancel token fires and the child's
            // pipes close.
            if tokio::time::timeout(Duration::from_secs(2), &mut proxy_task)
                .await
                .is_err()
            {
                proxy_task.abort();
            }
        }

        Ok(child_exit_code)
    }
}

fn kilometers_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kilometers")
}

fn filter_rules(settings: &FilterSettings) -> FilterRules {
    FilterRules {
        method_whitelist: settings.method_whitelist.clone(),
        method_blacklist: settings.method_blacklist.clone(),
        exclude_ping_messages: settings.exclude_ping_messages,
        directions: settings.directions.clone(),
        payload_size_limit: settings.payload_size_limit,
        min_risk_level: settings.min_risk_level,
        high_risk_only: settings.high_risk_only,
        content_blacklist: settings.content_blacklist.clone(),
    }
}
