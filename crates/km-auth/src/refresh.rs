//! Token refresh manager: refresh-ahead renewal, per-scope single-flight
//! coalescing, retry with cancellation, and a background renewal loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::TokenCache;
use crate::provider::TokenProvider;
use crate::token::AuthToken;
use crate::AuthError;

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Lead time before expiry at which a token is proactively renewed.
    pub refresh_ahead: Duration,
    pub max_retries: u32,
    pub retry_interval: Duration,
    /// Background loop tick.
    pub check_interval: Duration,
    /// Hard timeout for one background refresh.
    pub refresh_timeout: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            refresh_ahead: Duration::from_secs(5 * 60),
            max_retries: 3,
            retry_interval: Duration::from_secs(30),
            check_interval: Duration::from_secs(60),
            refresh_timeout: Duration::from_secs(30),
        }
    }
}

/// Read-side interface handed to HTTP consumers (uploader, plugin host).
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn get_valid_token(&self, scope: &str) -> Result<AuthToken, AuthError>;
    async fn force_refresh(&self, scope: &str) -> Result<AuthToken, AuthError>;
}

enum Role {
    Leader(watch::Sender<bool>),
    Waiter(watch::Receiver<bool>),
}

pub struct RefreshManager {
    cache: Arc<dyn TokenCache>,
    provider: Arc<dyn TokenProvider>,
    config: RefreshConfig,
    /// scope -> rendezvous of the in-flight refresh. First arrival registers
    /// the entry and does the work; everyone else waits on the channel and
    /// reads the cache afterwards.
    inflight: Mutex<HashMap<String, watch::Receiver<bool>>>,
    cancel: CancellationToken,
    background: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RefreshManager {
    pub fn new(
        cache: Arc<dyn TokenCache>,
        provider: Arc<dyn TokenProvider>,
        config: RefreshConfig,
    ) -> Self {
        Self {
            cache,
            provider,
            config,
            inflight: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            background: std::sync::Mutex::new(None),
        }
    }

    pub fn cache(&self) -> Arc<dyn TokenCache> {
        Arc::clone(&self.cache)
    }

    /// Return a usable token for `scope`, refreshing when the cached one is
    /// missing, expired, or inside the refresh-ahead window.
    pub async fn get_valid_token(&self, scope: &str) -> Result<AuthToken, AuthError> {
        if let Some(token) = self.cache.get(scope).await {
            if !token.is_expired() && !token.should_refresh(self.config.refresh_ahead) {
                return Ok(token);
            }
        }
        self.refresh_single_flight(scope).await
    }

    /// Unconditionally obtain a new token, bypassing cache validity. Used on
    /// a 401 from the collector.
    pub async fn force_refresh(&self, scope: &str) -> Result<AuthToken, AuthError> {
        self.refresh_single_flight(scope).await
    }

    async fn refresh_single_flight(&self, scope: &str) -> Result<AuthToken, AuthError> {
        let role = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(scope) {
                Some(rx) => Role::Waiter(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(false);
                    inflight.insert(scope.to_string(), rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Waiter(mut rx) => {
                // A close (leader dropped the sender) counts as completion.
                let _ = rx.wait_for(|done| *done).await;
                match self.cache.get(scope).await {
                    Some(token) if !token.is_expired() => Ok(token),
                    _ => Err(AuthError::RefreshFailed(scope.to_string())),
                }
            }
            Role::Leader(tx) => {
                let result = self.do_refresh(scope).await;
                self.inflight.lock().await.remove(scope);
                let _ = tx.send(true);
                result
            }
        }
    }

    /// Try the refresh grant when a refresh token is cached, fall back to a
    /// fresh api-key grant.
    async fn do_refresh(&self, scope: &str) -> Result<AuthToken, AuthError> {
        let cached = self.cache.get(scope).await;
        let refresh_token = cached.as_ref().and_then(|t| t.refresh_token.clone());

        let mut token = match refresh_token {
            Some(refresh) => {
                match self
                    .call_with_retry(|| self.provider.refresh_token(&refresh, scope))
                    .await
                {
                    Ok(token) => token,
                    Err(error) => {
                        tracing::warn!(%error, scope, "refresh grant failed, requesting fresh token");
                        self.call_with_retry(|| self.provider.get_token(scope))
                            .await?
                    }
                }
            }
            None => {
                self.call_with_retry(|| self.provider.get_token(scope))
                    .await?
            }
        };

        // Providers may omit the refresh token on renewal; keep the old one.
        if token.refresh_token.is_none() {
            token.refresh_token = cached.and_then(|t| t.refresh_token);
        }

        self.cache.set(scope, token.clone()).await;
        Ok(token)
    }

    async fn call_with_retry<F, Fut>(&self, mut call: F) -> Result<AuthToken, AuthError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<AuthToken, AuthError>>,
    {
        let mut last_error = None;
        for attempt in 1..=self.config.max_retries {
            if self.cancel.is_cancelled() {
                return Err(AuthError::Cancelled);
            }
            match call().await {
                Ok(token) => return Ok(token),
                Err(error) => {
                    tracing::warn!(%error, attempt, "token request failed");
                    last_error = Some(error);
                    if attempt < self.config.max_retries {
                        tokio::select! {
                            _ = tokio::time::sleep(self.config.retry_interval) => {}
                            _ = self.cancel.cancelled() => return Err(AuthError::Cancelled),
                        }
                    }
                }
            }
        }
        Err(last_error.unwrap_or(AuthError::Cancelled))
    }

    // -- Background loop ----------------------------------------------------

    /// Start the renewal ticker over a fixed set of known scopes.
    pub fn start_background(self: Arc<Self>, scopes: Vec<String>) {
        let mgr = Arc::clone(&self);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(mgr.config.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so a fresh start does
            // not race the initial foreground token acquisition.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        for scope in &scopes {
                            let Some(token) = mgr.cache.get(scope).await else {
                                continue;
                            };
                            if !token.should_refresh(mgr.config.refresh_ahead) {
                                continue;
                            }
                            let mgr = Arc::clone(&mgr);
                            let scope = scope.clone();
                            tokio::spawn(async move {
                                let outcome = tokio::time::timeout(
                                    mgr.config.refresh_timeout,
                                    mgr.force_refresh(&scope),
                                )
                                .await;
                                match outcome {
                                    Ok(Ok(_)) => {
                                        tracing::debug!(scope, "background token refresh complete");
                                    }
                                    Ok(Err(error)) => {
                                        tracing::warn!(%error, scope, "background token refresh failed");
                                    }
                                    Err(_) => {
                                        tracing::warn!(scope, "background token refresh timed out");
                                    }
                                }
                            });
                        }
                    }
                }
            }
        });
        *self.background.lock().unwrap() = Some(handle);
    }

    /// Stop the background loop and wait for it to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.background.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[async_trait]
impl TokenSource for RefreshManager {
    async fn get_valid_token(&self, scope: &str) -> Result<AuthToken, AuthError> {
        RefreshManager::get_valid_token(self, scope).await
    }

    async fn force_refresh(&self, scope: &str) -> Result<AuthToken, AuthError> {
        RefreshManager::force_refresh(self, scope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryTokenCache;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingProvider {
        gets: AtomicU32,
        refreshes: AtomicU32,
        delay: Duration,
        fail_first_n: AtomicU32,
        fail_refresh: bool,
    }

    impl CountingProvider {
        fn new() -> Self {
            Self {
                gets: AtomicU32::new(0),
                refreshes: AtomicU32::new(0),
                delay: Duration::ZERO,
                fail_first_n: AtomicU32::new(0),
                fail_refresh: false,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn failing_first(self, n: u32) -> Self {
            self.fail_first_n.store(n, Ordering::SeqCst);
            self
        }

        fn with_failing_refresh(mut self) -> Self {
            self.fail_refresh = true;
            self
        }
    }

    #[async_trait]
    impl TokenProvider for CountingProvider {
        async fn get_token(&self, _scope: &str) -> Result<AuthToken, AuthError> {
            tokio::time::sleep(self.delay).await;
            let n = self.gets.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_first_n.load(Ordering::SeqCst) >= n {
                return Err(AuthError::Network("scripted failure".into()));
            }
            Ok(AuthToken::new(
                format!("fresh-{n}"),
                "Bearer",
                Duration::from_secs(3600),
            ))
        }

        async fn refresh_token(
            &self,
            _refresh_token: &str,
            _scope: &str,
        ) -> Result<AuthToken, AuthError> {
            tokio::time::sleep(self.delay).await;
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_refresh {
                return Err(AuthError::Network("refresh rejected".into()));
            }
            Ok(AuthToken::new(
                format!("refreshed-{n}"),
                "Bearer",
                Duration::from_secs(3600),
            ))
        }
    }

    fn manager(provider: CountingProvider, config: RefreshConfig) -> Arc<RefreshManager> {
        Arc::new(RefreshManager::new(
            Arc::new(MemoryTokenCache::new()),
            Arc::new(provider),
            config,
        ))
    }

    fn fast_config() -> RefreshConfig {
        RefreshConfig {
            refresh_ahead: Duration::from_secs(300),
            max_retries: 3,
            retry_interval: Duration::from_millis(5),
            check_interval: Duration::from_millis(20),
            refresh_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn valid_cached_token_skips_the_provider() {
        let mgr = manager(CountingProvider::new(), fast_config());
        mgr.cache
            .set(
                "default",
                AuthToken::new("cached", "Bearer", Duration::from_secs(3600)),
            )
            .await;

        let token = mgr.get_valid_token("default").await.unwrap();
        assert_eq!(token.access_token, "cached");
    }

    #[tokio::test]
    async fn token_in_window_triggers_refresh_grant() {
        let mgr = manager(CountingProvider::new(), fast_config());
        mgr.cache
            .set(
                "default",
                AuthToken::new("old", "Bearer", Duration::from_secs(60))
                    .with_refresh_token("rt"),
            )
            .await;

        let token = mgr.get_valid_token("default").await.unwrap();
        assert_eq!(token.access_token, "refreshed-1");
        // The refresh token is preserved across renewal.
        assert_eq!(token.refresh_token.as_deref(), Some("rt"));
    }

    #[tokio::test]
    async fn refresh_failure_falls_back_to_api_key_grant() {
        let mgr = manager(
            CountingProvider::new().with_failing_refresh(),
            RefreshConfig {
                max_retries: 1,
                ..fast_config()
            },
        );
        mgr.cache
            .set(
                "default",
                AuthToken::new("old", "Bearer", Duration::ZERO).with_refresh_token("rt"),
            )
            .await;

        let token = mgr.get_valid_token("default").await.unwrap();
        assert!(token.access_token.starts_with("fresh-"));
    }

    #[tokio::test]
    async fn concurrent_requests_single_flight() {
        let mgr = manager(
            CountingProvider::new().with_delay(Duration::from_millis(50)),
            fast_config(),
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let mgr = Arc::clone(&mgr);
            handles.push(tokio::spawn(
                async move { mgr.get_valid_token("default").await },
            ));
        }

        let mut tokens = Vec::new();
        for handle in handles {
            tokens.push(handle.await.unwrap().unwrap());
        }

        // Exactly one remote call happened; everyone saw its result.
        let first = &tokens[0].access_token;
        assert!(tokens.iter().all(|t| &t.access_token == first));
        assert_eq!(first, "fresh-1");
    }

    #[tokio::test]
    async fn retries_until_success() {
        let mgr = manager(CountingProvider::new().failing_first(2), fast_config());
        let token = mgr.get_valid_token("default").await.unwrap();
        assert_eq!(token.access_token, "fresh-3");
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_error() {
        let mgr = manager(
            CountingProvider::new().failing_first(10),
            RefreshConfig {
                max_retries: 2,
                ..fast_config()
            },
        );
        assert!(mgr.get_valid_token("default").await.is_err());
    }

    #[tokio::test]
    async fn force_refresh_replaces_a_valid_token() {
        let mgr = manager(CountingProvider::new(), fast_config());
        mgr.cache
            .set(
                "default",
                AuthToken::new("cached", "Bearer", Duration::from_secs(3600)),
            )
            .await;

        let token = mgr.force_refresh("default").await.unwrap();
        assert_eq!(token.access_token, "fresh-1");
        assert_eq!(
            mgr.cache.get("default").await.unwrap().access_token,
            "fresh-1"
        );
    }

    #[tokio::test]
    async fn background_loop_renews_tokens_in_window() {
        let mgr = manager(CountingProvider::new(), fast_config());
        mgr.cache
            .set(
                "default",
                AuthToken::new("stale", "Bearer", Duration::from_secs(30))
                    .with_refresh_token("rt"),
            )
            .await;

        Arc::clone(&mgr).start_background(vec!["default".to_string()]);
        tokio::time::sleep(Duration::from_millis(120)).await;
        mgr.stop().await;

        let token = mgr.cache.get("default").await.unwrap();
        assert!(token.access_token.starts_with("refreshed-"));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let mgr = manager(CountingProvider::new(), fast_config());
        Arc::clone(&mgr).start_background(vec![]);
        mgr.stop().await;
        mgr.stop().await;
    }
}
