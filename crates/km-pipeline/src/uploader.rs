//! Batch uploader: stages sealed batches locally, POSTs them to the
//! collector in seal order, and retries transient failures with exponential
//! backoff.
//!
//! Batch N+1 is never submitted before batch N has succeeded or finally
//! failed; the single consumer loop over the bounded channel provides both
//! the ordering and the backpressure.

use async_trait::async_trait;
use km_core::Batch;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::store::BatchStore;
use crate::wire::BatchUpload;
use km_auth::{AuthError, AuthedClient};

/// Capacity of the aggregator -> uploader channel. Small on purpose: a full
/// channel blocks the aggregator, which is the intended backpressure path
/// onto the wire.
pub const UPLOAD_CHANNEL_CAPACITY: usize = 8;

pub const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
pub const BACKOFF_MAX: Duration = Duration::from_secs(30);
pub const MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("collector rejected batch with status {0}")]
    Rejected(u16),

    #[error("unauthorized after token refresh")]
    Unauthorized,

    #[error("upload retries exhausted after {0} attempts")]
    RetriesExhausted(u32),

    #[error("network error: {0}")]
    Network(String),

    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("cancelled")]
    Cancelled,
}

/// Transport to the collector. The production implementation wraps the
/// signing HTTP client; tests script status sequences.
#[async_trait]
pub trait CollectorTransport: Send + Sync {
    /// POST one batch and return the HTTP status code.
    async fn post_batch(&self, body: &BatchUpload) -> Result<u16, UploadError>;
}

// ---------------------------------------------------------------------------
// HTTP transport
// ---------------------------------------------------------------------------

pub struct HttpCollector {
    client: AuthedClient,
    url: String,
}

impl HttpCollector {
    pub fn new(client: AuthedClient, api_endpoint: &url::Url) -> Self {
        let base = api_endpoint.as_str().trim_end_matches('/');
        Self {
            client,
            url: format!("{base}/api/events/batch"),
        }
    }
}

#[async_trait]
impl CollectorTransport for HttpCollector {
    async fn post_batch(&self, body: &BatchUpload) -> Result<u16, UploadError> {
        let request = self
            .client
            .post(&self.url)
            .json(body)
            .build()
            .map_err(|e| UploadError::Network(e.to_string()))?;
        // The signing client already performs the single forced refresh and
        // replay on 401; whatever status comes back here is final for this
        // attempt.
        let response = self.client.execute(request).await?;
        Ok(response.status().as_u16())
    }
}

// ---------------------------------------------------------------------------
// Uploader
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct UploaderConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            initial_backoff: BACKOFF_INITIAL,
            max_backoff: BACKOFF_MAX,
            max_attempts: MAX_ATTEMPTS,
        }
    }
}

pub struct BatchUploader {
    transport: Arc<dyn CollectorTransport>,
    store: Arc<dyn BatchStore>,
    config: UploaderConfig,
    cancel: CancellationToken,
    uploaded_batches: AtomicU64,
    uploaded_events: AtomicU64,
    failed_batches: AtomicU64,
}

impl BatchUploader {
    pub fn new(
        transport: Arc<dyn CollectorTransport>,
        store: Arc<dyn BatchStore>,
        config: UploaderConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            store,
            config,
            cancel,
            uploaded_batches: AtomicU64::new(0),
            uploaded_events: AtomicU64::new(0),
            failed_batches: AtomicU64::new(0),
        }
    }

    pub fn uploaded_batches(&self) -> u64 {
        self.uploaded_batches.load(Ordering::Relaxed)
    }

    pub fn uploaded_events(&self) -> u64 {
        self.uploaded_events.load(Ordering::Relaxed)
    }

    pub fn failed_batches(&self) -> u64 {
        self.failed_batches.load(Ordering::Relaxed)
    }

    /// Consume sealed batches until the channel closes. Each batch fully
    /// resolves (success or final failure) before the next is taken.
    pub async fn run(&self, mut rx: mpsc::Receiver<Batch>) {
        while let Some(batch) = rx.recv().await {
            if let Err(error) = self.process(batch).await {
                tracing::warn!(target: "km::monitor", %error, "batch upload failed");
            }
        }
    }

    /// Stage and upload one batch. On final failure the batch stays staged.
    pub async fn process(&self, batch: Batch) -> Result<(), UploadError> {
        let body = BatchUpload::from_batch(&batch);

        if let Err(error) = self.store.stage(&body).await {
            // A broken store must not lose the wire path.
            tracing::warn!(target: "km::monitor", %error, batch = body.batch_id, "failed to stage batch");
        }

        match self.upload_with_retry(&body).await {
            Ok(()) => {
                self.uploaded_batches.fetch_add(1, Ordering::Relaxed);
                self.uploaded_events
                    .fetch_add(body.events.len() as u64, Ordering::Relaxed);
                if let Err(error) = self.store.discard(&body.session_id, body.batch_id).await {
                    tracing::warn!(target: "km::monitor", %error, batch = body.batch_id, "failed to discard staged batch");
                }
                tracing::debug!(
                    target: "km::monitor",
                    batch = body.batch_id,
                    events = body.events.len(),
                    "batch uploaded"
                );
                Ok(())
            }
            Err(error) => {
                self.failed_batches.fetch_add(1, Ordering::Relaxed);
                Err(error)
            }
        }
    }

    async fn upload_with_retry(&self, body: &BatchUpload) -> Result<(), UploadError> {
        let mut backoff = self.config.initial_backoff;
        let mut last_error = None;

        for attempt in 1..=self.config.max_attempts {
            if self.cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }

            match self.transport.post_batch(body).await {
                Ok(status) if (200..300).contains(&status) => return Ok(()),
                Ok(401) => return Err(UploadError::Unauthorized),
                Ok(status) if status >= 500 => {
                    tracing::debug!(
                        target: "km::monitor",
                        batch = body.batch_id,
                        status,
                        attempt,
                        "transient collector error"
                    );
                    last_error = Some(UploadError::Rejected(status));
                }
                Ok(status) => return Err(UploadError::Rejected(status)),
                Err(UploadError::Auth(e)) => return Err(UploadError::Auth(e)),
                Err(error) => {
                    tracing::debug!(
                        target: "km::monitor",
                        batch = body.batch_id,
                        %error,
                        attempt,
                        "upload attempt failed"
                    );
                    last_error = Some(error);
                }
            }

            if attempt < self.config.max_attempts {
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = self.cancel.cancelled() => return Err(UploadError::Cancelled),
                }
                backoff = (backoff * 2).min(self.config.max_backoff);
            }
        }

        Err(last_error.unwrap_or(UploadError::RetriesExhausted(self.config.max_attempts)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBatchStore;
    use km_core::{Direction, Event, Session};
    use tokio::sync::Mutex;

    struct ScriptedCollector {
        statuses: Mutex<Vec<u16>>,
        posted: Mutex<Vec<u64>>,
    }

    impl ScriptedCollector {
        fn new(statuses: Vec<u16>) -> Self {
            Self {
                statuses: Mutex::new(statuses),
                posted: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CollectorTransport for ScriptedCollector {
        async fn post_batch(&self, body: &BatchUpload) -> Result<u16, UploadError> {
            self.posted.lock().await.push(body.batch_id);
            let mut statuses = self.statuses.lock().await;
            Ok(if statuses.is_empty() {
                200
            } else {
                statuses.remove(0)
            })
        }
    }

    fn batch(id_hint: u64) -> Batch {
        let mut session = Session::new();
        session.activate().unwrap();
        for _ in 0..id_hint {
            // Advance the batch counter so ids differ across calls.
            let ev = Event::new(session.next_event_id(), Direction::Inbound, "m", b"{}").unwrap();
            session.record(ev).unwrap();
            session.seal_open_batch();
        }
        let ev = Event::new(session.next_event_id(), Direction::Inbound, "m", b"{}").unwrap();
        session.record(ev).unwrap();
        session.seal_open_batch().unwrap()
    }

    fn uploader(
        transport: Arc<dyn CollectorTransport>,
        store: Arc<dyn BatchStore>,
    ) -> BatchUploader {
        BatchUploader::new(
            transport,
            store,
            UploaderConfig {
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(8),
                max_attempts: 5,
            },
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn retries_5xx_then_succeeds() {
        let transport = Arc::new(ScriptedCollector::new(vec![503, 503, 200]));
        let store = Arc::new(MemoryBatchStore::new());
        let up = uploader(transport.clone(), store.clone());

        up.process(batch(0)).await.unwrap();

        // Exactly three POSTs for the same batch id.
        let posted = transport.posted.lock().await;
        assert_eq!(posted.len(), 3);
        assert!(posted.iter().all(|id| *id == posted[0]));
        assert_eq!(up.uploaded_batches(), 1);
        assert_eq!(up.uploaded_events(), 1);
        // Staged copy discarded after success.
        assert!(store.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_keep_batch_staged() {
        let transport = Arc::new(ScriptedCollector::new(vec![500; 10]));
        let store = Arc::new(MemoryBatchStore::new());
        let up = uploader(transport.clone(), store.clone());

        let err = up.process(batch(0)).await.unwrap_err();
        assert!(matches!(err, UploadError::Rejected(500)));
        assert_eq!(transport.posted.lock().await.len(), 5);
        assert_eq!(up.failed_batches(), 1);
        assert_eq!(store.pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn permanent_4xx_fails_immediately() {
        let transport = Arc::new(ScriptedCollector::new(vec![400]));
        let store = Arc::new(MemoryBatchStore::new());
        let up = uploader(transport.clone(), store.clone());

        let err = up.process(batch(0)).await.unwrap_err();
        assert!(matches!(err, UploadError::Rejected(400)));
        assert_eq!(transport.posted.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn unauthorized_after_refresh_is_final() {
        let transport = Arc::new(ScriptedCollector::new(vec![401]));
        let store = Arc::new(MemoryBatchStore::new());
        let up = uploader(transport.clone(), store.clone());

        let err = up.process(batch(0)).await.unwrap_err();
        assert!(matches!(err, UploadError::Unauthorized));
        assert_eq!(store.pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn run_uploads_in_channel_order() {
        let transport = Arc::new(ScriptedCollector::new(vec![]));
        let store = Arc::new(MemoryBatchStore::new());
        let up = uploader(transport.clone(), store.clone());

        let (tx, rx) = mpsc::channel(UPLOAD_CHANNEL_CAPACITY);
        for n in 0..3 {
            tx.send(batch(n)).await.unwrap();
        }
        drop(tx);
        up.run(rx).await;

        let posted = transport.posted.lock().await;
        assert_eq!(posted.as_slice(), &[1, 2, 3]);
        assert_eq!(up.uploaded_batches(), 3);
    }

    #[tokio::test]
    async fn cancellation_aborts_pending_retries() {
        let transport = Arc::new(ScriptedCollector::new(vec![500; 10]));
        let store = Arc::new(MemoryBatchStore::new());
        let cancel = CancellationToken::new();
        let up = BatchUploader::new(
            transport,
            store,
            UploaderConfig {
                initial_backoff: Duration::from_secs(60),
                max_backoff: Duration::from_secs(60),
                max_attempts: 5,
            },
            cancel.clone(),
        );

        cancel.cancel();
        let err = tokio::time::timeout(Duration::from_secs(1), up.process(batch(0)))
            .await
            .expect("cancel must abort the backoff wait")
            .unwrap_err();
        assert!(matches!(err, UploadError::Cancelled));
    }
}
