//! Durable staging for sealed batches awaiting upload.
//!
//! A batch is staged before its first upload attempt and discarded after
//! success. Anything still present after a run represents batches whose
//! retries were exhausted. Store failures never block the upload path.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

use crate::wire::BatchUpload;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("staging I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("staging serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[async_trait]
pub trait BatchStore: Send + Sync {
    async fn stage(&self, batch: &BatchUpload) -> Result<(), StoreError>;
    async fn discard(&self, session_id: &str, batch_id: u64) -> Result<(), StoreError>;
    async fn pending(&self) -> Result<Vec<BatchUpload>, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryBatchStore {
    batches: Mutex<HashMap<(String, u64), BatchUpload>>,
}

impl MemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BatchStore for MemoryBatchStore {
    async fn stage(&self, batch: &BatchUpload) -> Result<(), StoreError> {
        self.batches
            .lock()
            .await
            .insert((batch.session_id.clone(), batch.batch_id), batch.clone());
        Ok(())
    }

    async fn discard(&self, session_id: &str, batch_id: u64) -> Result<(), StoreError> {
        self.batches
            .lock()
            .await
            .remove(&(session_id.to_string(), batch_id));
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<BatchUpload>, StoreError> {
        let batches = self.batches.lock().await;
        let mut out: Vec<_> = batches.values().cloned().collect();
        out.sort_by_key(|b| (b.session_id.clone(), b.batch_id));
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// File store
// ---------------------------------------------------------------------------

/// One JSON file per staged batch under a staging directory.
pub struct FileBatchStore {
    dir: PathBuf,
}

impl FileBatchStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, session_id: &str, batch_id: u64) -> PathBuf {
        self.dir.join(format!("{session_id}-{batch_id:08}.json"))
    }
}

#[async_trait]
impl BatchStore for FileBatchStore {
    async fn stage(&self, batch: &BatchUpload) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&batch.session_id, batch.batch_id);
        let json = serde_json::to_vec(batch)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    async fn discard(&self, session_id: &str, batch_id: u64) -> Result<(), StoreError> {
        let path = self.path_for(session_id, batch_id);
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn pending(&self) -> Result<Vec<BatchUpload>, StoreError> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();
        for path in paths {
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice(&bytes) {
                Ok(batch) => out.push(batch),
                Err(error) => {
                    tracing::warn!(%error, path = %path.display(), "skipping corrupt staged batch");
                }
            }
        }
        Ok(out)
    }
}
