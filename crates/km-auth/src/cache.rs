//! Per-scope token caches.
//!
//! Two implementations: an in-memory map for tests and short-lived runs, and
//! an encrypted single-file store under the user config directory. A cache
//! that cannot be decrypted behaves as an empty cache; the caller simply
//! fetches a fresh token.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::token::AuthToken;
use crate::AuthError;

const NONCE_SIZE: usize = 12;
pub const AUTH_CACHE_FILE: &str = ".auth_cache";

#[async_trait]
pub trait TokenCache: Send + Sync {
    async fn get(&self, scope: &str) -> Option<AuthToken>;
    async fn set(&self, scope: &str, token: AuthToken);
    async fn remove(&self, scope: &str);
    async fn clear(&self);
    /// Scopes currently holding a token.
    async fn scopes(&self) -> Vec<String>;
}

// ---------------------------------------------------------------------------
// In-memory cache
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryTokenCache {
    tokens: RwLock<HashMap<String, AuthToken>>,
}

impl MemoryTokenCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenCache for MemoryTokenCache {
    async fn get(&self, scope: &str) -> Option<AuthToken> {
        self.tokens.read().await.get(scope).cloned()
    }

    async fn set(&self, scope: &str, token: AuthToken) {
        self.tokens.write().await.insert(scope.to_string(), token);
    }

    async fn remove(&self, scope: &str) {
        self.tokens.write().await.remove(scope);
    }

    async fn clear(&self) {
        self.tokens.write().await.clear();
    }

    async fn scopes(&self) -> Vec<String> {
        self.tokens.read().await.keys().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Encrypted on-disk cache
// ---------------------------------------------------------------------------

/// Single-file encrypted cache: base64(nonce || AES-256-GCM(json map)).
///
/// The key is derived from the host and user names so the file is useless if
/// copied to another machine. Writes serialise through the same lock that
/// guards the in-memory view, making the read-modify-write atomic within the
/// process.
pub struct EncryptedFileCache {
    path: PathBuf,
    key: Key<Aes256Gcm>,
    tokens: RwLock<HashMap<String, AuthToken>>,
}

impl EncryptedFileCache {
    /// Open (or initialize) the cache at the default location,
    /// `~/.config/kilometers/.auth_cache`.
    pub async fn open_default() -> Result<Self, AuthError> {
        let dir = dirs::config_dir()
            .ok_or_else(|| AuthError::Cache("no user config directory".into()))?
            .join("kilometers");
        Self::open(dir.join(AUTH_CACHE_FILE)).await
    }

    pub async fn open(path: PathBuf) -> Result<Self, AuthError> {
        let key = derive_key();
        let tokens = load_tokens(&path, &key).await;
        Ok(Self {
            path,
            key,
            tokens: RwLock::new(tokens),
        })
    }

    async fn persist(&self, tokens: &HashMap<String, AuthToken>) -> Result<(), AuthError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AuthError::Cache(format!("create cache dir: {e}")))?;
        }

        let plaintext = serde_json::to_vec(tokens)
            .map_err(|e| AuthError::Cache(format!("serialize cache: {e}")))?;

        let cipher = Aes256Gcm::new(&self.key);
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_ref())
            .map_err(|e| AuthError::Cache(format!("encrypt cache: {e}")))?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        let encoded = BASE64.encode(blob);

        tokio::fs::write(&self.path, encoded)
            .await
            .map_err(|e| AuthError::Cache(format!("write cache: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| AuthError::Cache(format!("chmod cache: {e}")))?;
        }

        Ok(())
    }
}

#[async_trait]
impl TokenCache for EncryptedFileCache {
    async fn get(&self, scope: &str) -> Option<AuthToken> {
        self.tokens.read().await.get(scope).cloned()
    }

    async fn set(&self, scope: &str, token: AuthToken) {
        let mut tokens = self.tokens.write().await;
        tokens.insert(scope.to_string(), token);
        if let Err(error) = self.persist(&tokens).await {
            tracing::warn!(%error, scope, "failed to persist token cache");
        }
    }

    async fn remove(&self, scope: &str) {
        let mut tokens = self.tokens.write().await;
        tokens.remove(scope);
        if let Err(error) = self.persist(&tokens).await {
            tracing::warn!(%error, scope, "failed to persist token cache");
        }
    }

    async fn clear(&self) {
        let mut tokens = self.tokens.write().await;
        tokens.clear();
        if let Err(error) = self.persist(&tokens).await {
            tracing::warn!(%error, "failed to persist token cache");
        }
    }

    async fn scopes(&self) -> Vec<String> {
        self.tokens.read().await.keys().cloned().collect()
    }
}

/// SHA-256 of `kilometers-cli:<hostname>:<username>`.
fn derive_key() -> Key<Aes256Gcm> {
    let hostname = gethostname::gethostname().to_string_lossy().into_owned();
    let username = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(format!("kilometers-cli:{hostname}:{username}"));
    let digest = hasher.finalize();
    *Key::<Aes256Gcm>::from_slice(&digest)
}

/// Load and decrypt the cache file. Any failure (missing file, bad base64,
/// wrong key, corrupt JSON) yields an empty map.
async fn load_tokens(path: &Path, key: &Key<Aes256Gcm>) -> HashMap<String, AuthToken> {
    let encoded = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(_) => return HashMap::new(),
    };

    let blob = match BASE64.decode(encoded.trim()) {
        Ok(blob) if blob.len() > NONCE_SIZE => blob,
        _ => {
            tracing::warn!(path = %path.display(), "token cache unreadable, starting empty");
            return HashMap::new();
        }
    };

    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_SIZE);
    let cipher = Aes256Gcm::new(key);
    let plaintext = match cipher.decrypt(Nonce::from_slice(nonce_bytes), ciphertext) {
        Ok(p) => p,
        Err(_) => {
            tracing::warn!(path = %path.display(), "token cache failed to decrypt, starting empty");
            return HashMap::new();
        }
    };

    serde_json::from_slice(&plaintext).unwrap_or_else(|error| {
        tracing::warn!(%error, "token cache held corrupt JSON, starting empty");
        HashMap::new()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn token(access: &str) -> AuthToken {
        AuthToken::new(access, "Bearer", Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn memory_cache_round_trip() {
        let cache = MemoryTokenCache::new();
        cache.set("default", token("a")).await;
        assert_eq!(cache.get("default").await.unwrap().access_token, "a");
        cache.remove("default").await;
        assert!(cache.get("default").await.is_none());
    }

    #[tokio::test]
    async fn file_cache_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(AUTH_CACHE_FILE);

        {
            let cache = EncryptedFileCache::open(path.clone()).await.unwrap();
            cache
                .set("default", token("persisted").with_refresh_token("r1"))
                .await;
            cache.set("plugins", token("other")).await;
        }

        let reopened = EncryptedFileCache::open(path.clone()).await.unwrap();
        let got = reopened.get("default").await.unwrap();
        assert_eq!(got.access_token, "persisted");
        assert_eq!(got.refresh_token.as_deref(), Some("r1"));
        let mut scopes = reopened.scopes().await;
        scopes.sort();
        assert_eq!(scopes, vec!["default", "plugins"]);

        // On-disk content is not plaintext.
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("persisted"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_cache_is_mode_0600() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(AUTH_CACHE_FILE);
        let cache = EncryptedFileCache::open(path.clone()).await.unwrap();
        cache.set("default", token("x")).await;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn corrupted_cache_is_empty_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(AUTH_CACHE_FILE);
        std::fs::write(&path, "definitely not base64 ciphertext !!!").unwrap();

        let cache = EncryptedFileCache::open(path.clone()).await.unwrap();
        assert!(cache.get("default").await.is_none());
        assert!(cache.scopes().await.is_empty());

        // And it can be written over.
        cache.set("default", token("fresh")).await;
        let reopened = EncryptedFileCache::open(path).await.unwrap();
        assert_eq!(reopened.get("default").await.unwrap().access_token, "fresh");
    }

    #[tokio::test]
    async fn clear_wipes_the_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(AUTH_CACHE_FILE);
        let cache = EncryptedFileCache::open(path.clone()).await.unwrap();
        cache.set("default", token("x")).await;
        cache.clear().await;

        let reopened = EncryptedFileCache::open(path).await.unwrap();
        assert!(reopened.scopes().await.is_empty());
    }
}
