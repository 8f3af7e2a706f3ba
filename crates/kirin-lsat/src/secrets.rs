//! Root key storage.
//!
//! Keys are written once per [`RootKeyId`] and never overwritten: a retried
//! mint for an id that already has material must get the existing key back,
//! otherwise credentials issued under the first key would stop verifying.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::StoreError;
use crate::identifier::RootKeyId;

/// 32 bytes of signing key material.
#[derive(Clone, PartialEq, Eq)]
pub struct RootKey([u8; 32]);

impl RootKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, StoreError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| {
            StoreError::Corrupted(format!("root key must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(arr))
    }

    /// Fresh random key material from the OS CSPRNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::fill(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for RootKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RootKey([REDACTED])")
    }
}

/// Shared storage for root keys.
///
/// Implementations must be thread-safe and, for multi-instance deployments,
/// linearizable: a key created through one proxy instance must be readable
/// from every other instance immediately afterwards.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Create key material for `id` if none exists, and return the stored key.
    ///
    /// Must be idempotent: concurrent or repeated calls for the same id all
    /// return the same material.
    async fn new_secret(&self, id: &RootKeyId) -> Result<RootKey, StoreError>;

    /// Fetch existing key material. Returns [`StoreError::NotFound`] if the
    /// id was never created.
    async fn get_secret(&self, id: &RootKeyId) -> Result<RootKey, StoreError>;
}

#[async_trait]
impl<S: SecretStore + ?Sized> SecretStore for Arc<S> {
    async fn new_secret(&self, id: &RootKeyId) -> Result<RootKey, StoreError> {
        (**self).new_secret(id).await
    }

    async fn get_secret(&self, id: &RootKeyId) -> Result<RootKey, StoreError> {
        (**self).get_secret(id).await
    }
}

/// In-memory store backed by DashMap. Keys are lost on restart and not shared
/// between processes.
#[derive(Default)]
pub struct InMemorySecretStore {
    keys: DashMap<RootKeyId, RootKey>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn new_secret(&self, id: &RootKeyId) -> Result<RootKey, StoreError> {
        // Entry API gives create-if-absent within a single process.
        let key = self.keys.entry(*id).or_insert_with(RootKey::random);
        Ok(key.clone())
    }

    async fn get_secret(&self, id: &RootKeyId) -> Result<RootKey, StoreError> {
        self.keys
            .get(id)
            .map(|k| k.clone())
            .ok_or(StoreError::NotFound)
    }
}

/// Default bound on [`CachedSecretStore`] entries.
pub const DEFAULT_CACHE_ENTRIES: usize = 10_000;

/// Bounded read-through cache in front of another store.
///
/// Root keys are immutable once written, so a cached entry can never go
/// stale. Only keys read back through `get_secret` are cached: minting a
/// challenge for an anonymous request must not grow the cache. Misses and
/// errors always reach the inner store. Once full, an arbitrary entry is
/// evicted per insert.
pub struct CachedSecretStore<S> {
    inner: S,
    cache: DashMap<RootKeyId, RootKey>,
    max_entries: usize,
}

impl<S: SecretStore> CachedSecretStore<S> {
    pub fn new(inner: S) -> Self {
        Self::with_max_entries(inner, DEFAULT_CACHE_ENTRIES)
    }

    pub fn with_max_entries(inner: S, max_entries: usize) -> Self {
        Self {
            inner,
            cache: DashMap::new(),
            max_entries,
        }
    }

    fn remember(&self, id: RootKeyId, key: RootKey) {
        if self.max_entries == 0 {
            return;
        }
        while self.cache.len() >= self.max_entries {
            // Copy the key out first; removing while an iterator guard is
            // alive would deadlock on the shard lock.
            let victim = self.cache.iter().next().map(|e| *e.key());
            match victim {
                Some(victim) => {
                    self.cache.remove(&victim);
                }
                None => break,
            }
        }
        self.cache.insert(id, key);
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

#[async_trait]
impl<S: SecretStore> SecretStore for CachedSecretStore<S> {
    async fn new_secret(&self, id: &RootKeyId) -> Result<RootKey, StoreError> {
        if let Some(key) = self.cache.get(id) {
            return Ok(key.clone());
        }
        self.inner.new_secret(id).await
    }

    async fn get_secret(&self, id: &RootKeyId) -> Result<RootKey, StoreError> {
        if let Some(key) = self.cache.get(id) {
            return Ok(key.clone());
        }
        let key = self.inner.get_secret(id).await?;
        self.remember(*id, key.clone());
        Ok(key)
    }
}

/// Root keys in a SQLite file. Shared by every process on one host that opens
/// the same path; use [`crate::etcd::EtcdSecretStore`] across hosts.
#[cfg(feature = "full")]
pub struct SqliteSecretStore {
    conn: Arc<std::sync::Mutex<rusqlite::Connection>>,
}

#[cfg(feature = "full")]
impl SqliteSecretStore {
    /// Open (or create) the key database at `path`.
    ///
    /// On Unix the file is restricted to 0600 since it holds signing keys.
    pub fn open(path: &str) -> Result<Self, rusqlite::Error> {
        let conn = rusqlite::Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS root_keys (
                id BLOB PRIMARY KEY,
                secret BLOB NOT NULL,
                created_at INTEGER NOT NULL
            );
            PRAGMA journal_mode=WAL;",
        )?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            {
                tracing::warn!(
                    path = %path,
                    error = %e,
                    "failed to set secret database file permissions to 0600"
                );
            }
        }

        Ok(Self {
            conn: Arc::new(std::sync::Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking thread pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| StoreError::Unreachable("secret store lock poisoned".to_string()))?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Unreachable(format!("secret store task failed: {e}")))?
    }
}

#[cfg(feature = "full")]
#[async_trait]
impl SecretStore for SqliteSecretStore {
    async fn new_secret(&self, id: &RootKeyId) -> Result<RootKey, StoreError> {
        let id = *id;
        self.with_conn(move |conn| {
            let candidate = RootKey::random();
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);

            // The primary key makes this create-if-absent across every process
            // sharing the file; the select returns whichever key won.
            conn.execute(
                "INSERT OR IGNORE INTO root_keys (id, secret, created_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![id.as_bytes().as_slice(), candidate.as_bytes().as_slice(), now],
            )
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;

            let stored: Vec<u8> = conn
                .query_row(
                    "SELECT secret FROM root_keys WHERE id = ?1",
                    [id.as_bytes().as_slice()],
                    |row| row.get(0),
                )
                .map_err(|e| StoreError::Unreachable(e.to_string()))?;
            RootKey::from_slice(&stored)
        })
        .await
    }

    async fn get_secret(&self, id: &RootKeyId) -> Result<RootKey, StoreError> {
        use rusqlite::OptionalExtension;

        let id = *id;
        self.with_conn(move |conn| {
            let stored: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT secret FROM root_keys WHERE id = ?1",
                    [id.as_bytes().as_slice()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| StoreError::Unreachable(e.to_string()))?;
            match stored {
                Some(bytes) => RootKey::from_slice(&bytes),
                None => Err(StoreError::NotFound),
            }
        })
        .await
    }
}
