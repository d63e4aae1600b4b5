//! Versioned cache: TTL key/value entries with O(1) namespace invalidation.
//!
//! Every entry is stored together with the version of its namespace at write
//! time. Bumping the namespace version makes all older entries read as misses
//! without touching them. A writer that read version `n` and writes back after
//! the namespace moved to `n + 1` loses: its write is dropped.
//!
//! The cache is best-effort. Store failures are logged and degrade to a miss
//! (reads) or a skipped write; they never reach the caller as errors.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::kv::KvStore;

const KEY_PREFIX: &str = "scribe:cache";

/// TTL presets by kind of record.
pub mod ttl {
    use std::time::Duration;

    /// Immutable records (a generated summary never changes once written).
    pub const IMMUTABLE: Duration = Duration::from_secs(60 * 60);
    /// Records mirroring in-flight background work.
    pub const IN_FLIGHT: Duration = Duration::from_secs(10);
    /// List/filter views.
    pub const LIST_VIEW: Duration = Duration::from_secs(5 * 60);
    /// Quota usage counters.
    pub const COUNTER: Duration = Duration::from_secs(60);
}

/// A cache key scoped to a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    namespace: String,
    id: String,
}

impl CacheKey {
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn storage_key(&self) -> String {
        format!("{KEY_PREFIX}:{}:{}", self.namespace, self.id)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.id)
    }
}

fn version_key(namespace: &str) -> String {
    format!("{KEY_PREFIX}:version:{namespace}")
}

/// Namespace version. A namespace that was never invalidated is at version 0.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheVersion(u64);

impl CacheVersion {
    pub const INITIAL: CacheVersion = CacheVersion(0);

    pub fn get(&self) -> u64 {
        self.0
    }

    /// Guard value as stored in the backing store (`None` = key absent).
    fn as_guard(&self) -> Option<String> {
        (self.0 > 0).then(|| self.0.to_string())
    }
}

impl fmt::Display for CacheVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Outcome of a cache write. Informational only: callers may ignore it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CacheWrite {
    Committed,
    /// The namespace version moved since the value was read; the write was dropped.
    StaleWriteRejected,
    /// The store was unavailable or the value could not be encoded.
    Skipped,
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    #[serde(rename = "v")]
    version: CacheVersion,
    data: T,
}

#[derive(Clone)]
pub struct VersionedCache {
    store: Arc<dyn KvStore>,
}

impl fmt::Debug for VersionedCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionedCache").finish_non_exhaustive()
    }
}

impl VersionedCache {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        self.get_with_version(key).await.0
    }

    pub async fn set<T: Serialize>(&self, key: &CacheKey, value: &T, ttl: Duration) -> CacheWrite {
        let Some(version) = self.current_version(key.namespace()).await else {
            return CacheWrite::Skipped;
        };
        let Some(encoded) = encode(key, version, value) else {
            return CacheWrite::Skipped;
        };
        match self.store.set(&key.storage_key(), &encoded, Some(ttl)).await {
            Ok(()) => CacheWrite::Committed,
            Err(e) => {
                warn!(key = %key, error = %e, "cache write skipped");
                CacheWrite::Skipped
            }
        }
    }

    /// Read a value together with the namespace's current version.
    ///
    /// Entries tagged with an older version are reported as misses. The
    /// returned version is what a later [`set_with_version`](Self::set_with_version)
    /// must be guarded by.
    pub async fn get_with_version<T: DeserializeOwned>(
        &self,
        key: &CacheKey,
    ) -> (Option<T>, CacheVersion) {
        let Some(version) = self.current_version(key.namespace()).await else {
            return (None, CacheVersion::INITIAL);
        };

        let raw = match self.store.get(&key.storage_key()).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %key, error = %e, "cache read failed; treating as miss");
                return (None, version);
            }
        };

        let value = raw.and_then(|raw| match serde_json::from_str::<Envelope<T>>(&raw) {
            Ok(env) if env.version == version => Some(env.data),
            Ok(env) => {
                debug!(key = %key, entry = %env.version, current = %version, "stale cache entry");
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "undecodable cache entry; treating as miss");
                None
            }
        });

        (value, version)
    }

    /// Write only if the namespace is still at `expected`.
    pub async fn set_with_version<T: Serialize>(
        &self,
        key: &CacheKey,
        value: &T,
        expected: CacheVersion,
        ttl: Duration,
    ) -> CacheWrite {
        let Some(encoded) = encode(key, expected, value) else {
            return CacheWrite::Skipped;
        };
        let guard = expected.as_guard();
        let result = self
            .store
            .compare_and_set(
                &version_key(key.namespace()),
                guard.as_deref(),
                &key.storage_key(),
                &encoded,
                Some(ttl),
            )
            .await;

        match result {
            Ok(true) => CacheWrite::Committed,
            Ok(false) => {
                debug!(key = %key, expected = %expected, "stale cache write dropped");
                CacheWrite::StaleWriteRejected
            }
            Err(e) => {
                warn!(key = %key, error = %e, "cache write skipped");
                CacheWrite::Skipped
            }
        }
    }

    /// Bump the namespace version, making every entry under it stale.
    ///
    /// Returns the new version, or `None` if the store could not be reached.
    pub async fn invalidate_version(&self, namespace: &str) -> Option<CacheVersion> {
        match self.store.incr(&version_key(namespace), None).await {
            Ok(v) => {
                debug!(namespace, version = v, "cache namespace invalidated");
                Some(CacheVersion(v.max(0) as u64))
            }
            Err(e) => {
                warn!(namespace, error = %e, "cache invalidation failed; entries expire by TTL");
                None
            }
        }
    }

    pub async fn delete(&self, key: &CacheKey) {
        if let Err(e) = self.store.delete(&key.storage_key()).await {
            warn!(key = %key, error = %e, "cache delete failed");
        }
    }

    /// Read-through helper: return the cached value, or run `loader` and cache
    /// what it returns (guarded by the version observed before loading).
    ///
    /// `Ok(None)` from the loader is passed through and not cached.
    pub async fn get_or_load<T, E, F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        loader: F,
    ) -> Result<Option<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        let (cached, version) = self.get_with_version::<T>(key).await;
        if cached.is_some() {
            return Ok(cached);
        }

        let loaded = loader().await?;
        if let Some(value) = &loaded {
            self.set_with_version(key, value, version, ttl).await;
        }
        Ok(loaded)
    }

    async fn current_version(&self, namespace: &str) -> Option<CacheVersion> {
        match self.store.get(&version_key(namespace)).await {
            Ok(None) => Some(CacheVersion::INITIAL),
            Ok(Some(raw)) => match raw.parse::<u64>() {
                Ok(v) => Some(CacheVersion(v)),
                Err(_) => {
                    warn!(namespace, raw = %raw, "corrupt cache version");
                    None
                }
            },
            Err(e) => {
                warn!(namespace, error = %e, "cache version read failed");
                None
            }
        }
    }
}

fn encode<T: Serialize>(key: &CacheKey, version: CacheVersion, value: &T) -> Option<String> {
    match serde_json::to_string(&Envelope {
        version,
        data: value,
    }) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(key = %key, error = %e, "cache value not serializable");
            None
        }
    }
}
