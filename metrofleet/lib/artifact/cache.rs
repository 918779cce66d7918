use std::{future::Future, sync::Arc, time::Duration};

use tokio::time::Instant;

use crate::{
    config::ArtifactConfig,
    store::{KeyValueStore, MemoryStore},
    FleetResult,
};

use super::{generate_qr_code, QrArtifact, QrOptions};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A cached value and the instant it stops being served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry<V> {
    /// The cached value.
    pub value: V,

    /// The first instant at which the entry is expired.
    pub expires_at: Instant,
}

/// A TTL cache for generated artifacts.
///
/// Expired entries are evicted lazily by [`get`](Self::get) and [`size`](Self::size). Nothing
/// sweeps the cache in the background.
pub struct ArtifactCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    entries: Arc<dyn KeyValueStore<CacheEntry<V>>>,
    default_ttl: Duration,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<V> ArtifactCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates an in-memory cache whose entries live for `default_ttl` unless told otherwise.
    pub fn new(default_ttl: Duration) -> Self {
        Self::with_store(MemoryStore::shared(), default_ttl)
    }

    /// Creates an in-memory cache using the configured TTL.
    pub fn from_config(config: &ArtifactConfig) -> Self {
        Self::new(config.ttl())
    }

    /// Creates a cache on top of an existing store.
    pub fn with_store(entries: Arc<dyn KeyValueStore<CacheEntry<V>>>, default_ttl: Duration) -> Self {
        Self {
            entries,
            default_ttl,
        }
    }

    /// The value under `key`, unless it is missing or expired.
    pub async fn get(&self, key: &str) -> Option<V> {
        let entry = self.entries.get(key).await?;
        if entry.expires_at <= Instant::now() {
            self.entries.delete(key).await;
            return None;
        }

        Some(entry.value)
    }

    /// Stores `value` under `key` for `ttl`, or the default TTL.
    pub async fn set(&self, key: &str, value: V, ttl: Option<Duration>) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl.unwrap_or(self.default_ttl),
        };
        self.entries.set(key, entry).await;
    }

    /// Returns the cached value under `key`, or generates, stores and returns a fresh one.
    ///
    /// `generate` is not called when an unexpired value exists. A failed generation leaves
    /// the cache untouched.
    pub async fn get_or_generate<F, Fut>(
        &self,
        key: &str,
        generate: F,
        ttl: Option<Duration>,
    ) -> FleetResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FleetResult<V>>,
    {
        if let Some(value) = self.get(key).await {
            tracing::trace!(key, "artifact cache hit");
            return Ok(value);
        }

        tracing::debug!(key, "artifact cache miss");
        let value = generate().await?;
        self.set(key, value.clone(), ttl).await;

        Ok(value)
    }

    /// Removes `key`, returning whether it was present.
    pub async fn delete(&self, key: &str) -> bool {
        self.entries.delete(key).await
    }

    /// Removes every entry.
    pub async fn clear(&self) {
        self.entries.clear().await;
    }

    /// The number of live entries. Expired entries are evicted first.
    pub async fn size(&self) -> usize {
        let now = Instant::now();
        let mut live = 0;

        for key in self.entries.keys().await {
            match self.entries.get(&key).await {
                Some(entry) if entry.expires_at > now => live += 1,
                Some(_) => {
                    self.entries.delete(&key).await;
                }
                None => {}
            }
        }

        live
    }
}

impl ArtifactCache<QrArtifact> {
    /// The connection code for `url`, cached under `key`.
    pub async fn connection_code(
        &self,
        key: &str,
        url: &str,
        options: &QrOptions,
    ) -> FleetResult<QrArtifact> {
        self.get_or_generate(key, move || async move { generate_qr_code(url, options) }, None)
            .await
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::time;

    use super::*;

    const HOUR: Duration = Duration::from_secs(60 * 60);

    #[tokio::test(start_paused = true)]
    async fn test_get_or_generate_calls_generator_once_within_ttl() -> anyhow::Result<()> {
        let cache = ArtifactCache::<String>::new(HOUR);
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let generate = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok("code".to_string())
        };

        assert_eq!(cache.get_or_generate("task-1", generate, None).await?, "code");
        assert_eq!(cache.get_or_generate("task-1", generate, None).await?, "code");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        time::advance(HOUR).await;
        assert_eq!(cache.get_or_generate("task-1", generate, None).await?, "code");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_evicted_lazily() {
        let cache = ArtifactCache::<u32>::new(HOUR);
        cache.set("short", 1, Some(Duration::from_secs(10))).await;
        cache.set("long", 2, None).await;
        assert_eq!(cache.size().await, 2);

        time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.get("short").await, None);
        assert_eq!(cache.get("long").await, Some(2));

        cache.set("other", 3, Some(Duration::from_secs(10))).await;
        time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.size().await, 1);

        assert!(cache.delete("long").await);
        assert_eq!(cache.size().await, 0);
    }

    #[tokio::test]
    async fn test_failed_generation_is_not_cached() {
        let cache = ArtifactCache::<String>::new(HOUR);
        let result = cache
            .get_or_generate(
                "task-1",
                || async { Err(crate::FleetError::Artifact("boom".into())) },
                None,
            )
            .await;
        assert!(result.is_err());
        assert_eq!(cache.size().await, 0);

        cache.set("task-1", "code".to_string(), None).await;
        cache.clear().await;
        assert_eq!(cache.get("task-1").await, None);
    }

    #[tokio::test]
    async fn test_connection_code_is_cached_per_key() -> anyhow::Result<()> {
        let cache = ArtifactCache::<QrArtifact>::new(HOUR);
        let options = QrOptions::default();

        let first = cache
            .connection_code("task-1", "https://metro.example.com", &options)
            .await?;
        let second = cache
            .connection_code("task-1", "https://metro.example.com", &options)
            .await?;
        assert_eq!(first.generated_at, second.generated_at);
        assert_eq!(first.data, second.data);

        Ok(())
    }
}
