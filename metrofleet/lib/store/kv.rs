use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::RwLock;

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// A key-value map shared by concurrent tasks.
#[async_trait]
pub trait KeyValueStore<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    /// Gets the value stored under `key`.
    async fn get(&self, key: &str) -> Option<V>;

    /// Stores `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: V);

    /// Removes `key`, returning whether it was present.
    async fn delete(&self, key: &str) -> bool;

    /// Every key currently stored.
    async fn keys(&self) -> Vec<String>;

    /// Removes every entry.
    async fn clear(&self);
}

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An in-process [`KeyValueStore`].
#[derive(Debug)]
pub struct MemoryStore<V> {
    entries: RwLock<HashMap<String, V>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<V> MemoryStore<V> {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Creates an empty store ready to be shared.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl<V> Default for MemoryStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<V> KeyValueStore<V> for MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Option<V> {
        self.entries.read().await.get(key).cloned()
    }

    async fn set(&self, key: &str, value: V) {
        self.entries.write().await.insert(key.to_string(), value);
    }

    async fn delete(&self, key: &str) -> bool {
        self.entries.write().await.remove(key).is_some()
    }

    async fn keys(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_basic_operations() {
        let store = MemoryStore::<u32>::new();
        assert_eq!(store.get("a").await, None);

        store.set("a", 1).await;
        store.set("b", 2).await;
        store.set("a", 3).await;
        assert_eq!(store.get("a").await, Some(3));

        let mut keys = store.keys().await;
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);

        assert!(store.delete("a").await);
        assert!(!store.delete("a").await);

        store.clear().await;
        assert!(store.keys().await.is_empty());
    }
}
