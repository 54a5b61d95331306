//! In-memory backends: useful for testing and ephemeral sessions.

use async_trait::async_trait;
use routewise_core::error::MemoryError;
use routewise_core::store::{LogStore, SessionStore};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// A session store kept in a sorted map.
/// Useful for testing and runs where persistence isn't needed.
#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    entries: Arc<RwLock<BTreeMap<String, String>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, MemoryError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<(), MemoryError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, MemoryError> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, MemoryError> {
        Ok(self
            .entries
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Append-only streams kept in memory.
#[derive(Clone, Default)]
pub struct InMemoryLogStore {
    streams: Arc<RwLock<HashMap<String, Vec<String>>>>,
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogStore for InMemoryLogStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn append(&self, stream: &str, record: String) -> Result<(), MemoryError> {
        self.streams
            .write()
            .await
            .entry(stream.to_string())
            .or_default()
            .push(record);
        Ok(())
    }

    async fn read_all(&self, stream: &str) -> Result<Vec<String>, MemoryError> {
        Ok(self
            .streams
            .read()
            .await
            .get(stream)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_and_retrieve() {
        let store = InMemorySessionStore::new();
        store.put("episode:s1", "data".into()).await.unwrap();
        assert_eq!(store.get("episode:s1").await.unwrap().as_deref(), Some("data"));
        assert!(store.get("episode:s2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clones_share_state() {
        let store = InMemorySessionStore::new();
        let other = store.clone();
        store.put("k", "v".into()).await.unwrap();
        assert_eq!(other.keys("").await.unwrap(), vec!["k"]);
        assert!(other.delete("k").await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn log_streams_are_independent() {
        let log = InMemoryLogStore::new();
        log.append("a", "1".into()).await.unwrap();
        log.append("b", "2".into()).await.unwrap();
        log.append("a", "3".into()).await.unwrap();
        assert_eq!(log.read_all("a").await.unwrap(), vec!["1", "3"]);
        assert_eq!(log.read_all("b").await.unwrap(), vec!["2"]);
        assert!(log.read_all("c").await.unwrap().is_empty());
    }
}
