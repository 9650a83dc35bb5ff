//! Ephemeral in-process storage backends.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::collections::HashSet;
use std::sync::Mutex;

use super::{DedupKey, OutboxItem, OutboxStorage, PostStore};
use crate::Error;

/// In-memory dedup store. State is lost on restart, so every run starts
/// with first-run suppression.
#[derive(Default)]
pub struct MemoryPostStore {
    data: Mutex<FxHashMap<String, HashSet<String>>>,
}

impl MemoryPostStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PostStore for MemoryPostStore {
    async fn has_any(&self, key: &DedupKey) -> Result<bool, Error> {
        let data = self.data.lock().map_err(|_| Error::UnableToSecureLock)?;
        Ok(data.get(&key.to_string()).is_some_and(|ids| !ids.is_empty()))
    }

    async fn is_processed(&self, key: &DedupKey, post_id: &str) -> Result<bool, Error> {
        let data = self.data.lock().map_err(|_| Error::UnableToSecureLock)?;
        Ok(data
            .get(&key.to_string())
            .is_some_and(|ids| ids.contains(post_id)))
    }

    async fn mark_processed(&self, key: &DedupKey, post_ids: &[String]) -> Result<(), Error> {
        let mut data = self.data.lock().map_err(|_| Error::UnableToSecureLock)?;
        let ids = data.entry(key.to_string()).or_default();
        ids.extend(post_ids.iter().cloned());
        Ok(())
    }
}

#[derive(Default)]
struct MemoryOutboxState {
    queue: Vec<OutboxItem>,
    in_progress: FxHashMap<String, i64>,
}

/// In-memory outbox storage. FIFO by insertion order; claims are tracked in
/// a side map keyed by item id.
#[derive(Default)]
pub struct MemoryOutboxStorage {
    state: Mutex<MemoryOutboxState>,
}

impl MemoryOutboxStorage {
    /// Creates an empty outbox.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutboxStorage for MemoryOutboxStorage {
    async fn put(&self, item: &OutboxItem, _now: i64) -> Result<(), Error> {
        let mut state = self.state.lock().map_err(|_| Error::UnableToSecureLock)?;
        state.queue.push(item.clone());
        Ok(())
    }

    async fn get(&self, now: i64) -> Result<Option<OutboxItem>, Error> {
        let mut state = self.state.lock().map_err(|_| Error::UnableToSecureLock)?;
        let claimed = state
            .queue
            .iter()
            .find(|item| !state.in_progress.contains_key(&item.id))
            .cloned();
        if let Some(item) = &claimed {
            let _ = state.in_progress.insert(item.id.clone(), now);
        }
        Ok(claimed)
    }

    async fn get_dead_letter(&self, now: i64, delta: i64) -> Result<Option<OutboxItem>, Error> {
        let state = self.state.lock().map_err(|_| Error::UnableToSecureLock)?;
        let mut claims: Vec<(&String, &i64)> = state.in_progress.iter().collect();
        claims.sort_by_key(|(_, at)| **at);
        match claims.first() {
            Some((id, at)) if now - **at >= delta => {
                let item = state
                    .queue
                    .iter()
                    .find(|item| &item.id == *id)
                    .cloned()
                    .ok_or_else(|| {
                        Error::Storage(format!("in-progress item {id} not found in the queue"))
                    })?;
                Ok(Some(item))
            }
            _ => Ok(None),
        }
    }

    async fn commit(&self, id: &str) -> Result<(), Error> {
        let mut state = self.state.lock().map_err(|_| Error::UnableToSecureLock)?;
        if let Some(pos) = state.queue.iter().position(|item| item.id == id) {
            let _ = state.queue.remove(pos);
        }
        let _ = state.in_progress.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mark_and_check_posts() {
        let sut = MemoryPostStore::new();
        let key = DedupKey::new("src", "console");

        assert!(!sut.has_any(&key).await.unwrap());
        assert!(!sut.is_processed(&key, "mypost").await.unwrap());

        sut.mark_processed(&key, &["mypost".to_string()]).await.unwrap();

        assert!(sut.has_any(&key).await.unwrap());
        assert!(sut.is_processed(&key, "mypost").await.unwrap());
    }

    #[tokio::test]
    async fn has_any_operates_only_on_passed_key() {
        let sut = MemoryPostStore::new();
        sut.mark_processed(&DedupKey::new("src", "console"), &["mypost".to_string()])
            .await
            .unwrap();

        assert!(!sut.has_any(&DedupKey::new("other", "console")).await.unwrap());
    }

    #[tokio::test]
    async fn mark_processed_is_idempotent() {
        let sut = MemoryPostStore::new();
        let key = DedupKey::new("src", "console");
        let ids = vec!["a".to_string(), "a".to_string(), "b".to_string()];

        sut.mark_processed(&key, &ids).await.unwrap();
        sut.mark_processed(&key, &ids).await.unwrap();

        assert!(sut.is_processed(&key, "a").await.unwrap());
        assert!(sut.is_processed(&key, "b").await.unwrap());
        assert!(!sut.is_processed(&key, "c").await.unwrap());
    }
}
