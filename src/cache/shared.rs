//! The shared cache tier: a key/value store reachable by every cooperating
//! process. Production deployments use redis; [`MemoryTier`] serves tests and
//! several consumers living inside one process.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::models::errors::CacheError;

#[async_trait]
pub trait SharedTier: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Creates `key` only if it does not exist yet. Returns whether it was created.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// Appends to a capped list, keeping the newest `max_len` entries.
    async fn append(&self, key: &str, entry: &str, max_len: usize) -> Result<(), CacheError>;
}

#[derive(Default)]
struct MemoryState {
    values: HashMap<String, (String, Instant)>,
    lists: HashMap<String, VecDeque<String>>,
}

/// In-process shared tier with TTL expiry on read.
#[derive(Default)]
pub struct MemoryTier {
    state: Mutex<MemoryState>,
}

impl MemoryTier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self, key: &str) -> Vec<String> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SharedTier for MemoryTier {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let entry = state
            .values
            .get(key)
            .map(|(value, expires_at)| (value.clone(), *expires_at));

        match entry {
            Some((_, expires_at)) if expires_at <= Instant::now() => {
                state.values.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value)),
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .values
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();

        let occupied = matches!(state.values.get(key), Some((_, expires_at)) if *expires_at > now);
        if occupied {
            return Ok(false);
        }

        state
            .values
            .insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(true)
    }

    async fn append(&self, key: &str, entry: &str, max_len: usize) -> Result<(), CacheError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let list = state.lists.entry(key.to_string()).or_default();

        list.push_front(entry.to_string());
        list.truncate(max_len);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_memory_tier_expiry() {
        let tier = MemoryTier::new();
        tier.set_ex("k", "v", Duration::from_secs(1)).await.unwrap();
        assert_eq!(tier.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert_eq!(tier.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_tier_set_nx_respects_ttl() {
        let tier = MemoryTier::new();
        let ttl = Duration::from_secs(5);

        assert!(tier.set_nx_ex("lock", "a", ttl).await.unwrap());
        assert!(!tier.set_nx_ex("lock", "b", ttl).await.unwrap());

        tokio::time::advance(ttl).await;
        assert!(tier.set_nx_ex("lock", "c", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_tier_append_caps_list() {
        let tier = MemoryTier::new();
        for i in 0..5 {
            tier.append("events", &i.to_string(), 3).await.unwrap();
        }
        assert_eq!(tier.list("events"), vec!["4", "3", "2"]);
    }
}
