//! In-process directory backed by a bounded LRU cache

use super::{check_add, check_key, Directory, StatusInfo, StoreError};
use async_trait::async_trait;
use beacon_core::crypto::key_hash;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::time::Instant;

/// Default number of keys held before the least recently used is evicted
pub const DEFAULT_CAPACITY: usize = 100_000;

/// Default lifetime of a key record after its last write
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(15 * 60);

struct ValueEntry {
    value: String,
    /// Per-key insertion counter
    token: u64,
    expires_at: Instant,
}

struct KeyRecord {
    values: Vec<ValueEntry>,
    next_token: u64,
    expires_at: Instant,
}

impl KeyRecord {
    fn new(now: Instant) -> Self {
        Self {
            values: Vec::new(),
            next_token: 1,
            expires_at: now,
        }
    }

    fn purge(&mut self, now: Instant) {
        self.values.retain(|entry| entry.expires_at > now);
    }

    /// Keep the record at least until `at`; never shortened
    fn extend(&mut self, at: Instant) {
        self.expires_at = self.expires_at.max(at);
    }
}

/// Directory held in memory; one lock serialises every operation
pub struct MemoryDirectory {
    domain: String,
    capacity: usize,
    idle_ttl: Duration,
    cache: Mutex<LruCache<String, KeyRecord>>,
}

impl MemoryDirectory {
    pub fn new(domain: &str, capacity: usize, idle_ttl: Duration) -> Self {
        let capacity = capacity.max(1);
        let slots = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            domain: domain.to_string(),
            capacity,
            idle_ttl,
            cache: Mutex::new(LruCache::new(slots)),
        }
    }
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new("beacon", DEFAULT_CAPACITY, DEFAULT_IDLE_TTL)
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn status(&self) -> Result<StatusInfo, StoreError> {
        let keys = self.cache.lock().len();
        let mut info = StatusInfo::default();
        let keyspace = info.section("keyspace");
        keyspace.insert("keys".into(), keys.to_string());
        keyspace.insert("capacity".into(), self.capacity.to_string());
        info.section("server")
            .insert("backend".into(), "memory".into());
        Ok(info)
    }

    async fn list(&self, key: &str) -> Result<Vec<String>, StoreError> {
        check_key(key)?;
        let hash = key_hash(&self.domain, key);
        let now = Instant::now();

        let mut cache = self.cache.lock();
        let Some(record) = cache.get_mut(&hash) else {
            return Ok(Vec::new());
        };
        if record.expires_at <= now {
            cache.pop(&hash);
            return Ok(Vec::new());
        }

        record.purge(now);
        let mut live: Vec<(u64, String)> = record
            .values
            .iter()
            .map(|entry| (entry.token, entry.value.clone()))
            .collect();
        if live.is_empty() {
            cache.pop(&hash);
        }

        live.sort_by_key(|(token, _)| *token);
        Ok(live.into_iter().map(|(_, value)| value).collect())
    }

    async fn add(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        check_add(key, value, ttl)?;
        let hash = key_hash(&self.domain, key);
        let now = Instant::now();

        let mut cache = self.cache.lock();
        if cache.peek(&hash).map_or(false, |record| record.expires_at <= now) {
            cache.pop(&hash);
        }
        let record = cache.get_or_insert_mut(hash, || KeyRecord::new(now));

        record.purge(now);
        let expires_at = now + ttl;
        match record.values.iter_mut().find(|entry| entry.value == value) {
            Some(entry) => entry.expires_at = expires_at,
            None => {
                let token = record.next_token;
                record.next_token += 1;
                record.values.push(ValueEntry {
                    value: value.to_string(),
                    token,
                    expires_at,
                });
            }
        }
        record.extend(now + self.idle_ttl.max(ttl));
        Ok(())
    }

    async fn remove(&self, key: &str, value: &str) -> Result<(), StoreError> {
        check_key(key)?;
        let hash = key_hash(&self.domain, key);
        let now = Instant::now();

        let mut cache = self.cache.lock();
        let Some(record) = cache.get_mut(&hash) else {
            return Ok(());
        };
        record.purge(now);
        record.values.retain(|entry| entry.value != value);
        record.extend(now + self.idle_ttl);
        if record.values.is_empty() {
            cache.pop(&hash);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    fn directory() -> MemoryDirectory {
        MemoryDirectory::new("test", 16, DEFAULT_IDLE_TTL)
    }

    #[tokio::test]
    async fn test_add_list_remove() {
        let dir = directory();
        dir.add("room", "a", TTL).await.unwrap();
        dir.add("room", "b", TTL).await.unwrap();
        assert_eq!(dir.list("room").await.unwrap(), vec!["a", "b"]);

        dir.remove("room", "a").await.unwrap();
        assert_eq!(dir.list("room").await.unwrap(), vec!["b"]);
        assert!(dir.list("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_add_keeps_position() {
        let dir = directory();
        dir.add("room", "a", TTL).await.unwrap();
        dir.add("room", "b", TTL).await.unwrap();
        dir.add("room", "a", TTL).await.unwrap();
        assert_eq!(dir.list("room").await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_invalid_arguments_have_no_effect() {
        let dir = directory();
        assert!(matches!(dir.add("", "v", TTL).await, Err(StoreError::InvalidArgs)));
        assert!(matches!(dir.add("k", "", TTL).await, Err(StoreError::InvalidArgs)));
        assert!(matches!(
            dir.add("k", "v", Duration::from_millis(500)).await,
            Err(StoreError::InvalidArgs)
        ));
        assert!(matches!(dir.list("").await, Err(StoreError::InvalidArgs)));
        assert!(matches!(dir.remove("", "v").await, Err(StoreError::InvalidArgs)));
        assert!(dir.list("k").await.unwrap().is_empty());
        assert_eq!(dir.cache.lock().len(), 0);
    }

    #[tokio::test]
    async fn test_remove_unknown_is_ok() {
        let dir = directory();
        dir.remove("missing", "v").await.unwrap();
        dir.add("room", "a", TTL).await.unwrap();
        dir.remove("room", "zzz").await.unwrap();
        assert_eq!(dir.list("room").await.unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_last_remove_drops_key() {
        let dir = directory();
        dir.add("room", "a", TTL).await.unwrap();
        dir.remove("room", "a").await.unwrap();
        assert_eq!(dir.cache.lock().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_values_expire() {
        let dir = directory();
        dir.add("room", "short", Duration::from_secs(15)).await.unwrap();
        dir.add("room", "long", Duration::from_secs(60)).await.unwrap();

        tokio::time::advance(Duration::from_secs(16)).await;
        assert_eq!(dir.list("room").await.unwrap(), vec!["long"]);

        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(dir.list("room").await.unwrap().is_empty());
        assert_eq!(dir.cache.lock().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_extends_expiry() {
        let dir = directory();
        dir.add("room", "a", Duration::from_secs(15)).await.unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        dir.add("room", "a", Duration::from_secs(15)).await.unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(dir.list("room").await.unwrap(), vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_value_readded_moves_last() {
        let dir = directory();
        dir.add("room", "a", Duration::from_secs(5)).await.unwrap();
        dir.add("room", "b", Duration::from_secs(60)).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        dir.add("room", "a", Duration::from_secs(60)).await.unwrap();
        assert_eq!(dir.list("room").await.unwrap(), vec!["b", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_outlives_its_values() {
        let dir = MemoryDirectory::new("test", 16, Duration::from_secs(1));
        dir.add("room", "a", Duration::from_secs(300)).await.unwrap();
        dir.remove("room", "unknown").await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(dir.list("room").await.unwrap(), vec!["a"]);

        dir.add("mixed", "long", Duration::from_secs(300)).await.unwrap();
        dir.add("mixed", "short", Duration::from_secs(15)).await.unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(dir.list("mixed").await.unwrap(), vec!["long"]);
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recent_key() {
        let dir = MemoryDirectory::new("test", 2, DEFAULT_IDLE_TTL);
        dir.add("k1", "v", TTL).await.unwrap();
        dir.add("k2", "v", TTL).await.unwrap();
        dir.list("k1").await.unwrap();
        dir.add("k3", "v", TTL).await.unwrap();

        assert_eq!(dir.list("k1").await.unwrap(), vec!["v"]);
        assert!(dir.list("k2").await.unwrap().is_empty());
        assert_eq!(dir.list("k3").await.unwrap(), vec!["v"]);
    }

    #[tokio::test]
    async fn test_status_counts_keys() {
        let dir = directory();
        dir.add("room", "a", TTL).await.unwrap();
        let status = dir.status().await.unwrap();
        assert_eq!(status.sections["keyspace"]["keys"], "1");
        assert_eq!(status.sections["keyspace"]["capacity"], "16");
    }
}
