//! In-process backend for single-node deployments and tests.
//!
//! Each primitive runs inside one `DashMap` shard lock, which gives the same
//! per-key atomicity a shared store provides. The expiry decision is taken under
//! that same lock. Expired keys are dropped lazily on access and by
//! [`MemoryBackend::purge_expired`].

use std::collections::{HashMap, HashSet};
use std::ops::DerefMut;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use super::backend::{CacheBackend, CacheError};

#[derive(Debug, Clone)]
enum Slot {
    Scalar(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct StoredValue {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(slot: Slot) -> Self {
        Self {
            slot,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: DashMap<String, StoredValue>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired key; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, value| !value.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(
                target = "murmur::cache::memory",
                removed, "Purged expired cache keys"
            );
        }
        removed
    }

    /// Number of live and not-yet-purged keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_if_expired(&self, key: &str) {
        let now = Instant::now();
        self.entries.remove_if(key, |_, value| value.is_expired(now));
    }

    /// Entry for a mutation; an expired value is replaced by `empty` under the
    /// same shard lock, so a deadline cannot pass between check and write.
    fn live_entry(
        &self,
        key: &str,
        empty: fn() -> Slot,
    ) -> impl DerefMut<Target = StoredValue> + '_ {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StoredValue::new(empty()));
        if entry.is_expired(now) {
            *entry = StoredValue::new(empty());
        }
        entry
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.evict_if_expired(key);
        let now = Instant::now();
        match self.entries.get(key) {
            None => Ok(None),
            Some(entry) if entry.is_expired(now) => Ok(None),
            Some(entry) => match &entry.slot {
                Slot::Scalar(value) => Ok(Some(value.clone())),
                _ => Err(CacheError::wrong_type(key)),
            },
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let stored = StoredValue {
            slot: Slot::Scalar(value.to_string()),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.entries.insert(key.to_string(), stored);
        Ok(())
    }

    async fn set_field(&self, key: &str, field: &str, value: &str) -> Result<(), CacheError> {
        let mut entry = self.live_entry(key, || Slot::Hash(HashMap::new()));
        match &mut entry.slot {
            Slot::Hash(fields) => {
                fields.insert(field.to_string(), value.to_string());
                Ok(())
            }
            _ => Err(CacheError::wrong_type(key)),
        }
    }

    async fn get_field(&self, key: &str, field: &str) -> Result<Option<String>, CacheError> {
        self.evict_if_expired(key);
        let now = Instant::now();
        match self.entries.get(key) {
            None => Ok(None),
            Some(entry) if entry.is_expired(now) => Ok(None),
            Some(entry) => match &entry.slot {
                Slot::Hash(fields) => Ok(fields.get(field).cloned()),
                _ => Err(CacheError::wrong_type(key)),
            },
        }
    }

    async fn get_all_fields(&self, key: &str) -> Result<HashMap<String, String>, CacheError> {
        self.evict_if_expired(key);
        let now = Instant::now();
        match self.entries.get(key) {
            None => Ok(HashMap::new()),
            Some(entry) if entry.is_expired(now) => Ok(HashMap::new()),
            Some(entry) => match &entry.slot {
                Slot::Hash(fields) => Ok(fields.clone()),
                _ => Err(CacheError::wrong_type(key)),
            },
        }
    }

    async fn delete_field(&self, key: &str, field: &str) -> Result<(), CacheError> {
        self.evict_if_expired(key);
        let now = Instant::now();
        let now_empty = match self.entries.get_mut(key) {
            None => return Ok(()),
            Some(entry) if entry.is_expired(now) => return Ok(()),
            Some(mut entry) => match &mut entry.slot {
                Slot::Hash(fields) => {
                    fields.remove(field);
                    fields.is_empty()
                }
                _ => return Err(CacheError::wrong_type(key)),
            },
        };

        // An empty hash stops existing, same as a shared store would report it.
        if now_empty {
            self.entries
                .remove_if(key, |_, value| matches!(&value.slot, Slot::Hash(f) if f.is_empty()));
        }
        Ok(())
    }

    async fn delete_key(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn increment(&self, key: &str) -> Result<i64, CacheError> {
        let mut entry = self.live_entry(key, || Slot::Scalar("0".to_string()));
        match &mut entry.slot {
            Slot::Scalar(raw) => {
                let current: i64 = raw
                    .parse()
                    .map_err(|_| CacheError::not_an_integer(key))?;
                let next = current
                    .checked_add(1)
                    .ok_or_else(|| CacheError::not_an_integer(key))?;
                *raw = next.to_string();
                Ok(next)
            }
            _ => Err(CacheError::wrong_type(key)),
        }
    }

    async fn add_to_set(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        let mut entry = self.live_entry(key, || Slot::Set(HashSet::new()));
        match &mut entry.slot {
            Slot::Set(members) => Ok(members.insert(member.to_string())),
            _ => Err(CacheError::wrong_type(key)),
        }
    }

    async fn expire_if_unset(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.evict_if_expired(key);
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                if entry.expires_at.is_some() {
                    return Ok(false);
                }
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn add_to_set_reports_only_the_first_insert() {
        let backend = MemoryBackend::new();

        assert!(backend.add_to_set("likes", "203.0.113.5").await.unwrap());
        assert!(!backend.add_to_set("likes", "203.0.113.5").await.unwrap());
        assert!(!backend.add_to_set("likes", "203.0.113.5").await.unwrap());
        assert!(backend.add_to_set("likes", "198.51.100.7").await.unwrap());

        backend.delete_key("likes").await.unwrap();
        assert!(backend.add_to_set("likes", "203.0.113.5").await.unwrap());
    }

    #[tokio::test]
    async fn increment_starts_from_zero() {
        let backend = MemoryBackend::new();

        assert_eq!(backend.increment("count").await.unwrap(), 1);
        assert_eq!(backend.increment("count").await.unwrap(), 2);
        assert_eq!(backend.get("count").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn increment_rejects_non_integer_scalars() {
        let backend = MemoryBackend::new();
        backend.set("count", "many", None).await.unwrap();

        let err = backend.increment("count").await.unwrap_err();
        assert_eq!(err, CacheError::not_an_integer("count"));
        assert!(!err.is_unavailable());
    }

    #[tokio::test]
    async fn structures_do_not_mix() {
        let backend = MemoryBackend::new();
        backend.set_field("presence", "conn-1", "{}").await.unwrap();

        assert!(matches!(
            backend.add_to_set("presence", "x").await,
            Err(CacheError::WrongType { .. })
        ));
        assert!(matches!(
            backend.increment("presence").await,
            Err(CacheError::WrongType { .. })
        ));
    }

    #[tokio::test]
    async fn hash_fields_overwrite_and_delete() {
        let backend = MemoryBackend::new();

        assert!(backend.get_all_fields("presence").await.unwrap().is_empty());
        assert_eq!(backend.get_field("presence", "a").await.unwrap(), None);

        backend.set_field("presence", "a", "1").await.unwrap();
        backend.set_field("presence", "a", "2").await.unwrap();
        backend.set_field("presence", "b", "3").await.unwrap();
        assert_eq!(
            backend.get_field("presence", "a").await.unwrap().as_deref(),
            Some("2")
        );

        backend.delete_field("presence", "missing").await.unwrap();
        backend.delete_field("presence", "a").await.unwrap();
        let fields = backend.get_all_fields("presence").await.unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields.get("b").map(String::as_str), Some("3"));

        backend.delete_field("presence", "b").await.unwrap();
        assert!(backend.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_is_anchored_at_first_ttl() {
        let backend = MemoryBackend::new();
        backend.add_to_set("dedup", "v1").await.unwrap();

        assert!(
            backend
                .expire_if_unset("dedup", Duration::from_secs(10))
                .await
                .unwrap()
        );
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(
            !backend
                .expire_if_unset("dedup", Duration::from_secs(10))
                .await
                .unwrap()
        );
        assert!(!backend.add_to_set("dedup", "v1").await.unwrap());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(backend.add_to_set("dedup", "v1").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_values_are_replaced_under_one_lock() {
        let backend = MemoryBackend::new();
        backend.add_to_set("dedup", "v1").await.unwrap();
        backend
            .expire_if_unset("dedup", Duration::from_secs(10))
            .await
            .unwrap();
        backend.increment("count").await.unwrap();
        backend
            .expire_if_unset("count", Duration::from_secs(10))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;

        // Go straight to the mutating path without a prior lazy eviction.
        {
            let entry = backend.live_entry("dedup", || Slot::Set(HashSet::new()));
            assert!(entry.expires_at.is_none());
            assert!(matches!(&entry.slot, Slot::Set(members) if members.is_empty()));
        }
        assert!(backend.add_to_set("dedup", "v1").await.unwrap());
        assert!(
            backend
                .expire_if_unset("dedup", Duration::from_secs(10))
                .await
                .unwrap()
        );
        assert_eq!(backend.increment("count").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_expired_drops_only_timed_out_keys() {
        let backend = MemoryBackend::new();
        backend
            .set("short", "1", Some(Duration::from_secs(1)))
            .await
            .unwrap();
        backend.set("forever", "1", None).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(backend.purge_expired(), 1);
        assert_eq!(backend.len(), 1);
        assert_eq!(backend.get("short").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expire_if_unset_ignores_absent_keys() {
        let backend = MemoryBackend::new();
        assert!(
            !backend
                .expire_if_unset("missing", Duration::from_secs(1))
                .await
                .unwrap()
        );
        assert!(backend.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_increments_are_not_lost() {
        let backend = Arc::new(MemoryBackend::new());
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..64 {
            let backend = backend.clone();
            tasks.spawn(async move { backend.increment("burst").await });
        }
        while let Some(result) = tasks.join_next().await {
            result.expect("task should not panic").unwrap();
        }

        assert_eq!(backend.get("burst").await.unwrap().as_deref(), Some("64"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_adds_of_one_member_have_one_winner() {
        let backend = Arc::new(MemoryBackend::new());
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..32 {
            let backend = backend.clone();
            tasks.spawn(async move { backend.add_to_set("dedup", "same").await });
        }

        let mut winners = 0;
        while let Some(result) = tasks.join_next().await {
            if result.expect("task should not panic").unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
