//! In-process state store
//!
//! Mirrors the Redis semantics the session guard relies on (per-key TTL,
//! TTL-preserving compare-and-swap, atomic record + index insertion) behind a
//! single mutex. Expiry is evaluated lazily against the injected [`Clock`].
//! Useful for tests and single-node development; it is not shared between
//! processes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::clock::{Clock, SystemClock};
use crate::error::StoreResult;
use crate::store::{StateStore, glob_matches};

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<i64>,
}

impl Entry {
    fn is_live(&self, now: i64) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// Mutex-guarded map store
#[derive(Clone)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    /// Number of live keys
    pub async fn len(&self) -> usize {
        let now = self.clock.now();
        let entries = self.entries.lock().await;
        entries.values().filter(|e| e.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Overwrite a raw value keeping its TTL, bypassing any checks
    pub async fn put_raw(&self, key: &str, value: &str) {
        let mut entries = self.entries.lock().await;
        let expires_at = entries.get(key).and_then(|e| e.expires_at);
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at,
            },
        );
    }
}

fn purge_expired(entries: &mut HashMap<String, Entry>, key: &str, now: i64) {
    if entries.get(key).is_some_and(|e| !e.is_live(now)) {
        entries.remove(key);
    }
}

fn deadline(now: i64, ttl_seconds: u64) -> i64 {
    now.saturating_add(i64::try_from(ttl_seconds).unwrap_or(i64::MAX))
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, key, now);
        Ok(match entries.get(key) {
            Some(Entry {
                value: Value::Text(v),
                ..
            }) => Some(v.clone()),
            _ => None,
        })
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, key, now);
        Ok(entries.contains_key(key))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> StoreResult<()> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: Some(deadline(now, ttl_seconds)),
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> StoreResult<bool> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, key, now);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: Some(deadline(now, ttl_seconds)),
            },
        );
        Ok(true)
    }

    async fn compare_and_swap(&self, key: &str, expected: &str, new: &str) -> StoreResult<bool> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, key, now);
        match entries.get_mut(key) {
            Some(Entry {
                value: Value::Text(current),
                ..
            }) if current == expected => {
                *current = new.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_indexed(
        &self,
        record_key: &str,
        value: &str,
        ttl_seconds: u64,
        index_key: &str,
        member: &str,
    ) -> StoreResult<()> {
        let now = self.clock.now();
        let record_deadline = deadline(now, ttl_seconds);
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, index_key, now);

        entries.insert(
            record_key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: Some(record_deadline),
            },
        );

        let index = entries.entry(index_key.to_string()).or_insert(Entry {
            value: Value::Set(HashSet::new()),
            expires_at: Some(record_deadline),
        });
        if !matches!(index.value, Value::Set(_)) {
            index.value = Value::Set(HashSet::new());
        }
        if let Value::Set(set) = &mut index.value {
            set.insert(member.to_string());
        }
        if index.expires_at.is_some_and(|at| at < record_deadline) {
            index.expires_at = Some(record_deadline);
        }
        Ok(())
    }

    async fn members(&self, key: &str) -> StoreResult<Vec<String>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, key, now);
        Ok(match entries.get(key) {
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => set.iter().cloned().collect(),
            _ => Vec::new(),
        })
    }

    async fn remove_member(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut entries = self.entries.lock().await;
        let now_empty = match entries.get_mut(key) {
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => {
                set.remove(member);
                set.is_empty()
            }
            _ => false,
        };
        // Redis drops empty sets
        if now_empty {
            entries.remove(key);
        }
        Ok(())
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<u64>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries, key, now);
        Ok(entries
            .get(key)
            .and_then(|e| e.expires_at)
            .and_then(|at| u64::try_from(at - now).ok()))
    }

    async fn scan_keys(&self, pattern: &str, limit: usize) -> StoreResult<Vec<String>> {
        let now = self.clock.now();
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .filter(|(k, e)| e.is_live(now) && glob_matches(pattern, k))
            .map(|(k, _)| k.clone())
            .take(limit)
            .collect())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (MemoryStore, ManualClock) {
        let clock = ManualClock::new(1_700_000_000);
        (MemoryStore::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn keys_expire_with_the_clock() -> StoreResult<()> {
        let (store, clock) = store();
        store.set_ex("k", "v", 10).await?;
        assert_eq!(store.ttl("k").await?, Some(10));

        clock.advance(9);
        assert!(store.exists("k").await?);

        clock.advance(1);
        assert!(!store.exists("k").await?);
        assert_eq!(store.get("k").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn compare_and_swap_preserves_ttl() -> StoreResult<()> {
        let (store, clock) = store();
        store.set_ex("k", "a", 100).await?;
        clock.advance(40);

        assert!(store.compare_and_swap("k", "a", "b").await?);
        assert!(!store.compare_and_swap("k", "a", "c").await?);
        assert_eq!(store.get("k").await?.as_deref(), Some("b"));
        assert_eq!(store.ttl("k").await?, Some(60));
        Ok(())
    }

    #[tokio::test]
    async fn set_nx_only_writes_once() -> StoreResult<()> {
        let (store, clock) = store();
        assert!(store.set_nx_ex("k", "1", 5).await?);
        assert!(!store.set_nx_ex("k", "2", 5).await?);

        clock.advance(5);
        assert!(store.set_nx_ex("k", "3", 5).await?);
        assert_eq!(store.get("k").await?.as_deref(), Some("3"));
        Ok(())
    }

    #[tokio::test]
    async fn index_outlives_its_records() -> StoreResult<()> {
        let (store, clock) = store();
        store.insert_indexed("r:1", "a", 100, "idx", "1").await?;
        store.insert_indexed("r:2", "b", 10, "idx", "2").await?;
        assert_eq!(store.ttl("idx").await?, Some(100));

        clock.advance(50);
        let mut members = store.members("idx").await?;
        members.sort();
        assert_eq!(members, vec!["1", "2"]);
        assert!(!store.exists("r:2").await?);

        store.remove_member("idx", "2").await?;
        store.remove_member("idx", "1").await?;
        assert!(!store.exists("idx").await?);
        Ok(())
    }

    #[tokio::test]
    async fn scan_respects_pattern_and_limit() -> StoreResult<()> {
        let (store, _) = store();
        for i in 0..5 {
            store.set_ex(&format!("session:{}", i), "x", 60).await?;
        }
        store.set_ex("blacklist:a", "x", 60).await?;

        assert_eq!(store.scan_keys("session:*", 100).await?.len(), 5);
        assert_eq!(store.scan_keys("session:*", 3).await?.len(), 3);
        assert_eq!(store.scan_keys("blacklist:*", 100).await?.len(), 1);
        Ok(())
    }
}
