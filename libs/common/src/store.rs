//! Shared key/value state store
//!
//! Every application instance talks to the same store, so all multi-step
//! state transitions are expressed here as single atomic operations rather
//! than read-then-write sequences issued by the caller.

use async_trait::async_trait;

use crate::error::StoreResult;

/// A network-shared key/value store with per-key TTL and atomic primitives
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read a string value
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Whether the key exists (and has not expired)
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Write a value with a TTL in seconds
    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> StoreResult<()>;

    /// Write a value with a TTL only if the key is absent.
    ///
    /// Returns `true` if this call created the key.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> StoreResult<bool>;

    /// Replace `expected` with `new` iff the key currently holds `expected`.
    ///
    /// The key's remaining TTL is preserved. Returns `false` when the key is
    /// missing or holds a different value.
    async fn compare_and_swap(&self, key: &str, expected: &str, new: &str) -> StoreResult<bool>;

    /// Write a record and add `member` to the set at `index_key` as one unit.
    ///
    /// The record gets `ttl_seconds`; the index TTL is raised to at least
    /// `ttl_seconds` so it outlives every record it points at.
    async fn insert_indexed(
        &self,
        record_key: &str,
        value: &str,
        ttl_seconds: u64,
        index_key: &str,
        member: &str,
    ) -> StoreResult<()>;

    /// Members of the set at `key`
    async fn members(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Remove `member` from the set at `key`
    async fn remove_member(&self, key: &str, member: &str) -> StoreResult<()>;

    /// Remaining TTL in seconds, `None` if the key is missing or persistent
    async fn ttl(&self, key: &str) -> StoreResult<Option<u64>>;

    /// Keys matching a glob pattern, stopping after `limit` keys
    async fn scan_keys(&self, pattern: &str, limit: usize) -> StoreResult<Vec<String>>;

    /// Round-trip to the store
    async fn ping(&self) -> StoreResult<()>;
}

/// Match a store glob pattern supporting `*` wildcards only
pub fn glob_matches(pattern: &str, key: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return key.is_empty();
    };
    let Some(mut rest) = key.strip_prefix(first) else {
        return false;
    };
    let tail: Vec<&str> = parts.collect();
    let Some((last, middle)) = tail.split_last() else {
        return rest.is_empty();
    };
    for part in middle {
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}
