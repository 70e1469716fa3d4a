//! Redis state store for the session guard
//!
//! This module provides the Redis connection and implements [`StateStore`] on
//! top of it. Multi-key and read-modify-write operations run as Lua scripts
//! so they execute atomically on the server.

use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, Client, Script, aio::ConnectionManager};
use tracing::info;

use crate::error::{StoreError, StoreResult};
use crate::store::StateStore;

/// Swap the value only if it still matches, keeping the current TTL
const COMPARE_AND_SWAP: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == ARGV[1] then
  redis.call('SET', KEYS[1], ARGV[2], 'KEEPTTL')
  return 1
end
return 0
"#;

/// Write the record and register it in the index in one step
const INSERT_INDEXED: &str = r#"
redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
redis.call('SADD', KEYS[2], ARGV[3])
local ttl = redis.call('TTL', KEYS[2])
if ttl < tonumber(ARGV[2]) then
  redis.call('EXPIRE', KEYS[2], ARGV[2])
end
return 1
"#;

const SCAN_BATCH: usize = 200;

/// Configuration for Redis connection
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    pub url: String,
    /// How long to wait for the initial connection
    pub connect_timeout_ms: u64,
}

impl RedisConfig {
    /// Create a new RedisConfig from environment variables
    ///
    /// # Environment Variables
    /// - `REDIS_URL`: Redis connection URL (default: "redis://localhost:6379")
    /// - `REDIS_CONNECT_TIMEOUT_MS`: Initial connection timeout (default: 2000)
    pub fn from_env() -> StoreResult<Self> {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let connect_timeout_ms = std::env::var("REDIS_CONNECT_TIMEOUT_MS")
            .unwrap_or_else(|_| "2000".to_string())
            .parse()
            .map_err(|e| {
                StoreError::Configuration(format!("Invalid REDIS_CONNECT_TIMEOUT_MS: {}", e))
            })?;

        Ok(RedisConfig {
            url,
            connect_timeout_ms,
        })
    }
}

/// Shared Redis connection
///
/// Cloning is cheap; clones share one multiplexed, auto-reconnecting
/// connection.
#[derive(Clone)]
pub struct RedisPool {
    manager: ConnectionManager,
    compare_and_swap: Script,
    insert_indexed: Script,
}

impl RedisPool {
    /// Connect to Redis, failing if the server is not reachable in time
    pub async fn new(config: &RedisConfig) -> StoreResult<Self> {
        let client = Client::open(config.url.clone())
            .map_err(|e| StoreError::Configuration(format!("Invalid Redis URL: {}", e)))?;

        let manager = tokio::time::timeout(
            Duration::from_millis(config.connect_timeout_ms),
            ConnectionManager::new(client),
        )
        .await
        .map_err(|_| StoreError::Timeout(config.connect_timeout_ms))?
        .map_err(StoreError::Connection)?;

        info!("Redis connection established to {}", config.url);

        Ok(RedisPool {
            manager,
            compare_and_swap: Script::new(COMPARE_AND_SWAP),
            insert_indexed: Script::new(INSERT_INDEXED),
        })
    }

    fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl StateStore for RedisPool {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.connection();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.connection();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> StoreResult<()> {
        let mut conn = self.connection();
        let _: () = conn.set_ex(key, value, ttl_seconds).await?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> StoreResult<bool> {
        let mut conn = self.connection();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn compare_and_swap(&self, key: &str, expected: &str, new: &str) -> StoreResult<bool> {
        let mut conn = self.connection();
        let swapped: i64 = self
            .compare_and_swap
            .key(key)
            .arg(expected)
            .arg(new)
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn insert_indexed(
        &self,
        record_key: &str,
        value: &str,
        ttl_seconds: u64,
        index_key: &str,
        member: &str,
    ) -> StoreResult<()> {
        let mut conn = self.connection();
        let _: i64 = self
            .insert_indexed
            .key(record_key)
            .key(index_key)
            .arg(value)
            .arg(ttl_seconds)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn members(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.connection();
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn remove_member(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.connection();
        let _: i64 = conn.srem(key, member).await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<u64>> {
        let mut conn = self.connection();
        let ttl: i64 = conn.ttl(key).await?;
        // -2: missing, -1: no expiry
        Ok(u64::try_from(ttl).ok())
    }

    async fn scan_keys(&self, pattern: &str, limit: usize) -> StoreResult<Vec<String>> {
        let mut conn = self.connection();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            keys.extend(batch);
            if keys.len() >= limit {
                keys.truncate(limit);
                break;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(keys)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.connection();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Configuration(format!(
                "Unexpected PING reply: {}",
                pong
            )))
        }
    }
}
