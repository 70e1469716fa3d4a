//! Common library for the session guard
//!
//! This crate provides the shared state store that every stateless service
//! instance talks to: the [`store::StateStore`] contract, its Redis and
//! in-process implementations, the error type, and an injectable clock.

pub mod cache;
pub mod clock;
pub mod error;
pub mod memory;
pub mod store;

pub use cache::{RedisConfig, RedisPool};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use store::StateStore;

/// Example usage of the Redis store
///
/// ```rust,no_run
/// use common::{RedisConfig, RedisPool, StateStore};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = RedisConfig::from_env()?;
///     let pool = RedisPool::new(&config).await?;
///     pool.ping().await?;
///     pool.set_ex("greeting", "hello", 30).await?;
///     Ok(())
/// }
/// ```
pub fn example_usage() {}
