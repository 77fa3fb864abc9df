use anyhow::Result;
use async_trait::async_trait;

pub mod memory;
pub mod postgres;
pub mod redis_store;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use redis_store::RedisStore;

/// Flat key-value system of record. Values are JSON documents; keys are the
/// hierarchical strings built by `nimbus_common::keys`.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Every `(key, value)` whose key starts with `prefix`, sorted by key.
    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    /// Write `value` only if the current value equals `expected`
    /// (`None` = key must be absent). Returns whether the write happened.
    async fn compare_and_swap(&self, key: &str, expected: Option<&str>, value: &str)
        -> Result<bool>;
}
