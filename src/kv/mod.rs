//! # Key-Value Store
//!
//! The small slice of Redis the engine needs outside of its queues and locks:
//! hashes for cron statistics and the node ledger, sets for org bookkeeping and
//! capped sorted sets for recent campaign fires.
//!
//! Two providers implement [`KeyValueStore`]: [`RedisStore`] for deployments and
//! [`MemoryStore`] for single-process use and tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::MailroomResult;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::{connect, RedisStore};

#[async_trait]
pub trait KeyValueStore: Send + Sync + std::fmt::Debug {
    /// Check that the store is reachable
    async fn ping(&self) -> MailroomResult<()>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> MailroomResult<()>;

    async fn hget(&self, key: &str, field: &str) -> MailroomResult<Option<String>>;

    async fn hdel(&self, key: &str, field: &str) -> MailroomResult<()>;

    async fn hexists(&self, key: &str, field: &str) -> MailroomResult<bool>;

    async fn hgetall(&self, key: &str) -> MailroomResult<HashMap<String, String>>;

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> MailroomResult<i64>;

    async fn hincr_by_float(&self, key: &str, field: &str, delta: f64) -> MailroomResult<f64>;

    async fn sadd(&self, key: &str, member: &str) -> MailroomResult<()>;

    async fn srem(&self, key: &str, member: &str) -> MailroomResult<()>;

    async fn smembers(&self, key: &str) -> MailroomResult<Vec<String>>;

    /// Add a member to a sorted set, keep only the `cap` highest scored members and
    /// (re)set the key's expiration.
    async fn capped_zadd(
        &self,
        key: &str,
        member: &str,
        score: f64,
        cap: usize,
        expire: Duration,
    ) -> MailroomResult<()>;

    /// Members of a sorted set with their scores, lowest score first
    async fn zrange_with_scores(&self, key: &str) -> MailroomResult<Vec<(String, f64)>>;

    fn provider_name(&self) -> &'static str;
}
