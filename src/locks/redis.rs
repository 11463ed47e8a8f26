//! Redis locks: `SET NX PX` to grab, Lua compare-and-delete to release.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

use super::{new_token, Locker, LOCK_RETRY_INTERVAL};
use crate::error::MailroomResult;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

#[derive(Clone)]
pub struct RedisLocker {
    connection_manager: redis::aio::ConnectionManager,
    release_script: redis::Script,
    extend_script: redis::Script,
}

impl std::fmt::Debug for RedisLocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLocker")
            .field("connection_manager", &"ConnectionManager")
            .finish()
    }
}

impl RedisLocker {
    pub fn new(connection_manager: redis::aio::ConnectionManager) -> Self {
        Self {
            connection_manager,
            release_script: redis::Script::new(RELEASE_SCRIPT),
            extend_script: redis::Script::new(EXTEND_SCRIPT),
        }
    }

    async fn try_set(&self, key: &str, token: &str, expiration: Duration) -> MailroomResult<bool> {
        let mut conn = self.connection_manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(expiration.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }
}

#[async_trait]
impl Locker for RedisLocker {
    async fn grab(
        &self,
        key: &str,
        expiration: Duration,
        wait: Duration,
    ) -> MailroomResult<Option<String>> {
        let token = new_token();
        let deadline = Instant::now() + wait;

        loop {
            if self.try_set(key, &token, expiration).await? {
                return Ok(Some(token));
            }
            if Instant::now() + LOCK_RETRY_INTERVAL > deadline {
                return Ok(None);
            }
            tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
        }
    }

    async fn release(&self, key: &str, token: &str) -> MailroomResult<()> {
        let mut conn = self.connection_manager.clone();
        let _: i64 = self
            .release_script
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn extend(&self, key: &str, token: &str, expiration: Duration) -> MailroomResult<bool> {
        let mut conn = self.connection_manager.clone();
        let extended: i64 = self
            .extend_script
            .key(key)
            .arg(token)
            .arg(expiration.as_millis().max(1) as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn is_locked(&self, key: &str) -> MailroomResult<bool> {
        let mut conn = self.connection_manager.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(exists)
    }
}
