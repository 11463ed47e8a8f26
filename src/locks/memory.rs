//! In-process locks with the same expiry and token semantics as the Redis locks.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::{new_token, Locker, LOCK_RETRY_INTERVAL};
use crate::error::MailroomResult;

#[derive(Debug)]
struct Held {
    token: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
pub struct MemoryLocker {
    locks: Mutex<HashMap<String, Held>>,
}

impl MemoryLocker {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_take(&self, key: &str, token: &str, expiration: Duration) -> bool {
        let mut locks = self.locks.lock();
        let now = Instant::now();
        match locks.get(key) {
            Some(held) if held.expires_at > now => false,
            _ => {
                locks.insert(
                    key.to_string(),
                    Held {
                        token: token.to_string(),
                        expires_at: now + expiration,
                    },
                );
                true
            }
        }
    }
}

#[async_trait]
impl Locker for MemoryLocker {
    async fn grab(
        &self,
        key: &str,
        expiration: Duration,
        wait: Duration,
    ) -> MailroomResult<Option<String>> {
        let token = new_token();
        let deadline = Instant::now() + wait;

        loop {
            if self.try_take(key, &token, expiration) {
                return Ok(Some(token));
            }
            if Instant::now() + LOCK_RETRY_INTERVAL > deadline {
                return Ok(None);
            }
            tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
        }
    }

    async fn release(&self, key: &str, token: &str) -> MailroomResult<()> {
        let mut locks = self.locks.lock();
        if locks.get(key).is_some_and(|held| held.token == token) {
            locks.remove(key);
        }
        Ok(())
    }

    async fn extend(&self, key: &str, token: &str, expiration: Duration) -> MailroomResult<bool> {
        let mut locks = self.locks.lock();
        let now = Instant::now();
        match locks.get_mut(key) {
            Some(held) if held.token == token && held.expires_at > now => {
                held.expires_at = now + expiration;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_locked(&self, key: &str) -> MailroomResult<bool> {
        Ok(self
            .locks
            .lock()
            .get(key)
            .is_some_and(|held| held.expires_at > Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_grab_is_exclusive() {
        let locker = MemoryLocker::new();
        let token = locker.grab("lock:a", MINUTE, Duration::ZERO).await.unwrap();
        assert!(token.is_some());
        let second = locker.grab("lock:a", MINUTE, Duration::ZERO).await.unwrap();
        assert!(second.is_none());
        assert!(locker.is_locked("lock:a").await.unwrap());
    }

    #[tokio::test]
    async fn test_release_requires_token() {
        let locker = MemoryLocker::new();
        let token = locker
            .grab("lock:a", MINUTE, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        locker.release("lock:a", "not-the-token").await.unwrap();
        assert!(locker.is_locked("lock:a").await.unwrap());

        locker.release("lock:a", &token).await.unwrap();
        assert!(!locker.is_locked("lock:a").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken() {
        let locker = MemoryLocker::new();
        let first = locker
            .grab("lock:a", Duration::from_millis(20), Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let second = locker.grab("lock:a", MINUTE, Duration::ZERO).await.unwrap();
        assert!(second.is_some());
        assert!(!locker.extend("lock:a", &first, MINUTE).await.unwrap());

        // the stale holder must not be able to drop the new lock
        locker.release("lock:a", &first).await.unwrap();
        assert!(locker.is_locked("lock:a").await.unwrap());
    }

    #[tokio::test]
    async fn test_grab_waits_for_release() {
        let locker = std::sync::Arc::new(MemoryLocker::new());
        let token = locker
            .grab("lock:a", MINUTE, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        let releaser = locker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            releaser.release("lock:a", &token).await.unwrap();
        });

        let waited = locker
            .grab("lock:a", MINUTE, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(waited.is_some());
    }
}
