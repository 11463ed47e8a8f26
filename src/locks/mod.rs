//! # Distributed Locks
//!
//! Expiring, token-guarded locks. Grabbing a lock stores a random token under the
//! lock key; only the holder of that token can release or extend it, so a holder
//! whose lock expired cannot release a lock that another process has since taken.
//!
//! Locks serialize work on a single contact (`lock:c:<org>:<contact>`), keep crons
//! to one instance (`lock:cron:<name>`) and guard long single-entity jobs.

use async_trait::async_trait;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tracing::warn;

use crate::error::MailroomResult;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryLocker;
pub use self::redis::RedisLocker;

/// Delay between attempts while waiting for a held lock
pub const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

#[async_trait]
pub trait Locker: Send + Sync + std::fmt::Debug {
    /// Try to take the lock, retrying until `wait` has passed. Returns the token of the
    /// acquired lock or `None` if it stayed held. A zero `wait` makes a single attempt.
    async fn grab(&self, key: &str, expiration: Duration, wait: Duration)
        -> MailroomResult<Option<String>>;

    /// Release the lock if it is still held with this token
    async fn release(&self, key: &str, token: &str) -> MailroomResult<()>;

    /// Push back the expiration of a lock still held with this token. Returns false if
    /// the lock was lost.
    async fn extend(&self, key: &str, token: &str, expiration: Duration) -> MailroomResult<bool>;

    async fn is_locked(&self, key: &str) -> MailroomResult<bool>;
}

/// New random lock token
pub fn new_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Run `f` while holding the lock, handing it the token so it can extend the lock.
///
/// Returns `Ok(None)` when the lock could not be taken within `wait`. The lock is
/// released on every exit path; a panic inside `f` is re-raised after the release.
pub async fn with_lock<F, Fut, T>(
    locker: &dyn Locker,
    key: &str,
    expiration: Duration,
    wait: Duration,
    f: F,
) -> MailroomResult<Option<T>>
where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = MailroomResult<T>>,
{
    let Some(token) = locker.grab(key, expiration, wait).await? else {
        return Ok(None);
    };

    let outcome = AssertUnwindSafe(f(token.clone())).catch_unwind().await;

    if let Err(e) = locker.release(key, &token).await {
        warn!(key, error = %e, "Failed to release lock, it will expire on its own");
    }

    match outcome {
        Ok(result) => result.map(Some),
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MailroomError;

    const MINUTE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_with_lock_releases_after_error() {
        let locker = MemoryLocker::new();
        let result: MailroomResult<Option<()>> =
            with_lock(&locker, "lock:job", MINUTE, Duration::ZERO, |_| async {
                Err(MailroomError::Internal("boom".into()))
            })
            .await;
        assert!(result.is_err());
        assert!(!locker.is_locked("lock:job").await.unwrap());
    }

    #[tokio::test]
    async fn test_with_lock_skips_when_held() {
        let locker = MemoryLocker::new();
        let held = locker.grab("lock:job", MINUTE, Duration::ZERO).await.unwrap();
        assert!(held.is_some());

        let ran = with_lock(&locker, "lock:job", MINUTE, Duration::ZERO, |_| async { Ok(1) })
            .await
            .unwrap();
        assert_eq!(ran, None);
    }

    async fn explode() -> MailroomResult<()> {
        panic!("task bug")
    }

    #[tokio::test]
    async fn test_with_lock_releases_after_panic() {
        let locker = std::sync::Arc::new(MemoryLocker::new());
        let inner = locker.clone();
        let handle = tokio::spawn(async move {
            let _: MailroomResult<Option<()>> =
                with_lock(inner.as_ref(), "lock:job", MINUTE, Duration::ZERO, |_| explode()).await;
        });
        assert!(handle.await.unwrap_err().is_panic());
        assert!(!locker.is_locked("lock:job").await.unwrap());
    }
}
