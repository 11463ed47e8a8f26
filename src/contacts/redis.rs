//! Redis contact queues
//!
//! `c:<org>:<contact>` holds the envelopes, `c:<org>:<contact>:queued` is the
//! dispatch marker. Pushing and setting the marker happen in one script.

use async_trait::async_trait;

use super::ContactQueueStore;
use crate::constants::{keys, CONTACT_DISPATCH_TTL};
use crate::error::MailroomResult;
use crate::models::{ContactId, OrgId};

const PUSH_SCRIPT: &str = r#"
local list_key, marker_key = KEYS[1], KEYS[2]
local task, ttl = ARGV[1], ARGV[2]

redis.call("RPUSH", list_key, task)
if redis.call("SET", marker_key, "1", "NX", "EX", ttl) then
    return 1
end
return 0
"#;

#[derive(Clone)]
pub struct RedisContactQueue {
    connection_manager: redis::aio::ConnectionManager,
    push_script: redis::Script,
}

impl std::fmt::Debug for RedisContactQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisContactQueue")
            .field("connection_manager", &"ConnectionManager")
            .finish()
    }
}

impl RedisContactQueue {
    pub fn new(connection_manager: redis::aio::ConnectionManager) -> Self {
        Self {
            connection_manager,
            push_script: redis::Script::new(PUSH_SCRIPT),
        }
    }
}

#[async_trait]
impl ContactQueueStore for RedisContactQueue {
    async fn push_back(
        &self,
        org_id: OrgId,
        contact_id: ContactId,
        payload: &str,
    ) -> MailroomResult<bool> {
        let mut conn = self.connection_manager.clone();
        let marked: i64 = self
            .push_script
            .key(keys::contact_queue(org_id, contact_id))
            .key(keys::contact_dispatch(org_id, contact_id))
            .arg(payload)
            .arg(CONTACT_DISPATCH_TTL.as_secs())
            .invoke_async(&mut conn)
            .await?;
        Ok(marked == 1)
    }

    async fn push_front(
        &self,
        org_id: OrgId,
        contact_id: ContactId,
        payload: &str,
    ) -> MailroomResult<()> {
        let mut conn = self.connection_manager.clone();
        let _: i64 = redis::cmd("LPUSH")
            .arg(keys::contact_queue(org_id, contact_id))
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn pop(&self, org_id: OrgId, contact_id: ContactId) -> MailroomResult<Option<String>> {
        let mut conn = self.connection_manager.clone();
        let payload: Option<String> = redis::cmd("LPOP")
            .arg(keys::contact_queue(org_id, contact_id))
            .query_async(&mut conn)
            .await?;
        Ok(payload)
    }

    async fn mark_dispatch(&self, org_id: OrgId, contact_id: ContactId) -> MailroomResult<bool> {
        let mut conn = self.connection_manager.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(keys::contact_dispatch(org_id, contact_id))
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(CONTACT_DISPATCH_TTL.as_secs())
            .query_async(&mut conn)
            .await?;
        Ok(set.is_some())
    }

    async fn clear_dispatch(&self, org_id: OrgId, contact_id: ContactId) -> MailroomResult<()> {
        let mut conn = self.connection_manager.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(keys::contact_dispatch(org_id, contact_id))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn size(&self, org_id: OrgId, contact_id: ContactId) -> MailroomResult<usize> {
        let mut conn = self.connection_manager.clone();
        let len: i64 = redis::cmd("LLEN")
            .arg(keys::contact_queue(org_id, contact_id))
            .query_async(&mut conn)
            .await?;
        Ok(len.max(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    // Integration tests require a running Redis instance (behind test-services feature)
    #[cfg(feature = "test-services")]
    mod integration {
        use super::super::*;
        use tracing::warn;

        #[tokio::test]
        async fn test_redis_contact_queue_marks_dispatch_once() {
            let url =
                std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379/15".into());
            let conn = match crate::kv::connect(&url).await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Skipping Redis test (not available): {}", e);
                    return;
                }
            };
            let queue = RedisContactQueue::new(conn);
            let org = OrgId(rand::random::<u32>() as i64);
            let contact = ContactId(1);

            assert!(queue.push_back(org, contact, "a").await.unwrap());
            assert!(!queue.push_back(org, contact, "b").await.unwrap());
            queue.push_front(org, contact, "z").await.unwrap();
            assert_eq!(queue.size(org, contact).await.unwrap(), 3);

            assert_eq!(queue.pop(org, contact).await.unwrap().as_deref(), Some("z"));
            queue.clear_dispatch(org, contact).await.unwrap();
            assert!(queue.mark_dispatch(org, contact).await.unwrap());
            assert!(!queue.mark_dispatch(org, contact).await.unwrap());
            queue.clear_dispatch(org, contact).await.unwrap();

            while queue.pop(org, contact).await.unwrap().is_some() {}
        }
    }
}
