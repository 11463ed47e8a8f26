//! Handing outgoing messages to the courier.
//!
//! The courier reads per-channel sorted sets named `msgs:<channel uuid>|<tps>/<priority>`
//! and a `msgs:active` sorted set listing the queues that have work.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::OrgAssets;
use crate::error::MailroomResult;
use crate::models::Msg;

#[async_trait]
pub trait Courier: Send + Sync {
    /// Queue messages for sending, returns how many were queued
    async fn queue_messages(&self, oa: &OrgAssets, msgs: &[Msg]) -> MailroomResult<usize>;
}

const QUEUE_SCRIPT: &str = r#"
local queue_key, active_key = KEYS[1], KEYS[2]
local queue_name, score = ARGV[1], ARGV[2]

for i = 3, #ARGV do
    redis.call("ZADD", queue_key, score, ARGV[i])
end

-- make sure the queue is listed as having work
redis.call("ZINCRBY", active_key, 0, queue_name)
return #ARGV - 2
"#;

pub const ACTIVE_QUEUES_KEY: &str = "msgs:active";

/// Default throughput recorded in the queue name of channels without one
pub const DEFAULT_TPS: i32 = 10;

#[derive(Clone)]
pub struct RedisCourier {
    connection_manager: redis::aio::ConnectionManager,
    queue_script: redis::Script,
}

impl std::fmt::Debug for RedisCourier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCourier")
            .field("connection_manager", &"ConnectionManager")
            .finish()
    }
}

impl RedisCourier {
    pub fn new(connection_manager: redis::aio::ConnectionManager) -> Self {
        Self {
            connection_manager,
            queue_script: redis::Script::new(QUEUE_SCRIPT),
        }
    }
}

/// Groups messages by courier queue name, dropping those without a known channel
fn group_by_queue<'a>(oa: &OrgAssets, msgs: &'a [Msg]) -> BTreeMap<(String, u8), Vec<&'a Msg>> {
    let mut queues: BTreeMap<(String, u8), Vec<&Msg>> = BTreeMap::new();
    for msg in msgs {
        let Some(channel) = msg.channel_id.and_then(|id| oa.channel(id)) else {
            warn!(msg_uuid = %msg.uuid, org_id = %oa.org_id(), "Skipping message without a channel");
            continue;
        };
        let name = format!(
            "msgs:{}|{}",
            channel.uuid,
            channel.tps.unwrap_or(DEFAULT_TPS)
        );
        queues
            .entry((name, u8::from(msg.high_priority)))
            .or_default()
            .push(msg);
    }
    queues
}

#[async_trait]
impl Courier for RedisCourier {
    async fn queue_messages(&self, oa: &OrgAssets, msgs: &[Msg]) -> MailroomResult<usize> {
        let mut conn = self.connection_manager.clone();
        let score = format!("{:.6}", Utc::now().timestamp_micros() as f64 / 1_000_000.0);
        let mut queued = 0;

        for ((name, priority), batch) in group_by_queue(oa, msgs) {
            let mut invocation = self.queue_script.prepare_invoke();
            invocation
                .key(format!("{name}/{priority}"))
                .key(ACTIVE_QUEUES_KEY)
                .arg(&name)
                .arg(&score);
            for msg in &batch {
                invocation.arg(serde_json::to_string(msg)?);
            }
            let count: i64 = invocation.invoke_async(&mut conn).await?;
            queued += count as usize;
            debug!(queue = %name, priority, count, "Queued messages to courier");
        }
        Ok(queued)
    }
}

/// Courier that keeps queued messages in memory
#[derive(Debug, Default)]
pub struct MemoryCourier {
    queued: Mutex<Vec<Msg>>,
}

impl MemoryCourier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queued(&self) -> Vec<Msg> {
        self.queued.lock().clone()
    }
}

#[async_trait]
impl Courier for MemoryCourier {
    async fn queue_messages(&self, oa: &OrgAssets, msgs: &[Msg]) -> MailroomResult<usize> {
        let grouped = group_by_queue(oa, msgs);
        let mut queued = self.queued.lock();
        let mut count = 0;
        for batch in grouped.into_values() {
            count += batch.len();
            queued.extend(batch.into_iter().cloned());
        }
        Ok(count)
    }
}
