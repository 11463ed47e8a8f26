//! Redis fair queue
//!
//! Layout for a queue named `Q`:
//!
//! ```text
//! {tasks:Q}:queued        sorted set  owner -> time the owner joined the line
//! tasks:Q:active          hash        owner -> tasks in flight
//! tasks:Q:paused          set         paused owners
//! {tasks:Q}:o:<owner>/0   list        bulk lane
//! {tasks:Q}:o:<owner>/1   list        high priority lane
//! ```
//!
//! The `{tasks:Q}` hash tag keeps the line and the owner lanes in one cluster slot,
//! which the pop script relies on since it derives lane keys from the owner ids.

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use super::{PoppedTask, Priority, TaskEnvelope, TaskQueue};
use crate::constants::keys;
use crate::error::{MailroomError, MailroomResult};
use crate::models::OrgId;

const PUSH_SCRIPT: &str = r#"
local queued_key, lane_key = KEYS[1], KEYS[2]
local owner, now, task = ARGV[1], ARGV[2], ARGV[3]

redis.call("RPUSH", lane_key, task)

-- an owner already in line keeps its place
redis.call("ZADD", queued_key, "NX", now, owner)
return 1
"#;

const POP_SCRIPT: &str = r#"
local queued_key, active_key, paused_key = KEYS[1], KEYS[2], KEYS[3]
local prefix, max_active, now = ARGV[1], tonumber(ARGV[2]), ARGV[3]

local owners = redis.call("ZRANGE", queued_key, 0, -1)
for _, owner in ipairs(owners) do
    if redis.call("SISMEMBER", paused_key, owner) == 0 then
        local active = tonumber(redis.call("HGET", active_key, owner) or "0")
        if active < max_active then
            local high_key = prefix .. owner .. "/1"
            local bulk_key = prefix .. owner .. "/0"

            local task = redis.call("LPOP", high_key)
            if not task then
                task = redis.call("LPOP", bulk_key)
            end

            -- owner was in line without tasks, drop it and let the caller try again
            if not task then
                redis.call("ZREM", queued_key, owner)
                return {"retry", ""}
            end

            if redis.call("LLEN", high_key) + redis.call("LLEN", bulk_key) == 0 then
                redis.call("ZREM", queued_key, owner)
            else
                redis.call("ZADD", queued_key, now, owner)
            end

            redis.call("HINCRBY", active_key, owner, 1)
            return {owner, task}
        end
    end
end

return {"empty", ""}
"#;

const DONE_SCRIPT: &str = r#"
local active_key, owner = KEYS[1], ARGV[1]

local count = redis.call("HINCRBY", active_key, owner, -1)
if count <= 0 then
    redis.call("HDEL", active_key, owner)
end
return count
"#;

const SIZE_SCRIPT: &str = r#"
local queued_key, prefix = KEYS[1], ARGV[1]

local total = 0
for _, owner in ipairs(redis.call("ZRANGE", queued_key, 0, -1)) do
    total = total + redis.call("LLEN", prefix .. owner .. "/0") + redis.call("LLEN", prefix .. owner .. "/1")
end
return total
"#;

/// Attempts a single pop makes when the script keeps reporting racily drained owners
const MAX_POP_RETRIES: usize = 10;

#[derive(Clone)]
pub struct RedisFairQueue {
    name: String,
    max_active_per_owner: usize,
    connection_manager: redis::aio::ConnectionManager,
    push_script: redis::Script,
    pop_script: redis::Script,
    done_script: redis::Script,
    size_script: redis::Script,
}

impl std::fmt::Debug for RedisFairQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisFairQueue")
            .field("name", &self.name)
            .field("max_active_per_owner", &self.max_active_per_owner)
            .finish()
    }
}

impl RedisFairQueue {
    pub fn new(
        name: impl Into<String>,
        max_active_per_owner: usize,
        connection_manager: redis::aio::ConnectionManager,
    ) -> Self {
        Self {
            name: name.into(),
            max_active_per_owner: max_active_per_owner.max(1),
            connection_manager,
            push_script: redis::Script::new(PUSH_SCRIPT),
            pop_script: redis::Script::new(POP_SCRIPT),
            done_script: redis::Script::new(DONE_SCRIPT),
            size_script: redis::Script::new(SIZE_SCRIPT),
        }
    }

    fn now() -> String {
        format!("{:.6}", Utc::now().timestamp_micros() as f64 / 1_000_000.0)
    }
}

#[async_trait]
impl TaskQueue for RedisFairQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_active_per_owner(&self) -> usize {
        self.max_active_per_owner
    }

    async fn push(
        &self,
        owner_id: OrgId,
        envelope: &TaskEnvelope,
        priority: Priority,
    ) -> MailroomResult<()> {
        let mut conn = self.connection_manager.clone();
        let payload = envelope.to_json()?;

        let _: i64 = self
            .push_script
            .key(keys::queued(&self.name))
            .key(keys::owner_lane(&self.name, owner_id, priority.lane()))
            .arg(owner_id.0)
            .arg(Self::now())
            .arg(payload)
            .invoke_async(&mut conn)
            .await?;

        debug!(queue = %self.name, owner_id = %owner_id, task_type = %envelope.task_type, ?priority, "Task queued");
        Ok(())
    }

    async fn pop(&self) -> MailroomResult<Option<PoppedTask>> {
        let mut conn = self.connection_manager.clone();

        for _ in 0..MAX_POP_RETRIES {
            let (owner, payload): (String, String) = self
                .pop_script
                .key(keys::queued(&self.name))
                .key(keys::active(&self.name))
                .key(keys::paused(&self.name))
                .arg(keys::owner_prefix(&self.name))
                .arg(self.max_active_per_owner)
                .arg(Self::now())
                .invoke_async(&mut conn)
                .await?;

            match owner.as_str() {
                "empty" => return Ok(None),
                "retry" => continue,
                _ => {
                    let owner_id = owner.parse::<OrgId>().map_err(|e| {
                        MailroomError::KeyValueError(format!("bad owner in queue {}: {e}", self.name))
                    })?;
                    return Ok(Some(PoppedTask {
                        queue: self.name.clone(),
                        owner_id,
                        payload,
                    }));
                }
            }
        }

        Ok(None)
    }

    async fn done(&self, owner_id: OrgId) -> MailroomResult<()> {
        let mut conn = self.connection_manager.clone();
        let _: i64 = self
            .done_script
            .key(keys::active(&self.name))
            .arg(owner_id.0)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn pause(&self, owner_id: OrgId) -> MailroomResult<()> {
        let mut conn = self.connection_manager.clone();
        let _: i64 = redis::cmd("SADD")
            .arg(keys::paused(&self.name))
            .arg(owner_id.0)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn resume(&self, owner_id: OrgId) -> MailroomResult<()> {
        let mut conn = self.connection_manager.clone();
        let _: i64 = redis::cmd("SREM")
            .arg(keys::paused(&self.name))
            .arg(owner_id.0)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn paused(&self) -> MailroomResult<Vec<OrgId>> {
        let mut conn = self.connection_manager.clone();
        let mut owners: Vec<i64> = redis::cmd("SMEMBERS")
            .arg(keys::paused(&self.name))
            .query_async(&mut conn)
            .await?;
        owners.sort_unstable();
        Ok(owners.into_iter().map(OrgId).collect())
    }

    async fn owners(&self) -> MailroomResult<Vec<OrgId>> {
        let mut conn = self.connection_manager.clone();
        let owners: Vec<i64> = redis::cmd("ZRANGE")
            .arg(keys::queued(&self.name))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        Ok(owners.into_iter().map(OrgId).collect())
    }

    async fn active(&self, owner_id: OrgId) -> MailroomResult<usize> {
        let mut conn = self.connection_manager.clone();
        let count: Option<i64> = redis::cmd("HGET")
            .arg(keys::active(&self.name))
            .arg(owner_id.0)
            .query_async(&mut conn)
            .await?;
        Ok(count.unwrap_or(0).max(0) as usize)
    }

    async fn size(&self) -> MailroomResult<usize> {
        let mut conn = self.connection_manager.clone();
        let total: i64 = self
            .size_script
            .key(keys::queued(&self.name))
            .arg(keys::owner_prefix(&self.name))
            .invoke_async(&mut conn)
            .await?;
        Ok(total.max(0) as usize)
    }

    async fn owner_size(&self, owner_id: OrgId) -> MailroomResult<usize> {
        let mut conn = self.connection_manager.clone();
        let (bulk, high): (i64, i64) = redis::pipe()
            .cmd("LLEN")
            .arg(keys::owner_lane(&self.name, owner_id, Priority::Bulk.lane()))
            .cmd("LLEN")
            .arg(keys::owner_lane(&self.name, owner_id, Priority::High.lane()))
            .query_async(&mut conn)
            .await?;
        Ok((bulk + high).max(0) as usize)
    }
}
