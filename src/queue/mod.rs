//! # Fair Queues
//!
//! Multi-tenant task queues that keep one busy owner from starving the others.
//!
//! Each owner (org) has two FIFO lanes, high priority and bulk, and a position in a
//! line of owners with work waiting. Popping walks that line in order and takes the
//! first task from the first owner that is neither paused nor already running its
//! maximum number of concurrent tasks. An owner that still has tasks goes to the back
//! of the line, so busy owners take turns.
//!
//! ## Invariants
//!
//! - an owner never has more than `max_active_per_owner` tasks in flight
//! - paused owners are skipped until resumed, their tasks are kept
//! - tasks of one owner and priority come out in the order they were pushed
//! - a high-priority task comes out before that owner's waiting bulk tasks
//!
//! [`RedisFairQueue`] runs every operation as an atomic Lua script;
//! [`MemoryFairQueue`] implements the same algorithm in process.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::MailroomResult;
use crate::models::OrgId;

pub mod envelope;
pub mod memory;
pub mod redis;

pub use self::envelope::TaskEnvelope;
pub use self::memory::MemoryFairQueue;
pub use self::redis::RedisFairQueue;

/// Lane a task is pushed onto
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Bulk,
    High,
}

impl Priority {
    pub fn lane(&self) -> u8 {
        match self {
            Priority::Bulk => 0,
            Priority::High => 1,
        }
    }
}

/// A task taken off a queue, still in its serialized form
#[derive(Debug, Clone, PartialEq)]
pub struct PoppedTask {
    pub queue: String,
    pub owner_id: OrgId,
    pub payload: String,
}

impl PoppedTask {
    pub fn envelope(&self) -> MailroomResult<TaskEnvelope> {
        TaskEnvelope::from_json(&self.payload)
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    fn max_active_per_owner(&self) -> usize;

    /// Append a task to the owner's lane for the given priority
    async fn push(
        &self,
        owner_id: OrgId,
        envelope: &TaskEnvelope,
        priority: Priority,
    ) -> MailroomResult<()>;

    /// Take the next task according to the fairness rules, `None` when no owner has
    /// a task that may run now
    async fn pop(&self) -> MailroomResult<Option<PoppedTask>>;

    /// Record that one of the owner's popped tasks finished
    async fn done(&self, owner_id: OrgId) -> MailroomResult<()>;

    async fn pause(&self, owner_id: OrgId) -> MailroomResult<()>;

    async fn resume(&self, owner_id: OrgId) -> MailroomResult<()>;

    async fn paused(&self) -> MailroomResult<Vec<OrgId>>;

    /// Owners that currently have queued tasks, paused or not
    async fn owners(&self) -> MailroomResult<Vec<OrgId>>;

    /// Number of the owner's tasks in flight
    async fn active(&self, owner_id: OrgId) -> MailroomResult<usize>;

    /// Number of queued tasks across all owners
    async fn size(&self) -> MailroomResult<usize>;

    /// Number of the owner's queued tasks
    async fn owner_size(&self, owner_id: OrgId) -> MailroomResult<usize>;
}

/// The three queues a service runs
#[derive(Debug, Clone)]
pub struct Queues {
    pub realtime: std::sync::Arc<dyn TaskQueue>,
    pub batch: std::sync::Arc<dyn TaskQueue>,
    pub throttled: std::sync::Arc<dyn TaskQueue>,
}

impl Queues {
    pub fn all(&self) -> [&std::sync::Arc<dyn TaskQueue>; 3] {
        [&self.realtime, &self.batch, &self.throttled]
    }

    pub fn by_name(&self, name: &str) -> Option<&std::sync::Arc<dyn TaskQueue>> {
        self.all().into_iter().find(|q| q.name() == name)
    }
}
