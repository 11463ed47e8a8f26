//! # System Constants
//!
//! Queue names, key layouts and the timing constants that bound how the task
//! engine uses its key-value store and database.

use std::time::Duration;

/// Names of the three fair queues and the foremen that drain them.
pub mod queues {
    pub const REALTIME: &str = "realtime";
    pub const BATCH: &str = "batch";
    pub const THROTTLED: &str = "throttled";

    pub const ALL: [&str; 3] = [REALTIME, BATCH, THROTTLED];
}

/// Key layout of everything the engine keeps in the key-value store.
pub mod keys {
    use crate::models::{ContactId, OrgId};

    /// Sorted set of owners that currently have queued tasks.
    pub fn queued(queue: &str) -> String {
        format!("{{tasks:{queue}}}:queued")
    }

    /// Hash of owner -> number of tasks in flight.
    pub fn active(queue: &str) -> String {
        format!("tasks:{queue}:active")
    }

    /// Set of paused owners.
    pub fn paused(queue: &str) -> String {
        format!("tasks:{queue}:paused")
    }

    /// Prefix of the per-owner task lists; the owner id and lane are appended.
    pub fn owner_prefix(queue: &str) -> String {
        format!("{{tasks:{queue}}}:o:")
    }

    /// FIFO list of one owner's tasks for one lane (0 = bulk, 1 = high).
    pub fn owner_lane(queue: &str, owner: OrgId, lane: u8) -> String {
        format!("{{tasks:{queue}}}:o:{owner}/{lane}")
    }

    pub fn contact_queue(org: OrgId, contact: ContactId) -> String {
        format!("c:{org}:{contact}")
    }

    pub fn contact_dispatch(org: OrgId, contact: ContactId) -> String {
        format!("c:{org}:{contact}:queued")
    }

    pub fn contact_lock(org: OrgId, contact: ContactId) -> String {
        format!("lock:c:{org}:{contact}")
    }

    pub fn cron_lock(name: &str) -> String {
        format!("lock:cron:{name}")
    }

    pub fn group_population_lock(group_id: i64) -> String {
        format!("lock:group_population:{group_id}")
    }

    pub fn campaign_point_lock(point_id: i64) -> String {
        format!("lock:campaign_point:{point_id}")
    }

    pub fn recent_campaign_fires(point_id: i64) -> String {
        format!("recent_campaign_fires:{point_id}")
    }

    pub const CRON_LAST_START: &str = "cron_stats:last_start";
    pub const CRON_LAST_TIME: &str = "cron_stats:last_time";
    pub const CRON_TOTAL_TIME: &str = "cron_stats:total_time";
    pub const CRON_CALL_COUNT: &str = "cron_stats:call_count";
    pub const CRON_LAST_RESULT: &str = "cron_stats:last_result";

    pub const RUNNING_NODES: &str = "app-nodes:running";

    pub const DEINDEX_ORGS: &str = "deindex:orgs";
}

/// How long a worker sleeps after popping from an empty queue.
pub const EMPTY_QUEUE_BACKOFF: Duration = Duration::from_millis(250);

/// Contact lock expiration and acquisition wait.
pub const CONTACT_LOCK_TTL: Duration = Duration::from_secs(5 * 60);
pub const CONTACT_LOCK_WAIT: Duration = Duration::from_secs(10);

/// Contact dispatch marker lifetime, matches the contact lock.
pub const CONTACT_DISPATCH_TTL: Duration = Duration::from_secs(5 * 60);

/// Attempts a contact task gets before it is dropped.
pub const CONTACT_TASK_MAX_ATTEMPTS: u32 = 3;

/// Longest a single contact task may run before it counts as a failed attempt.
pub const CONTACT_TASK_TIMEOUT: Duration = Duration::from_secs(60);

/// Once a drain has run this long it stops after the current event and queues a new
/// dispatch. Budget plus one task timeout stays under the contact lock TTL.
pub const CONTACT_DRAIN_BUDGET: Duration = Duration::from_secs(3 * 60);

/// Locks held by long single-entity jobs (group population, campaign point scheduling).
pub const LONG_JOB_LOCK_TTL: Duration = Duration::from_secs(60 * 60);
pub const LONG_JOB_LOCK_WAIT: Duration = Duration::from_secs(5 * 60);

/// Recent campaign fires kept per point and how long they are kept.
pub const RECENT_CAMPAIGN_FIRES_CAP: usize = 10;
pub const RECENT_CAMPAIGN_FIRES_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Fraction of a task's timeout after which a slow-task warning is logged.
pub const SLOW_TASK_FRACTION: f64 = 0.75;

/// Probability that a flow start is deferred while its owner is under high load.
pub const HIGH_LOAD_DEFER_PROBABILITY: f64 = 0.95;

/// Name this service records itself under in the node ledger.
pub const SERVICE_NAME: &str = "mailroom";
