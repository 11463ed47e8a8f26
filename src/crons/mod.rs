//! # Crons
//!
//! Periodic jobs. Each cron gets its own loop that sleeps until the next fire time,
//! takes the cron's lock so only one node runs it (unless the cron runs on every
//! instance), runs it with the next fire time as deadline and records stats.
//!
//! Fire times are aligned to multiples of the interval since the epoch, so every
//! node agrees on them and a cron that overruns skips the ticks it missed rather
//! than running back to back.
//!
//! ## Stats
//!
//! Hashes keyed by cron name: `cron_stats:last_start`, `cron_stats:last_time`,
//! `cron_stats:total_time`, `cron_stats:call_count` and `cron_stats:last_result`
//! (the cron's counts as JSON, or `{"error": "..."}`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use opentelemetry::KeyValue;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::constants::keys;
use crate::error::{MailroomError, MailroomResult};
use crate::foreman::panic_message;
use crate::metrics;
use crate::runtime::Runtime;

pub mod android;
pub mod deindex;
pub mod expire_msgs;
pub mod fires;
pub mod incidents;
pub mod retry_calls;
pub mod retry_msgs;
pub mod throttle;

pub use self::android::SyncAndroidChannels;
pub use self::deindex::DeindexDeletedOrgs;
pub use self::expire_msgs::FailOldMsgs;
pub use self::fires::FireContactFires;
pub use self::incidents::EndIncidents;
pub use self::retry_calls::RetryCalls;
pub use self::retry_msgs::RetryMsgs;
pub use self::throttle::ThrottleQueue;

/// Named counts reported by a cron run
pub type CronStats = BTreeMap<&'static str, u64>;

#[async_trait]
pub trait Cron: Send + Sync {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    /// When to fire next given the last fire time
    fn next(&self, last: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        next_fire(last, now, self.interval())
    }

    /// Whether every node runs this cron instead of one node per tick
    fn all_instances(&self) -> bool {
        false
    }

    async fn run(&self, rt: &Runtime) -> MailroomResult<CronStats>;
}

fn to_nanos(t: DateTime<Utc>) -> i128 {
    i128::from(t.timestamp()) * 1_000_000_000 + i128::from(t.timestamp_subsec_nanos())
}

fn from_nanos(nanos: i128) -> DateTime<Utc> {
    let secs = nanos.div_euclid(1_000_000_000) as i64;
    let subsec = nanos.rem_euclid(1_000_000_000) as u32;
    DateTime::from_timestamp(secs, subsec).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// The first multiple of `interval` (counted from the epoch) strictly after `last`,
/// or, if that is already behind `now`, the first multiple strictly after `now`.
pub fn next_fire(last: DateTime<Utc>, now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let step = interval.as_nanos().max(1) as i128;
    let after = |t: i128| (t.div_euclid(step) + 1) * step;

    let now = to_nanos(now);
    let mut next = after(to_nanos(last));
    if next <= now {
        next = after(now);
    }
    from_nanos(next)
}

/// The crons every node runs
pub fn default_crons(rt: &Runtime) -> Vec<Arc<dyn Cron>> {
    vec![
        Arc::new(FireContactFires::new(
            rt.config.fires_fetch_batch_size,
            rt.config.fires_task_batch_size,
        )),
        Arc::new(ThrottleQueue::new(rt.config.throttle_outbox_threshold)),
        Arc::new(RetryMsgs),
        Arc::new(RetryCalls),
        Arc::new(EndIncidents),
        Arc::new(DeindexDeletedOrgs),
        Arc::new(SyncAndroidChannels),
        Arc::new(FailOldMsgs),
    ]
}

/// Run a cron once if its lock can be taken, recording stats.
///
/// Returns `None` when another node holds the lock for this tick.
pub async fn fire(
    rt: &Runtime,
    cron: &dyn Cron,
    deadline: Duration,
) -> Option<MailroomResult<CronStats>> {
    let name = cron.name();
    let lock_key = keys::cron_lock(name);

    let token = if cron.all_instances() {
        None
    } else {
        match rt.locker.grab(&lock_key, cron.interval() * 2, Duration::ZERO).await {
            Ok(Some(token)) => Some(token),
            Ok(None) => {
                debug!(cron = name, "Cron lock held elsewhere, skipping");
                return None;
            }
            Err(e) => {
                error!(cron = name, error = %e, "Error grabbing cron lock");
                return None;
            }
        }
    };

    let started_on = Utc::now();
    let started = Instant::now();
    let run = AssertUnwindSafe(cron.run(rt)).catch_unwind();
    let result = match tokio::time::timeout(deadline, run).await {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => Err(MailroomError::Internal(format!(
            "cron panicked: {}",
            panic_message(panic.as_ref())
        ))),
        Err(_) => Err(MailroomError::Timeout(format!(
            "cron {name} ran past its deadline of {deadline:?}"
        ))),
    };
    let elapsed = started.elapsed();

    let outcome = match &result {
        Ok(stats) => {
            info!(cron = name, elapsed_ms = elapsed.as_millis() as u64, ?stats, "Cron completed");
            "success"
        }
        Err(MailroomError::Timeout(_)) => {
            error!(cron = name, elapsed_ms = elapsed.as_millis() as u64, "Cron timed out");
            "timeout"
        }
        Err(e) => {
            error!(cron = name, elapsed_ms = elapsed.as_millis() as u64, error = %e, "Cron failed");
            "error"
        }
    };
    metrics::cron_runs_total().add(
        1,
        &[KeyValue::new("cron", name), KeyValue::new("result", outcome)],
    );
    metrics::cron_duration().record(elapsed.as_secs_f64() * 1000.0, &[KeyValue::new("cron", name)]);

    if let Err(e) = record_stats(rt, name, started_on, elapsed, &result).await {
        warn!(cron = name, error = %e, "Failed to record cron stats");
    }

    if let Some(token) = token {
        if let Err(e) = rt.locker.release(&lock_key, &token).await {
            warn!(cron = name, error = %e, "Failed to release cron lock");
        }
    }

    Some(result)
}

async fn record_stats(
    rt: &Runtime,
    name: &str,
    started_on: DateTime<Utc>,
    elapsed: Duration,
    result: &MailroomResult<CronStats>,
) -> MailroomResult<()> {
    let last_result = match result {
        Ok(stats) => serde_json::to_string(stats)?,
        Err(e) => serde_json::json!({ "error": e.to_string() }).to_string(),
    };

    rt.kv
        .hset(keys::CRON_LAST_START, name, &started_on.to_rfc3339())
        .await?;
    rt.kv
        .hset(keys::CRON_LAST_TIME, name, &elapsed.as_secs_f64().to_string())
        .await?;
    rt.kv
        .hincr_by_float(keys::CRON_TOTAL_TIME, name, elapsed.as_secs_f64())
        .await?;
    rt.kv.hincr_by(keys::CRON_CALL_COUNT, name, 1).await?;
    rt.kv.hset(keys::CRON_LAST_RESULT, name, &last_result).await?;
    Ok(())
}

async fn cron_loop(rt: Arc<Runtime>, cron: Arc<dyn Cron>, shutdown: CancellationToken) {
    let name = cron.name();
    let mut last = Utc::now();
    info!(cron = name, interval = ?cron.interval(), all_instances = cron.all_instances(), "Cron started");

    loop {
        let next = cron.next(last, Utc::now());
        let wait = (next - Utc::now()).to_std().unwrap_or_default();

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        // the run must be over before the tick after this one
        let deadline = (cron.next(next, Utc::now()) - Utc::now())
            .to_std()
            .unwrap_or(cron.interval());
        fire(&rt, cron.as_ref(), deadline).await;
        last = next;
    }

    info!(cron = name, "Cron stopped");
}

/// Running cron loops, stopped through the shutdown token they were started with
#[derive(Debug)]
pub struct CronScheduler {
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl CronScheduler {
    pub fn start(
        rt: Arc<Runtime>,
        crons: Vec<Arc<dyn Cron>>,
        shutdown: CancellationToken,
    ) -> Self {
        let handles = crons
            .into_iter()
            .map(|cron| {
                let name = cron.name();
                let handle = tokio::spawn(cron_loop(rt.clone(), cron, shutdown.clone()));
                (name, handle)
            })
            .collect();
        Self { handles }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.handles.iter().map(|(name, _)| *name).collect()
    }

    /// Wait for every cron loop to exit
    pub async fn join(self) {
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                error!(cron = name, error = %e, "Cron loop ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_next_fire_is_aligned() {
        let thirty = Duration::from_secs(30);
        assert_eq!(next_fire(at(10, 0, 5), at(10, 0, 6), thirty), at(10, 0, 30));
        // exactly on a boundary moves to the next one
        assert_eq!(next_fire(at(10, 0, 30), at(10, 0, 30), thirty), at(10, 1, 0));
    }

    #[test]
    fn test_next_fire_skips_missed_ticks() {
        let thirty = Duration::from_secs(30);
        assert_eq!(next_fire(at(10, 0, 0), at(10, 2, 10), thirty), at(10, 2, 30));
    }

    #[test]
    fn test_next_fire_sub_second() {
        let step = Duration::from_millis(250);
        let last = at(10, 0, 0);
        assert_eq!(
            next_fire(last, last, step),
            last + chrono::Duration::milliseconds(250)
        );
    }

    proptest! {
        #[test]
        fn next_fire_is_after_last_and_now_and_aligned(
            last_ms in 0i64..4_000_000_000_000,
            ahead_ms in 0i64..10_000_000,
            interval_ms in 1u64..86_400_000,
        ) {
            let last = DateTime::from_timestamp_millis(last_ms).unwrap();
            let now = last + chrono::Duration::milliseconds(ahead_ms);
            let interval = Duration::from_millis(interval_ms);

            let next = next_fire(last, now, interval);
            prop_assert!(next > last);
            prop_assert!(next > now);
            prop_assert_eq!(next.timestamp_millis() % interval_ms as i64, 0);
            // never more than one interval past the later of the two
            prop_assert!(next.timestamp_millis() - now.timestamp_millis() <= interval_ms as i64);
        }
    }
}
