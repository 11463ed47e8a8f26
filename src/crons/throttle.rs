//! Pauses owners of the throttled queue whose outbox is backed up.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

use super::{Cron, CronStats};
use crate::error::MailroomResult;
use crate::runtime::Runtime;
use crate::services::Refresh;

#[derive(Debug, Clone)]
pub struct ThrottleQueue {
    outbox_threshold: i64,
}

impl ThrottleQueue {
    pub fn new(outbox_threshold: i64) -> Self {
        Self { outbox_threshold }
    }
}

#[async_trait]
impl Cron for ThrottleQueue {
    fn name(&self) -> &'static str {
        "throttle_queue"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(10)
    }

    async fn run(&self, rt: &Runtime) -> MailroomResult<CronStats> {
        let queue = &rt.queues.throttled;
        let (mut paused, mut resumed) = (0, 0);

        for owner_id in queue.owners().await? {
            let oa = match rt.assets.get(owner_id, Refresh::NONE).await {
                Ok(oa) => oa,
                Err(e) => {
                    warn!(owner_id = %owner_id, error = %e, "Unable to load org assets, not throttling");
                    continue;
                }
            };

            let outbox = rt.db.msgs.outbox_count(oa.org_id()).await?;
            if outbox >= self.outbox_threshold {
                debug!(owner_id = %owner_id, outbox, "Outbox over threshold, pausing owner");
                queue.pause(owner_id).await?;
                paused += 1;
            } else {
                queue.resume(owner_id).await?;
                resumed += 1;
            }
        }

        Ok(CronStats::from([("paused", paused), ("resumed", resumed)]))
    }
}
