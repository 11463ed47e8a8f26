use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{Cron, CronStats};
use crate::error::MailroomResult;
use crate::runtime::Runtime;

/// Minutes an Android channel can go unseen before it gets a sync push
pub const ANDROID_STALE_AFTER_MINUTES: i64 = 15;

pub const ANDROID_SYNC_LIMIT: usize = 1_000;

/// Nudges silent Android relayer channels to sync
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncAndroidChannels;

#[async_trait]
impl Cron for SyncAndroidChannels {
    fn name(&self) -> &'static str {
        "sync_android_channels"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(10 * 60)
    }

    fn all_instances(&self) -> bool {
        true
    }

    async fn run(&self, rt: &Runtime) -> MailroomResult<CronStats> {
        let (mut synced, mut errored) = (0, 0);
        let Some(android) = rt.android.as_ref() else {
            debug!("No FCM key configured, skipping Android sync");
            return Ok(CronStats::from([("synced", 0), ("errored", 0)]));
        };

        let channels = rt
            .db
            .channels
            .stale_android_channels(Utc::now() - chrono::Duration::minutes(ANDROID_STALE_AFTER_MINUTES), ANDROID_SYNC_LIMIT)
            .await?;

        for channel in &channels {
            match android.sync(channel).await {
                Ok(()) => synced += 1,
                Err(e) => {
                    warn!(channel_uuid = %channel.uuid, error = %e, "Error syncing Android channel");
                    errored += 1;
                }
            }
        }

        Ok(CronStats::from([("synced", synced), ("errored", errored)]))
    }
}
