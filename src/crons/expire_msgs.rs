use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;

use super::{Cron, CronStats};
use crate::error::MailroomResult;
use crate::runtime::Runtime;

/// Days after which unsent outgoing messages are failed
pub const OUTGOING_MSG_MAX_AGE_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, Default)]
pub struct FailOldMsgs;

#[async_trait]
impl Cron for FailOldMsgs {
    fn name(&self) -> &'static str {
        "fail_old_messages"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(24 * 60 * 60)
    }

    async fn run(&self, rt: &Runtime) -> MailroomResult<CronStats> {
        let failed = rt
            .db
            .msgs
            .fail_old_outgoing(Utc::now() - chrono::Duration::days(OUTGOING_MSG_MAX_AGE_DAYS))
            .await?;
        Ok(CronStats::from([("failed", failed)]))
    }
}
