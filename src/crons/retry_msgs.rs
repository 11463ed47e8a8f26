use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;

use super::{Cron, CronStats};
use crate::error::MailroomResult;
use crate::models::{Msg, MsgId, MsgStatus, OrgId};
use crate::runtime::Runtime;
use crate::services::Refresh;

/// Most errored messages re-sent per run
pub const RETRY_MSGS_LIMIT: usize = 5_000;

/// Re-queues errored outgoing messages whose next attempt is due
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryMsgs;

#[async_trait]
impl Cron for RetryMsgs {
    fn name(&self) -> &'static str {
        "retry_errored_messages"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn run(&self, rt: &Runtime) -> MailroomResult<CronStats> {
        let msgs = rt.db.msgs.load_retryable(Utc::now(), RETRY_MSGS_LIMIT).await?;

        let mut by_org: BTreeMap<OrgId, Vec<Msg>> = BTreeMap::new();
        for msg in msgs {
            by_org.entry(msg.org_id).or_default().push(msg);
        }

        let mut retried = 0;
        for (org_id, mut msgs) in by_org {
            let oa = match rt.assets.get(org_id, Refresh::NONE).await {
                Ok(oa) => oa,
                Err(e) => {
                    warn!(org_id = %org_id, error = %e, "Unable to load org assets, not retrying messages");
                    continue;
                }
            };

            let ids: Vec<MsgId> = msgs.iter().map(|m| m.id).collect();
            rt.db.msgs.mark_for_retry(&ids).await?;
            for msg in &mut msgs {
                msg.status = MsgStatus::Queued;
                msg.retry_count += 1;
                msg.next_attempt = None;
            }

            retried += rt.courier.queue_messages(&oa, &msgs).await? as u64;
        }

        Ok(CronStats::from([("retried", retried)]))
    }
}
