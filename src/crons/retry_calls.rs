//! Re-requests IVR calls that errored or were left queued by a busy channel.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{Cron, CronStats};
use crate::error::MailroomResult;
use crate::models::{CallStatus, ChannelId, OrgId};
use crate::runtime::Runtime;
use crate::services::{CallOutcome, OrgAssets, Refresh};

pub const RETRY_CALLS_LIMIT: usize = 250;

/// Minutes before a call that could not be requested is tried again
pub const CALL_RETRY_BACKOFF_MINUTES: i64 = 5;

fn retry_on() -> DateTime<Utc> {
    Utc::now() + chrono::Duration::minutes(CALL_RETRY_BACKOFF_MINUTES)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RetryCalls;

#[async_trait]
impl Cron for RetryCalls {
    fn name(&self) -> &'static str {
        "retry_calls"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn run(&self, rt: &Runtime) -> MailroomResult<CronStats> {
        let (mut retried, mut errored, mut throttled) = (0, 0, 0);
        let Some(ivr) = rt.ivr.as_ref() else {
            debug!("No IVR service configured, skipping call retries");
            return Ok(CronStats::from([("retried", 0), ("errored", 0), ("throttled", 0)]));
        };

        let calls = rt.db.calls.load_retryable(Utc::now(), RETRY_CALLS_LIMIT).await?;
        let mut assets: HashMap<OrgId, Arc<OrgAssets>> = HashMap::new();
        let mut busy_channels: HashSet<ChannelId> = HashSet::new();

        for call in calls {
            if busy_channels.contains(&call.channel_id) {
                throttled += 1;
                continue;
            }

            let oa = match assets.get(&call.org_id) {
                Some(oa) => oa.clone(),
                None => match rt.assets.get(call.org_id, Refresh::NONE).await {
                    Ok(oa) => {
                        assets.insert(call.org_id, oa.clone());
                        oa
                    }
                    Err(e) => {
                        warn!(org_id = %call.org_id, call_id = %call.id, error = %e, "Unable to load org assets for call");
                        errored += 1;
                        continue;
                    }
                },
            };

            let Some(channel) = oa.channel(call.channel_id) else {
                rt.db.calls.update_status(call.id, CallStatus::Failed, None).await?;
                errored += 1;
                continue;
            };

            match ivr.request_call(&oa, channel, &call).await {
                Ok(CallOutcome::Requested) => {
                    rt.db.calls.update_status(call.id, CallStatus::Wired, None).await?;
                    retried += 1;
                }
                Ok(CallOutcome::Throttled) => {
                    busy_channels.insert(call.channel_id);
                    rt.db
                        .calls
                        .update_status(call.id, CallStatus::Queued, Some(retry_on()))
                        .await?;
                    throttled += 1;
                }
                Ok(CallOutcome::Failed(reason)) => {
                    debug!(call_id = %call.id, reason = %reason, "Call request failed");
                    rt.db.calls.update_status(call.id, CallStatus::Failed, None).await?;
                    errored += 1;
                }
                Err(e) => {
                    warn!(call_id = %call.id, channel_id = %call.channel_id, error = %e, "Error requesting call");
                    rt.db
                        .calls
                        .update_status(call.id, CallStatus::Errored, Some(retry_on()))
                        .await?;
                    errored += 1;
                }
            }
        }

        Ok(CronStats::from([
            ("retried", retried),
            ("errored", errored),
            ("throttled", throttled),
        ]))
    }
}
