use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tracing::info;

use super::{Cron, CronStats};
use crate::error::MailroomResult;
use crate::models::incident::WEBHOOKS_UNHEALTHY;
use crate::models::IncidentId;
use crate::runtime::Runtime;

/// Minutes without a failed webhook call after which an unhealthy-webhooks incident ends
pub const WEBHOOKS_HEALTHY_AFTER_MINUTES: i64 = 20;

#[derive(Debug, Clone, Copy, Default)]
pub struct EndIncidents;

#[async_trait]
impl Cron for EndIncidents {
    fn name(&self) -> &'static str {
        "end_incidents"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(5 * 60)
    }

    async fn run(&self, rt: &Runtime) -> MailroomResult<CronStats> {
        let since = Utc::now() - chrono::Duration::minutes(WEBHOOKS_HEALTHY_AFTER_MINUTES);
        let mut healthy: Vec<IncidentId> = Vec::new();

        for incident in rt.db.incidents.open_incidents(WEBHOOKS_UNHEALTHY).await? {
            let failures = rt
                .db
                .incidents
                .webhook_failures_since(incident.org_id, since)
                .await?;
            if failures == 0 {
                healthy.push(incident.id);
            }
        }

        let ended = if healthy.is_empty() {
            0
        } else {
            rt.db.incidents.end_incidents(&healthy).await?
        };
        if ended > 0 {
            info!(ended, "Ended webhook incidents");
        }
        Ok(CronStats::from([("ended", ended)]))
    }
}
