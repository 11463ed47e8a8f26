//! Campaign tasks: firing a campaign point for a batch of contacts, and
//! (re)scheduling the fires of a point after it or its group changed.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info};

use super::{Task, TaskType};
use crate::constants::{
    keys, LONG_JOB_LOCK_TTL, LONG_JOB_LOCK_WAIT, RECENT_CAMPAIGN_FIRES_CAP,
    RECENT_CAMPAIGN_FIRES_TTL,
};
use crate::error::{MailroomError, MailroomResult};
use crate::locks::with_lock;
use crate::models::{ContactId, NewContactFire, PointId, StartMode};
use crate::runner::run_locked;
use crate::runtime::Runtime;
use crate::services::{EngineInput, OrgAssets, Refresh};

/// Fires a campaign point for contacts whose fire came due
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkCampaignTrigger {
    pub point_id: PointId,
    pub fire_version: i32,
    pub contact_ids: Vec<ContactId>,
}

impl TaskType for BulkCampaignTrigger {
    const TYPE: &'static str = "bulk_campaign_trigger";
}

#[async_trait]
impl Task for BulkCampaignTrigger {
    fn task_type(&self) -> &'static str {
        Self::TYPE
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(15 * 60)
    }

    fn with_assets(&self) -> Refresh {
        Refresh::CAMPAIGNS
    }

    async fn perform(&self, rt: &Runtime, oa: &OrgAssets) -> MailroomResult<()> {
        let org_id = oa.org_id();

        // fires for deleted or since-edited points are stale
        let Some(point) = oa.campaign_point(self.point_id) else {
            debug!(org_id = %org_id, point_id = %self.point_id, "Ignoring fires for deleted campaign point");
            return Ok(());
        };
        if point.fire_version != self.fire_version {
            debug!(
                org_id = %org_id,
                point_id = %self.point_id,
                fire_version = self.fire_version,
                current_version = point.fire_version,
                "Ignoring fires for outdated campaign point"
            );
            return Ok(());
        }
        match oa.flow(point.flow_id) {
            Some(flow) if !flow.is_archived => {}
            _ => {
                debug!(org_id = %org_id, point_id = %self.point_id, flow_id = %point.flow_id, "Ignoring fires for unavailable flow");
                return Ok(());
            }
        }

        let mut contact_ids = self.contact_ids.clone();
        if point.start_mode == StartMode::Skip {
            let in_flow: HashSet<ContactId> = rt
                .db
                .sessions
                .filter_in_flow(org_id, &contact_ids)
                .await?
                .into_iter()
                .collect();
            contact_ids.retain(|id| !in_flow.contains(id));
        }
        if contact_ids.is_empty() {
            return Ok(());
        }

        let input = EngineInput::Campaign {
            point_id: point.id,
            flow_id: point.flow_id,
        };
        let interrupt = point.start_mode == StartMode::Interrupt;
        let outcome = run_locked(rt, oa, &contact_ids, interrupt, &input).await?;

        let fired_on = Utc::now();
        let key = keys::recent_campaign_fires(point.id.0);
        for contact_id in &outcome.ran {
            rt.kv
                .capped_zadd(
                    &key,
                    &format!("{contact_id}|{}", fired_on.timestamp_millis()),
                    fired_on.timestamp_millis() as f64 / 1000.0,
                    RECENT_CAMPAIGN_FIRES_CAP,
                    RECENT_CAMPAIGN_FIRES_TTL,
                )
                .await?;
        }

        info!(
            org_id = %org_id,
            point_id = %point.id,
            start_mode = %point.start_mode,
            fired = outcome.ran.len(),
            skipped = self.contact_ids.len() - outcome.ran.len(),
            "Campaign point fired"
        );
        Ok(())
    }
}

/// Rebuilds all future fires of a campaign point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleCampaignPoint {
    pub point_id: PointId,
}

impl TaskType for ScheduleCampaignPoint {
    const TYPE: &'static str = "schedule_campaign_point";
}

#[async_trait]
impl Task for ScheduleCampaignPoint {
    fn task_type(&self) -> &'static str {
        Self::TYPE
    }

    fn timeout(&self) -> Duration {
        LONG_JOB_LOCK_TTL
    }

    fn with_assets(&self) -> Refresh {
        Refresh::CAMPAIGNS | Refresh::GROUPS
    }

    async fn perform(&self, rt: &Runtime, oa: &OrgAssets) -> MailroomResult<()> {
        let lock_key = keys::campaign_point_lock(self.point_id.0);

        let scheduled = with_lock(
            rt.locker.as_ref(),
            &lock_key,
            LONG_JOB_LOCK_TTL,
            LONG_JOB_LOCK_WAIT,
            |_token| self.schedule(rt, oa),
        )
        .await?;

        scheduled.ok_or_else(|| {
            MailroomError::LockError(format!(
                "campaign point {} is being scheduled elsewhere",
                self.point_id
            ))
        })
    }
}

impl ScheduleCampaignPoint {
    async fn schedule(&self, rt: &Runtime, oa: &OrgAssets) -> MailroomResult<()> {
        let org_id = oa.org_id();
        let deleted = rt.db.fires.delete_campaign_fires(self.point_id).await?;

        let Some(point) = oa.campaign_point(self.point_id) else {
            info!(org_id = %org_id, point_id = %self.point_id, deleted, "Campaign point gone, fires removed");
            return Ok(());
        };

        let now = Utc::now();
        let fires: Vec<NewContactFire> = rt
            .db
            .campaigns
            .schedule_inputs(org_id, point)
            .await?
            .into_iter()
            .filter_map(|(contact_id, base)| {
                let fire_on = point.fire_on(base?);
                (fire_on > now).then(|| {
                    NewContactFire::for_campaign(
                        org_id,
                        contact_id,
                        point.id,
                        point.fire_version,
                        fire_on,
                    )
                })
            })
            .collect();

        let inserted = rt.db.fires.insert_fires(&fires).await?;
        info!(org_id = %org_id, point_id = %point.id, deleted, inserted, "Campaign point scheduled");
        Ok(())
    }
}
