use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

use super::{Cron, CronStats};
use crate::constants::keys;
use crate::error::MailroomResult;
use crate::models::OrgId;
use crate::runtime::Runtime;

/// Contact documents removed per org per run
pub const DEINDEX_BATCH_SIZE: usize = 10_000;

/// Removes the contact documents of deleted orgs from the search index
#[derive(Debug, Clone, Copy, Default)]
pub struct DeindexDeletedOrgs;

#[async_trait]
impl Cron for DeindexDeletedOrgs {
    fn name(&self) -> &'static str {
        "deindex_deleted_orgs"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(60 * 60)
    }

    async fn run(&self, rt: &Runtime) -> MailroomResult<CronStats> {
        let members = rt.kv.smembers(keys::DEINDEX_ORGS).await?;
        let (mut orgs, mut deindexed) = (0, 0);

        for member in members {
            let Ok(org_id) = member.parse::<OrgId>() else {
                warn!(member = %member, "Invalid org id in deindex set, removing");
                rt.kv.srem(keys::DEINDEX_ORGS, &member).await?;
                continue;
            };

            let deleted = rt
                .search
                .deindex_org_contacts(org_id, DEINDEX_BATCH_SIZE)
                .await?;
            if deleted == 0 {
                info!(org_id = %org_id, "Org fully deindexed");
                rt.kv.srem(keys::DEINDEX_ORGS, &member).await?;
            }

            orgs += 1;
            deindexed += deleted as u64;
        }

        Ok(CronStats::from([("orgs", orgs), ("deindexed", deindexed)]))
    }
}
