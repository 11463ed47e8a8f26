use async_trait::async_trait;

use super::incidents::SELECT_CHANNEL;
use super::PgRepositories;
use crate::error::MailroomResult;
use crate::models::{CampaignPoint, Channel, Flow, Group, Org, OrgId};
use crate::services::AssetLoader;

#[async_trait]
impl AssetLoader for PgRepositories {
    async fn load_org(&self, org_id: OrgId) -> MailroomResult<Option<Org>> {
        let org = sqlx::query_as::<_, Org>(
            "SELECT id, name, is_active, is_suspended FROM orgs_org WHERE id = $1",
        )
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(org)
    }

    async fn load_channels(&self, org_id: OrgId) -> MailroomResult<Vec<Channel>> {
        let channels = sqlx::query_as::<_, Channel>(&format!(
            "{SELECT_CHANNEL} WHERE org_id = $1 AND is_active ORDER BY id"
        ))
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(channels)
    }

    async fn load_campaign_points(&self, org_id: OrgId) -> MailroomResult<Vec<CampaignPoint>> {
        let points = sqlx::query_as::<_, CampaignPoint>(
            "SELECT e.id, e.uuid, e.campaign_id, c.group_id, e.flow_id, e.fire_version, e.start_mode, \
                    e.relative_to_key AS relative_to, e.offset_minutes \
               FROM campaigns_campaignevent e JOIN campaigns_campaign c ON c.id = e.campaign_id \
              WHERE c.org_id = $1 AND c.is_active AND NOT c.is_archived AND e.is_active ORDER BY e.id",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(points)
    }

    async fn load_groups(&self, org_id: OrgId) -> MailroomResult<Vec<Group>> {
        let groups = sqlx::query_as::<_, Group>(
            "SELECT id, uuid, name, query, status FROM contacts_contactgroup \
              WHERE org_id = $1 AND is_active ORDER BY id",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(groups)
    }

    async fn load_flows(&self, org_id: OrgId) -> MailroomResult<Vec<Flow>> {
        let flows = sqlx::query_as::<_, Flow>(
            "SELECT id, uuid, name, is_archived FROM flows_flow WHERE org_id = $1 AND is_active ORDER BY id",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(flows)
    }
}
