use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{raw_ids, PgRepositories};
use crate::database::{CampaignRepository, ContactFireRepository};
use crate::error::MailroomResult;
use crate::models::{
    CampaignPoint, ContactFire, ContactId, FireId, FireType, NewContactFire, OrgId, PointId,
};

/// Contact columns a campaign point may be relative to; anything else is a custom field
const SYSTEM_DATE_FIELDS: [&str; 2] = ["created_on", "last_seen_on"];

#[async_trait]
impl ContactFireRepository for PgRepositories {
    async fn load_due(&self, now: DateTime<Utc>, limit: usize) -> MailroomResult<Vec<ContactFire>> {
        let fires = sqlx::query_as::<_, ContactFire>(
            "SELECT id, org_id, contact_id, fire_type, scope, fire_on, session_uuid, sprint_uuid \
               FROM contacts_contactfire WHERE fire_on <= $1 ORDER BY fire_on, id LIMIT $2",
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(fires)
    }

    async fn delete_fires(&self, ids: &[FireId]) -> MailroomResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM contacts_contactfire WHERE id = ANY($1)")
            .bind(raw_ids(ids, |f| f.0))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_campaign_fires(&self, point_id: PointId) -> MailroomResult<u64> {
        let result = sqlx::query(
            "DELETE FROM contacts_contactfire WHERE fire_type = $1 AND split_part(scope, ':', 1) = $2",
        )
        .bind(FireType::Campaign.code())
        .bind(point_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_fires(&self, fires: &[NewContactFire]) -> MailroomResult<u64> {
        if fires.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for fire in fires {
            let result = sqlx::query(
                "INSERT INTO contacts_contactfire (org_id, contact_id, fire_type, scope, fire_on, session_uuid, sprint_uuid) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) ON CONFLICT DO NOTHING",
            )
            .bind(fire.org_id)
            .bind(fire.contact_id)
            .bind(fire.fire_type.code())
            .bind(&fire.scope)
            .bind(fire.fire_on)
            .bind(fire.session_uuid)
            .bind(fire.sprint_uuid)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }
}

#[async_trait]
impl CampaignRepository for PgRepositories {
    async fn schedule_inputs(
        &self,
        org_id: OrgId,
        point: &CampaignPoint,
    ) -> MailroomResult<Vec<(ContactId, Option<DateTime<Utc>>)>> {
        let rows: Vec<(i64, Option<DateTime<Utc>>)> =
            if SYSTEM_DATE_FIELDS.contains(&point.relative_to.as_str()) {
                let sql = format!(
                    "SELECT c.id, c.{} FROM contacts_contact c \
                       JOIN contacts_contactgroup_contacts gc ON gc.contact_id = c.id \
                      WHERE c.org_id = $1 AND gc.contactgroup_id = $2 AND c.is_active ORDER BY c.id",
                    point.relative_to
                );
                sqlx::query_as(&sql)
                    .bind(org_id)
                    .bind(point.group_id)
                    .fetch_all(&self.pool)
                    .await?
            } else {
                sqlx::query_as(
                    "SELECT c.id, (c.fields -> $3 ->> 'datetime')::timestamptz FROM contacts_contact c \
                       JOIN contacts_contactgroup_contacts gc ON gc.contact_id = c.id \
                      WHERE c.org_id = $1 AND gc.contactgroup_id = $2 AND c.is_active ORDER BY c.id",
                )
                .bind(org_id)
                .bind(point.group_id)
                .bind(&point.relative_to)
                .fetch_all(&self.pool)
                .await?
            };

        Ok(rows
            .into_iter()
            .map(|(id, value)| (ContactId(id), value))
            .collect())
    }
}
