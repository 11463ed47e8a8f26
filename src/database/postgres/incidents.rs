use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{raw_ids, PgRepositories};
use crate::database::{ChannelRepository, IncidentRepository};
use crate::error::MailroomResult;
use crate::models::channel::ANDROID_CHANNEL_TYPE;
use crate::models::{Channel, Incident, IncidentId, OrgId};

pub(super) const SELECT_CHANNEL: &str = r#"
SELECT id, uuid, org_id, name, channel_type, tps, config ->> 'FCM_ID' AS fcm_id, last_seen
  FROM channels_channel
"#;

#[async_trait]
impl ChannelRepository for PgRepositories {
    async fn stale_android_channels(
        &self,
        seen_before: DateTime<Utc>,
        limit: usize,
    ) -> MailroomResult<Vec<Channel>> {
        let channels = sqlx::query_as::<_, Channel>(&format!(
            "{SELECT_CHANNEL} WHERE is_active AND channel_type = $1 AND config ->> 'FCM_ID' <> '' \
             AND (last_seen IS NULL OR last_seen < $2) ORDER BY last_seen NULLS FIRST, id LIMIT $3"
        ))
        .bind(ANDROID_CHANNEL_TYPE)
        .bind(seen_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(channels)
    }
}

#[async_trait]
impl IncidentRepository for PgRepositories {
    async fn open_incidents(&self, incident_type: &str) -> MailroomResult<Vec<Incident>> {
        let incidents = sqlx::query_as::<_, Incident>(
            "SELECT id, org_id, incident_type, started_on FROM notifications_incident \
              WHERE incident_type = $1 AND ended_on IS NULL ORDER BY started_on",
        )
        .bind(incident_type)
        .fetch_all(&self.pool)
        .await?;
        Ok(incidents)
    }

    async fn webhook_failures_since(
        &self,
        org_id: OrgId,
        since: DateTime<Utc>,
    ) -> MailroomResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM request_logs_httplog \
              WHERE org_id = $1 AND log_type = 'webhook_called' AND is_error AND created_on >= $2",
        )
        .bind(org_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn end_incidents(&self, ids: &[IncidentId]) -> MailroomResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "UPDATE notifications_incident SET ended_on = NOW() WHERE id = ANY($1) AND ended_on IS NULL",
        )
        .bind(raw_ids(ids, |i| i.0))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
