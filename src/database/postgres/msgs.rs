use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{raw_ids, PgRepositories};
use crate::database::{CallRepository, MsgRepository};
use crate::error::MailroomResult;
use crate::models::{Call, CallId, CallStatus, Msg, MsgId, OrgId};

#[async_trait]
impl MsgRepository for PgRepositories {
    async fn load_retryable(&self, now: DateTime<Utc>, limit: usize) -> MailroomResult<Vec<Msg>> {
        let msgs = sqlx::query_as::<_, Msg>(
            "SELECT m.id, m.uuid, m.org_id, m.channel_id, m.contact_id, u.identity AS contact_urn, m.text, \
                    m.status, m.high_priority, m.error_count AS retry_count, m.next_attempt, m.created_on \
               FROM msgs_msg m LEFT JOIN contacts_contacturn u ON u.id = m.contact_urn_id \
              WHERE m.direction = 'O' AND m.status = 'E' AND m.next_attempt <= $1 \
              ORDER BY m.next_attempt, m.id LIMIT $2",
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(msgs)
    }

    async fn mark_for_retry(&self, ids: &[MsgId]) -> MailroomResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "UPDATE msgs_msg SET status = 'Q', error_count = error_count + 1, next_attempt = NULL, modified_on = NOW() \
             WHERE id = ANY($1)",
        )
        .bind(raw_ids(ids, |m| m.0))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn fail_old_outgoing(&self, before: DateTime<Utc>) -> MailroomResult<u64> {
        let result = sqlx::query(
            "UPDATE msgs_msg SET status = 'F', failed_reason = 'T', modified_on = NOW() \
             WHERE direction = 'O' AND status IN ('I', 'P', 'Q', 'E') AND created_on < $1",
        )
        .bind(before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn outbox_count(&self, org_id: OrgId) -> MailroomResult<i64> {
        let count: Option<i64> = sqlx::query_scalar(
            "SELECT SUM(count)::bigint FROM msgs_systemlabelcount WHERE org_id = $1 AND label_type = 'O'",
        )
        .bind(org_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.unwrap_or(0))
    }
}

#[async_trait]
impl CallRepository for PgRepositories {
    async fn load_retryable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> MailroomResult<Vec<Call>> {
        let calls = sqlx::query_as::<_, Call>(
            "SELECT c.id, c.org_id, c.channel_id, c.contact_id, u.identity AS contact_urn, c.status, \
                    c.error_count AS retry_count, c.next_attempt \
               FROM ivr_call c JOIN contacts_contacturn u ON u.id = c.contact_urn_id \
              WHERE c.status IN ('Q', 'E') AND c.next_attempt <= $1 \
              ORDER BY c.next_attempt, c.id LIMIT $2",
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(calls)
    }

    async fn update_status(
        &self,
        id: CallId,
        status: CallStatus,
        next_attempt: Option<DateTime<Utc>>,
    ) -> MailroomResult<()> {
        sqlx::query(
            "UPDATE ivr_call SET status = $2, next_attempt = $3, \
                    error_count = CASE WHEN $2 IN ('E', 'F') THEN error_count + 1 ELSE error_count END, \
                    modified_on = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(status.code())
        .bind(next_attempt)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
