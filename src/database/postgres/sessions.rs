use async_trait::async_trait;
use uuid::Uuid;

use super::{raw_ids, PgRepositories};
use crate::database::SessionRepository;
use crate::error::MailroomResult;
use crate::models::{ContactId, FlowId, OrgId, Session, SessionStatus};

const SELECT_SESSION: &str = r#"
SELECT uuid, org_id, contact_id, status, current_flow_id, last_sprint_uuid, created_on
  FROM flows_flowsession
"#;

#[async_trait]
impl SessionRepository for PgRepositories {
    async fn get_session(&self, org_id: OrgId, uuid: Uuid) -> MailroomResult<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(&format!(
            "{SELECT_SESSION} WHERE org_id = $1 AND uuid = $2"
        ))
        .bind(org_id)
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    async fn exit_sessions(
        &self,
        org_id: OrgId,
        uuids: &[Uuid],
        status: SessionStatus,
    ) -> MailroomResult<u64> {
        if uuids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE flows_flowsession SET status = $3, ended_on = NOW(), current_flow_id = NULL \
             WHERE org_id = $1 AND uuid = ANY($2) AND status = 'W'",
        )
        .bind(org_id)
        .bind(uuids)
        .bind(status.code())
        .execute(&mut *tx)
        .await?;

        // timers of ended sessions are now meaningless
        sqlx::query("DELETE FROM contacts_contactfire WHERE org_id = $1 AND session_uuid = ANY($2)")
            .bind(org_id)
            .bind(uuids)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn interrupt_contacts(
        &self,
        org_id: OrgId,
        contact_ids: &[ContactId],
    ) -> MailroomResult<u64> {
        let uuids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT uuid FROM flows_flowsession WHERE org_id = $1 AND contact_id = ANY($2) AND status = 'W'",
        )
        .bind(org_id)
        .bind(raw_ids(contact_ids, |c| c.0))
        .fetch_all(&self.pool)
        .await?;

        self.exit_sessions(org_id, &uuids, SessionStatus::Interrupted)
            .await
    }

    async fn filter_in_flow(
        &self,
        org_id: OrgId,
        contact_ids: &[ContactId],
    ) -> MailroomResult<Vec<ContactId>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT contact_id FROM flows_flowsession \
             WHERE org_id = $1 AND contact_id = ANY($2) AND status = 'W' ORDER BY contact_id",
        )
        .bind(org_id)
        .bind(raw_ids(contact_ids, |c| c.0))
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(ContactId).collect())
    }

    async fn filter_started_previously(
        &self,
        org_id: OrgId,
        flow_id: FlowId,
        contact_ids: &[ContactId],
    ) -> MailroomResult<Vec<ContactId>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT contact_id FROM flows_flowrun \
             WHERE org_id = $1 AND flow_id = $2 AND contact_id = ANY($3) ORDER BY contact_id",
        )
        .bind(org_id)
        .bind(flow_id)
        .bind(raw_ids(contact_ids, |c| c.0))
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(ContactId).collect())
    }

    async fn waiting_sessions(
        &self,
        org_id: OrgId,
        contact_ids: &[ContactId],
        flow_ids: &[FlowId],
    ) -> MailroomResult<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(&format!(
            "{SELECT_SESSION} WHERE org_id = $1 AND status = 'W' \
             AND (contact_id = ANY($2) OR current_flow_id = ANY($3)) ORDER BY created_on"
        ))
        .bind(org_id)
        .bind(raw_ids(contact_ids, |c| c.0))
        .bind(raw_ids(flow_ids, |f| f.0))
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }
}
