use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{raw_ids, PgRepositories};
use crate::database::ContactRepository;
use crate::error::MailroomResult;
use crate::models::{Contact, ContactId, ContactStatus, OrgId};

const SELECT_CONTACT: &str = r#"
SELECT c.id, c.uuid, c.org_id, c.name, c.status, c.last_seen_on,
       s.uuid AS current_session_uuid, s.current_flow_id
  FROM contacts_contact c
  LEFT JOIN flows_flowsession s ON s.contact_id = c.id AND s.status = 'W'
 WHERE c.org_id = $1 AND c.id = $2 AND c.is_active
"#;

#[async_trait]
impl ContactRepository for PgRepositories {
    async fn load_contact(
        &self,
        org_id: OrgId,
        contact_id: ContactId,
        read_only: bool,
    ) -> MailroomResult<Option<Contact>> {
        let contact = sqlx::query_as::<_, Contact>(SELECT_CONTACT)
            .bind(org_id)
            .bind(contact_id)
            .fetch_optional(self.reader(read_only))
            .await?;
        Ok(contact)
    }

    async fn update_last_seen_on(
        &self,
        org_id: OrgId,
        contact_id: ContactId,
        seen_on: DateTime<Utc>,
    ) -> MailroomResult<()> {
        sqlx::query(
            "UPDATE contacts_contact SET last_seen_on = $3, modified_on = NOW() \
             WHERE org_id = $1 AND id = $2 AND (last_seen_on IS NULL OR last_seen_on < $3)",
        )
        .bind(org_id)
        .bind(contact_id)
        .bind(seen_on)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn stop_contact(&self, org_id: OrgId, contact_id: ContactId) -> MailroomResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE contacts_contact SET status = $3, modified_on = NOW() WHERE org_id = $1 AND id = $2",
        )
        .bind(org_id)
        .bind(contact_id)
        .bind(ContactStatus::Stopped.code())
        .execute(&mut *tx)
        .await?;

        // stopped contacts leave every static group
        sqlx::query(
            "DELETE FROM contacts_contactgroup_contacts gc USING contacts_contactgroup g \
             WHERE gc.contactgroup_id = g.id AND gc.contact_id = $1 AND g.query IS NULL",
        )
        .bind(contact_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_or_create_by_urns(
        &self,
        org_id: OrgId,
        urns: &[String],
    ) -> MailroomResult<Vec<ContactId>> {
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(urns.len());

        for urn in urns {
            let existing: Option<i64> = sqlx::query_scalar(
                "SELECT contact_id FROM contacts_contacturn WHERE org_id = $1 AND identity = $2 AND contact_id IS NOT NULL",
            )
            .bind(org_id)
            .bind(urn)
            .fetch_optional(&mut *tx)
            .await?;

            let id = match existing {
                Some(id) => id,
                None => {
                    let id: i64 = sqlx::query_scalar(
                        "INSERT INTO contacts_contact (org_id, uuid, status, is_active, created_on, modified_on) \
                         VALUES ($1, $2, 'A', TRUE, NOW(), NOW()) RETURNING id",
                    )
                    .bind(org_id)
                    .bind(Uuid::new_v4())
                    .fetch_one(&mut *tx)
                    .await?;

                    sqlx::query(
                        "INSERT INTO contacts_contacturn (org_id, identity, contact_id) VALUES ($1, $2, $3) \
                         ON CONFLICT (org_id, identity) DO UPDATE SET contact_id = EXCLUDED.contact_id",
                    )
                    .bind(org_id)
                    .bind(urn)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                    id
                }
            };
            ids.push(ContactId(id));
        }

        tx.commit().await?;
        Ok(ids)
    }

    async fn filter_active(
        &self,
        org_id: OrgId,
        contact_ids: &[ContactId],
    ) -> MailroomResult<Vec<ContactId>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM contacts_contact WHERE org_id = $1 AND id = ANY($2) AND is_active AND status = 'A' ORDER BY id",
        )
        .bind(org_id)
        .bind(raw_ids(contact_ids, |c| c.0))
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(ContactId).collect())
    }

    async fn filter_seen_since(
        &self,
        org_id: OrgId,
        contact_ids: &[ContactId],
        since: DateTime<Utc>,
    ) -> MailroomResult<Vec<ContactId>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM contacts_contact WHERE org_id = $1 AND id = ANY($2) AND last_seen_on >= $3 ORDER BY id",
        )
        .bind(org_id)
        .bind(raw_ids(contact_ids, |c| c.0))
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(ContactId).collect())
    }
}
