use async_trait::async_trait;

use super::{raw_ids, PgRepositories};
use crate::database::GroupRepository;
use crate::error::MailroomResult;
use crate::models::{ContactId, GroupId, GroupStatus, OrgId};

#[async_trait]
impl GroupRepository for PgRepositories {
    async fn member_ids(
        &self,
        org_id: OrgId,
        group_ids: &[GroupId],
    ) -> MailroomResult<Vec<ContactId>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT gc.contact_id FROM contacts_contactgroup_contacts gc \
               JOIN contacts_contactgroup g ON g.id = gc.contactgroup_id \
              WHERE g.org_id = $1 AND gc.contactgroup_id = ANY($2) ORDER BY gc.contact_id",
        )
        .bind(org_id)
        .bind(raw_ids(group_ids, |g| g.0))
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(ContactId).collect())
    }

    async fn set_members(
        &self,
        org_id: OrgId,
        group_id: GroupId,
        contact_ids: &[ContactId],
    ) -> MailroomResult<()> {
        let members = raw_ids(contact_ids, |c| c.0);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM contacts_contactgroup_contacts WHERE contactgroup_id = $1 AND NOT (contact_id = ANY($2))",
        )
        .bind(group_id)
        .bind(&members)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO contacts_contactgroup_contacts (contactgroup_id, contact_id) \
             SELECT $1, c.id FROM contacts_contact c WHERE c.org_id = $2 AND c.id = ANY($3) \
             ON CONFLICT DO NOTHING",
        )
        .bind(group_id)
        .bind(org_id)
        .bind(&members)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn set_status(&self, group_id: GroupId, status: GroupStatus) -> MailroomResult<()> {
        sqlx::query("UPDATE contacts_contactgroup SET status = $2, modified_on = NOW() WHERE id = $1")
            .bind(group_id)
            .bind(status.code())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
