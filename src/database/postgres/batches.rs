use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::PgRepositories;
use crate::database::{BroadcastRepository, FlowStartRepository};
use crate::error::MailroomResult;
use crate::models::{
    BatchStatus, Broadcast, BroadcastId, ContactId, Exclusions, FlowId, FlowStart, GroupId, OrgId,
    Recipients, StartId,
};

#[derive(Debug, FromRow)]
struct RecipientColumns {
    contact_ids: Vec<i64>,
    group_ids: Vec<i64>,
    query: Option<String>,
    urns: Vec<String>,
    exclusions: Option<Json<Exclusions>>,
}

impl From<RecipientColumns> for Recipients {
    fn from(row: RecipientColumns) -> Self {
        Recipients {
            contact_ids: row.contact_ids.into_iter().map(ContactId).collect(),
            group_ids: row.group_ids.into_iter().map(GroupId).collect(),
            query: row.query,
            urns: row.urns,
            exclusions: row.exclusions.map(|e| e.0).unwrap_or_default(),
        }
    }
}

#[derive(Debug, FromRow)]
struct BroadcastRow {
    id: i64,
    org_id: i64,
    #[sqlx(try_from = "String")]
    status: BatchStatus,
    translations: Json<BTreeMap<String, String>>,
    base_language: String,
    contact_count: i64,
    #[sqlx(flatten)]
    recipients: RecipientColumns,
}

#[derive(Debug, FromRow)]
struct FlowStartRow {
    id: i64,
    uuid: Uuid,
    org_id: i64,
    flow_id: i64,
    #[sqlx(try_from = "String")]
    status: BatchStatus,
    params: Option<Json<serde_json::Value>>,
    contact_count: i64,
    #[sqlx(flatten)]
    recipients: RecipientColumns,
}

// the join tables are aggregated so a batch loads in one round trip
const RECIPIENT_COLUMNS: &str = r#"
       COALESCE((SELECT array_agg(contact_id ORDER BY contact_id) FROM {table}_contacts WHERE {fk} = b.id), '{}') AS contact_ids,
       COALESCE((SELECT array_agg(contactgroup_id ORDER BY contactgroup_id) FROM {table}_groups WHERE {fk} = b.id), '{}') AS group_ids,
       b.query, COALESCE(b.urns, '{}') AS urns, b.exclusions
"#;

fn recipient_columns(table: &str, fk: &str) -> String {
    RECIPIENT_COLUMNS
        .replace("{table}", table)
        .replace("{fk}", fk)
}

#[async_trait]
impl BroadcastRepository for PgRepositories {
    async fn get_broadcast(
        &self,
        org_id: OrgId,
        id: BroadcastId,
    ) -> MailroomResult<Option<Broadcast>> {
        let sql = format!(
            "SELECT b.id, b.org_id, b.status, b.translations, b.base_language, b.contact_count, {} \
               FROM msgs_broadcast b WHERE b.org_id = $1 AND b.id = $2",
            recipient_columns("msgs_broadcast", "broadcast_id")
        );
        let row = sqlx::query_as::<_, BroadcastRow>(&sql)
            .bind(org_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| Broadcast {
            id: BroadcastId(row.id),
            org_id: OrgId(row.org_id),
            status: row.status,
            translations: row.translations.0,
            base_language: row.base_language,
            recipients: row.recipients.into(),
            contact_count: row.contact_count,
        }))
    }

    async fn set_queued(&self, id: BroadcastId, contact_count: i64) -> MailroomResult<()> {
        sqlx::query(
            "UPDATE msgs_broadcast SET status = 'Q', contact_count = $2, modified_on = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(contact_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_status(&self, id: BroadcastId, status: BatchStatus) -> MailroomResult<()> {
        sqlx::query("UPDATE msgs_broadcast SET status = $2, modified_on = NOW() WHERE id = $1")
            .bind(id)
            .bind(status.code())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl FlowStartRepository for PgRepositories {
    async fn get_start(&self, org_id: OrgId, id: StartId) -> MailroomResult<Option<FlowStart>> {
        let sql = format!(
            "SELECT b.id, b.uuid, b.org_id, b.flow_id, b.status, b.params, b.contact_count, {} \
               FROM flows_flowstart b WHERE b.org_id = $1 AND b.id = $2",
            recipient_columns("flows_flowstart", "flowstart_id")
        );
        let row = sqlx::query_as::<_, FlowStartRow>(&sql)
            .bind(org_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| FlowStart {
            id: StartId(row.id),
            uuid: row.uuid,
            org_id: OrgId(row.org_id),
            flow_id: FlowId(row.flow_id),
            status: row.status,
            recipients: row.recipients.into(),
            params: row.params.map(|p| p.0),
            contact_count: row.contact_count,
        }))
    }

    async fn set_queued(&self, id: StartId, contact_count: i64) -> MailroomResult<()> {
        sqlx::query(
            "UPDATE flows_flowstart SET status = 'Q', contact_count = $2, modified_on = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(contact_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_status(&self, id: StartId, status: BatchStatus) -> MailroomResult<()> {
        sqlx::query("UPDATE flows_flowstart SET status = $2, modified_on = NOW() WHERE id = $1")
            .bind(id)
            .bind(status.code())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
