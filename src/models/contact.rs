use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::{coded_enum, ContactId, FlowId, OrgId};

coded_enum!(
    ContactStatus {
        Active = "A",
        Blocked = "B",
        Stopped = "S",
        Archived = "V",
    }
);

/// A contact as seen by the task engine. Maps to `contacts_contact`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Contact {
    pub id: ContactId,
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub name: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: ContactStatus,
    pub last_seen_on: Option<DateTime<Utc>>,
    pub current_session_uuid: Option<Uuid>,
    pub current_flow_id: Option<FlowId>,
}

impl Contact {
    pub fn new(org_id: OrgId, id: ContactId) -> Self {
        Self {
            id,
            uuid: Uuid::new_v4(),
            org_id,
            name: None,
            status: ContactStatus::Active,
            last_seen_on: None,
            current_session_uuid: None,
            current_flow_id: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ContactStatus::Active
    }
}
