use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::{coded_enum, ChannelId, ContactId, MsgId, OrgId};

coded_enum!(
    MsgStatus {
        Pending = "P",
        Queued = "Q",
        Wired = "W",
        Sent = "S",
        Delivered = "D",
        Errored = "E",
        Failed = "F",
    }
);

/// An outgoing message. Maps to `msgs_msg`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Msg {
    pub id: MsgId,
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub channel_id: Option<ChannelId>,
    pub contact_id: ContactId,
    pub contact_urn: Option<String>,
    pub text: String,
    #[sqlx(try_from = "String")]
    pub status: MsgStatus,
    pub high_priority: bool,
    pub retry_count: i32,
    pub next_attempt: Option<DateTime<Utc>>,
    pub created_on: DateTime<Utc>,
}

impl Msg {
    /// New outgoing message ready to be handed to the courier
    pub fn outgoing(
        org_id: OrgId,
        channel_id: Option<ChannelId>,
        contact_id: ContactId,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: MsgId(0),
            uuid: Uuid::new_v4(),
            org_id,
            channel_id,
            contact_id,
            contact_urn: None,
            text: text.into(),
            status: MsgStatus::Queued,
            high_priority: false,
            retry_count: 0,
            next_attempt: None,
            created_on: Utc::now(),
        }
    }
}
