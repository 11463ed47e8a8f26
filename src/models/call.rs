use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{coded_enum, CallId, ChannelId, ContactId, OrgId};

coded_enum!(
    CallStatus {
        Pending = "P",
        Queued = "Q",
        Wired = "W",
        InProgress = "I",
        Completed = "D",
        Errored = "E",
        Failed = "F",
    }
);

/// An IVR call. Maps to `ivr_call`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Call {
    pub id: CallId,
    pub org_id: OrgId,
    pub channel_id: ChannelId,
    pub contact_id: ContactId,
    pub contact_urn: String,
    #[sqlx(try_from = "String")]
    pub status: CallStatus,
    pub retry_count: i32,
    pub next_attempt: Option<DateTime<Utc>>,
}
