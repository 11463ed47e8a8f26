use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::{ChannelId, OrgId};

pub const ANDROID_CHANNEL_TYPE: &str = "A";

/// Maps to `channels_channel`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Channel {
    pub id: ChannelId,
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub name: String,
    pub channel_type: String,
    /// Messages per second the courier may send on this channel
    pub tps: Option<i32>,
    pub fcm_id: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Channel {
    pub fn is_android(&self) -> bool {
        self.channel_type == ANDROID_CHANNEL_TYPE
    }
}
