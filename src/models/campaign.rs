use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::{coded_enum, FlowId, GroupId, PointId};

coded_enum!(
    /// How a campaign point treats contacts that are already in a flow
    StartMode {
        Interrupt = "I",
        Skip = "S",
        Passive = "P",
    }
);

/// A campaign point (event). Maps to `campaigns_campaignevent`.
///
/// Fires are scheduled at `relative_to + offset_minutes` for every member of the
/// campaign's group. Changing the point bumps `fire_version`, which makes fires
/// scheduled for older versions stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct CampaignPoint {
    pub id: PointId,
    pub uuid: Uuid,
    pub campaign_id: i64,
    pub group_id: GroupId,
    pub flow_id: FlowId,
    pub fire_version: i32,
    #[sqlx(try_from = "String")]
    pub start_mode: StartMode,
    pub relative_to: String,
    pub offset_minutes: i64,
}

impl CampaignPoint {
    /// When this point fires for a contact whose `relative_to` value is `base`
    pub fn fire_on(&self, base: DateTime<Utc>) -> DateTime<Utc> {
        base + Duration::minutes(self.offset_minutes)
    }
}
