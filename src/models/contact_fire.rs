use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::{ContactId, FireId, OrgId, PointId};

/// What a contact fire does when it comes due
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FireType {
    WaitTimeout,
    WaitExpiration,
    SessionExpiration,
    Campaign,
}

impl FireType {
    pub fn code(&self) -> &'static str {
        match self {
            FireType::WaitTimeout => "T",
            FireType::WaitExpiration => "E",
            FireType::SessionExpiration => "S",
            FireType::Campaign => "C",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "T" => Some(FireType::WaitTimeout),
            "E" => Some(FireType::WaitExpiration),
            "S" => Some(FireType::SessionExpiration),
            "C" => Some(FireType::Campaign),
            _ => None,
        }
    }
}

/// A scheduled per-contact event. Maps to `contacts_contactfire`.
///
/// The type is kept as the raw stored code so that rows of a type this version
/// does not know about can still be fetched and reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ContactFire {
    pub id: FireId,
    pub org_id: OrgId,
    pub contact_id: ContactId,
    pub fire_type: String,
    pub scope: String,
    pub fire_on: DateTime<Utc>,
    pub session_uuid: Option<Uuid>,
    pub sprint_uuid: Option<Uuid>,
}

impl ContactFire {
    pub fn kind(&self) -> Option<FireType> {
        FireType::from_code(&self.fire_type)
    }
}

/// A contact fire to be inserted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewContactFire {
    pub org_id: OrgId,
    pub contact_id: ContactId,
    pub fire_type: FireType,
    pub scope: String,
    pub fire_on: DateTime<Utc>,
    pub session_uuid: Option<Uuid>,
    pub sprint_uuid: Option<Uuid>,
}

impl NewContactFire {
    pub fn for_campaign(
        org_id: OrgId,
        contact_id: ContactId,
        point_id: PointId,
        fire_version: i32,
        fire_on: DateTime<Utc>,
    ) -> Self {
        Self {
            org_id,
            contact_id,
            fire_type: FireType::Campaign,
            scope: campaign_scope(point_id, fire_version),
            fire_on,
            session_uuid: None,
            sprint_uuid: None,
        }
    }
}

/// Scope of a campaign fire: `<pointID>:<fireVersion>`
pub fn campaign_scope(point_id: PointId, fire_version: i32) -> String {
    format!("{point_id}:{fire_version}")
}

pub fn parse_campaign_scope(scope: &str) -> Option<(PointId, i32)> {
    let (point, version) = scope.split_once(':')?;
    Some((point.parse().ok()?, version.parse().ok()?))
}
