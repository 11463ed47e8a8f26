use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{IncidentId, OrgId};

pub const WEBHOOKS_UNHEALTHY: &str = "webhooks:unhealthy";

/// Maps to `notifications_incident`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Incident {
    pub id: IncidentId,
    pub org_id: OrgId,
    pub incident_type: String,
    pub started_on: DateTime<Utc>,
}
