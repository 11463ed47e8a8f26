use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::OrgId;

/// Maps to `orgs_org`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Org {
    pub id: OrgId,
    pub name: String,
    pub is_active: bool,
    pub is_suspended: bool,
}
