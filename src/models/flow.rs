use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::FlowId;

/// Maps to `flows_flow`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Flow {
    pub id: FlowId,
    pub uuid: Uuid,
    pub name: String,
    pub is_archived: bool,
}
