use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{BatchStatus, FlowId, OrgId, Recipients, StartId};

/// A request to start a flow for many contacts. Maps to `flows_flowstart` and its
/// recipient tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStart {
    pub id: StartId,
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub flow_id: FlowId,
    pub status: BatchStatus,
    pub recipients: Recipients,
    pub params: Option<serde_json::Value>,
    pub contact_count: i64,
}
