use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::{coded_enum, GroupId};

coded_enum!(
    GroupStatus {
        Initializing = "I",
        Evaluating = "V",
        Ready = "R",
    }
);

/// A contact group. Maps to `contacts_contactgroup`. Groups with a query are smart
/// groups whose membership is recomputed from search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Group {
    pub id: GroupId,
    pub uuid: Uuid,
    pub name: String,
    pub query: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: GroupStatus,
}
