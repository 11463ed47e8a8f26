use serde::{Deserialize, Serialize};

use super::{ContactId, GroupId};

/// Filters applied after recipients are resolved
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Exclusions {
    /// Drop blocked, stopped and archived contacts
    pub non_active: bool,
    /// Drop contacts currently waiting in a flow
    pub in_a_flow: bool,
    /// Drop contacts that have ever been in the started flow
    pub started_previously: bool,
    /// Drop contacts not seen within this many days, 0 disables
    pub not_seen_since_days: i32,
}

/// Who a broadcast or flow start goes to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Recipients {
    pub contact_ids: Vec<ContactId>,
    pub group_ids: Vec<GroupId>,
    pub query: Option<String>,
    pub urns: Vec<String>,
    pub exclusions: Exclusions,
}

impl Recipients {
    pub fn contacts(ids: impl IntoIterator<Item = ContactId>) -> Self {
        Self {
            contact_ids: ids.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.contact_ids.is_empty()
            && self.group_ids.is_empty()
            && self.urns.is_empty()
            && self.query.as_deref().map_or(true, str::is_empty)
    }
}
