use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{coded_enum, BroadcastId, OrgId, Recipients};

coded_enum!(
    /// Status of a fanned-out job (broadcast or flow start)
    BatchStatus {
        Pending = "P",
        Queued = "Q",
        Started = "S",
        Completed = "C",
        Failed = "F",
        Interrupted = "I",
    }
);

/// A message sent to many contacts. Maps to `msgs_broadcast` and its recipient tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Broadcast {
    pub id: BroadcastId,
    pub org_id: OrgId,
    pub status: BatchStatus,
    /// Message text keyed by language
    pub translations: BTreeMap<String, String>,
    pub base_language: String,
    pub recipients: Recipients,
    pub contact_count: i64,
}

impl Broadcast {
    /// Text in the base language, falling back to any translation
    pub fn base_text(&self) -> &str {
        self.translations
            .get(&self.base_language)
            .or_else(|| self.translations.values().next())
            .map(String::as_str)
            .unwrap_or_default()
    }
}
