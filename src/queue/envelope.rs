//! Wire format of a queued task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MailroomResult;

/// A task as stored in a queue list: `{"type", "task", "queued_on", "error_count"}`.
///
/// The owner is not part of the envelope; it is implied by the list the envelope
/// sits in and handed back alongside it on pop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    #[serde(rename = "type")]
    pub task_type: String,
    pub task: serde_json::Value,
    pub queued_on: DateTime<Utc>,
    #[serde(default)]
    pub error_count: u32,
}

impl TaskEnvelope {
    pub fn new(task_type: impl Into<String>, task: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            task,
            queued_on: Utc::now(),
            error_count: 0,
        }
    }

    /// Envelope for a typed payload
    pub fn for_payload<T: Serialize>(task_type: &str, payload: &T) -> MailroomResult<Self> {
        Ok(Self::new(task_type, serde_json::to_value(payload)?))
    }

    pub fn to_json(&self) -> MailroomResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> MailroomResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Same envelope with one more recorded failure. `queued_on` is kept.
    pub fn with_failure(mut self) -> Self {
        self.error_count += 1;
        self
    }
}
