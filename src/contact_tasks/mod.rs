//! # Contact Tasks
//!
//! Events for a single contact. They are never queued on a fair queue directly:
//! they go through the contact's queue and run inside the
//! [`HandleContactEvent`](crate::tasks::HandleContactEvent) drain, one at a time,
//! with the contact loaded and locked.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;

use crate::error::{MailroomError, MailroomResult};
use crate::models::Contact;
use crate::queue::TaskEnvelope;
use crate::runtime::Runtime;
use crate::services::OrgAssets;

pub mod event_received;
pub mod msg_received;
pub mod timers;

pub use self::event_received::EventReceived;
pub use self::msg_received::MsgReceived;
pub use self::timers::{WaitExpiration, WaitTimeout};

#[async_trait]
pub trait ContactTask: Send + Sync + std::fmt::Debug {
    fn task_type(&self) -> &'static str;

    /// Whether the contact can be loaded from the read replica
    fn use_read_only(&self) -> bool {
        false
    }

    async fn perform(&self, rt: &Runtime, oa: &OrgAssets, contact: &Contact)
        -> MailroomResult<()>;
}

pub trait ContactTaskType: ContactTask + Serialize + DeserializeOwned + 'static {
    const TYPE: &'static str;
}

type Decoder = fn(serde_json::Value) -> MailroomResult<Box<dyn ContactTask>>;

fn decode_as<T: ContactTaskType>(payload: serde_json::Value) -> MailroomResult<Box<dyn ContactTask>> {
    let task: T = serde_json::from_value(payload)?;
    Ok(Box::new(task))
}

#[derive(Clone, Default)]
pub struct ContactTaskRegistry {
    decoders: HashMap<&'static str, Decoder>,
}

impl std::fmt::Debug for ContactTaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContactTaskRegistry")
            .field("types", &self.types())
            .finish()
    }
}

impl ContactTaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: ContactTaskType>(&mut self) -> &mut Self {
        self.decoders.insert(T::TYPE, decode_as::<T>);
        self
    }

    pub fn types(&self) -> Vec<&'static str> {
        let mut types: Vec<&'static str> = self.decoders.keys().copied().collect();
        types.sort_unstable();
        types
    }

    pub fn decode(&self, envelope: &TaskEnvelope) -> MailroomResult<Box<dyn ContactTask>> {
        let decoder = self
            .decoders
            .get(envelope.task_type.as_str())
            .ok_or_else(|| MailroomError::UnknownTaskType(envelope.task_type.clone()))?;
        decoder(envelope.task.clone())
    }
}

pub fn default_registry() -> ContactTaskRegistry {
    let mut registry = ContactTaskRegistry::new();
    registry
        .register::<MsgReceived>()
        .register::<EventReceived>()
        .register::<WaitTimeout>()
        .register::<WaitExpiration>();
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_registry() {
        assert_eq!(
            default_registry().types(),
            vec!["event_received", "msg_received", "wait_expiration", "wait_timeout"]
        );
    }

    #[test]
    fn test_decodes_timer() {
        let envelope = TaskEnvelope::new(
            "wait_timeout",
            json!({
                "session_uuid": "8f7b5b1e-8a4f-4c61-9d1e-0a5c0f2f0c11",
                "sprint_uuid": "1d5a3f0b-1d7e-4c2f-b6a2-6f1b1e2c3d4e",
            }),
        );
        let task = default_registry().decode(&envelope).unwrap();
        assert_eq!(task.task_type(), "wait_timeout");
        assert!(!task.use_read_only());
    }
}
