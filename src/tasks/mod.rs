//! # Tasks
//!
//! A task is a serializable unit of work queued on one of the fair queues. Its
//! envelope carries the registered type name; workers look the name up in the
//! [`TaskRegistry`] to decode the payload back into a [`Task`] and run it.
//!
//! ## Registered tasks
//!
//! | Type | Queued on |
//! |------|-----------|
//! | `handle_contact_event` | realtime |
//! | `bulk_wait_timeout`, `bulk_wait_expire`, `bulk_campaign_trigger` | throttled (high) |
//! | `interrupt_session_batch`, `interrupt_sessions` | batch |
//! | `send_broadcast`, `start_flow`, `populate_dynamic_group`, `schedule_campaign_point` | batch |
//! | `send_broadcast_batch`, `start_flow_batch` | throttled, realtime for one contact |
//!
//! Type names are part of the wire format; renaming one breaks tasks already queued.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::error;

use crate::error::{MailroomError, MailroomResult};
use crate::models::{ContactId, OrgId};
use crate::queue::{Priority, TaskEnvelope, TaskQueue};
use crate::runtime::Runtime;
use crate::services::{OrgAssets, Refresh};

pub mod broadcasts;
pub mod campaigns;
pub mod groups;
pub mod handle_contact_event;
pub mod interrupts;
pub mod starts;
pub mod timeouts;

pub use self::broadcasts::{SendBroadcast, SendBroadcastBatch};
pub use self::campaigns::{BulkCampaignTrigger, ScheduleCampaignPoint};
pub use self::groups::PopulateDynamicGroup;
pub use self::handle_contact_event::HandleContactEvent;
pub use self::interrupts::{InterruptSessionBatch, InterruptSessions};
pub use self::starts::{StartFlow, StartFlowBatch};
pub use self::timeouts::{BulkWaitExpire, BulkWaitTimeout, TimedSession};

pub use crate::contact_tasks::ContactTaskType;

/// Timeout for tasks that do not declare their own
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(60);

#[async_trait]
pub trait Task: Send + Sync + std::fmt::Debug {
    fn task_type(&self) -> &'static str;

    /// Hard cap on how long `perform` may run
    fn timeout(&self) -> Duration {
        DEFAULT_TASK_TIMEOUT
    }

    /// Parts of the org's assets to reload before the task runs
    fn with_assets(&self) -> Refresh {
        Refresh::NONE
    }

    async fn perform(&self, rt: &Runtime, oa: &OrgAssets) -> MailroomResult<()>;
}

/// A task with a registered type name that can be queued and decoded
pub trait TaskType: Task + Serialize + DeserializeOwned + 'static {
    const TYPE: &'static str;
}

type Decoder = fn(serde_json::Value) -> MailroomResult<Box<dyn Task>>;

fn decode_as<T: TaskType>(payload: serde_json::Value) -> MailroomResult<Box<dyn Task>> {
    let task: T = serde_json::from_value(payload)?;
    Ok(Box::new(task))
}

/// Type name -> decoder for every task a worker can run
#[derive(Clone, Default)]
pub struct TaskRegistry {
    decoders: HashMap<&'static str, Decoder>,
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("types", &self.types())
            .finish()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: TaskType>(&mut self) -> &mut Self {
        self.decoders.insert(T::TYPE, decode_as::<T>);
        self
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.decoders.contains_key(task_type)
    }

    /// Registered type names, sorted
    pub fn types(&self) -> Vec<&'static str> {
        let mut types: Vec<&'static str> = self.decoders.keys().copied().collect();
        types.sort_unstable();
        types
    }

    pub fn decode(&self, envelope: &TaskEnvelope) -> MailroomResult<Box<dyn Task>> {
        let decoder = self
            .decoders
            .get(envelope.task_type.as_str())
            .ok_or_else(|| MailroomError::UnknownTaskType(envelope.task_type.clone()))?;
        decoder(envelope.task.clone())
    }
}

/// Registry with every task the service runs
pub fn default_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry
        .register::<HandleContactEvent>()
        .register::<BulkWaitTimeout>()
        .register::<BulkWaitExpire>()
        .register::<InterruptSessionBatch>()
        .register::<InterruptSessions>()
        .register::<BulkCampaignTrigger>()
        .register::<ScheduleCampaignPoint>()
        .register::<SendBroadcast>()
        .register::<SendBroadcastBatch>()
        .register::<StartFlow>()
        .register::<StartFlowBatch>()
        .register::<PopulateDynamicGroup>();
    registry
}

/// Queue a task for the given owner
pub async fn queue_task<T: TaskType>(
    queue: &dyn TaskQueue,
    owner_id: OrgId,
    task: &T,
    priority: Priority,
) -> MailroomResult<()> {
    let envelope = TaskEnvelope::for_payload(T::TYPE, task)?;
    queue.push(owner_id, &envelope, priority).await
}

/// Queue one batch task per chunk of contacts, flagging the first and last.
///
/// A single contact goes on the realtime queue with high priority, anything larger
/// on the throttled queue. Only a failure to queue the first batch is returned;
/// later failures are logged since the parent is already committed by then.
/// Returns how many batches were queued.
pub(crate) async fn queue_batches<T, F>(
    rt: &Runtime,
    owner_id: OrgId,
    contact_ids: &[ContactId],
    batch_size: usize,
    make_batch: F,
) -> MailroomResult<usize>
where
    T: TaskType,
    F: Fn(Vec<ContactId>, bool, bool) -> T,
{
    let (queue, priority) = if contact_ids.len() == 1 {
        (rt.queues.realtime.as_ref(), Priority::High)
    } else {
        (rt.queues.throttled.as_ref(), Priority::Bulk)
    };

    let chunks: Vec<&[ContactId]> = contact_ids.chunks(batch_size.max(1)).collect();
    let last = chunks.len().saturating_sub(1);
    let mut queued = 0;

    for (i, chunk) in chunks.into_iter().enumerate() {
        let batch = make_batch(chunk.to_vec(), i == 0, i == last);
        match queue_task(queue, owner_id, &batch, priority).await {
            Ok(()) => queued += 1,
            Err(e) if i == 0 => return Err(e),
            Err(e) => {
                error!(owner_id = %owner_id, task_type = T::TYPE, batch = i, error = %e, "Failed to queue batch");
            }
        }
    }
    Ok(queued)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContactId;
    use serde_json::json;

    #[test]
    fn test_default_registry_knows_every_task() {
        let registry = default_registry();
        assert_eq!(registry.types().len(), 12);
        for name in [
            "handle_contact_event",
            "bulk_wait_timeout",
            "bulk_wait_expire",
            "interrupt_session_batch",
            "interrupt_sessions",
            "bulk_campaign_trigger",
            "schedule_campaign_point",
            "send_broadcast",
            "send_broadcast_batch",
            "start_flow",
            "start_flow_batch",
            "populate_dynamic_group",
        ] {
            assert!(registry.contains(name), "{name} not registered");
        }
    }

    #[test]
    fn test_decode_round_trips_payload() {
        let registry = default_registry();
        let envelope = TaskEnvelope::for_payload(
            HandleContactEvent::TYPE,
            &HandleContactEvent {
                contact_id: ContactId(42),
            },
        )
        .unwrap();
        let task = registry.decode(&envelope).unwrap();
        assert_eq!(task.task_type(), "handle_contact_event");
    }

    #[test]
    fn test_decode_rejects_unknown_and_corrupt() {
        let registry = default_registry();
        let unknown = TaskEnvelope::new("mystery", json!({}));
        assert_eq!(
            registry.decode(&unknown).unwrap_err(),
            MailroomError::UnknownTaskType("mystery".to_string())
        );

        let corrupt = TaskEnvelope::new("handle_contact_event", json!({ "contact_id": "x" }));
        assert!(matches!(
            registry.decode(&corrupt).unwrap_err(),
            MailroomError::SerializationError(_)
        ));
    }
}
