//! # Contact Queues
//!
//! Every event for a contact goes through that contact's private FIFO so events
//! are handled strictly one at a time, across all nodes. Pushing an event also
//! queues a single `handle_contact_event` dispatch task on the realtime queue,
//! unless one is already pending; the worker that runs it takes the contact lock
//! and drains the list.

use async_trait::async_trait;
use tracing::debug;

use crate::error::MailroomResult;
use crate::models::{ContactId, OrgId};
use crate::queue::{Priority, TaskEnvelope};
use crate::runtime::Runtime;
use crate::tasks::{queue_task, ContactTaskType, HandleContactEvent};

pub mod memory;
pub mod redis;

pub use self::memory::MemoryContactQueue;
pub use self::redis::RedisContactQueue;

/// Storage for per-contact event lists and their dispatch markers
#[async_trait]
pub trait ContactQueueStore: Send + Sync + std::fmt::Debug {
    /// Append an envelope. Returns true when no dispatch was pending, in which
    /// case the marker is now set and the caller must queue one.
    async fn push_back(
        &self,
        org_id: OrgId,
        contact_id: ContactId,
        payload: &str,
    ) -> MailroomResult<bool>;

    /// Put an envelope back at the head of the list
    async fn push_front(
        &self,
        org_id: OrgId,
        contact_id: ContactId,
        payload: &str,
    ) -> MailroomResult<()>;

    async fn pop(&self, org_id: OrgId, contact_id: ContactId) -> MailroomResult<Option<String>>;

    /// Set the dispatch marker, returns false if it was already set
    async fn mark_dispatch(&self, org_id: OrgId, contact_id: ContactId) -> MailroomResult<bool>;

    async fn clear_dispatch(&self, org_id: OrgId, contact_id: ContactId) -> MailroomResult<()>;

    async fn size(&self, org_id: OrgId, contact_id: ContactId) -> MailroomResult<usize>;
}

/// Queue a contact task and, when needed, the dispatch task that will drain it
pub async fn queue_contact_task<T: ContactTaskType>(
    rt: &Runtime,
    org_id: OrgId,
    contact_id: ContactId,
    task: &T,
    priority: Priority,
) -> MailroomResult<()> {
    let envelope = TaskEnvelope::for_payload(T::TYPE, task)?;
    let needs_dispatch = rt
        .contact_queue
        .push_back(org_id, contact_id, &envelope.to_json()?)
        .await?;

    if needs_dispatch {
        queue_dispatch(rt, org_id, contact_id, priority).await?;
    }

    debug!(org_id = %org_id, contact_id = %contact_id, task_type = T::TYPE, needs_dispatch, "Contact task queued");
    Ok(())
}

/// Queue a `handle_contact_event` for the contact, clearing the marker if that fails
pub(crate) async fn queue_dispatch(
    rt: &Runtime,
    org_id: OrgId,
    contact_id: ContactId,
    priority: Priority,
) -> MailroomResult<()> {
    let dispatch = HandleContactEvent { contact_id };
    if let Err(e) = queue_task(rt.queues.realtime.as_ref(), org_id, &dispatch, priority).await {
        rt.contact_queue.clear_dispatch(org_id, contact_id).await?;
        return Err(e);
    }
    Ok(())
}
