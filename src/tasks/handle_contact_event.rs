//! Drains a contact's event queue under the contact lock.

use async_trait::async_trait;
use futures::FutureExt;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{queue_task, Task, TaskType};
use crate::constants::{
    keys, CONTACT_DRAIN_BUDGET, CONTACT_LOCK_TTL, CONTACT_LOCK_WAIT, CONTACT_TASK_MAX_ATTEMPTS,
    CONTACT_TASK_TIMEOUT,
};
use crate::contacts::queue_dispatch;
use crate::error::{MailroomError, MailroomResult};
use crate::locks::with_lock;
use crate::metrics;
use crate::models::{ContactId, OrgId};
use crate::queue::{Priority, TaskEnvelope};
use crate::runtime::Runtime;
use crate::services::OrgAssets;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleContactEvent {
    pub contact_id: ContactId,
}

impl TaskType for HandleContactEvent {
    const TYPE: &'static str = "handle_contact_event";
}

/// How a drain ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Drain {
    Emptied,
    /// A failed event went back to the head of the queue
    Retrying,
    /// The lock expired under us
    LockLost,
    /// Ran out of time with events left
    Yielded,
}

#[async_trait]
impl Task for HandleContactEvent {
    fn task_type(&self) -> &'static str {
        Self::TYPE
    }

    fn timeout(&self) -> Duration {
        CONTACT_LOCK_TTL
    }

    async fn perform(&self, rt: &Runtime, oa: &OrgAssets) -> MailroomResult<()> {
        let org_id = oa.org_id();
        let lock_key = keys::contact_lock(org_id, self.contact_id);

        let drained = AssertUnwindSafe(with_lock(
            rt.locker.as_ref(),
            &lock_key,
            CONTACT_LOCK_TTL,
            CONTACT_LOCK_WAIT,
            |token| self.drain(rt, oa, &lock_key, token),
        ))
        .catch_unwind()
        .await;

        // the marker was cleared when the drain started, so any exit short of an
        // empty queue must leave a dispatch behind for the events still waiting
        match drained {
            Ok(Ok(Some(Drain::Emptied))) => Ok(()),
            Ok(Ok(Some(_))) => self.redispatch_remaining(rt, org_id).await,
            Ok(Ok(None)) => {
                // someone else is handling this contact, try again later
                info!(org_id = %org_id, contact_id = %self.contact_id, "Failed to acquire contact lock, requeuing");
                metrics::contact_lock_failures_total().add(1, &[]);
                queue_task(rt.queues.realtime.as_ref(), org_id, self, Priority::Bulk).await
            }
            Ok(Err(e)) => {
                if let Err(redispatch) = self.recover_dispatch(rt, org_id).await {
                    error!(org_id = %org_id, contact_id = %self.contact_id, error = %redispatch, "Failed to redispatch after drain error");
                }
                Err(e)
            }
            Err(panic) => {
                if let Err(redispatch) = self.recover_dispatch(rt, org_id).await {
                    error!(org_id = %org_id, contact_id = %self.contact_id, error = %redispatch, "Failed to redispatch after drain panic");
                }
                std::panic::resume_unwind(panic)
            }
        }
    }
}

impl HandleContactEvent {
    async fn drain(
        &self,
        rt: &Runtime,
        oa: &OrgAssets,
        lock_key: &str,
        token: String,
    ) -> MailroomResult<Drain> {
        let org_id = oa.org_id();
        let contact_id = self.contact_id;

        let started = Instant::now();

        // events pushed from here on need a new dispatch
        rt.contact_queue.clear_dispatch(org_id, contact_id).await?;

        while let Some(raw) = rt.contact_queue.pop(org_id, contact_id).await? {
            let envelope = TaskEnvelope::from_json(&raw)?;
            let task = rt.contact_tasks.decode(&envelope)?;

            let Some(contact) = rt
                .db
                .contacts
                .load_contact(org_id, contact_id, task.use_read_only())
                .await?
            else {
                info!(org_id = %org_id, contact_id = %contact_id, task_type = task.task_type(), "Contact no longer exists, discarding event");
                continue;
            };

            let performed = tokio::time::timeout(CONTACT_TASK_TIMEOUT, task.perform(rt, oa, &contact))
                .await
                .unwrap_or_else(|_| {
                    Err(MailroomError::Timeout(format!(
                        "{} exceeded {}s",
                        envelope.task_type,
                        CONTACT_TASK_TIMEOUT.as_secs()
                    )))
                });

            if let Err(e) = performed {
                let envelope = envelope.with_failure();
                if envelope.error_count < CONTACT_TASK_MAX_ATTEMPTS {
                    warn!(
                        org_id = %org_id,
                        contact_id = %contact_id,
                        task_type = %envelope.task_type,
                        error_count = envelope.error_count,
                        error = %e,
                        "Contact task failed, will retry"
                    );
                    rt.contact_queue
                        .push_front(org_id, contact_id, &envelope.to_json()?)
                        .await?;
                    return Ok(Drain::Retrying);
                }

                error!(
                    org_id = %org_id,
                    contact_id = %contact_id,
                    task_type = %envelope.task_type,
                    task = %envelope.task,
                    error = %e,
                    "Contact task failed too many times, dropping"
                );
                metrics::contact_tasks_dropped_total()
                    .add(1, &[KeyValue::new("task_type", envelope.task_type.clone())]);
            }

            if !rt.locker.extend(lock_key, &token, CONTACT_LOCK_TTL).await? {
                warn!(org_id = %org_id, contact_id = %contact_id, "Contact lock lost while draining");
                return Ok(Drain::LockLost);
            }

            if started.elapsed() >= CONTACT_DRAIN_BUDGET {
                debug!(org_id = %org_id, contact_id = %contact_id, "Contact drain out of time, yielding");
                return Ok(Drain::Yielded);
            }
        }

        debug!(org_id = %org_id, contact_id = %contact_id, "Contact queue drained");
        Ok(Drain::Emptied)
    }

    /// After a failed drain the marker state is unknown, reset it so a dispatch is
    /// queued for whatever is left
    async fn recover_dispatch(&self, rt: &Runtime, org_id: OrgId) -> MailroomResult<()> {
        rt.contact_queue.clear_dispatch(org_id, self.contact_id).await?;
        self.redispatch_remaining(rt, org_id).await
    }

    /// Queue another drain for events still waiting, unless a push already did
    async fn redispatch_remaining(&self, rt: &Runtime, org_id: OrgId) -> MailroomResult<()> {
        if rt.contact_queue.size(org_id, self.contact_id).await? == 0 {
            return Ok(());
        }
        if rt.contact_queue.mark_dispatch(org_id, self.contact_id).await? {
            queue_dispatch(rt, org_id, self.contact_id, Priority::Bulk).await?;
        }
        Ok(())
    }
}
