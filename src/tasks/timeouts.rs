//! Bulk session timers: fan fired wait timeouts and expirations out to the
//! contact queues, where each is checked against the contact's current session.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::{Task, TaskType};
use crate::contact_tasks::{WaitExpiration, WaitTimeout};
use crate::contacts::queue_contact_task;
use crate::error::MailroomResult;
use crate::models::ContactId;
use crate::queue::Priority;
use crate::runtime::Runtime;
use crate::services::OrgAssets;

/// A contact's session and the sprint that set its timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedSession {
    pub contact_id: ContactId,
    pub session_uuid: Uuid,
    pub sprint_uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkWaitTimeout {
    pub timeouts: Vec<TimedSession>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkWaitExpire {
    pub expirations: Vec<TimedSession>,
}

impl TaskType for BulkWaitTimeout {
    const TYPE: &'static str = "bulk_wait_timeout";
}

impl TaskType for BulkWaitExpire {
    const TYPE: &'static str = "bulk_wait_expire";
}

#[async_trait]
impl Task for BulkWaitTimeout {
    fn task_type(&self) -> &'static str {
        Self::TYPE
    }

    async fn perform(&self, rt: &Runtime, oa: &OrgAssets) -> MailroomResult<()> {
        for timed in &self.timeouts {
            let task = WaitTimeout {
                session_uuid: timed.session_uuid,
                sprint_uuid: timed.sprint_uuid,
            };
            queue_contact_task(rt, oa.org_id(), timed.contact_id, &task, Priority::High).await?;
        }
        debug!(org_id = %oa.org_id(), count = self.timeouts.len(), "Queued wait timeouts");
        Ok(())
    }
}

#[async_trait]
impl Task for BulkWaitExpire {
    fn task_type(&self) -> &'static str {
        Self::TYPE
    }

    async fn perform(&self, rt: &Runtime, oa: &OrgAssets) -> MailroomResult<()> {
        for timed in &self.expirations {
            let task = WaitExpiration {
                session_uuid: timed.session_uuid,
                sprint_uuid: timed.sprint_uuid,
            };
            queue_contact_task(rt, oa.org_id(), timed.contact_id, &task, Priority::High).await?;
        }
        debug!(org_id = %oa.org_id(), count = self.expirations.len(), "Queued wait expirations");
        Ok(())
    }
}
