use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::{queue_task, Task, TaskType};
use crate::error::MailroomResult;
use crate::models::{ContactId, FlowId, SessionStatus};
use crate::queue::Priority;
use crate::runtime::Runtime;
use crate::services::OrgAssets;

/// Sessions per `interrupt_session_batch` task
pub const INTERRUPT_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRef {
    pub session_uuid: Uuid,
    pub contact_id: ContactId,
}

/// Ends a batch of waiting sessions with the given status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptSessionBatch {
    pub sessions: Vec<SessionRef>,
    pub status: SessionStatus,
}

impl TaskType for InterruptSessionBatch {
    const TYPE: &'static str = "interrupt_session_batch";
}

#[async_trait]
impl Task for InterruptSessionBatch {
    fn task_type(&self) -> &'static str {
        Self::TYPE
    }

    async fn perform(&self, rt: &Runtime, oa: &OrgAssets) -> MailroomResult<()> {
        let uuids: Vec<Uuid> = self.sessions.iter().map(|s| s.session_uuid).collect();
        let ended = rt
            .db
            .sessions
            .exit_sessions(oa.org_id(), &uuids, self.status)
            .await?;

        info!(org_id = %oa.org_id(), status = %self.status, requested = uuids.len(), ended, "Exited sessions");
        Ok(())
    }
}

/// Interrupts every waiting session of the given contacts or in the given flows
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptSessions {
    #[serde(default)]
    pub contact_ids: Vec<ContactId>,
    #[serde(default)]
    pub flow_ids: Vec<FlowId>,
}

impl TaskType for InterruptSessions {
    const TYPE: &'static str = "interrupt_sessions";
}

#[async_trait]
impl Task for InterruptSessions {
    fn task_type(&self) -> &'static str {
        Self::TYPE
    }

    async fn perform(&self, rt: &Runtime, oa: &OrgAssets) -> MailroomResult<()> {
        let org_id = oa.org_id();
        let sessions = rt
            .db
            .sessions
            .waiting_sessions(org_id, &self.contact_ids, &self.flow_ids)
            .await?;

        let refs: Vec<SessionRef> = sessions
            .iter()
            .map(|s| SessionRef {
                session_uuid: s.uuid,
                contact_id: s.contact_id,
            })
            .collect();

        for chunk in refs.chunks(INTERRUPT_BATCH_SIZE) {
            let batch = InterruptSessionBatch {
                sessions: chunk.to_vec(),
                status: SessionStatus::Interrupted,
            };
            queue_task(rt.queues.batch.as_ref(), org_id, &batch, Priority::Bulk).await?;
        }

        info!(org_id = %org_id, sessions = refs.len(), batches = refs.len().div_ceil(INTERRUPT_BATCH_SIZE), "Queued session interrupts");
        Ok(())
    }
}
