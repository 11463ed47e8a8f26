//! Flow start fan-out, the flow equivalent of the broadcast tasks.

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::{queue_batches, queue_task, Task, TaskType};
use crate::constants::HIGH_LOAD_DEFER_PROBABILITY;
use crate::error::{MailroomError, MailroomResult};
use crate::models::{BatchStatus, ContactId, FlowId, OrgId, StartId};
use crate::queue::Priority;
use crate::recipients;
use crate::runner::run_locked;
use crate::runtime::Runtime;
use crate::services::{EngineInput, OrgAssets, Refresh};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartFlow {
    pub start_id: StartId,
}

impl TaskType for StartFlow {
    const TYPE: &'static str = "start_flow";
}

/// Tasks the owner has waiting across all queues
async fn queued_for_owner(rt: &Runtime, owner_id: OrgId) -> MailroomResult<usize> {
    let mut total = 0;
    for queue in rt.queues.all() {
        total += queue.owner_size(owner_id).await?;
    }
    Ok(total)
}

#[async_trait]
impl Task for StartFlow {
    fn task_type(&self) -> &'static str {
        Self::TYPE
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(30 * 60)
    }

    fn with_assets(&self) -> Refresh {
        Refresh::FLOWS
    }

    async fn perform(&self, rt: &Runtime, oa: &OrgAssets) -> MailroomResult<()> {
        let org_id = oa.org_id();

        let threshold = rt.config.high_load_threshold;
        if threshold > 0 {
            let queued = queued_for_owner(rt, org_id).await?;
            let defer = queued > threshold
                && rand::thread_rng().gen_bool(HIGH_LOAD_DEFER_PROBABILITY);
            if defer {
                info!(org_id = %org_id, start_id = %self.start_id, queued, "Owner under high load, deferring flow start");
                return queue_task(rt.queues.batch.as_ref(), org_id, self, Priority::Bulk).await;
            }
        }

        let start = rt
            .db
            .starts
            .get_start(org_id, self.start_id)
            .await?
            .ok_or_else(|| MailroomError::NotFound(format!("flow start {}", self.start_id)))?;

        if start.status == BatchStatus::Interrupted {
            info!(org_id = %org_id, start_id = %start.id, "Flow start interrupted before starting");
            return Ok(());
        }

        let fan_out = async {
            match oa.flow(start.flow_id) {
                Some(flow) if !flow.is_archived => {}
                _ => {
                    return Err(MailroomError::NotFound(format!(
                        "flow {} of start {}",
                        start.flow_id, start.id
                    )))
                }
            }

            let contact_ids =
                recipients::resolve(rt, oa, &start.recipients, Some(start.flow_id)).await?;
            rt.db
                .starts
                .set_queued(start.id, contact_ids.len() as i64)
                .await?;

            if contact_ids.is_empty() {
                rt.db
                    .starts
                    .set_status(start.id, BatchStatus::Completed)
                    .await?;
                return Ok((0, 0));
            }

            let batches = queue_batches(
                rt,
                org_id,
                &contact_ids,
                rt.config.start_batch_size,
                |contact_ids, is_first, is_last| StartFlowBatch {
                    start_id: start.id,
                    flow_id: start.flow_id,
                    contact_ids,
                    params: start.params.clone(),
                    is_first,
                    is_last,
                },
            )
            .await?;
            Ok::<_, MailroomError>((contact_ids.len(), batches))
        };

        match fan_out.await {
            Ok((contacts, batches)) => {
                info!(org_id = %org_id, start_id = %start.id, contacts, batches, "Flow start queued");
                Ok(())
            }
            Err(e) => {
                rt.db.starts.set_status(start.id, BatchStatus::Failed).await?;
                Err(e)
            }
        }
    }
}

/// Starts a flow for one batch of a flow start's contacts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartFlowBatch {
    pub start_id: StartId,
    pub flow_id: FlowId,
    pub contact_ids: Vec<ContactId>,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    pub is_first: bool,
    pub is_last: bool,
}

impl TaskType for StartFlowBatch {
    const TYPE: &'static str = "start_flow_batch";
}

#[async_trait]
impl Task for StartFlowBatch {
    fn task_type(&self) -> &'static str {
        Self::TYPE
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(15 * 60)
    }

    fn with_assets(&self) -> Refresh {
        Refresh::FLOWS
    }

    async fn perform(&self, rt: &Runtime, oa: &OrgAssets) -> MailroomResult<()> {
        let org_id = oa.org_id();
        let Some(start) = rt.db.starts.get_start(org_id, self.start_id).await? else {
            debug!(org_id = %org_id, start_id = %self.start_id, "Flow start gone, dropping batch");
            return Ok(());
        };

        if matches!(start.status, BatchStatus::Interrupted | BatchStatus::Failed) {
            debug!(org_id = %org_id, start_id = %start.id, status = %start.status, "Flow start stopped, skipping batch");
            return Ok(());
        }

        if self.is_first && start.status == BatchStatus::Queued {
            rt.db.starts.set_status(start.id, BatchStatus::Started).await?;
        }

        let input = EngineInput::FlowStart {
            start_id: Some(start.id),
            flow_id: self.flow_id,
            params: self.params.clone(),
        };
        let outcome = run_locked(rt, oa, &self.contact_ids, true, &input).await?;

        if self.is_last {
            rt.db
                .starts
                .set_status(start.id, BatchStatus::Completed)
                .await?;
        }

        debug!(
            org_id = %org_id,
            start_id = %start.id,
            started = outcome.ran.len(),
            skipped = outcome.skipped.len(),
            "Flow start batch run"
        );
        Ok(())
    }
}
