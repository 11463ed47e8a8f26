//! Broadcast fan-out: `send_broadcast` resolves the recipients and splits them
//! into `send_broadcast_batch` tasks, each of which sends to its contacts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::{queue_batches, Task, TaskType};
use crate::error::{MailroomError, MailroomResult};
use crate::models::{BatchStatus, BroadcastId, ContactId};
use crate::recipients;
use crate::runner::run_locked;
use crate::runtime::Runtime;
use crate::services::{EngineInput, OrgAssets};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendBroadcast {
    pub broadcast_id: BroadcastId,
}

impl TaskType for SendBroadcast {
    const TYPE: &'static str = "send_broadcast";
}

#[async_trait]
impl Task for SendBroadcast {
    fn task_type(&self) -> &'static str {
        Self::TYPE
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(30 * 60)
    }

    async fn perform(&self, rt: &Runtime, oa: &OrgAssets) -> MailroomResult<()> {
        let org_id = oa.org_id();
        let broadcast = rt
            .db
            .broadcasts
            .get_broadcast(org_id, self.broadcast_id)
            .await?
            .ok_or_else(|| MailroomError::NotFound(format!("broadcast {}", self.broadcast_id)))?;

        if broadcast.status == BatchStatus::Interrupted {
            info!(org_id = %org_id, broadcast_id = %broadcast.id, "Broadcast interrupted before sending");
            return Ok(());
        }

        let fan_out = async {
            let contact_ids = recipients::resolve(rt, oa, &broadcast.recipients, None).await?;
            rt.db
                .broadcasts
                .set_queued(broadcast.id, contact_ids.len() as i64)
                .await?;

            if contact_ids.is_empty() {
                rt.db
                    .broadcasts
                    .set_status(broadcast.id, BatchStatus::Completed)
                    .await?;
                return Ok((0, 0));
            }

            let batches = queue_batches(
                rt,
                org_id,
                &contact_ids,
                rt.config.broadcast_batch_size,
                |contact_ids, is_first, is_last| SendBroadcastBatch {
                    broadcast_id: broadcast.id,
                    contact_ids,
                    is_first,
                    is_last,
                },
            )
            .await?;
            Ok::<_, MailroomError>((contact_ids.len(), batches))
        };

        match fan_out.await {
            Ok((contacts, batches)) => {
                info!(org_id = %org_id, broadcast_id = %broadcast.id, contacts, batches, "Broadcast queued");
                Ok(())
            }
            Err(e) => {
                rt.db
                    .broadcasts
                    .set_status(broadcast.id, BatchStatus::Failed)
                    .await?;
                Err(e)
            }
        }
    }
}

/// Sends a broadcast to one batch of its recipients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendBroadcastBatch {
    pub broadcast_id: BroadcastId,
    pub contact_ids: Vec<ContactId>,
    pub is_first: bool,
    pub is_last: bool,
}

impl TaskType for SendBroadcastBatch {
    const TYPE: &'static str = "send_broadcast_batch";
}

#[async_trait]
impl Task for SendBroadcastBatch {
    fn task_type(&self) -> &'static str {
        Self::TYPE
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(15 * 60)
    }

    async fn perform(&self, rt: &Runtime, oa: &OrgAssets) -> MailroomResult<()> {
        let org_id = oa.org_id();
        let Some(broadcast) = rt
            .db
            .broadcasts
            .get_broadcast(org_id, self.broadcast_id)
            .await?
        else {
            debug!(org_id = %org_id, broadcast_id = %self.broadcast_id, "Broadcast gone, dropping batch");
            return Ok(());
        };

        if matches!(broadcast.status, BatchStatus::Interrupted | BatchStatus::Failed) {
            debug!(org_id = %org_id, broadcast_id = %broadcast.id, status = %broadcast.status, "Broadcast stopped, skipping batch");
            return Ok(());
        }

        if self.is_first && broadcast.status == BatchStatus::Queued {
            rt.db
                .broadcasts
                .set_status(broadcast.id, BatchStatus::Started)
                .await?;
        }

        let input = EngineInput::Broadcast {
            broadcast_id: broadcast.id,
            translations: broadcast.translations.clone(),
            base_language: broadcast.base_language.clone(),
        };
        let outcome = run_locked(rt, oa, &self.contact_ids, false, &input).await?;

        if self.is_last {
            rt.db
                .broadcasts
                .set_status(broadcast.id, BatchStatus::Completed)
                .await?;
        }

        debug!(
            org_id = %org_id,
            broadcast_id = %broadcast.id,
            sent_to = outcome.ran.len(),
            skipped = outcome.skipped.len(),
            msgs = outcome.msgs,
            "Broadcast batch sent"
        );
        Ok(())
    }
}
