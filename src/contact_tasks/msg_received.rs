use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::{ContactTask, ContactTaskType};
use crate::error::MailroomResult;
use crate::models::{ChannelId, Contact, ContactStatus};
use crate::runner::run_for_contact;
use crate::runtime::Runtime;
use crate::services::{EngineInput, OrgAssets};

/// An incoming message from the contact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgReceived {
    pub channel_id: Option<ChannelId>,
    pub msg_uuid: Uuid,
    pub urn: String,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    pub received_on: DateTime<Utc>,
}

impl ContactTaskType for MsgReceived {
    const TYPE: &'static str = "msg_received";
}

#[async_trait]
impl ContactTask for MsgReceived {
    fn task_type(&self) -> &'static str {
        Self::TYPE
    }

    async fn perform(&self, rt: &Runtime, oa: &OrgAssets, contact: &Contact) -> MailroomResult<()> {
        rt.db
            .contacts
            .update_last_seen_on(oa.org_id(), contact.id, self.received_on)
            .await?;

        // messages from blocked contacts are recorded but never handled
        if contact.status == ContactStatus::Blocked {
            info!(contact_id = %contact.id, msg_uuid = %self.msg_uuid, "Ignoring message from blocked contact");
            return Ok(());
        }

        let input = EngineInput::Msg {
            msg_uuid: self.msg_uuid,
            channel_id: self.channel_id,
            urn: self.urn.clone(),
            text: self.text.clone(),
            attachments: self.attachments.clone(),
            resume: contact.current_session_uuid.is_some(),
        };
        run_for_contact(rt, oa, contact, input).await?;
        Ok(())
    }
}
