use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ContactTask, ContactTaskType};
use crate::error::MailroomResult;
use crate::models::{ChannelId, Contact};
use crate::runner::run_for_contact;
use crate::runtime::Runtime;
use crate::services::{EngineInput, OrgAssets};

/// Channel event that opts the contact out
pub const STOP_CONTACT: &str = "stop_contact";

/// A channel event for the contact: new conversation, referral, opt out, etc.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventReceived {
    pub event_type: String,
    pub channel_id: Option<ChannelId>,
    #[serde(default)]
    pub extra: serde_json::Value,
    pub created_on: DateTime<Utc>,
}

impl ContactTaskType for EventReceived {
    const TYPE: &'static str = "event_received";
}

#[async_trait]
impl ContactTask for EventReceived {
    fn task_type(&self) -> &'static str {
        Self::TYPE
    }

    async fn perform(&self, rt: &Runtime, oa: &OrgAssets, contact: &Contact) -> MailroomResult<()> {
        let org_id = oa.org_id();
        rt.db
            .contacts
            .update_last_seen_on(org_id, contact.id, self.created_on)
            .await?;

        if self.event_type == STOP_CONTACT {
            rt.db.contacts.stop_contact(org_id, contact.id).await?;
            let interrupted = rt.db.sessions.interrupt_contacts(org_id, &[contact.id]).await?;
            debug!(contact_id = %contact.id, interrupted, "Contact stopped");
            return Ok(());
        }

        if !contact.is_active() {
            debug!(contact_id = %contact.id, event_type = %self.event_type, "Ignoring event for inactive contact");
            return Ok(());
        }

        let input = EngineInput::ChannelEvent {
            event_type: self.event_type.clone(),
            channel_id: self.channel_id,
            extra: self.extra.clone(),
        };
        run_for_contact(rt, oa, contact, input).await?;
        Ok(())
    }
}
