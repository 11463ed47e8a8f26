//! Session timers fired by the contact-fire dispatcher.
//!
//! A timer only resumes the session it was set for: the contact must still be in
//! that session and the session's last sprint must be the one that set the timer.
//! Anything else means the contact has moved on and the timer is stale.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::{ContactTask, ContactTaskType};
use crate::error::MailroomResult;
use crate::models::Contact;
use crate::runner::run_for_contact;
use crate::runtime::Runtime;
use crate::services::{EngineInput, OrgAssets};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitTimeout {
    pub session_uuid: Uuid,
    pub sprint_uuid: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitExpiration {
    pub session_uuid: Uuid,
    pub sprint_uuid: Uuid,
}

impl ContactTaskType for WaitTimeout {
    const TYPE: &'static str = "wait_timeout";
}

impl ContactTaskType for WaitExpiration {
    const TYPE: &'static str = "wait_expiration";
}

/// Whether the contact is still waiting in the session and sprint the timer was set for
async fn timer_applies(
    rt: &Runtime,
    oa: &OrgAssets,
    contact: &Contact,
    session_uuid: Uuid,
    sprint_uuid: Uuid,
) -> MailroomResult<bool> {
    if contact.current_session_uuid != Some(session_uuid) {
        return Ok(false);
    }
    let session = rt.db.sessions.get_session(oa.org_id(), session_uuid).await?;
    Ok(session.is_some_and(|s| s.matches_timer(session_uuid, sprint_uuid)))
}

#[async_trait]
impl ContactTask for WaitTimeout {
    fn task_type(&self) -> &'static str {
        Self::TYPE
    }

    async fn perform(&self, rt: &Runtime, oa: &OrgAssets, contact: &Contact) -> MailroomResult<()> {
        if !timer_applies(rt, oa, contact, self.session_uuid, self.sprint_uuid).await? {
            debug!(contact_id = %contact.id, session_uuid = %self.session_uuid, "Ignoring stale wait timeout");
            return Ok(());
        }

        let input = EngineInput::WaitTimeout {
            session_uuid: self.session_uuid,
            sprint_uuid: self.sprint_uuid,
        };
        run_for_contact(rt, oa, contact, input).await?;
        Ok(())
    }
}

#[async_trait]
impl ContactTask for WaitExpiration {
    fn task_type(&self) -> &'static str {
        Self::TYPE
    }

    async fn perform(&self, rt: &Runtime, oa: &OrgAssets, contact: &Contact) -> MailroomResult<()> {
        if !timer_applies(rt, oa, contact, self.session_uuid, self.sprint_uuid).await? {
            debug!(contact_id = %contact.id, session_uuid = %self.session_uuid, "Ignoring stale wait expiration");
            return Ok(());
        }

        let input = EngineInput::WaitExpiration {
            session_uuid: self.session_uuid,
            sprint_uuid: self.sprint_uuid,
        };
        run_for_contact(rt, oa, contact, input).await?;
        Ok(())
    }
}
