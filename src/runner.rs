//! Engine runs.
//!
//! [`run_for_contact`] is used inside the contact queue drain, where the caller
//! already holds the contact lock. [`run_locked`] is used by batch tasks: it takes
//! each contact's lock in turn so batch runs never overlap with the contact's
//! own event handling.

use tracing::debug;

use crate::constants::{keys, CONTACT_LOCK_TTL, CONTACT_LOCK_WAIT};
use crate::error::MailroomResult;
use crate::locks::with_lock;
use crate::models::{Contact, ContactId, Msg};
use crate::runtime::Runtime;
use crate::services::{EngineEvent, EngineInput, OrgAssets};

/// Run the engine for a contact and queue the messages it creates, returns how many
pub async fn run_for_contact(
    rt: &Runtime,
    oa: &OrgAssets,
    contact: &Contact,
    input: EngineInput,
) -> MailroomResult<usize> {
    let events = rt.engine.run(oa, contact, input).await?;

    let mut msgs: Vec<Msg> = Vec::new();
    for event in events {
        match event {
            EngineEvent::MsgCreated { msg } => msgs.push(msg),
            EngineEvent::SessionEnded {
                session_uuid,
                status,
            } => {
                debug!(contact_id = %contact.id, %session_uuid, %status, "Session ended");
            }
        }
    }

    if !msgs.is_empty() {
        rt.courier.queue_messages(oa, &msgs).await?;
    }
    Ok(msgs.len())
}

/// What a locked batch run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Contacts the engine ran for
    pub ran: Vec<ContactId>,
    /// Contacts skipped: missing, not active or locked elsewhere for too long
    pub skipped: Vec<ContactId>,
    pub msgs: usize,
}

/// Run the engine for each contact under its contact lock.
///
/// With `interrupt` set, the contact's waiting sessions are interrupted first.
pub async fn run_locked(
    rt: &Runtime,
    oa: &OrgAssets,
    contact_ids: &[ContactId],
    interrupt: bool,
    input: &EngineInput,
) -> MailroomResult<BatchOutcome> {
    let org_id = oa.org_id();
    let mut outcome = BatchOutcome::default();

    for &contact_id in contact_ids {
        let lock_key = keys::contact_lock(org_id, contact_id);
        let ran = with_lock(
            rt.locker.as_ref(),
            &lock_key,
            CONTACT_LOCK_TTL,
            CONTACT_LOCK_WAIT,
            |_token| async move {
                let Some(mut contact) = rt
                    .db
                    .contacts
                    .load_contact(org_id, contact_id, false)
                    .await?
                else {
                    return Ok(None);
                };
                if !contact.is_active() {
                    return Ok(None);
                }

                if interrupt && contact.current_session_uuid.is_some() {
                    rt.db
                        .sessions
                        .interrupt_contacts(org_id, &[contact_id])
                        .await?;
                    contact.current_session_uuid = None;
                    contact.current_flow_id = None;
                }

                run_for_contact(rt, oa, &contact, input.clone()).await.map(Some)
            },
        )
        .await?;

        match ran.flatten() {
            Some(msgs) => {
                outcome.ran.push(contact_id);
                outcome.msgs += msgs;
            }
            None => outcome.skipped.push(contact_id),
        }
    }

    if !outcome.skipped.is_empty() {
        debug!(org_id = %org_id, skipped = outcome.skipped.len(), "Contacts skipped by batch run");
    }
    Ok(outcome)
}
