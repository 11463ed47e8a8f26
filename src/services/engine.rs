//! The flow engine seam.
//!
//! The engine interprets flows: given a contact and something that happened to
//! them, it advances or starts a session and reports what it did. Session
//! persistence belongs to the engine; the task engine only forwards the
//! messages it creates to the courier.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::OrgAssets;
use crate::error::{MailroomError, MailroomResult};
use crate::models::{BroadcastId, ChannelId, Contact, FlowId, Msg, PointId, SessionStatus, StartId};

/// What the engine is asked to handle for a contact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineInput {
    /// An incoming message, resuming the contact's waiting session if `resume` is set
    Msg {
        msg_uuid: Uuid,
        channel_id: Option<ChannelId>,
        urn: String,
        text: String,
        attachments: Vec<String>,
        resume: bool,
    },
    /// A non-message channel event (new conversation, referral, missed call...)
    ChannelEvent {
        event_type: String,
        channel_id: Option<ChannelId>,
        extra: serde_json::Value,
    },
    WaitTimeout {
        session_uuid: Uuid,
        sprint_uuid: Uuid,
    },
    WaitExpiration {
        session_uuid: Uuid,
        sprint_uuid: Uuid,
    },
    Campaign {
        point_id: PointId,
        flow_id: FlowId,
    },
    FlowStart {
        start_id: Option<StartId>,
        flow_id: FlowId,
        params: Option<serde_json::Value>,
    },
    Broadcast {
        broadcast_id: BroadcastId,
        translations: BTreeMap<String, String>,
        base_language: String,
    },
}

/// Side effects reported back by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    MsgCreated { msg: Msg },
    SessionEnded { session_uuid: Uuid, status: SessionStatus },
}

#[async_trait]
pub trait FlowEngine: Send + Sync {
    async fn run(
        &self,
        oa: &OrgAssets,
        contact: &Contact,
        input: EngineInput,
    ) -> MailroomResult<Vec<EngineEvent>>;
}

/// Messages created by a run, in order
pub fn created_msgs(events: Vec<EngineEvent>) -> impl Iterator<Item = Msg> {
    events.into_iter().filter_map(|event| match event {
        EngineEvent::MsgCreated { msg } => Some(msg),
        _ => None,
    })
}

/// Engine used when none has been wired in; every run fails
#[derive(Debug, Default, Clone)]
pub struct UnconfiguredEngine;

#[async_trait]
impl FlowEngine for UnconfiguredEngine {
    async fn run(
        &self,
        _oa: &OrgAssets,
        _contact: &Contact,
        _input: EngineInput,
    ) -> MailroomResult<Vec<EngineEvent>> {
        Err(MailroomError::Unavailable(
            "no flow engine configured".to_string(),
        ))
    }
}
