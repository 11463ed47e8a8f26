//! # Database Access
//!
//! Repository traits for every table the task engine touches, with a Postgres
//! implementation ([`postgres::PgRepositories`]) and an in-memory one
//! ([`memory::MemoryDatabase`]). Tasks and crons only see the traits, bundled in
//! [`Repositories`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::MailroomResult;
use crate::models::{
    BatchStatus, Broadcast, BroadcastId, Call, CallId, CallStatus, CampaignPoint, Channel,
    Contact, ContactFire, ContactId, FireId, FlowId, FlowStart, GroupId, GroupStatus, Incident,
    IncidentId, Msg, MsgId, NewContactFire, OrgId, PointId, Session, SessionStatus, StartId,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryDatabase;
pub use postgres::PgRepositories;

#[async_trait]
pub trait ContactRepository: Send + Sync {
    /// Load a contact, from the read replica when `read_only` is set and one exists
    async fn load_contact(
        &self,
        org_id: OrgId,
        contact_id: ContactId,
        read_only: bool,
    ) -> MailroomResult<Option<Contact>>;

    /// Move `last_seen_on` forward to `seen_on`; older values are ignored
    async fn update_last_seen_on(
        &self,
        org_id: OrgId,
        contact_id: ContactId,
        seen_on: DateTime<Utc>,
    ) -> MailroomResult<()>;

    async fn stop_contact(&self, org_id: OrgId, contact_id: ContactId) -> MailroomResult<()>;

    /// Ids of the contacts owning these URNs, creating contacts for unknown URNs
    async fn get_or_create_by_urns(
        &self,
        org_id: OrgId,
        urns: &[String],
    ) -> MailroomResult<Vec<ContactId>>;

    /// The given contacts that are active
    async fn filter_active(
        &self,
        org_id: OrgId,
        contact_ids: &[ContactId],
    ) -> MailroomResult<Vec<ContactId>>;

    /// The given contacts seen at or after `since`
    async fn filter_seen_since(
        &self,
        org_id: OrgId,
        contact_ids: &[ContactId],
        since: DateTime<Utc>,
    ) -> MailroomResult<Vec<ContactId>>;
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn get_session(&self, org_id: OrgId, uuid: Uuid) -> MailroomResult<Option<Session>>;

    /// End waiting sessions with the given status, returns how many were ended
    async fn exit_sessions(
        &self,
        org_id: OrgId,
        uuids: &[Uuid],
        status: SessionStatus,
    ) -> MailroomResult<u64>;

    /// Interrupt the waiting sessions of these contacts
    async fn interrupt_contacts(
        &self,
        org_id: OrgId,
        contact_ids: &[ContactId],
    ) -> MailroomResult<u64>;

    /// The given contacts that have a waiting session
    async fn filter_in_flow(
        &self,
        org_id: OrgId,
        contact_ids: &[ContactId],
    ) -> MailroomResult<Vec<ContactId>>;

    /// The given contacts that have ever had a session in the flow
    async fn filter_started_previously(
        &self,
        org_id: OrgId,
        flow_id: FlowId,
        contact_ids: &[ContactId],
    ) -> MailroomResult<Vec<ContactId>>;

    /// Waiting sessions belonging to any of the contacts or in any of the flows
    async fn waiting_sessions(
        &self,
        org_id: OrgId,
        contact_ids: &[ContactId],
        flow_ids: &[FlowId],
    ) -> MailroomResult<Vec<Session>>;
}

#[async_trait]
pub trait ContactFireRepository: Send + Sync {
    /// Up to `limit` fires due at `now`, oldest first
    async fn load_due(&self, now: DateTime<Utc>, limit: usize) -> MailroomResult<Vec<ContactFire>>;

    async fn delete_fires(&self, ids: &[FireId]) -> MailroomResult<u64>;

    /// Delete every fire of a campaign point, whatever its version
    async fn delete_campaign_fires(&self, point_id: PointId) -> MailroomResult<u64>;

    /// Insert fires, skipping any that duplicate an existing (contact, type, scope)
    async fn insert_fires(&self, fires: &[NewContactFire]) -> MailroomResult<u64>;
}

#[async_trait]
pub trait CampaignRepository: Send + Sync {
    /// Members of the point's group with the value of the field the point is relative to
    async fn schedule_inputs(
        &self,
        org_id: OrgId,
        point: &CampaignPoint,
    ) -> MailroomResult<Vec<(ContactId, Option<DateTime<Utc>>)>>;
}

#[async_trait]
pub trait MsgRepository: Send + Sync {
    /// Errored outgoing messages whose next attempt is due
    async fn load_retryable(&self, now: DateTime<Utc>, limit: usize) -> MailroomResult<Vec<Msg>>;

    /// Put messages back in the queued state and count the retry
    async fn mark_for_retry(&self, ids: &[MsgId]) -> MailroomResult<u64>;

    /// Fail outgoing messages created before `before` that were never sent
    async fn fail_old_outgoing(&self, before: DateTime<Utc>) -> MailroomResult<u64>;

    /// Messages waiting in the org's outbox
    async fn outbox_count(&self, org_id: OrgId) -> MailroomResult<i64>;
}

#[async_trait]
pub trait CallRepository: Send + Sync {
    /// Errored or queued calls whose next attempt is due
    async fn load_retryable(&self, now: DateTime<Utc>, limit: usize)
        -> MailroomResult<Vec<Call>>;

    async fn update_status(
        &self,
        id: CallId,
        status: CallStatus,
        next_attempt: Option<DateTime<Utc>>,
    ) -> MailroomResult<()>;
}

#[async_trait]
pub trait BroadcastRepository: Send + Sync {
    async fn get_broadcast(
        &self,
        org_id: OrgId,
        id: BroadcastId,
    ) -> MailroomResult<Option<Broadcast>>;

    async fn set_queued(&self, id: BroadcastId, contact_count: i64) -> MailroomResult<()>;

    async fn set_status(&self, id: BroadcastId, status: BatchStatus) -> MailroomResult<()>;
}

#[async_trait]
pub trait FlowStartRepository: Send + Sync {
    async fn get_start(&self, org_id: OrgId, id: StartId) -> MailroomResult<Option<FlowStart>>;

    async fn set_queued(&self, id: StartId, contact_count: i64) -> MailroomResult<()>;

    async fn set_status(&self, id: StartId, status: BatchStatus) -> MailroomResult<()>;
}

#[async_trait]
pub trait GroupRepository: Send + Sync {
    /// Members of any of the groups, each contact once
    async fn member_ids(
        &self,
        org_id: OrgId,
        group_ids: &[GroupId],
    ) -> MailroomResult<Vec<ContactId>>;

    /// Replace a group's membership
    async fn set_members(
        &self,
        org_id: OrgId,
        group_id: GroupId,
        contact_ids: &[ContactId],
    ) -> MailroomResult<()>;

    async fn set_status(&self, group_id: GroupId, status: GroupStatus) -> MailroomResult<()>;
}

#[async_trait]
pub trait ChannelRepository: Send + Sync {
    /// Android channels with an FCM id that have not been seen since `seen_before`
    async fn stale_android_channels(
        &self,
        seen_before: DateTime<Utc>,
        limit: usize,
    ) -> MailroomResult<Vec<Channel>>;
}

#[async_trait]
pub trait IncidentRepository: Send + Sync {
    async fn open_incidents(&self, incident_type: &str) -> MailroomResult<Vec<Incident>>;

    /// Failed webhook calls of the org since the given time
    async fn webhook_failures_since(
        &self,
        org_id: OrgId,
        since: DateTime<Utc>,
    ) -> MailroomResult<i64>;

    async fn end_incidents(&self, ids: &[IncidentId]) -> MailroomResult<u64>;
}

/// All repositories, shared by every task through the runtime
#[derive(Clone)]
pub struct Repositories {
    pub contacts: Arc<dyn ContactRepository>,
    pub sessions: Arc<dyn SessionRepository>,
    pub fires: Arc<dyn ContactFireRepository>,
    pub campaigns: Arc<dyn CampaignRepository>,
    pub msgs: Arc<dyn MsgRepository>,
    pub calls: Arc<dyn CallRepository>,
    pub broadcasts: Arc<dyn BroadcastRepository>,
    pub starts: Arc<dyn FlowStartRepository>,
    pub groups: Arc<dyn GroupRepository>,
    pub channels: Arc<dyn ChannelRepository>,
    pub incidents: Arc<dyn IncidentRepository>,
}

impl std::fmt::Debug for Repositories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repositories").finish_non_exhaustive()
    }
}

impl Repositories {
    /// Every repository served by one implementation
    pub fn from_single<T>(db: Arc<T>) -> Self
    where
        T: ContactRepository
            + SessionRepository
            + ContactFireRepository
            + CampaignRepository
            + MsgRepository
            + CallRepository
            + BroadcastRepository
            + FlowStartRepository
            + GroupRepository
            + ChannelRepository
            + IncidentRepository
            + 'static,
    {
        Self {
            contacts: db.clone(),
            sessions: db.clone(),
            fires: db.clone(),
            campaigns: db.clone(),
            msgs: db.clone(),
            calls: db.clone(),
            broadcasts: db.clone(),
            starts: db.clone(),
            groups: db.clone(),
            channels: db.clone(),
            incidents: db,
        }
    }
}
