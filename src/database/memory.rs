//! In-process database
//!
//! Implements every repository plus [`AssetLoader`] over plain collections so the
//! task engine can run without Postgres. Seeding helpers are public for tests
//! and local development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

use super::{
    BroadcastRepository, CallRepository, CampaignRepository, ChannelRepository,
    ContactFireRepository, ContactRepository, FlowStartRepository, GroupRepository,
    IncidentRepository, MsgRepository, SessionRepository,
};
use crate::error::MailroomResult;
use crate::models::{
    BatchStatus, Broadcast, BroadcastId, Call, CallId, CallStatus, CampaignPoint, Channel,
    Contact, ContactFire, ContactId, ContactStatus, FireId, FireType, Flow, FlowId, FlowStart,
    Group, GroupId, GroupStatus, Incident, IncidentId, Msg, MsgId, MsgStatus, NewContactFire,
    Org, OrgId, PointId, Session, SessionStatus, StartId,
};
use crate::models::contact_fire::parse_campaign_scope;
use crate::services::AssetLoader;

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    orgs: BTreeMap<OrgId, Org>,
    contacts: BTreeMap<ContactId, Contact>,
    urns: HashMap<(OrgId, String), ContactId>,
    /// contact -> field key -> value
    fields: HashMap<ContactId, HashMap<String, DateTime<Utc>>>,
    created_on: HashMap<ContactId, DateTime<Utc>>,
    sessions: BTreeMap<Uuid, Session>,
    /// (contact, flow) pairs that have ever run
    runs: BTreeSet<(ContactId, FlowId)>,
    fires: BTreeMap<FireId, ContactFire>,
    msgs: BTreeMap<MsgId, Msg>,
    calls: BTreeMap<CallId, Call>,
    broadcasts: BTreeMap<BroadcastId, Broadcast>,
    starts: BTreeMap<StartId, FlowStart>,
    groups: BTreeMap<GroupId, (OrgId, Group)>,
    members: HashMap<GroupId, BTreeSet<ContactId>>,
    channels: BTreeMap<i64, Channel>,
    points: BTreeMap<PointId, (OrgId, CampaignPoint)>,
    flows: BTreeMap<FlowId, (OrgId, Flow)>,
    incidents: BTreeMap<IncidentId, (Incident, bool)>,
    webhook_failures: Vec<(OrgId, DateTime<Utc>)>,
    outbox: HashMap<OrgId, i64>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn end_sessions(&mut self, org_id: OrgId, uuids: &[Uuid], status: SessionStatus) -> u64 {
        let mut ended = 0;
        for uuid in uuids {
            if let Some(session) = self.sessions.get_mut(uuid) {
                if session.org_id == org_id && session.is_waiting() {
                    session.status = status;
                    session.current_flow_id = None;
                    ended += 1;

                    if let Some(contact) = self.contacts.get_mut(&session.contact_id) {
                        if contact.current_session_uuid == Some(*uuid) {
                            contact.current_session_uuid = None;
                            contact.current_flow_id = None;
                        }
                    }
                }
            }
        }
        self.fires
            .retain(|_, f| !f.session_uuid.is_some_and(|s| uuids.contains(&s)));
        ended
    }
}

#[derive(Debug, Default)]
pub struct MemoryDatabase {
    state: Mutex<State>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_org(&self, id: OrgId, name: &str) -> Org {
        let org = Org {
            id,
            name: name.to_string(),
            is_active: true,
            is_suspended: false,
        };
        self.state.lock().orgs.insert(id, org.clone());
        org
    }

    pub fn suspend_org(&self, id: OrgId) {
        if let Some(org) = self.state.lock().orgs.get_mut(&id) {
            org.is_suspended = true;
        }
    }

    pub fn add_contact(&self, org_id: OrgId, id: ContactId) -> Contact {
        let contact = Contact::new(org_id, id);
        let mut state = self.state.lock();
        state.next_id = state.next_id.max(id.0);
        state.created_on.insert(id, Utc::now());
        state.contacts.insert(id, contact.clone());
        contact
    }

    pub fn add_urn(&self, org_id: OrgId, contact_id: ContactId, urn: &str) {
        self.state
            .lock()
            .urns
            .insert((org_id, urn.to_string()), contact_id);
    }

    pub fn set_contact_status(&self, contact_id: ContactId, status: ContactStatus) {
        if let Some(contact) = self.state.lock().contacts.get_mut(&contact_id) {
            contact.status = status;
        }
    }

    pub fn set_last_seen_on(&self, contact_id: ContactId, seen_on: DateTime<Utc>) {
        if let Some(contact) = self.state.lock().contacts.get_mut(&contact_id) {
            contact.last_seen_on = Some(seen_on);
        }
    }

    pub fn set_date_field(&self, contact_id: ContactId, key: &str, value: DateTime<Utc>) {
        self.state
            .lock()
            .fields
            .entry(contact_id)
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn contact(&self, contact_id: ContactId) -> Option<Contact> {
        self.state.lock().contacts.get(&contact_id).cloned()
    }

    pub fn contact_count(&self) -> usize {
        self.state.lock().contacts.len()
    }

    /// Start a waiting session for the contact, returns it
    pub fn add_waiting_session(
        &self,
        org_id: OrgId,
        contact_id: ContactId,
        flow_id: FlowId,
    ) -> Session {
        let session = Session {
            uuid: Uuid::new_v4(),
            org_id,
            contact_id,
            status: SessionStatus::Waiting,
            current_flow_id: Some(flow_id),
            last_sprint_uuid: Some(Uuid::new_v4()),
            created_on: Utc::now(),
        };
        let mut state = self.state.lock();
        if let Some(contact) = state.contacts.get_mut(&contact_id) {
            contact.current_session_uuid = Some(session.uuid);
            contact.current_flow_id = Some(flow_id);
        }
        state.runs.insert((contact_id, flow_id));
        state.sessions.insert(session.uuid, session.clone());
        session
    }

    pub fn add_run(&self, contact_id: ContactId, flow_id: FlowId) {
        self.state.lock().runs.insert((contact_id, flow_id));
    }

    pub fn session(&self, uuid: Uuid) -> Option<Session> {
        self.state.lock().sessions.get(&uuid).cloned()
    }

    pub fn add_fire(&self, fire: NewContactFire) -> ContactFire {
        let mut state = self.state.lock();
        let id = FireId(state.next_id());
        let fire = ContactFire {
            id,
            org_id: fire.org_id,
            contact_id: fire.contact_id,
            fire_type: fire.fire_type.code().to_string(),
            scope: fire.scope,
            fire_on: fire.fire_on,
            session_uuid: fire.session_uuid,
            sprint_uuid: fire.sprint_uuid,
        };
        state.fires.insert(id, fire.clone());
        fire
    }

    pub fn fires(&self) -> Vec<ContactFire> {
        self.state.lock().fires.values().cloned().collect()
    }

    pub fn add_msg(&self, mut msg: Msg) -> Msg {
        let mut state = self.state.lock();
        if msg.id.0 == 0 {
            msg.id = MsgId(state.next_id());
        }
        state.msgs.insert(msg.id, msg.clone());
        msg
    }

    pub fn msg(&self, id: MsgId) -> Option<Msg> {
        self.state.lock().msgs.get(&id).cloned()
    }

    pub fn add_call(&self, call: Call) -> Call {
        self.state.lock().calls.insert(call.id, call.clone());
        call
    }

    pub fn call(&self, id: CallId) -> Option<Call> {
        self.state.lock().calls.get(&id).cloned()
    }

    pub fn add_broadcast(&self, broadcast: Broadcast) {
        self.state
            .lock()
            .broadcasts
            .insert(broadcast.id, broadcast);
    }

    pub fn broadcast(&self, id: BroadcastId) -> Option<Broadcast> {
        self.state.lock().broadcasts.get(&id).cloned()
    }

    pub fn add_start(&self, start: FlowStart) {
        self.state.lock().starts.insert(start.id, start);
    }

    pub fn start(&self, id: StartId) -> Option<FlowStart> {
        self.state.lock().starts.get(&id).cloned()
    }

    pub fn add_group(&self, org_id: OrgId, group: Group, members: &[ContactId]) {
        let mut state = self.state.lock();
        state
            .members
            .insert(group.id, members.iter().copied().collect());
        state.groups.insert(group.id, (org_id, group));
    }

    pub fn group(&self, id: GroupId) -> Option<Group> {
        self.state.lock().groups.get(&id).map(|(_, g)| g.clone())
    }

    pub fn group_members(&self, id: GroupId) -> Vec<ContactId> {
        self.state
            .lock()
            .members
            .get(&id)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn add_channel(&self, channel: Channel) {
        self.state.lock().channels.insert(channel.id.0, channel);
    }

    pub fn add_campaign_point(&self, org_id: OrgId, point: CampaignPoint) {
        self.state.lock().points.insert(point.id, (org_id, point));
    }

    pub fn add_flow(&self, org_id: OrgId, flow: Flow) {
        self.state.lock().flows.insert(flow.id, (org_id, flow));
    }

    pub fn add_incident(&self, incident: Incident) {
        self.state
            .lock()
            .incidents
            .insert(incident.id, (incident, false));
    }

    pub fn incident_ended(&self, id: IncidentId) -> bool {
        self.state
            .lock()
            .incidents
            .get(&id)
            .is_some_and(|(_, ended)| *ended)
    }

    pub fn add_webhook_failure(&self, org_id: OrgId, at: DateTime<Utc>) {
        self.state.lock().webhook_failures.push((org_id, at));
    }

    pub fn set_outbox_count(&self, org_id: OrgId, count: i64) {
        self.state.lock().outbox.insert(org_id, count);
    }
}

#[async_trait]
impl ContactRepository for MemoryDatabase {
    async fn load_contact(
        &self,
        org_id: OrgId,
        contact_id: ContactId,
        _read_only: bool,
    ) -> MailroomResult<Option<Contact>> {
        Ok(self
            .state
            .lock()
            .contacts
            .get(&contact_id)
            .filter(|c| c.org_id == org_id)
            .cloned())
    }

    async fn update_last_seen_on(
        &self,
        org_id: OrgId,
        contact_id: ContactId,
        seen_on: DateTime<Utc>,
    ) -> MailroomResult<()> {
        let mut state = self.state.lock();
        if let Some(contact) = state.contacts.get_mut(&contact_id) {
            if contact.org_id == org_id && contact.last_seen_on.map_or(true, |l| l < seen_on) {
                contact.last_seen_on = Some(seen_on);
            }
        }
        Ok(())
    }

    async fn stop_contact(&self, org_id: OrgId, contact_id: ContactId) -> MailroomResult<()> {
        let mut state = self.state.lock();
        if let Some(contact) = state.contacts.get_mut(&contact_id) {
            if contact.org_id == org_id {
                contact.status = ContactStatus::Stopped;
            }
        }
        let static_groups: Vec<GroupId> = state
            .groups
            .values()
            .filter(|(_, g)| g.query.is_none())
            .map(|(_, g)| g.id)
            .collect();
        for group_id in static_groups {
            if let Some(members) = state.members.get_mut(&group_id) {
                members.remove(&contact_id);
            }
        }
        Ok(())
    }

    async fn get_or_create_by_urns(
        &self,
        org_id: OrgId,
        urns: &[String],
    ) -> MailroomResult<Vec<ContactId>> {
        let mut state = self.state.lock();
        let mut ids = Vec::with_capacity(urns.len());
        for urn in urns {
            let key = (org_id, urn.clone());
            let id = match state.urns.get(&key).copied() {
                Some(id) => id,
                None => {
                    let id = ContactId(state.next_id());
                    state.contacts.insert(id, Contact::new(org_id, id));
                    state.created_on.insert(id, Utc::now());
                    state.urns.insert(key, id);
                    id
                }
            };
            ids.push(id);
        }
        Ok(ids)
    }

    async fn filter_active(
        &self,
        org_id: OrgId,
        contact_ids: &[ContactId],
    ) -> MailroomResult<Vec<ContactId>> {
        let state = self.state.lock();
        Ok(contact_ids
            .iter()
            .filter(|id| {
                state
                    .contacts
                    .get(*id)
                    .is_some_and(|c| c.org_id == org_id && c.is_active())
            })
            .copied()
            .collect())
    }

    async fn filter_seen_since(
        &self,
        org_id: OrgId,
        contact_ids: &[ContactId],
        since: DateTime<Utc>,
    ) -> MailroomResult<Vec<ContactId>> {
        let state = self.state.lock();
        Ok(contact_ids
            .iter()
            .filter(|id| {
                state.contacts.get(*id).is_some_and(|c| {
                    c.org_id == org_id && c.last_seen_on.is_some_and(|seen| seen >= since)
                })
            })
            .copied()
            .collect())
    }
}

#[async_trait]
impl SessionRepository for MemoryDatabase {
    async fn get_session(&self, org_id: OrgId, uuid: Uuid) -> MailroomResult<Option<Session>> {
        Ok(self
            .state
            .lock()
            .sessions
            .get(&uuid)
            .filter(|s| s.org_id == org_id)
            .cloned())
    }

    async fn exit_sessions(
        &self,
        org_id: OrgId,
        uuids: &[Uuid],
        status: SessionStatus,
    ) -> MailroomResult<u64> {
        Ok(self.state.lock().end_sessions(org_id, uuids, status))
    }

    async fn interrupt_contacts(
        &self,
        org_id: OrgId,
        contact_ids: &[ContactId],
    ) -> MailroomResult<u64> {
        let mut state = self.state.lock();
        let uuids: Vec<Uuid> = state
            .sessions
            .values()
            .filter(|s| s.org_id == org_id && s.is_waiting() && contact_ids.contains(&s.contact_id))
            .map(|s| s.uuid)
            .collect();
        Ok(state.end_sessions(org_id, &uuids, SessionStatus::Interrupted))
    }

    async fn filter_in_flow(
        &self,
        org_id: OrgId,
        contact_ids: &[ContactId],
    ) -> MailroomResult<Vec<ContactId>> {
        let state = self.state.lock();
        let waiting: BTreeSet<ContactId> = state
            .sessions
            .values()
            .filter(|s| s.org_id == org_id && s.is_waiting())
            .map(|s| s.contact_id)
            .collect();
        Ok(contact_ids
            .iter()
            .filter(|id| waiting.contains(*id))
            .copied()
            .collect())
    }

    async fn filter_started_previously(
        &self,
        _org_id: OrgId,
        flow_id: FlowId,
        contact_ids: &[ContactId],
    ) -> MailroomResult<Vec<ContactId>> {
        let state = self.state.lock();
        Ok(contact_ids
            .iter()
            .filter(|id| state.runs.contains(&(**id, flow_id)))
            .copied()
            .collect())
    }

    async fn waiting_sessions(
        &self,
        org_id: OrgId,
        contact_ids: &[ContactId],
        flow_ids: &[FlowId],
    ) -> MailroomResult<Vec<Session>> {
        let state = self.state.lock();
        let mut sessions: Vec<Session> = state
            .sessions
            .values()
            .filter(|s| s.org_id == org_id && s.is_waiting())
            .filter(|s| {
                contact_ids.contains(&s.contact_id)
                    || s.current_flow_id.is_some_and(|f| flow_ids.contains(&f))
            })
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.created_on);
        Ok(sessions)
    }
}

#[async_trait]
impl ContactFireRepository for MemoryDatabase {
    async fn load_due(&self, now: DateTime<Utc>, limit: usize) -> MailroomResult<Vec<ContactFire>> {
        let mut due: Vec<ContactFire> = self
            .state
            .lock()
            .fires
            .values()
            .filter(|f| f.fire_on <= now)
            .cloned()
            .collect();
        due.sort_by_key(|f| (f.fire_on, f.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn delete_fires(&self, ids: &[FireId]) -> MailroomResult<u64> {
        let mut state = self.state.lock();
        Ok(ids
            .iter()
            .filter(|id| state.fires.remove(*id).is_some())
            .count() as u64)
    }

    async fn delete_campaign_fires(&self, point_id: PointId) -> MailroomResult<u64> {
        let mut state = self.state.lock();
        let before = state.fires.len();
        state.fires.retain(|_, f| {
            !(f.kind() == Some(FireType::Campaign)
                && parse_campaign_scope(&f.scope).is_some_and(|(p, _)| p == point_id))
        });
        Ok((before - state.fires.len()) as u64)
    }

    async fn insert_fires(&self, fires: &[NewContactFire]) -> MailroomResult<u64> {
        let mut state = self.state.lock();
        let mut inserted = 0;
        for fire in fires {
            let duplicate = state.fires.values().any(|f| {
                f.contact_id == fire.contact_id
                    && f.fire_type == fire.fire_type.code()
                    && f.scope == fire.scope
            });
            if duplicate {
                continue;
            }
            let id = FireId(state.next_id());
            state.fires.insert(
                id,
                ContactFire {
                    id,
                    org_id: fire.org_id,
                    contact_id: fire.contact_id,
                    fire_type: fire.fire_type.code().to_string(),
                    scope: fire.scope.clone(),
                    fire_on: fire.fire_on,
                    session_uuid: fire.session_uuid,
                    sprint_uuid: fire.sprint_uuid,
                },
            );
            inserted += 1;
        }
        Ok(inserted)
    }
}

#[async_trait]
impl CampaignRepository for MemoryDatabase {
    async fn schedule_inputs(
        &self,
        org_id: OrgId,
        point: &CampaignPoint,
    ) -> MailroomResult<Vec<(ContactId, Option<DateTime<Utc>>)>> {
        let state = self.state.lock();
        let Some(members) = state.members.get(&point.group_id) else {
            return Ok(Vec::new());
        };

        Ok(members
            .iter()
            .filter_map(|id| state.contacts.get(id))
            .filter(|c| c.org_id == org_id)
            .map(|c| {
                let value = match point.relative_to.as_str() {
                    "created_on" => state.created_on.get(&c.id).copied(),
                    "last_seen_on" => c.last_seen_on,
                    key => state.fields.get(&c.id).and_then(|f| f.get(key)).copied(),
                };
                (c.id, value)
            })
            .collect())
    }
}

#[async_trait]
impl MsgRepository for MemoryDatabase {
    async fn load_retryable(&self, now: DateTime<Utc>, limit: usize) -> MailroomResult<Vec<Msg>> {
        let mut msgs: Vec<Msg> = self
            .state
            .lock()
            .msgs
            .values()
            .filter(|m| m.status == MsgStatus::Errored && m.next_attempt.is_some_and(|n| n <= now))
            .cloned()
            .collect();
        msgs.sort_by_key(|m| (m.next_attempt, m.id));
        msgs.truncate(limit);
        Ok(msgs)
    }

    async fn mark_for_retry(&self, ids: &[MsgId]) -> MailroomResult<u64> {
        let mut state = self.state.lock();
        let mut updated = 0;
        for id in ids {
            if let Some(msg) = state.msgs.get_mut(id) {
                msg.status = MsgStatus::Queued;
                msg.retry_count += 1;
                msg.next_attempt = None;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn fail_old_outgoing(&self, before: DateTime<Utc>) -> MailroomResult<u64> {
        let mut state = self.state.lock();
        let mut failed = 0;
        for msg in state.msgs.values_mut() {
            let unsent = matches!(
                msg.status,
                MsgStatus::Pending | MsgStatus::Queued | MsgStatus::Errored
            );
            if unsent && msg.created_on < before {
                msg.status = MsgStatus::Failed;
                failed += 1;
            }
        }
        Ok(failed)
    }

    async fn outbox_count(&self, org_id: OrgId) -> MailroomResult<i64> {
        Ok(self
            .state
            .lock()
            .outbox
            .get(&org_id)
            .copied()
            .unwrap_or(0))
    }
}

#[async_trait]
impl CallRepository for MemoryDatabase {
    async fn load_retryable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> MailroomResult<Vec<Call>> {
        let mut calls: Vec<Call> = self
            .state
            .lock()
            .calls
            .values()
            .filter(|c| matches!(c.status, CallStatus::Queued | CallStatus::Errored))
            .filter(|c| c.next_attempt.is_some_and(|n| n <= now))
            .cloned()
            .collect();
        calls.sort_by_key(|c| (c.next_attempt, c.id));
        calls.truncate(limit);
        Ok(calls)
    }

    async fn update_status(
        &self,
        id: CallId,
        status: CallStatus,
        next_attempt: Option<DateTime<Utc>>,
    ) -> MailroomResult<()> {
        if let Some(call) = self.state.lock().calls.get_mut(&id) {
            if matches!(status, CallStatus::Errored | CallStatus::Failed) {
                call.retry_count += 1;
            }
            call.status = status;
            call.next_attempt = next_attempt;
        }
        Ok(())
    }
}

#[async_trait]
impl BroadcastRepository for MemoryDatabase {
    async fn get_broadcast(
        &self,
        org_id: OrgId,
        id: BroadcastId,
    ) -> MailroomResult<Option<Broadcast>> {
        Ok(self
            .state
            .lock()
            .broadcasts
            .get(&id)
            .filter(|b| b.org_id == org_id)
            .cloned())
    }

    async fn set_queued(&self, id: BroadcastId, contact_count: i64) -> MailroomResult<()> {
        if let Some(broadcast) = self.state.lock().broadcasts.get_mut(&id) {
            broadcast.status = BatchStatus::Queued;
            broadcast.contact_count = contact_count;
        }
        Ok(())
    }

    async fn set_status(&self, id: BroadcastId, status: BatchStatus) -> MailroomResult<()> {
        if let Some(broadcast) = self.state.lock().broadcasts.get_mut(&id) {
            broadcast.status = status;
        }
        Ok(())
    }
}

#[async_trait]
impl FlowStartRepository for MemoryDatabase {
    async fn get_start(&self, org_id: OrgId, id: StartId) -> MailroomResult<Option<FlowStart>> {
        Ok(self
            .state
            .lock()
            .starts
            .get(&id)
            .filter(|s| s.org_id == org_id)
            .cloned())
    }

    async fn set_queued(&self, id: StartId, contact_count: i64) -> MailroomResult<()> {
        if let Some(start) = self.state.lock().starts.get_mut(&id) {
            start.status = BatchStatus::Queued;
            start.contact_count = contact_count;
        }
        Ok(())
    }

    async fn set_status(&self, id: StartId, status: BatchStatus) -> MailroomResult<()> {
        if let Some(start) = self.state.lock().starts.get_mut(&id) {
            start.status = status;
        }
        Ok(())
    }
}

#[async_trait]
impl GroupRepository for MemoryDatabase {
    async fn member_ids(
        &self,
        org_id: OrgId,
        group_ids: &[GroupId],
    ) -> MailroomResult<Vec<ContactId>> {
        let state = self.state.lock();
        let members: BTreeSet<ContactId> = group_ids
            .iter()
            .filter(|id| state.groups.get(*id).is_some_and(|(org, _)| *org == org_id))
            .filter_map(|id| state.members.get(id))
            .flatten()
            .copied()
            .collect();
        Ok(members.into_iter().collect())
    }

    async fn set_members(
        &self,
        _org_id: OrgId,
        group_id: GroupId,
        contact_ids: &[ContactId],
    ) -> MailroomResult<()> {
        self.state
            .lock()
            .members
            .insert(group_id, contact_ids.iter().copied().collect());
        Ok(())
    }

    async fn set_status(&self, group_id: GroupId, status: GroupStatus) -> MailroomResult<()> {
        if let Some((_, group)) = self.state.lock().groups.get_mut(&group_id) {
            group.status = status;
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelRepository for MemoryDatabase {
    async fn stale_android_channels(
        &self,
        seen_before: DateTime<Utc>,
        limit: usize,
    ) -> MailroomResult<Vec<Channel>> {
        let mut channels: Vec<Channel> = self
            .state
            .lock()
            .channels
            .values()
            .filter(|c| c.is_android() && c.fcm_id.as_deref().is_some_and(|f| !f.is_empty()))
            .filter(|c| c.last_seen.map_or(true, |seen| seen < seen_before))
            .cloned()
            .collect();
        channels.truncate(limit);
        Ok(channels)
    }
}

#[async_trait]
impl IncidentRepository for MemoryDatabase {
    async fn open_incidents(&self, incident_type: &str) -> MailroomResult<Vec<Incident>> {
        Ok(self
            .state
            .lock()
            .incidents
            .values()
            .filter(|(i, ended)| !ended && i.incident_type == incident_type)
            .map(|(i, _)| i.clone())
            .collect())
    }

    async fn webhook_failures_since(
        &self,
        org_id: OrgId,
        since: DateTime<Utc>,
    ) -> MailroomResult<i64> {
        Ok(self
            .state
            .lock()
            .webhook_failures
            .iter()
            .filter(|(org, at)| *org == org_id && *at >= since)
            .count() as i64)
    }

    async fn end_incidents(&self, ids: &[IncidentId]) -> MailroomResult<u64> {
        let mut state = self.state.lock();
        let mut ended = 0;
        for id in ids {
            if let Some((_, done)) = state.incidents.get_mut(id) {
                if !*done {
                    *done = true;
                    ended += 1;
                }
            }
        }
        Ok(ended)
    }
}

#[async_trait]
impl AssetLoader for MemoryDatabase {
    async fn load_org(&self, org_id: OrgId) -> MailroomResult<Option<Org>> {
        Ok(self.state.lock().orgs.get(&org_id).cloned())
    }

    async fn load_channels(&self, org_id: OrgId) -> MailroomResult<Vec<Channel>> {
        Ok(self
            .state
            .lock()
            .channels
            .values()
            .filter(|c| c.org_id == org_id)
            .cloned()
            .collect())
    }

    async fn load_campaign_points(&self, org_id: OrgId) -> MailroomResult<Vec<CampaignPoint>> {
        Ok(self
            .state
            .lock()
            .points
            .values()
            .filter(|(org, _)| *org == org_id)
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn load_groups(&self, org_id: OrgId) -> MailroomResult<Vec<Group>> {
        Ok(self
            .state
            .lock()
            .groups
            .values()
            .filter(|(org, _)| *org == org_id)
            .map(|(_, g)| g.clone())
            .collect())
    }

    async fn load_flows(&self, org_id: OrgId) -> MailroomResult<Vec<Flow>> {
        Ok(self
            .state
            .lock()
            .flows
            .values()
            .filter(|(org, _)| *org == org_id)
            .map(|(_, f)| f.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_last_seen_only_moves_forward() {
        let db = MemoryDatabase::new();
        db.add_contact(OrgId(1), ContactId(10));
        let later = Utc::now();
        let earlier = later - Duration::hours(1);

        db.update_last_seen_on(OrgId(1), ContactId(10), later).await.unwrap();
        db.update_last_seen_on(OrgId(1), ContactId(10), earlier).await.unwrap();
        assert_eq!(db.contact(ContactId(10)).unwrap().last_seen_on, Some(later));
    }

    #[tokio::test]
    async fn test_insert_fires_skips_duplicates() {
        let db = MemoryDatabase::new();
        let fire = NewContactFire::for_campaign(OrgId(1), ContactId(2), PointId(3), 1, Utc::now());
        assert_eq!(db.insert_fires(&[fire.clone(), fire]).await.unwrap(), 1);
        assert_eq!(db.delete_campaign_fires(PointId(3)).await.unwrap(), 1);
        assert!(db.fires().is_empty());
    }

    #[tokio::test]
    async fn test_exit_sessions_clears_their_timers() {
        let db = MemoryDatabase::new();
        db.add_contact(OrgId(1), ContactId(5));
        let session = db.add_waiting_session(OrgId(1), ContactId(5), FlowId(9));
        db.add_fire(NewContactFire {
            org_id: OrgId(1),
            contact_id: ContactId(5),
            fire_type: FireType::WaitTimeout,
            scope: String::new(),
            fire_on: Utc::now(),
            session_uuid: Some(session.uuid),
            sprint_uuid: session.last_sprint_uuid,
        });

        let ended = db
            .exit_sessions(OrgId(1), &[session.uuid], SessionStatus::Expired)
            .await
            .unwrap();
        assert_eq!(ended, 1);
        assert!(db.fires().is_empty());
        assert_eq!(db.contact(ContactId(5)).unwrap().current_session_uuid, None);
    }

    #[tokio::test]
    async fn test_urns_resolve_to_stable_contacts() {
        let db = MemoryDatabase::new();
        let urns = vec!["tel:+1".to_string(), "tel:+2".to_string(), "tel:+1".to_string()];
        let ids = db.get_or_create_by_urns(OrgId(1), &urns).await.unwrap();
        assert_eq!(ids[0], ids[2]);
        assert_ne!(ids[0], ids[1]);
        assert_eq!(db.contact_count(), 2);
    }
}
