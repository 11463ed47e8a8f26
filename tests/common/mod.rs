//! Shared harness for the integration tests.
//!
//! Builds an in-process runtime over [`MemoryDatabase`] with fakes for the flow
//! engine, search and IVR, and drives queued tasks to completion without
//! starting any foremen.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use mailroom_core::config::MailroomConfig;
use mailroom_core::database::MemoryDatabase;
use mailroom_core::foreman::execute_task;
use mailroom_core::models::{
    Call, Channel, ChannelId, Contact, ContactId, Flow, FlowId, Msg, OrgId,
};
use mailroom_core::queue::TaskQueue;
use mailroom_core::runtime::{Runtime, RuntimeBuilder};
use mailroom_core::tasks::TaskRegistry;
use mailroom_core::services::{
    CallOutcome, EngineEvent, EngineInput, FlowEngine, IvrService, MemoryCourier, OrgAssets,
    SearchClient,
};
use mailroom_core::{MailroomError, MailroomResult};
use uuid::Uuid;

pub const ORG1: OrgId = OrgId(1);
pub const ORG2: OrgId = OrgId(2);

/// Engine that records every run and replies with one message
#[derive(Debug, Default)]
pub struct RecordingEngine {
    runs: Mutex<Vec<(ContactId, EngineInput)>>,
    failing_texts: Mutex<HashSet<String>>,
    panicking_texts: Mutex<HashSet<String>>,
    hanging_texts: Mutex<HashSet<String>>,
}

impl RecordingEngine {
    pub fn runs(&self) -> Vec<(ContactId, EngineInput)> {
        self.runs.lock().clone()
    }

    pub fn contacts_run(&self) -> Vec<ContactId> {
        self.runs.lock().iter().map(|(c, _)| *c).collect()
    }

    /// Make runs for incoming messages with this text fail
    pub fn fail_on_text(&self, text: &str) {
        self.failing_texts.lock().insert(text.to_string());
    }

    /// Make runs for incoming messages with this text panic
    pub fn panic_on_text(&self, text: &str) {
        self.panicking_texts.lock().insert(text.to_string());
    }

    /// Make runs for incoming messages with this text never finish
    pub fn hang_on_text(&self, text: &str) {
        self.hanging_texts.lock().insert(text.to_string());
    }
}

#[async_trait]
impl FlowEngine for RecordingEngine {
    async fn run(
        &self,
        oa: &OrgAssets,
        contact: &Contact,
        input: EngineInput,
    ) -> MailroomResult<Vec<EngineEvent>> {
        if let EngineInput::Msg { text, .. } = &input {
            if self.failing_texts.lock().contains(text) {
                return Err(MailroomError::EngineError(format!("cannot handle '{text}'")));
            }
            if self.panicking_texts.lock().contains(text) {
                panic!("engine blew up on '{text}'");
            }
            let hangs = self.hanging_texts.lock().contains(text);
            if hangs {
                std::future::pending::<()>().await;
            }
        }
        self.runs.lock().push((contact.id, input));

        let msg = Msg::outgoing(oa.org_id(), None, contact.id, "reply");
        Ok(vec![EngineEvent::MsgCreated { msg }])
    }
}

/// Search returning canned matches per query
#[derive(Debug, Default)]
pub struct FakeSearch {
    matches: Mutex<HashMap<String, Vec<ContactId>>>,
    deindexable: Mutex<HashMap<OrgId, usize>>,
}

impl FakeSearch {
    pub fn add_query(&self, query: &str, ids: &[ContactId]) {
        self.matches.lock().insert(query.to_string(), ids.to_vec());
    }

    pub fn add_deindexable(&self, org_id: OrgId, count: usize) {
        self.deindexable.lock().insert(org_id, count);
    }
}

#[async_trait]
impl SearchClient for FakeSearch {
    async fn ping(&self) -> MailroomResult<()> {
        Ok(())
    }

    async fn query_contact_ids(&self, _oa: &OrgAssets, query: &str) -> MailroomResult<Vec<ContactId>> {
        self.matches
            .lock()
            .get(query)
            .cloned()
            .ok_or_else(|| MailroomError::SearchError(format!("unknown query '{query}'")))
    }

    async fn deindex_org_contacts(&self, org_id: OrgId, limit: usize) -> MailroomResult<usize> {
        let mut deindexable = self.deindexable.lock();
        let remaining = deindexable.entry(org_id).or_insert(0);
        let deleted = (*remaining).min(limit);
        *remaining -= deleted;
        Ok(deleted)
    }
}

/// IVR that answers with a fixed outcome per channel and records requests
#[derive(Debug, Default)]
pub struct FakeIvr {
    outcomes: Mutex<HashMap<ChannelId, CallOutcome>>,
    requested: Mutex<Vec<Call>>,
}

impl FakeIvr {
    pub fn set_outcome(&self, channel_id: ChannelId, outcome: CallOutcome) {
        self.outcomes.lock().insert(channel_id, outcome);
    }

    pub fn requested(&self) -> Vec<Call> {
        self.requested.lock().clone()
    }
}

#[async_trait]
impl IvrService for FakeIvr {
    async fn request_call(
        &self,
        _oa: &OrgAssets,
        channel: &Channel,
        call: &Call,
    ) -> MailroomResult<CallOutcome> {
        self.requested.lock().push(call.clone());
        Ok(self
            .outcomes
            .lock()
            .get(&channel.id)
            .cloned()
            .unwrap_or(CallOutcome::Requested))
    }
}

pub fn test_config() -> MailroomConfig {
    MailroomConfig {
        instance_name: "test-node".to_string(),
        workers_realtime: 4,
        workers_batch: 4,
        workers_throttled: 4,
        worker_owner_limit: 0.5,
        ..MailroomConfig::default()
    }
}

/// An in-process runtime with handles on its fakes
pub struct TestEnv {
    pub db: Arc<MemoryDatabase>,
    pub engine: Arc<RecordingEngine>,
    pub courier: Arc<MemoryCourier>,
    pub search: Arc<FakeSearch>,
    pub ivr: Arc<FakeIvr>,
    pub rt: Arc<Runtime>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: MailroomConfig) -> Self {
        Self::build(config, None)
    }

    /// Runtime that decodes tasks with the given registry instead of the default one
    pub fn with_tasks(tasks: TaskRegistry) -> Self {
        Self::build(test_config(), Some(tasks))
    }

    fn build(config: MailroomConfig, tasks: Option<TaskRegistry>) -> Self {
        let db = Arc::new(MemoryDatabase::new());
        db.add_org(ORG1, "Nyaruka");
        db.add_org(ORG2, "Trileet");

        let engine = Arc::new(RecordingEngine::default());
        let courier = Arc::new(MemoryCourier::new());
        let search = Arc::new(FakeSearch::default());
        let ivr = Arc::new(FakeIvr::default());

        let mut builder = RuntimeBuilder::in_memory(config, db.clone())
            .engine(engine.clone())
            .courier(courier.clone())
            .search(search.clone())
            .ivr(ivr.clone());
        if let Some(tasks) = tasks {
            builder = builder.tasks(tasks);
        }
        let rt = builder.build().expect("test runtime should build");

        Self {
            db,
            engine,
            courier,
            search,
            ivr,
            rt: Arc::new(rt),
        }
    }

    /// Add contacts with the given ids to an org
    pub fn add_contacts(&self, org_id: OrgId, ids: impl IntoIterator<Item = i64>) -> Vec<ContactId> {
        ids.into_iter()
            .map(|id| self.db.add_contact(org_id, ContactId(id)).id)
            .collect()
    }

    pub fn add_flow(&self, org_id: OrgId, id: i64, name: &str) -> FlowId {
        self.db.add_flow(
            org_id,
            Flow {
                id: FlowId(id),
                uuid: Uuid::new_v4(),
                name: name.to_string(),
                is_archived: false,
            },
        );
        FlowId(id)
    }

    /// Pop and run tasks from one queue until it has nothing poppable, returns how many ran
    pub async fn drain(&self, queue: &dyn TaskQueue) -> usize {
        let mut ran = 0;
        while let Some(popped) = queue.pop().await.expect("pop should succeed") {
            execute_task(&self.rt, queue, popped).await;
            ran += 1;
        }
        ran
    }

    /// Drain every queue until all are empty, including tasks queued along the way
    pub async fn run_all(&self) -> usize {
        let mut total = 0;
        loop {
            let mut ran = 0;
            for queue in self.rt.queues.all() {
                ran += self.drain(queue.as_ref()).await;
            }
            if ran == 0 {
                return total;
            }
            total += ran;
        }
    }

    pub async fn queued(&self) -> usize {
        let mut size = 0;
        for queue in self.rt.queues.all() {
            size += queue.size().await.expect("size should succeed");
        }
        size
    }
}
