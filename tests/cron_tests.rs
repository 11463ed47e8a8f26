//! Cron jobs run once against the in-process runtime.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{TestEnv, ORG1, ORG2};
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;
use uuid::Uuid;

use mailroom_core::constants::keys;
use mailroom_core::crons::{
    fire, Cron, DeindexDeletedOrgs, EndIncidents, FailOldMsgs, FireContactFires, RetryCalls,
    RetryMsgs, ThrottleQueue,
};
use mailroom_core::models::incident::WEBHOOKS_UNHEALTHY;
use mailroom_core::models::{
    Call, CallId, CallStatus, CampaignPoint, Channel, ChannelId, ContactId, FireType, FlowId,
    GroupId, Incident, IncidentId, Msg, MsgStatus, NewContactFire, OrgId, PointId,
    SessionStatus, StartMode,
};
use mailroom_core::queue::{Priority, TaskEnvelope, TaskQueue};
use mailroom_core::services::{CallOutcome, EngineInput};
use mailroom_core::tasks::{queue_task, ScheduleCampaignPoint};

fn point(id: i64, flow_id: FlowId, fire_version: i32, start_mode: StartMode) -> CampaignPoint {
    CampaignPoint {
        id: PointId(id),
        uuid: Uuid::new_v4(),
        campaign_id: 1,
        group_id: GroupId(90),
        flow_id,
        fire_version,
        start_mode,
        relative_to: "joined".to_string(),
        offset_minutes: 60,
    }
}

fn session_fire(
    fire_type: FireType,
    contact_id: ContactId,
    session_uuid: Uuid,
    sprint_uuid: Option<Uuid>,
) -> NewContactFire {
    NewContactFire {
        org_id: ORG1,
        contact_id,
        fire_type,
        scope: String::new(),
        fire_on: Utc::now() - ChronoDuration::minutes(1),
        session_uuid: Some(session_uuid),
        sprint_uuid,
    }
}

fn past() -> chrono::DateTime<Utc> {
    Utc::now() - ChronoDuration::minutes(5)
}

#[tokio::test]
async fn test_due_fires_become_bulk_tasks() {
    let env = TestEnv::new();
    let flow_id = env.add_flow(ORG1, 20, "Reminders");
    let contacts = env.add_contacts(ORG1, 1..=5);
    env.db
        .add_campaign_point(ORG1, point(70, flow_id, 1, StartMode::Interrupt));

    let timed = env.db.add_waiting_session(ORG1, contacts[0], FlowId(3));
    env.db.add_fire(session_fire(
        FireType::WaitTimeout,
        contacts[0],
        timed.uuid,
        timed.last_sprint_uuid,
    ));
    let expiring = env.db.add_waiting_session(ORG1, contacts[1], FlowId(3));
    env.db.add_fire(session_fire(
        FireType::SessionExpiration,
        contacts[1],
        expiring.uuid,
        None,
    ));
    for contact_id in &contacts[2..4] {
        env.db.add_fire(NewContactFire::for_campaign(
            ORG1,
            *contact_id,
            PointId(70),
            1,
            past(),
        ));
    }
    // fire from before the point was edited
    env.db.add_fire(NewContactFire::for_campaign(
        ORG1,
        contacts[4],
        PointId(70),
        0,
        past(),
    ));
    // not due yet
    env.db.add_fire(NewContactFire::for_campaign(
        ORG1,
        contacts[4],
        PointId(70),
        1,
        Utc::now() + ChronoDuration::hours(1),
    ));

    let cron = FireContactFires::new(5000, 100);
    let stats = cron.run(&env.rt).await.unwrap();
    assert_eq!(stats["wait_timeouts"], 1);
    assert_eq!(stats["wait_expires"], 0);
    assert_eq!(stats["session_expires"], 1);
    assert_eq!(stats["campaign_points"], 3);
    assert_eq!(env.db.fires().len(), 1);

    assert_eq!(env.rt.queues.throttled.size().await.unwrap(), 3);
    assert_eq!(env.rt.queues.batch.size().await.unwrap(), 1);

    env.run_all().await;

    let runs = env.engine.runs();
    assert!(runs.iter().any(|(contact_id, input)| *contact_id == contacts[0]
        && matches!(input, EngineInput::WaitTimeout { session_uuid, .. } if *session_uuid == timed.uuid)));
    let campaign_runs: HashSet<ContactId> = runs
        .iter()
        .filter(|(_, input)| matches!(input, EngineInput::Campaign { point_id, .. } if *point_id == PointId(70)))
        .map(|(contact_id, _)| *contact_id)
        .collect();
    assert_eq!(campaign_runs, HashSet::from([contacts[2], contacts[3]]));
    assert_eq!(
        env.db.session(expiring.uuid).unwrap().status,
        SessionStatus::Expired
    );

    let recent = env
        .rt
        .kv
        .zrange_with_scores(&keys::recent_campaign_fires(70))
        .await
        .unwrap();
    assert_eq!(recent.len(), 2);
    assert!(recent
        .iter()
        .any(|(member, _)| member.starts_with(&format!("{}|", contacts[2]))));
}

#[tokio::test]
async fn test_timer_fires_without_sprint_are_not_counted() {
    let env = TestEnv::new();
    let contacts = env.add_contacts(ORG1, 1..=3);

    let timed = env.db.add_waiting_session(ORG1, contacts[0], FlowId(3));
    env.db.add_fire(session_fire(
        FireType::WaitTimeout,
        contacts[0],
        timed.uuid,
        timed.last_sprint_uuid,
    ));
    let unsprinted = env.db.add_waiting_session(ORG1, contacts[1], FlowId(3));
    env.db.add_fire(session_fire(
        FireType::WaitTimeout,
        contacts[1],
        unsprinted.uuid,
        None,
    ));
    let expiring = env.db.add_waiting_session(ORG1, contacts[2], FlowId(3));
    env.db.add_fire(session_fire(
        FireType::WaitExpiration,
        contacts[2],
        expiring.uuid,
        None,
    ));

    let stats = FireContactFires::new(5000, 100).run(&env.rt).await.unwrap();
    assert_eq!(stats["wait_timeouts"], 1);
    assert_eq!(stats["wait_expires"], 0);

    // the unusable fires are gone and no empty task was queued for them
    assert!(env.db.fires().is_empty());
    assert_eq!(env.rt.queues.throttled.size().await.unwrap(), 1);
}

#[tokio::test]
async fn test_fires_left_for_next_run_after_soft_deadline() {
    let env = TestEnv::new();
    let flow_id = env.add_flow(ORG1, 20, "Reminders");
    let contacts = env.add_contacts(ORG1, 1..=5);
    env.db
        .add_campaign_point(ORG1, point(70, flow_id, 1, StartMode::Skip));
    for contact_id in &contacts {
        env.db.add_fire(NewContactFire::for_campaign(
            ORG1,
            *contact_id,
            PointId(70),
            1,
            past(),
        ));
    }

    let cron = FireContactFires::new(2, 100).with_soft_deadline(Duration::ZERO);
    let stats = cron.run(&env.rt).await.unwrap();
    assert_eq!(stats["campaign_points"], 2);
    assert_eq!(env.db.fires().len(), 3);

    let stats = FireContactFires::new(2, 100).run(&env.rt).await.unwrap();
    assert_eq!(stats["campaign_points"], 3);
    assert!(env.db.fires().is_empty());
}

#[tokio::test]
async fn test_skip_mode_leaves_contacts_in_flows_alone() {
    let env = TestEnv::new();
    let flow_id = env.add_flow(ORG1, 20, "Reminders");
    let contacts = env.add_contacts(ORG1, 1..=2);
    env.db
        .add_campaign_point(ORG1, point(71, flow_id, 1, StartMode::Skip));
    let busy = env.db.add_waiting_session(ORG1, contacts[1], FlowId(3));
    for contact_id in &contacts {
        env.db.add_fire(NewContactFire::for_campaign(
            ORG1,
            *contact_id,
            PointId(71),
            1,
            past(),
        ));
    }

    FireContactFires::new(100, 100).run(&env.rt).await.unwrap();
    env.run_all().await;

    assert_eq!(env.engine.contacts_run(), vec![contacts[0]]);
    assert_eq!(
        env.db.session(busy.uuid).unwrap().status,
        SessionStatus::Waiting
    );
}

#[tokio::test]
async fn test_schedule_campaign_point_replaces_future_fires() {
    let env = TestEnv::new();
    let flow_id = env.add_flow(ORG1, 20, "Reminders");
    let contacts = env.add_contacts(ORG1, 1..=3);
    env.db.add_group(
        ORG1,
        mailroom_core::models::Group {
            id: GroupId(90),
            uuid: Uuid::new_v4(),
            name: "Members".to_string(),
            query: None,
            status: mailroom_core::models::GroupStatus::Ready,
        },
        &contacts,
    );
    env.db
        .add_campaign_point(ORG1, point(72, flow_id, 2, StartMode::Interrupt));

    let joined = Utc::now() + ChronoDuration::days(1);
    env.db.set_date_field(contacts[0], "joined", joined);
    // fire time already passed
    env.db
        .set_date_field(contacts[1], "joined", Utc::now() - ChronoDuration::days(3));
    // contacts[2] has no value

    env.db.add_fire(NewContactFire::for_campaign(
        ORG1,
        contacts[1],
        PointId(72),
        1,
        Utc::now() + ChronoDuration::days(2),
    ));

    queue_task(
        env.rt.queues.batch.as_ref(),
        ORG1,
        &ScheduleCampaignPoint {
            point_id: PointId(72),
        },
        Priority::Bulk,
    )
    .await
    .unwrap();
    env.run_all().await;

    let fires = env.db.fires();
    assert_eq!(fires.len(), 1);
    assert_eq!(fires[0].contact_id, contacts[0]);
    assert_eq!(fires[0].scope, "72:2");
    assert_eq!(fires[0].fire_on, joined + ChronoDuration::minutes(60));
}

#[tokio::test]
async fn test_throttle_pauses_and_resumes_owners() {
    let env = TestEnv::new();
    let throttled = env.rt.queues.throttled.clone();
    for owner in [ORG1, ORG2] {
        throttled
            .push(owner, &TaskEnvelope::new("noop", json!({})), Priority::Bulk)
            .await
            .unwrap();
    }
    env.db.set_outbox_count(ORG1, 25_000);

    let cron = ThrottleQueue::new(10_000);
    let stats = cron.run(&env.rt).await.unwrap();
    assert_eq!(stats["paused"], 1);
    assert_eq!(stats["resumed"], 1);
    assert_eq!(throttled.paused().await.unwrap(), vec![ORG1]);

    let popped = throttled.pop().await.unwrap().unwrap();
    assert_eq!(popped.owner_id, ORG2);
    assert!(throttled.pop().await.unwrap().is_none());

    // paused owners keep their place so the next run sees them again
    env.db.set_outbox_count(ORG1, 100);
    let stats = cron.run(&env.rt).await.unwrap();
    assert_eq!(stats["resumed"], 1);
    assert!(throttled.paused().await.unwrap().is_empty());
    assert_eq!(throttled.pop().await.unwrap().unwrap().owner_id, ORG1);
}

#[tokio::test]
async fn test_errored_messages_are_retried() {
    let env = TestEnv::new();
    let contact_id = env.add_contacts(ORG1, [1])[0];

    let mut errored = Msg::outgoing(ORG1, None, contact_id, "try again");
    errored.status = MsgStatus::Errored;
    errored.retry_count = 1;
    errored.next_attempt = Some(past());
    let errored = env.db.add_msg(errored);

    let mut later = Msg::outgoing(ORG1, None, contact_id, "not yet");
    later.status = MsgStatus::Errored;
    later.next_attempt = Some(Utc::now() + ChronoDuration::hours(1));
    let later = env.db.add_msg(later);

    let stats = RetryMsgs.run(&env.rt).await.unwrap();
    assert_eq!(stats["retried"], 1);

    let retried = env.db.msg(errored.id).unwrap();
    assert_eq!(retried.status, MsgStatus::Queued);
    assert_eq!(retried.retry_count, 2);
    assert_eq!(env.db.msg(later.id).unwrap().status, MsgStatus::Errored);

    let sent: Vec<String> = env.courier.queued().into_iter().map(|m| m.text).collect();
    assert_eq!(sent, vec!["try again"]);
}

#[tokio::test]
async fn test_old_unsent_messages_are_failed() {
    let env = TestEnv::new();
    let contact_id = env.add_contacts(ORG1, [1])[0];

    let mut old = Msg::outgoing(ORG1, None, contact_id, "too late");
    old.created_on = Utc::now() - ChronoDuration::days(10);
    let old = env.db.add_msg(old);
    let recent = env.db.add_msg(Msg::outgoing(ORG1, None, contact_id, "on its way"));

    let stats = FailOldMsgs.run(&env.rt).await.unwrap();
    assert_eq!(stats["failed"], 1);
    assert_eq!(env.db.msg(old.id).unwrap().status, MsgStatus::Failed);
    assert_eq!(env.db.msg(recent.id).unwrap().status, MsgStatus::Queued);
}

fn channel(id: i64, org_id: OrgId) -> Channel {
    Channel {
        id: ChannelId(id),
        uuid: Uuid::new_v4(),
        org_id,
        name: format!("Channel {id}"),
        channel_type: "T".to_string(),
        tps: None,
        fcm_id: None,
        last_seen: None,
    }
}

fn errored_call(id: i64, channel_id: i64, contact_id: ContactId) -> Call {
    Call {
        id: CallId(id),
        org_id: ORG1,
        channel_id: ChannelId(channel_id),
        contact_id,
        contact_urn: format!("tel:+25078800{id:04}"),
        status: CallStatus::Errored,
        retry_count: 1,
        next_attempt: Some(past()),
    }
}

#[tokio::test]
async fn test_call_retries_back_off_busy_channels() {
    let env = TestEnv::new();
    let contact_id = env.add_contacts(ORG1, [1])[0];
    env.db.add_channel(channel(1, ORG1));
    env.db.add_channel(channel(2, ORG1));
    env.ivr.set_outcome(ChannelId(2), CallOutcome::Throttled);

    env.db.add_call(errored_call(1, 1, contact_id));
    env.db.add_call(errored_call(2, 2, contact_id));
    env.db.add_call(errored_call(3, 2, contact_id));
    // channel no longer exists
    env.db.add_call(errored_call(4, 99, contact_id));

    let stats = RetryCalls.run(&env.rt).await.unwrap();
    assert_eq!(stats["retried"], 1);
    assert_eq!(stats["throttled"], 2);
    assert_eq!(stats["errored"], 1);

    assert_eq!(env.db.call(CallId(1)).unwrap().status, CallStatus::Wired);
    let throttled = env.db.call(CallId(2)).unwrap();
    assert_eq!(throttled.status, CallStatus::Queued);
    assert!(throttled.next_attempt.unwrap() > Utc::now());
    // skipped without asking the channel again
    assert_eq!(env.db.call(CallId(3)).unwrap().status, CallStatus::Errored);
    assert_eq!(env.ivr.requested().len(), 2);
    assert_eq!(env.db.call(CallId(4)).unwrap().status, CallStatus::Failed);
}

#[tokio::test]
async fn test_webhook_incidents_end_once_healthy() {
    let env = TestEnv::new();
    for (id, org_id) in [(1, ORG1), (2, ORG2)] {
        env.db.add_incident(Incident {
            id: IncidentId(id),
            org_id,
            incident_type: WEBHOOKS_UNHEALTHY.to_string(),
            started_on: Utc::now() - ChronoDuration::hours(2),
        });
    }
    env.db
        .add_webhook_failure(ORG2, Utc::now() - ChronoDuration::minutes(5));

    let stats = EndIncidents.run(&env.rt).await.unwrap();
    assert_eq!(stats["ended"], 1);
    assert!(env.db.incident_ended(IncidentId(1)));
    assert!(!env.db.incident_ended(IncidentId(2)));
}

#[tokio::test]
async fn test_deleted_orgs_deindexed_in_batches() {
    let env = TestEnv::new();
    env.search.add_deindexable(OrgId(5), 12_000);
    env.rt.kv.sadd(keys::DEINDEX_ORGS, "5").await.unwrap();
    env.rt.kv.sadd(keys::DEINDEX_ORGS, "junk").await.unwrap();

    let stats = DeindexDeletedOrgs.run(&env.rt).await.unwrap();
    assert_eq!(stats["orgs"], 1);
    assert_eq!(stats["deindexed"], 10_000);
    assert_eq!(env.rt.kv.smembers(keys::DEINDEX_ORGS).await.unwrap(), vec!["5"]);

    DeindexDeletedOrgs.run(&env.rt).await.unwrap();
    let stats = DeindexDeletedOrgs.run(&env.rt).await.unwrap();
    assert_eq!(stats["deindexed"], 0);
    assert!(env.rt.kv.smembers(keys::DEINDEX_ORGS).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_fire_records_stats_and_respects_lock() {
    let env = TestEnv::new();
    let cron = ThrottleQueue::new(10_000);

    let result = fire(&env.rt, &cron, Duration::from_secs(5)).await;
    assert!(matches!(result, Some(Ok(_))));
    assert_eq!(
        env.rt
            .kv
            .hget(keys::CRON_CALL_COUNT, "throttle_queue")
            .await
            .unwrap()
            .as_deref(),
        Some("1")
    );
    let last_result = env
        .rt
        .kv
        .hget(keys::CRON_LAST_RESULT, "throttle_queue")
        .await
        .unwrap()
        .unwrap();
    let last_result: serde_json::Value = serde_json::from_str(&last_result).unwrap();
    assert_eq!(last_result, json!({ "paused": 0, "resumed": 0 }));

    // another node holds this tick
    let lock_key = keys::cron_lock("throttle_queue");
    env.rt
        .locker
        .grab(&lock_key, Duration::from_secs(60), Duration::ZERO)
        .await
        .unwrap()
        .unwrap();
    assert!(fire(&env.rt, &cron, Duration::from_secs(5)).await.is_none());
    assert_eq!(
        env.rt
            .kv
            .hget(keys::CRON_CALL_COUNT, "throttle_queue")
            .await
            .unwrap()
            .as_deref(),
        Some("1")
    );
}
