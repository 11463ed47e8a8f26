//! Broadcasts, flow starts, recipient resolution and smart group population.

mod common;

use chrono::{Duration, Utc};
use common::{TestEnv, ORG1};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

use mailroom_core::models::{
    BatchStatus, Broadcast, BroadcastId, ContactId, Exclusions, FlowId, FlowStart, Group,
    GroupId, GroupStatus, Recipients, StartId,
};
use mailroom_core::queue::{Priority, TaskQueue};
use mailroom_core::recipients::resolve;
use mailroom_core::services::{EngineInput, Refresh};
use mailroom_core::tasks::{queue_task, PopulateDynamicGroup, SendBroadcast, StartFlow};

fn broadcast(id: i64, recipients: Recipients) -> Broadcast {
    Broadcast {
        id: BroadcastId(id),
        org_id: ORG1,
        status: BatchStatus::Pending,
        translations: BTreeMap::from([("eng".to_string(), "Hello there".to_string())]),
        base_language: "eng".to_string(),
        recipients,
        contact_count: 0,
    }
}

fn flow_start(id: i64, flow_id: FlowId, recipients: Recipients) -> FlowStart {
    FlowStart {
        id: StartId(id),
        uuid: Uuid::new_v4(),
        org_id: ORG1,
        flow_id,
        status: BatchStatus::Pending,
        recipients,
        params: None,
        contact_count: 0,
    }
}

fn group(id: i64, query: Option<&str>) -> Group {
    Group {
        id: GroupId(id),
        uuid: Uuid::new_v4(),
        name: format!("Group {id}"),
        query: query.map(str::to_string),
        status: GroupStatus::Ready,
    }
}

#[tokio::test]
async fn test_broadcast_fans_out_in_batches() {
    let env = TestEnv::new();
    let contacts = env.add_contacts(ORG1, 1..=121);
    env.db
        .add_broadcast(broadcast(5, Recipients::contacts(contacts.clone())));

    queue_task(
        env.rt.queues.batch.as_ref(),
        ORG1,
        &SendBroadcast {
            broadcast_id: BroadcastId(5),
        },
        Priority::Bulk,
    )
    .await
    .unwrap();

    // the parent only queues the batches
    assert_eq!(env.drain(env.rt.queues.batch.as_ref()).await, 1);
    assert_eq!(env.rt.queues.throttled.size().await.unwrap(), 2);
    let queued = env.db.broadcast(BroadcastId(5)).unwrap();
    assert_eq!(queued.status, BatchStatus::Queued);
    assert_eq!(queued.contact_count, 121);

    env.run_all().await;

    let ran: HashSet<ContactId> = env.engine.contacts_run().into_iter().collect();
    assert_eq!(ran.len(), 121);
    assert!(env.engine.runs().iter().all(|(_, input)| matches!(
        input,
        EngineInput::Broadcast { broadcast_id, .. } if *broadcast_id == BroadcastId(5)
    )));
    assert_eq!(env.courier.queued().len(), 121);
    assert_eq!(
        env.db.broadcast(BroadcastId(5)).unwrap().status,
        BatchStatus::Completed
    );
}

#[tokio::test]
async fn test_broadcast_to_single_contact_goes_realtime() {
    let env = TestEnv::new();
    let contacts = env.add_contacts(ORG1, [1]);
    env.db.add_broadcast(broadcast(6, Recipients::contacts(contacts)));

    queue_task(
        env.rt.queues.batch.as_ref(),
        ORG1,
        &SendBroadcast {
            broadcast_id: BroadcastId(6),
        },
        Priority::Bulk,
    )
    .await
    .unwrap();
    env.drain(env.rt.queues.batch.as_ref()).await;

    assert_eq!(env.rt.queues.realtime.size().await.unwrap(), 1);
    assert_eq!(env.rt.queues.throttled.size().await.unwrap(), 0);
}

#[tokio::test]
async fn test_broadcast_without_recipients_completes_immediately() {
    let env = TestEnv::new();
    env.db.add_broadcast(broadcast(7, Recipients::default()));

    queue_task(
        env.rt.queues.batch.as_ref(),
        ORG1,
        &SendBroadcast {
            broadcast_id: BroadcastId(7),
        },
        Priority::Bulk,
    )
    .await
    .unwrap();
    env.run_all().await;

    assert_eq!(
        env.db.broadcast(BroadcastId(7)).unwrap().status,
        BatchStatus::Completed
    );
    assert!(env.engine.runs().is_empty());
}

#[tokio::test]
async fn test_interrupted_broadcast_sends_nothing() {
    let env = TestEnv::new();
    let contacts = env.add_contacts(ORG1, 1..=3);
    let mut interrupted = broadcast(8, Recipients::contacts(contacts));
    interrupted.status = BatchStatus::Interrupted;
    env.db.add_broadcast(interrupted);

    queue_task(
        env.rt.queues.batch.as_ref(),
        ORG1,
        &SendBroadcast {
            broadcast_id: BroadcastId(8),
        },
        Priority::Bulk,
    )
    .await
    .unwrap();
    env.run_all().await;

    assert!(env.engine.runs().is_empty());
    assert_eq!(
        env.db.broadcast(BroadcastId(8)).unwrap().status,
        BatchStatus::Interrupted
    );
}

#[tokio::test]
async fn test_flow_start_interrupts_and_applies_exclusions() {
    let env = TestEnv::new();
    let flow_id = env.add_flow(ORG1, 20, "Registration");
    let other_flow = env.add_flow(ORG1, 21, "Survey");
    let contacts = env.add_contacts(ORG1, 1..=4);

    // contact 2 is in another flow and gets interrupted, contact 3 already ran this flow
    let waiting = env.db.add_waiting_session(ORG1, contacts[1], other_flow);
    env.db.add_run(contacts[2], flow_id);

    let recipients = Recipients {
        contact_ids: contacts.clone(),
        exclusions: Exclusions {
            started_previously: true,
            ..Exclusions::default()
        },
        ..Recipients::default()
    };
    env.db.add_start(flow_start(30, flow_id, recipients));

    queue_task(
        env.rt.queues.batch.as_ref(),
        ORG1,
        &StartFlow {
            start_id: StartId(30),
        },
        Priority::Bulk,
    )
    .await
    .unwrap();
    env.run_all().await;

    let mut ran = env.engine.contacts_run();
    ran.sort();
    assert_eq!(ran, vec![contacts[0], contacts[1], contacts[3]]);
    assert!(env.engine.runs().iter().all(|(_, input)| matches!(
        input,
        EngineInput::FlowStart { flow_id: f, start_id: Some(StartId(30)), .. } if *f == flow_id
    )));

    assert_ne!(
        env.db.session(waiting.uuid).unwrap().status,
        mailroom_core::models::SessionStatus::Waiting
    );
    let start = env.db.start(StartId(30)).unwrap();
    assert_eq!(start.status, BatchStatus::Completed);
    assert_eq!(start.contact_count, 3);
}

#[tokio::test]
async fn test_flow_start_for_archived_flow_fails() {
    let env = TestEnv::new();
    let contacts = env.add_contacts(ORG1, 1..=2);
    env.db.add_flow(
        ORG1,
        mailroom_core::models::Flow {
            id: FlowId(40),
            uuid: Uuid::new_v4(),
            name: "Old".to_string(),
            is_archived: true,
        },
    );
    env.db
        .add_start(flow_start(31, FlowId(40), Recipients::contacts(contacts)));

    queue_task(
        env.rt.queues.batch.as_ref(),
        ORG1,
        &StartFlow {
            start_id: StartId(31),
        },
        Priority::Bulk,
    )
    .await
    .unwrap();
    env.run_all().await;

    assert!(env.engine.runs().is_empty());
    assert_eq!(
        env.db.start(StartId(31)).unwrap().status,
        BatchStatus::Failed
    );
}

#[tokio::test]
async fn test_resolve_unions_sources_once_in_order() {
    let env = TestEnv::new();
    let contacts = env.add_contacts(ORG1, 1..=6);
    env.db
        .add_group(ORG1, group(50, None), &[contacts[1], contacts[2]]);
    env.db.add_urn(ORG1, contacts[5], "tel:+250788000006");
    env.search.add_query("age > 20", &[contacts[2], contacts[3]]);

    let recipients = Recipients {
        contact_ids: vec![contacts[0], contacts[1]],
        group_ids: vec![GroupId(50)],
        query: Some("age > 20".to_string()),
        urns: vec!["tel:+250788000006".to_string(), "tel:+250788999999".to_string()],
        exclusions: Exclusions::default(),
    };

    let oa = env.rt.assets.get(ORG1, Refresh::NONE).await.unwrap();
    let resolved = resolve(&env.rt, &oa, &recipients, None).await.unwrap();

    assert_eq!(resolved.len(), 6);
    assert_eq!(
        &resolved[..5],
        &[contacts[0], contacts[1], contacts[2], contacts[3], contacts[5]]
    );
    // the unknown URN got a new contact
    assert!(!contacts.contains(&resolved[5]));
}

#[tokio::test]
async fn test_resolve_exclusions() {
    let env = TestEnv::new();
    let flow_id = env.add_flow(ORG1, 20, "Registration");
    let contacts = env.add_contacts(ORG1, 1..=5);

    env.db
        .set_contact_status(contacts[0], mailroom_core::models::ContactStatus::Blocked);
    env.db.add_waiting_session(ORG1, contacts[1], flow_id);
    for contact_id in &contacts[2..] {
        env.db.set_last_seen_on(*contact_id, Utc::now());
    }
    env.db
        .set_last_seen_on(contacts[4], Utc::now() - Duration::days(100));

    let recipients = Recipients {
        contact_ids: contacts.clone(),
        exclusions: Exclusions {
            non_active: true,
            in_a_flow: true,
            started_previously: false,
            not_seen_since_days: 90,
        },
        ..Recipients::default()
    };

    let oa = env.rt.assets.get(ORG1, Refresh::NONE).await.unwrap();
    let resolved = resolve(&env.rt, &oa, &recipients, Some(flow_id)).await.unwrap();
    assert_eq!(resolved, vec![contacts[2], contacts[3]]);
}

#[tokio::test]
async fn test_populate_dynamic_group_sets_members_and_status() {
    let env = TestEnv::new();
    let contacts = env.add_contacts(ORG1, 1..=4);
    env.db
        .add_group(ORG1, group(60, Some("gender = F")), &[contacts[0]]);
    env.search
        .add_query("gender = F", &[contacts[1], contacts[2]]);

    queue_task(
        env.rt.queues.batch.as_ref(),
        ORG1,
        &PopulateDynamicGroup {
            group_id: GroupId(60),
            query: "gender = F".to_string(),
        },
        Priority::Bulk,
    )
    .await
    .unwrap();
    env.run_all().await;

    assert_eq!(env.db.group_members(GroupId(60)), vec![contacts[1], contacts[2]]);
    assert_eq!(env.db.group(GroupId(60)).unwrap().status, GroupStatus::Ready);
}
