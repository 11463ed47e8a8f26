//! Per-contact event handling: ordering, locking, timers and retries.

mod common;

use chrono::Utc;
use common::{TestEnv, ORG1};
use std::time::Duration;
use uuid::Uuid;

use mailroom_core::constants::{keys, CONTACT_LOCK_TTL};
use mailroom_core::contact_tasks::event_received::STOP_CONTACT;
use mailroom_core::contact_tasks::{EventReceived, MsgReceived, WaitTimeout};
use mailroom_core::contacts::queue_contact_task;
use mailroom_core::foreman::execute_task;
use mailroom_core::foreman::TaskOutcome;
use mailroom_core::models::{ContactId, ContactStatus, FlowId, SessionStatus};
use mailroom_core::queue::{Priority, TaskEnvelope, TaskQueue};
use mailroom_core::services::EngineInput;
use mailroom_core::tasks::{queue_task, HandleContactEvent};

fn msg(text: &str) -> MsgReceived {
    MsgReceived {
        channel_id: None,
        msg_uuid: Uuid::new_v4(),
        urn: "tel:+250788123123".to_string(),
        text: text.to_string(),
        attachments: vec![],
        received_on: Utc::now(),
    }
}

fn texts(env: &TestEnv) -> Vec<String> {
    env.engine
        .runs()
        .into_iter()
        .filter_map(|(_, input)| match input {
            EngineInput::Msg { text, .. } => Some(text),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_events_for_a_contact_run_in_order_from_one_dispatch() {
    let env = TestEnv::new();
    let contact_id = env.add_contacts(ORG1, [10])[0];

    for text in ["one", "two", "three"] {
        queue_contact_task(&env.rt, ORG1, contact_id, &msg(text), Priority::High)
            .await
            .unwrap();
    }

    // only the first push queues a dispatch
    assert_eq!(env.rt.queues.realtime.size().await.unwrap(), 1);
    assert_eq!(env.rt.contact_queue.size(ORG1, contact_id).await.unwrap(), 3);

    env.run_all().await;

    assert_eq!(texts(&env), vec!["one", "two", "three"]);
    assert_eq!(env.courier.queued().len(), 3);
    assert_eq!(env.rt.contact_queue.size(ORG1, contact_id).await.unwrap(), 0);
    assert!(env.db.contact(contact_id).unwrap().last_seen_on.is_some());

    // the marker was cleared, so a new event gets a new dispatch
    queue_contact_task(&env.rt, ORG1, contact_id, &msg("four"), Priority::High)
        .await
        .unwrap();
    assert_eq!(env.rt.queues.realtime.size().await.unwrap(), 1);
}

#[tokio::test]
async fn test_resume_flag_follows_current_session() {
    let env = TestEnv::new();
    let contacts = env.add_contacts(ORG1, [10, 11]);
    env.db.add_waiting_session(ORG1, contacts[1], FlowId(3));

    for contact_id in &contacts {
        queue_contact_task(&env.rt, ORG1, *contact_id, &msg("hi"), Priority::High)
            .await
            .unwrap();
    }
    env.run_all().await;

    let resumes: Vec<(ContactId, bool)> = env
        .engine
        .runs()
        .into_iter()
        .filter_map(|(contact_id, input)| match input {
            EngineInput::Msg { resume, .. } => Some((contact_id, resume)),
            _ => None,
        })
        .collect();
    assert!(resumes.contains(&(contacts[0], false)));
    assert!(resumes.contains(&(contacts[1], true)));
}

#[tokio::test]
async fn test_dispatch_requeues_itself_while_contact_is_locked() {
    let env = TestEnv::new();
    let contact_id = env.add_contacts(ORG1, [10])[0];
    queue_contact_task(&env.rt, ORG1, contact_id, &msg("hello"), Priority::High)
        .await
        .unwrap();

    let lock_key = keys::contact_lock(ORG1, contact_id);
    let token = env
        .rt
        .locker
        .grab(&lock_key, CONTACT_LOCK_TTL, Duration::ZERO)
        .await
        .unwrap()
        .unwrap();

    // the dispatch waits out the lock, gives up and queues itself again
    let queue = env.rt.queues.realtime.clone();
    let popped = queue.pop().await.unwrap().unwrap();
    execute_task(&env.rt, queue.as_ref(), popped).await;

    assert!(env.engine.runs().is_empty());
    assert_eq!(queue.size().await.unwrap(), 1);
    assert_eq!(env.rt.contact_queue.size(ORG1, contact_id).await.unwrap(), 1);

    env.rt.locker.release(&lock_key, &token).await.unwrap();
    env.run_all().await;
    assert_eq!(texts(&env), vec!["hello"]);
}

#[tokio::test]
async fn test_failing_event_is_retried_then_dropped() {
    let env = TestEnv::new();
    env.engine.fail_on_text("boom");
    let contact_id = env.add_contacts(ORG1, [10])[0];

    queue_contact_task(&env.rt, ORG1, contact_id, &msg("boom"), Priority::High)
        .await
        .unwrap();
    queue_contact_task(&env.rt, ORG1, contact_id, &msg("after"), Priority::High)
        .await
        .unwrap();

    // one dispatch per attempt at the failing event
    let ran = env.run_all().await;
    assert_eq!(ran, 3);

    // the later event still ran, after the failing one was given up on
    assert_eq!(texts(&env), vec!["after"]);
    assert_eq!(env.rt.contact_queue.size(ORG1, contact_id).await.unwrap(), 0);
    assert!(!env
        .rt
        .locker
        .is_locked(&keys::contact_lock(ORG1, contact_id))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_stale_wait_timeout_is_ignored() {
    let env = TestEnv::new();
    let contact_id = env.add_contacts(ORG1, [10])[0];
    let session = env.db.add_waiting_session(ORG1, contact_id, FlowId(3));
    let sprint_uuid = session.last_sprint_uuid.unwrap();

    // a timer from an earlier sprint
    let stale = WaitTimeout {
        session_uuid: session.uuid,
        sprint_uuid: Uuid::new_v4(),
    };
    queue_contact_task(&env.rt, ORG1, contact_id, &stale, Priority::High)
        .await
        .unwrap();
    env.run_all().await;
    assert!(env.engine.runs().is_empty());

    let current = WaitTimeout {
        session_uuid: session.uuid,
        sprint_uuid,
    };
    queue_contact_task(&env.rt, ORG1, contact_id, &current, Priority::High)
        .await
        .unwrap();
    env.run_all().await;

    let runs = env.engine.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(
        runs[0].1,
        EngineInput::WaitTimeout {
            session_uuid: session.uuid,
            sprint_uuid,
        }
    );
}

#[tokio::test]
async fn test_stop_event_stops_contact_and_ends_sessions() {
    let env = TestEnv::new();
    let contact_id = env.add_contacts(ORG1, [10])[0];
    let session = env.db.add_waiting_session(ORG1, contact_id, FlowId(3));

    let event = EventReceived {
        event_type: STOP_CONTACT.to_string(),
        channel_id: None,
        extra: serde_json::Value::Null,
        created_on: Utc::now(),
    };
    queue_contact_task(&env.rt, ORG1, contact_id, &event, Priority::High)
        .await
        .unwrap();
    env.run_all().await;

    let contact = env.db.contact(contact_id).unwrap();
    assert_eq!(contact.status, ContactStatus::Stopped);
    assert_eq!(contact.current_session_uuid, None);
    assert_eq!(
        env.db.session(session.uuid).unwrap().status,
        SessionStatus::Interrupted
    );
    assert!(env.engine.runs().is_empty());
}

#[tokio::test]
async fn test_blocked_contact_messages_do_not_run_flows() {
    let env = TestEnv::new();
    let contact_id = env.add_contacts(ORG1, [10])[0];
    env.db.set_contact_status(contact_id, ContactStatus::Blocked);

    queue_contact_task(&env.rt, ORG1, contact_id, &msg("hi"), Priority::High)
        .await
        .unwrap();
    env.run_all().await;

    assert!(env.engine.runs().is_empty());
    assert!(env.db.contact(contact_id).unwrap().last_seen_on.is_some());
}

#[tokio::test]
async fn test_unknown_event_type_does_not_strand_later_events() {
    let env = TestEnv::new();
    let contact_id = env.add_contacts(ORG1, [10])[0];

    // an event from a newer release this node does not know how to handle
    let unknown = TaskEnvelope::new("mystery_event", serde_json::json!({}));
    let needs_dispatch = env
        .rt
        .contact_queue
        .push_back(ORG1, contact_id, &unknown.to_json().unwrap())
        .await
        .unwrap();
    assert!(needs_dispatch);
    queue_task(
        env.rt.queues.realtime.as_ref(),
        ORG1,
        &HandleContactEvent { contact_id },
        Priority::High,
    )
    .await
    .unwrap();
    queue_contact_task(&env.rt, ORG1, contact_id, &msg("good"), Priority::High)
        .await
        .unwrap();

    let queue = env.rt.queues.realtime.clone();
    let popped = queue.pop().await.unwrap().unwrap();
    assert_eq!(
        execute_task(&env.rt, queue.as_ref(), popped).await,
        TaskOutcome::Error
    );
    // the failed drain left a dispatch behind for the remaining event
    assert_eq!(queue.size().await.unwrap(), 1);

    env.run_all().await;
    assert_eq!(texts(&env), vec!["good"]);
    assert_eq!(env.rt.contact_queue.size(ORG1, contact_id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_panicking_event_does_not_strand_later_events() {
    let env = TestEnv::new();
    env.engine.panic_on_text("kaboom");
    let contact_id = env.add_contacts(ORG1, [10])[0];

    queue_contact_task(&env.rt, ORG1, contact_id, &msg("kaboom"), Priority::High)
        .await
        .unwrap();
    queue_contact_task(&env.rt, ORG1, contact_id, &msg("after"), Priority::High)
        .await
        .unwrap();

    let queue = env.rt.queues.realtime.clone();
    let popped = queue.pop().await.unwrap().unwrap();
    assert_eq!(
        execute_task(&env.rt, queue.as_ref(), popped).await,
        TaskOutcome::Panic
    );
    assert_eq!(queue.active(ORG1).await.unwrap(), 0);
    assert_eq!(queue.size().await.unwrap(), 1);

    env.run_all().await;
    assert_eq!(texts(&env), vec!["after"]);
    assert_eq!(env.rt.contact_queue.size(ORG1, contact_id).await.unwrap(), 0);
    assert!(!env
        .rt
        .locker
        .is_locked(&keys::contact_lock(ORG1, contact_id))
        .await
        .unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_hanging_event_times_out_as_failed_attempt() {
    let env = TestEnv::new();
    env.engine.hang_on_text("slow");
    let contact_id = env.add_contacts(ORG1, [10])[0];

    queue_contact_task(&env.rt, ORG1, contact_id, &msg("slow"), Priority::High)
        .await
        .unwrap();
    queue_contact_task(&env.rt, ORG1, contact_id, &msg("after"), Priority::High)
        .await
        .unwrap();

    // each dispatch gives up on the hanging event, the third drops it
    assert_eq!(env.run_all().await, 3);
    assert_eq!(texts(&env), vec!["after"]);
    assert_eq!(env.rt.contact_queue.size(ORG1, contact_id).await.unwrap(), 0);
}
