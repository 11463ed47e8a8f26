//! Service lifecycle and the status endpoints.

mod common;

use common::{test_config, TestEnv, ORG1};
use serde_json::{json, Value};

use mailroom_core::constants::keys;
use mailroom_core::queue::{Priority, TaskEnvelope, TaskQueue};
use mailroom_core::service::{check_dependencies, node_id, Service};

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[tokio::test]
async fn test_in_memory_dependencies_are_healthy() {
    let env = TestEnv::new();
    let checks = check_dependencies(&env.rt).await;

    let names: Vec<&str> = checks.iter().map(|c| c.name).collect();
    assert!(names.contains(&"kv"));
    assert!(names.contains(&"search"));
    assert!(checks.iter().all(|c| c.healthy), "{checks:?}");
}

#[tokio::test]
async fn test_service_serves_status_and_cleans_up_on_stop() {
    let port = free_port();
    let env = TestEnv::with_config(mailroom_core::MailroomConfig {
        address: "127.0.0.1".to_string(),
        port,
        ..test_config()
    });

    // keep the task parked so the running foremen leave it alone
    env.db.set_outbox_count(ORG1, 1_000_000);
    let throttled = env.rt.queues.throttled.clone();
    throttled.pause(ORG1).await.unwrap();
    throttled
        .push(ORG1, &TaskEnvelope::new("noop", json!({})), Priority::Bulk)
        .await
        .unwrap();

    let mut service = Service::new(env.rt.clone());
    service.start().await.unwrap();

    let node = node_id(&env.rt);
    assert_eq!(node, "mailroom:test-node");
    assert!(env.rt.kv.hexists(keys::RUNNING_NODES, &node).await.unwrap());

    let client = reqwest::Client::new();
    let base = format!("http://127.0.0.1:{port}");

    let health: Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let ready = client.get(format!("{base}/ready")).send().await.unwrap();
    assert_eq!(ready.status(), reqwest::StatusCode::OK);

    let queues: Value = client
        .get(format!("{base}/queues"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(queues["throttled"]["size"], 1);
    assert_eq!(queues["throttled"]["owners"]["1"]["queued"], 1);
    assert_eq!(queues["throttled"]["paused"], json!(["1"]));
    assert_eq!(queues["realtime"]["max_active_per_owner"], 2);

    service.stop().await;

    assert!(service.shutdown_token().is_cancelled());
    assert!(!env.rt.kv.hexists(keys::RUNNING_NODES, &node).await.unwrap());
}
