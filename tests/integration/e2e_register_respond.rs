//! End-to-end: register handshake, request/response between two services,
//! unknown-destination errors, and per-pair FIFO ordering.

use bus_client::{BusClient, ClientConfig, ClientError};
use bus_protocol::actions;
use bus_test_utils::{TestBroker, TestPeer, wait_until};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn client_for(broker: &TestBroker, name: &str) -> BusClient {
    let addr = broker.addr();
    BusClient::new(
        name,
        ClientConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            ..ClientConfig::default()
        },
    )
}

/// The broker confirms a registration on the wire within a second, carrying
/// the full service list.
#[tokio::test]
async fn register_confirmation_arrives_promptly() {
    let broker = TestBroker::spawn_default().await;

    let mut peer = TestPeer::connect(broker.addr()).await;
    peer.send_register("a").await;
    let confirmed = peer
        .expect_action(actions::REGISTERED, Duration::from_secs(1))
        .await;

    assert_eq!(
        confirmed.extra.get("service_name").and_then(|v| v.as_str()),
        Some("a")
    );
    assert_eq!(
        confirmed.extra.get("registered_services"),
        Some(&json!(["a"]))
    );
}

/// Scenario: `a` asks `b` to echo, and observes the echo with the matching
/// request correlation.
#[tokio::test]
async fn echo_round_trip_between_two_services() {
    let broker = TestBroker::spawn_default().await;

    let b = client_for(&broker, "b");
    b.register_callback("echo", |data| Some(data));
    b.connect(Duration::from_secs(2)).await.unwrap();

    let a = client_for(&broker, "a");
    a.connect(Duration::from_secs(2)).await.unwrap();

    let reply = a
        .send("b", "echo", json!({"x": 1}), true, Some(Duration::from_secs(2)))
        .await
        .unwrap()
        .expect("echo response");

    assert_eq!(reply.action, actions::RESPONSE);
    assert_eq!(reply.data, Some(json!({"x": 1})));
    assert!(reply.request_id.is_some());
}

/// Scenario: sending to an unregistered name yields an error envelope with
/// the matching request id, not a timeout.
#[tokio::test]
async fn unknown_destination_reports_error() {
    let broker = TestBroker::spawn_default().await;

    let a = client_for(&broker, "a");
    a.connect(Duration::from_secs(2)).await.unwrap();

    let reply = a
        .send("nobody", "ping_them", json!({}), true, Some(Duration::from_secs(1)))
        .await
        .unwrap()
        .expect("error envelope");

    assert_eq!(reply.action, actions::ERROR);
    assert!(
        reply
            .extra
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap()
            .contains("nobody")
    );
}

/// FIFO: two fire-and-forget sends from one sender to one destination arrive
/// in order.
#[tokio::test]
async fn sends_to_one_destination_preserve_order() {
    let broker = TestBroker::spawn_default().await;

    let seen: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let d = client_for(&broker, "d");
    {
        let seen = seen.clone();
        d.register_callback("store", move |data| {
            seen.lock()
                .unwrap()
                .push(data.get("n").and_then(|v| v.as_i64()).unwrap_or(-1));
            None
        });
    }
    d.connect(Duration::from_secs(2)).await.unwrap();

    let s = client_for(&broker, "s");
    s.connect(Duration::from_secs(2)).await.unwrap();

    for n in 0..20 {
        s.send("d", "store", json!({"n": n}), false, None)
            .await
            .unwrap();
    }

    let seen_done = seen.clone();
    assert!(
        wait_until(Duration::from_secs(3), move || {
            seen_done.lock().unwrap().len() == 20
        })
        .await
    );
    let order = seen.lock().unwrap().clone();
    assert_eq!(order, (0..20).collect::<Vec<i64>>());
}

/// A send while disconnected fails fast rather than queueing.
#[tokio::test]
async fn send_requires_registered_state() {
    let broker = TestBroker::spawn_default().await;
    let a = client_for(&broker, "a");
    let result = a.send("b", "echo", json!({}), false, None).await;
    assert!(matches!(result, Err(ClientError::NotConnected)));
}
