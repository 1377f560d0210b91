//! Scenario: a broadcast from one peer reaches every other registered peer
//! exactly once, and the sender gets a recipient count.

use bus_client::{BusClient, ClientConfig};
use bus_protocol::{Envelope, actions};
use bus_test_utils::{TestBroker, TestPeer, wait_until};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn broadcast_reaches_every_other_peer_exactly_once() {
    let broker = TestBroker::spawn_default().await;

    let mut a = TestPeer::register(broker.addr(), "a").await;
    let mut b = TestPeer::register(broker.addr(), "b").await;
    let mut c = TestPeer::register(broker.addr(), "c").await;

    a.send(
        &Envelope::new(actions::BROADCAST)
            .with_sender("a")
            .with_data(json!({"hello": true})),
    )
    .await;

    let sent = a.expect_action(actions::BROADCAST_SENT, WAIT).await;
    assert_eq!(sent.extra.get("recipients").and_then(|v| v.as_u64()), Some(2));

    for peer in [&mut b, &mut c] {
        let received = peer.expect_action(actions::BROADCAST, WAIT).await;
        assert_eq!(received.sender.as_deref(), Some("a"));
        assert_eq!(
            received.data.as_ref().and_then(|d| d.get("hello")),
            Some(&json!(true))
        );
        // Exactly once: nothing else with this action is in flight.
        if let Some(second) = peer.recv_timeout(Duration::from_millis(200)).await {
            assert_ne!(second.action, actions::BROADCAST);
        }
    }

    // The sender is excluded from its own fan-out.
    if let Some(envelope) = a.recv_timeout(Duration::from_millis(200)).await {
        assert_ne!(envelope.action, actions::BROADCAST);
    }
}

#[tokio::test]
async fn client_broadcast_api_feeds_peer_callbacks() {
    let broker = TestBroker::spawn_default().await;
    let addr = broker.addr();

    let make = |name: &str| {
        BusClient::new(
            name,
            ClientConfig {
                host: addr.ip().to_string(),
                port: addr.port(),
                ..ClientConfig::default()
            },
        )
    };

    let received = Arc::new(AtomicUsize::new(0));
    let mut listeners = Vec::new();
    for name in ["users", "appointments"] {
        let listener = make(name);
        let received = received.clone();
        listener.register_callback(actions::BROADCAST, move |data| {
            assert_eq!(data.get("event"), Some(&json!("maintenance")));
            let _ = received.fetch_add(1, Ordering::SeqCst);
            None
        });
        listener.connect(WAIT).await.unwrap();
        listeners.push(listener);
    }

    let admin = make("admin");
    admin.connect(WAIT).await.unwrap();
    admin.broadcast(json!({"event": "maintenance"})).unwrap();

    let received_done = received.clone();
    assert!(
        wait_until(WAIT, move || received_done.load(Ordering::SeqCst) == 2).await
    );
}
