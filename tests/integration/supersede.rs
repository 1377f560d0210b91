//! Scenario: a second connection registering an already-bound name
//! supersedes the first.  The old socket is closed before the new binding is
//! confirmed, and the remaining peers observe exactly one
//! `service_disconnected` followed by one `service_connected`.

use bus_protocol::actions;
use bus_test_utils::{TestBroker, TestPeer};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn supersede_closes_prior_connection_and_notifies_peers() {
    let broker = TestBroker::spawn_default().await;

    let mut first = TestPeer::register(broker.addr(), "a").await;
    let mut observer = TestPeer::register(broker.addr(), "b").await;

    // A second connection claims the same name.
    let second = TestPeer::register(broker.addr(), "a").await;

    // The observer sees the old binding die, then the new one appear.
    // (expect_action skips non-matching envelopes, so if the order were
    // reversed the first wait would swallow the `service_connected` and the
    // second would time out.)
    let disconnected = observer.expect_action(actions::SERVICE_DISCONNECTED, WAIT).await;
    assert_eq!(
        disconnected
            .extra
            .get("service_name")
            .and_then(|v| v.as_str()),
        Some("a")
    );
    assert_eq!(
        disconnected.extra.get("reason").and_then(|v| v.as_str()),
        Some("superseded")
    );

    let connected = observer.expect_action(actions::SERVICE_CONNECTED, WAIT).await;
    assert_eq!(
        connected.extra.get("service_name").and_then(|v| v.as_str()),
        Some("a")
    );

    // The first peer's next read runs off the end of the stream.
    first.expect_eof(WAIT).await;

    // The name now routes to the second connection.
    drop(second);
}

#[tokio::test]
async fn superseded_name_routes_to_the_new_connection() {
    let broker = TestBroker::spawn_default().await;

    let mut stale = TestPeer::register(broker.addr(), "worker").await;
    let mut fresh = TestPeer::register(broker.addr(), "worker").await;
    stale.expect_eof(WAIT).await;

    let mut sender = TestPeer::register(broker.addr(), "sender").await;
    sender
        .send(
            &bus_protocol::Envelope::new("task")
                .with_sender("sender")
                .with_destination("worker")
                .with_request_id("t-1"),
        )
        .await;

    let delivered = fresh.expect_action("task", WAIT).await;
    assert_eq!(delivered.request_id.as_deref(), Some("t-1"));
}
