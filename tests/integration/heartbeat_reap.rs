//! Scenario: a peer that goes silent past the liveness threshold
//! (3 × heartbeat interval) is reaped on the next sweep, and the remaining
//! peers are told.  Intervals are shrunk from the production 30 s / 60 s to
//! keep the test fast.

use broker::BrokerConfig;
use bus_protocol::{Envelope, actions};
use bus_test_utils::{TestBroker, TestPeer};
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn silent_peer_is_reaped_and_announced() {
    let broker = TestBroker::spawn(BrokerConfig {
        heartbeat_interval: Duration::from_millis(150),
        reaper_interval: Duration::from_millis(200),
        ..BrokerConfig::default()
    })
    .await;

    // `c` registers and then never reads or writes again.
    let _silent = TestPeer::register(broker.addr(), "c").await;
    let mut observer = TestPeer::register(broker.addr(), "observer").await;

    // The observer keeps itself alive with pings while watching for the
    // reaper's announcement (its own reads do not count as liveness).
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let announced = loop {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for service_disconnected"
        );
        observer
            .send(
                &Envelope::new(actions::PING)
                    .with_sender("observer")
                    .with_data(json!({})),
            )
            .await;
        match observer.recv_timeout(Duration::from_millis(100)).await {
            Some(envelope) if envelope.action == actions::SERVICE_DISCONNECTED => break envelope,
            _ => {}
        }
    };

    assert_eq!(
        announced.extra.get("service_name").and_then(|v| v.as_str()),
        Some("c")
    );
    assert_eq!(
        announced.extra.get("reason").and_then(|v| v.as_str()),
        Some("inactive")
    );
}

#[tokio::test]
async fn active_peer_survives_the_reaper() {
    let broker = TestBroker::spawn(BrokerConfig {
        heartbeat_interval: Duration::from_millis(100),
        reaper_interval: Duration::from_millis(150),
        ..BrokerConfig::default()
    })
    .await;

    let mut peer = TestPeer::register(broker.addr(), "steady").await;

    // Ping through several reaper sweeps.
    for _ in 0..8 {
        peer.send(
            &Envelope::new(actions::PING)
                .with_sender("steady")
                .with_data(json!({})),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Drain whatever arrived (pong replies, broker heartbeats).
        while peer.recv_timeout(Duration::from_millis(10)).await.is_some() {}
    }

    // Still registered: a fresh discover lists it.
    peer.send(&Envelope::new(actions::DISCOVER).with_sender("steady"))
        .await;
    let response = peer
        .expect_action(actions::DISCOVER_RESPONSE, Duration::from_secs(1))
        .await;
    let services = response.extra.get("services").unwrap().as_array().unwrap();
    assert!(
        services
            .iter()
            .any(|s| s.get("name").and_then(|n| n.as_str()) == Some("steady"))
    );
}
