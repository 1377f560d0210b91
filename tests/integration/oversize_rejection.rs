//! Scenario: a frame whose header exceeds the payload cap.  The stream is no
//! longer frame-aligned after the bad header, so the broker closes the
//! offending connection; other peers observe the disconnect.

use broker::BrokerConfig;
use bus_test_utils::{TestBroker, TestPeer};
use bus_protocol::actions;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

fn small_frame_broker_config() -> BrokerConfig {
    BrokerConfig {
        max_frame_len: 1024,
        ..BrokerConfig::default()
    }
}

#[tokio::test]
async fn oversize_header_reaps_the_sender() {
    let broker = TestBroker::spawn(small_frame_broker_config()).await;

    let mut offender = TestPeer::register(broker.addr(), "offender").await;
    let mut observer = TestPeer::register(broker.addr(), "observer").await;

    // Header claims 2 KiB against the 1 KiB cap.
    offender.send_raw(&2048u32.to_be_bytes()).await;

    let announced = observer
        .expect_action(actions::SERVICE_DISCONNECTED, WAIT)
        .await;
    assert_eq!(
        announced.extra.get("service_name").and_then(|v| v.as_str()),
        Some("offender")
    );

    offender.expect_eof(WAIT).await;
}

#[tokio::test]
async fn within_limit_frames_still_flow_on_other_connections() {
    let broker = TestBroker::spawn(small_frame_broker_config()).await;

    let mut offender = TestPeer::register(broker.addr(), "offender").await;
    let mut survivor = TestPeer::register(broker.addr(), "survivor").await;

    offender.send_raw(&(1024u32 * 1024).to_be_bytes()).await;
    offender.expect_eof(WAIT).await;

    // The survivor's connection is unaffected.
    survivor
        .send(
            &bus_protocol::Envelope::new(actions::PING)
                .with_sender("survivor")
                .with_data(serde_json::json!({})),
        )
        .await;
    let pong = survivor.expect_action(actions::PONG, WAIT).await;
    assert!(pong.extra.get("server_time").is_some());
}
