//! The broker is stateless across restarts: peers must reconnect and
//! re-register on their own.  This drives the client's error → backoff →
//! re-register path against a real broker bounce on a fixed port.

use broker::BrokerConfig;
use bus_client::{BusClient, ClientConfig, ConnectionState};
use bus_test_utils::{TestBroker, wait_until};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn fast_reconnect_config(addr: std::net::SocketAddr) -> ClientConfig {
    ClientConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        reconnect_delay: Duration::from_millis(100),
        connect_timeout: Duration::from_millis(500),
        ..ClientConfig::default()
    }
}

#[tokio::test]
async fn client_reregisters_after_broker_restart() {
    let broker = TestBroker::spawn_default().await;
    let addr = broker.addr();

    let registrations = Arc::new(AtomicUsize::new(0));
    let echo = BusClient::new("echo", fast_reconnect_config(addr));
    {
        let registrations = registrations.clone();
        echo.on_connect(move || {
            let _ = registrations.fetch_add(1, Ordering::SeqCst);
        });
    }
    echo.register_callback("echo", |data| Some(data));
    echo.connect(Duration::from_secs(2)).await.unwrap();
    assert_eq!(registrations.load(Ordering::SeqCst), 1);

    // Bounce the broker on the same port.
    broker.shutdown();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let broker = TestBroker::spawn_on(BrokerConfig::default(), addr).await;

    // The runtime notices the dead connection, backs off, reconnects, and
    // re-registers under the same name without host involvement.
    let echo_watch = echo.clone();
    assert!(
        wait_until(Duration::from_secs(10), move || echo_watch.is_registered()).await
    );
    assert_eq!(registrations.load(Ordering::SeqCst), 2);

    // The re-registered service answers requests again.
    let caller = BusClient::new("caller", fast_reconnect_config(addr));
    caller.connect(Duration::from_secs(2)).await.unwrap();
    let reply = caller
        .send("echo", "echo", json!({"alive": true}), true, Some(Duration::from_secs(2)))
        .await
        .unwrap()
        .expect("echo response after restart");
    assert_eq!(reply.data, Some(json!({"alive": true})));

    drop(broker);
}

#[tokio::test]
async fn pending_requests_fail_when_the_connection_dies() {
    let broker = TestBroker::spawn_default().await;
    let addr = broker.addr();

    // A destination that swallows requests, so the caller is left waiting on
    // the correlation slot when the broker goes away.
    let sink = BusClient::new("sink", fast_reconnect_config(addr));
    sink.register_callback("slow", |_| None);
    sink.connect(Duration::from_secs(2)).await.unwrap();

    let caller = BusClient::new("caller", fast_reconnect_config(addr));
    caller.connect(Duration::from_secs(2)).await.unwrap();

    let in_flight = {
        let caller = caller.clone();
        tokio::spawn(async move {
            caller
                .send("sink", "slow", json!({}), true, Some(Duration::from_secs(10)))
                .await
        })
    };
    // Let the request reach the wire before the bounce.
    tokio::time::sleep(Duration::from_millis(200)).await;
    broker.shutdown();

    let result = in_flight.await.unwrap();
    // Connection-lost beats the 10 s response timeout: slots are failed
    // eagerly on teardown, requests are never replayed.
    assert!(matches!(result, Err(bus_client::ClientError::ConnectionLost)));
}

#[tokio::test]
async fn reconnect_budget_exhaustion_goes_disconnected() {
    let broker = TestBroker::spawn_default().await;
    let addr = broker.addr();

    let gave_up = Arc::new(AtomicUsize::new(0));
    let client = BusClient::new(
        "auth",
        ClientConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            max_reconnect_attempts: 2,
            reconnect_delay: Duration::from_millis(50),
            connect_timeout: Duration::from_millis(200),
            ..ClientConfig::default()
        },
    );
    {
        let gave_up = gave_up.clone();
        client.on_disconnect(move || {
            let _ = gave_up.fetch_add(1, Ordering::SeqCst);
        });
    }
    client.connect(Duration::from_secs(2)).await.unwrap();

    // Kill the broker for good; the two attempts burn out quickly.
    broker.shutdown();

    let gave_up_watch = gave_up.clone();
    assert!(
        wait_until(Duration::from_secs(5), move || gave_up_watch
            .load(Ordering::SeqCst)
            == 1)
        .await
    );
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(client.stats().reconnect_attempts >= 2);
}
