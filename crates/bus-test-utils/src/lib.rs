// bus-test-utils: Shared test utilities for the message bus suite.
//
// Provides an in-process broker spawner and a raw framed TCP peer that speaks
// the wire protocol directly, without the client runtime, for protocol-level
// assertions.

pub mod test_peer;

pub use test_peer::TestPeer;

use broker::{Broker, BrokerConfig, BrokerHandle};
use std::net::SocketAddr;
use std::time::Duration;

/// A running in-process broker on an ephemeral port.
///
/// Shut down (or simply dropped at the end of the test — the tokio test
/// runtime tears the accept loop down with the process).
pub struct TestBroker {
    handle: BrokerHandle,
}

impl TestBroker {
    /// Bind on `127.0.0.1:0` with the given config (the host/port fields are
    /// overridden) and spawn the run loop.
    pub async fn spawn(cfg: BrokerConfig) -> TestBroker {
        let cfg = BrokerConfig {
            host: "127.0.0.1".to_owned(),
            port: 0,
            ..cfg
        };
        let broker = Broker::bind(cfg).await.expect("bind test broker");
        let handle = broker.handle();
        tokio::spawn(broker.run());
        TestBroker { handle }
    }

    /// Spawn with default intervals (heartbeat/reaper effectively inert for
    /// short tests).
    pub async fn spawn_default() -> TestBroker {
        TestBroker::spawn(BrokerConfig::default()).await
    }

    /// Re-bind a broker on a *specific* port (restart tests).
    pub async fn spawn_on(cfg: BrokerConfig, addr: SocketAddr) -> TestBroker {
        let cfg = BrokerConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            ..cfg
        };
        let broker = Broker::bind(cfg).await.expect("re-bind test broker");
        let handle = broker.handle();
        tokio::spawn(broker.run());
        TestBroker { handle }
    }

    pub fn addr(&self) -> SocketAddr {
        self.handle.addr()
    }

    pub fn shutdown(&self) {
        self.handle.shutdown();
    }
}

/// Poll `predicate` every 10 ms until it returns true or `deadline` elapses.
pub async fn wait_until<F>(deadline: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}
