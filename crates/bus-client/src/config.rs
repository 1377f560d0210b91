//! Client tuning knobs.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Maximum frame payload size in bytes.
    pub max_frame_len: usize,
    /// Cadence of client-initiated `ping` envelopes.
    pub heartbeat_interval: Duration,
    /// Default wait for `send(..., wait_for_response = true)`.
    pub response_timeout: Duration,
    /// Wait for the broker's `registered` confirmation.
    pub register_timeout: Duration,
    /// Wait for the receive task to come up before sending `register`.
    pub ready_timeout: Duration,
    /// TCP connect timeout used by the reconnect loop.
    pub connect_timeout: Duration,
    /// Reconnect attempt budget before giving up.
    pub max_reconnect_attempts: u32,
    /// Base reconnect delay; the actual delay is `base × min(attempt, 3)`.
    pub reconnect_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: "localhost".to_owned(),
            port: 5000,
            max_frame_len: bus_protocol::DEFAULT_MAX_FRAME_LEN,
            heartbeat_interval: Duration::from_secs(30),
            response_timeout: Duration::from_secs(30),
            register_timeout: Duration::from_secs(15),
            ready_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 10,
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `BUS_HOST` / `BUS_PORT`.
    pub fn from_env() -> Self {
        let mut cfg = ClientConfig::default();
        if let Ok(host) = std::env::var("BUS_HOST") {
            cfg.host = host;
        }
        if let Some(port) = std::env::var("BUS_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
        {
            cfg.port = port;
        }
        cfg
    }
}
