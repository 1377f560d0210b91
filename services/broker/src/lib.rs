//! broker: the central message bus router.
//!
//! Accepts TCP connections from backend services, reads length-prefixed JSON
//! envelopes, and routes them by destination name.  Keeps the authoritative
//! name → connection registry, broadcasts lifecycle events
//! (`service_connected` / `service_disconnected`), sends periodic heartbeats,
//! and reaps peers that go silent.
//!
//! # Usage
//! ```rust,no_run
//! # async fn example() -> Result<(), broker::RunError> {
//! use broker::{Broker, BrokerConfig};
//! let broker = Broker::bind(BrokerConfig {
//!     port: 0, // ephemeral
//!     ..BrokerConfig::default()
//! })
//! .await?;
//! let handle = broker.handle();
//! tokio::spawn(broker.run());
//! // ... later:
//! handle.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod connection;
mod dispatch;
pub mod registry;
pub mod stats;

use bus_protocol::{Envelope, FrameError, actions, read_envelope};
use connection::Connection;
use registry::Registry;
use serde_json::json;
use stats::BrokerStats;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream, tcp::OwnedReadHalf};
use tokio::sync::watch;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Broker tuning knobs.  Defaults match the deployed wire contract; tests
/// shrink the intervals.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Maximum frame payload size in bytes.
    pub max_frame_len: usize,
    /// Cadence of broker-initiated `heartbeat` envelopes.
    pub heartbeat_interval: Duration,
    /// Cadence of the liveness/queue-compaction sweep.  A peer silent for
    /// longer than `3 × heartbeat_interval` is reaped on the next sweep.
    pub reaper_interval: Duration,
    /// Outbound queue depth that triggers the drop-oldest-half policy.
    pub queue_high_water: usize,
    /// Maximum envelopes a writer drains per cycle.
    pub drain_max: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            host: "0.0.0.0".to_owned(),
            port: 5000,
            max_frame_len: bus_protocol::DEFAULT_MAX_FRAME_LEN,
            heartbeat_interval: Duration::from_secs(30),
            reaper_interval: Duration::from_secs(60),
            queue_high_water: 1000,
            drain_max: 100,
        }
    }
}

impl BrokerConfig {
    /// Defaults overridden by `BUS_HOST` / `BUS_PORT`.
    pub fn from_env() -> Self {
        let mut cfg = BrokerConfig::default();
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

/// Errors that keep the broker from coming up.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// The configured host did not resolve to any address.
    #[error("could not resolve {0}")]
    Resolve(String),
    /// Failed to bind the listener (e.g. port already in use).
    #[error("bind failed: {0}")]
    Bind(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Shared broker state
// ---------------------------------------------------------------------------

pub(crate) struct Shared {
    pub(crate) cfg: BrokerConfig,
    pub(crate) registry: Registry,
    pub(crate) stats: BrokerStats,
    shutdown_tx: watch::Sender<bool>,
    next_conn_id: AtomicU64,
    /// Every live connection, registered or not, for shutdown cleanup.
    conns: Mutex<HashMap<u64, Weak<Connection>>>,
}

impl Shared {
    fn new(cfg: BrokerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Shared {
            cfg,
            registry: Registry::new(),
            stats: BrokerStats::new(),
            shutdown_tx,
            next_conn_id: AtomicU64::new(1),
            conns: Mutex::new(HashMap::new()),
        }
    }

    fn track(&self, conn: &Arc<Connection>) {
        let mut conns = self.conns.lock().expect("conns lock poisoned");
        let _ = conns.insert(conn.id(), Arc::downgrade(conn));
    }

    /// Write directly on the peer's socket.  Returns false (after closing the
    /// connection) if the write failed.
    pub(crate) async fn send_direct(&self, conn: &Arc<Connection>, envelope: &Envelope) -> bool {
        match conn.write_direct(envelope).await {
            Ok(()) => {
                self.stats.inc_sent();
                true
            }
            Err(e) => {
                debug!(conn = conn.id(), error = %e, "direct write failed");
                self.reap(conn, "connection_error");
                false
            }
        }
    }

    /// Queue an envelope to every registered peer except `exclude`.  Returns
    /// the recipient count.
    pub(crate) fn broadcast_enqueue(&self, envelope: Envelope, exclude: Option<u64>) -> usize {
        let targets = self.registry.registered_conns(exclude);
        for conn in &targets {
            let _ = conn.enqueue(envelope.clone(), self.cfg.queue_high_water);
        }
        targets.len()
    }

    /// Unbind, close, and announce.  Idempotent: only the call that actually
    /// removes the binding emits the `service_disconnected` broadcast.
    pub(crate) fn reap(&self, conn: &Arc<Connection>, reason: &str) {
        conn.close();
        {
            let mut conns = self.conns.lock().expect("conns lock poisoned");
            let _ = conns.remove(&conn.id());
        }
        if let Some(name) = self.registry.unbind(conn.id()) {
            info!(service = %name, reason, "service disconnected");
            let notice = Envelope::new(actions::SERVICE_DISCONNECTED)
                .with_field("service_name", json!(name))
                .with_field("reason", json!(reason));
            let _ = self.broadcast_enqueue(notice, Some(conn.id()));
        }
    }

    fn live_conns(&self) -> Vec<Arc<Connection>> {
        let conns = self.conns.lock().expect("conns lock poisoned");
        conns.values().filter_map(Weak::upgrade).collect()
    }
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

pub struct Broker {
    listener: TcpListener,
    shared: Arc<Shared>,
}

/// Cheap clone-free handle for shutting down a running broker.
pub struct BrokerHandle {
    shared: Arc<Shared>,
    addr: SocketAddr,
}

impl BrokerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal the accept loop, timers, and every connection task to exit.
    pub fn shutdown(&self) {
        let _ = self.shared.shutdown_tx.send(true);
    }
}

impl Broker {
    pub async fn bind(cfg: BrokerConfig) -> Result<Self, RunError> {
        let addr = tokio::net::lookup_host((cfg.host.as_str(), cfg.port))
            .await?
            .next()
            .ok_or_else(|| RunError::Resolve(cfg.host.clone()))?;
        let socket = if addr.is_ipv4() {
            tokio::net::TcpSocket::new_v4()?
        } else {
            tokio::net::TcpSocket::new_v6()?
        };
        // Restarts must be able to rebind past TIME_WAIT remnants.
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(100)?;
        info!(addr = %listener.local_addr()?, "broker bound");
        Ok(Broker {
            listener,
            shared: Arc::new(Shared::new(cfg)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener
            .local_addr()
            .expect("local_addr always succeeds after bind")
    }

    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle {
            shared: self.shared.clone(),
            addr: self.local_addr(),
        }
    }

    /// Run the accept loop and timers until shutdown is signalled.
    pub async fn run(self) {
        let shared = self.shared;
        let mut shutdown = shared.shutdown_tx.subscribe();

        tokio::spawn(heartbeat_task(shared.clone()));
        tokio::spawn(reaper_task(shared.clone()));

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => accept_connection(&shared, stream, addr),
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }

        info!("broker shutting down");
        drain_and_close(&shared).await;
    }
}

fn accept_connection(shared: &Arc<Shared>, stream: TcpStream, addr: SocketAddr) {
    shared.stats.inc_connections();
    let id = shared.next_conn_id.fetch_add(1, Ordering::Relaxed);
    let (read_half, write_half) = stream.into_split();
    let conn = Arc::new(Connection::new(
        id,
        addr,
        Box::new(write_half),
        shared.cfg.max_frame_len,
    ));
    shared.track(&conn);
    info!(conn = id, %addr, "connection accepted");

    tokio::spawn(writer_task(shared.clone(), conn.clone()));

    let shared = shared.clone();
    tokio::spawn(async move {
        let welcome = Envelope::new(actions::WELCOME)
            .with_field("message", json!("connected to medibus broker"))
            .with_field("server_version", json!(env!("CARGO_PKG_VERSION")));
        if shared.send_direct(&conn, &welcome).await {
            connection_task(shared, conn, read_half).await;
        }
    });
}

/// Per-connection read loop.  Every exit path funnels through `reap` so the
/// registry, the lifecycle broadcast, and the socket close stay consistent.
async fn connection_task(shared: Arc<Shared>, conn: Arc<Connection>, mut reader: OwnedReadHalf) {
    let mut closed = conn.closed();
    let reason = loop {
        if conn.is_closed() {
            break "connection_closed";
        }
        tokio::select! {
            biased;
            _ = closed.changed() => {
                if *closed.borrow() {
                    break "connection_closed";
                }
            }
            result = read_envelope(&mut reader, shared.cfg.max_frame_len) => match result {
                Ok(envelope) => dispatch::handle_envelope(&shared, &conn, envelope).await,
                Err(FrameError::Closed) => {
                    debug!(conn = conn.id(), "peer closed connection");
                    break "connection_closed";
                }
                Err(e @ (FrameError::Oversize { .. } | FrameError::Json(_) | FrameError::UnexpectedEof)) => {
                    warn!(conn = conn.id(), error = %e, "protocol error, closing connection");
                    shared.stats.inc_errors();
                    break "protocol_error";
                }
                Err(e) => {
                    debug!(conn = conn.id(), error = %e, "read error");
                    break "connection_error";
                }
            }
        }
    };
    shared.reap(&conn, reason);
}

/// Per-connection queue drain loop.
async fn writer_task(shared: Arc<Shared>, conn: Arc<Connection>) {
    loop {
        if conn.is_closed() {
            break;
        }
        conn.wait_for_work().await;
        loop {
            if conn.is_closed() {
                return;
            }
            let batch = conn.drain(shared.cfg.drain_max);
            if batch.is_empty() {
                break;
            }
            for envelope in batch {
                if let Err(e) = conn.write_direct(&envelope).await {
                    debug!(conn = conn.id(), error = %e, "queued write failed");
                    shared.reap(&conn, "connection_error");
                    return;
                }
                shared.stats.inc_sent();
            }
        }
    }
}

async fn heartbeat_task(shared: Arc<Shared>) {
    let mut shutdown = shared.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(shared.cfg.heartbeat_interval) => {
                let heartbeat = Envelope::new(actions::HEARTBEAT)
                    .with_field("server_stats", shared.stats.snapshot(&shared.registry));
                let peers = shared.broadcast_enqueue(heartbeat, None);
                debug!(peers, "heartbeat tick");
            }
        }
    }
}

async fn reaper_task(shared: Arc<Shared>) {
    let mut shutdown = shared.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(shared.cfg.reaper_interval) => {
                let liveness = shared.cfg.heartbeat_interval * 3;
                if let Some(deadline) = Instant::now().checked_sub(liveness) {
                    for conn in shared.registry.reap_candidates(deadline) {
                        warn!(conn = conn.id(), addr = %conn.addr(), "reaping inactive service");
                        shared.reap(&conn, "inactive");
                    }
                }
                for conn in shared.registry.registered_conns(None) {
                    let dropped = conn.compact_queue(shared.cfg.queue_high_water);
                    if dropped > 0 {
                        warn!(conn = conn.id(), dropped, "compacted oversized queue");
                    }
                }
                info!(stats = %shared.stats.snapshot(&shared.registry), "broker stats");
            }
        }
    }
}

/// Best-effort flush of queued envelopes, then close every connection.
async fn drain_and_close(shared: &Arc<Shared>) {
    let conns = shared.live_conns();
    tokio::time::sleep(Duration::from_millis(100)).await;
    for conn in conns {
        conn.close();
    }
}
