//! Connection state machine states and client statistics.

use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Where the runtime is in its connection lifecycle.
///
/// Only `Registered` permits `send`; every earlier state queues nothing and
/// fails fast with a not-connected error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Registered,
    Error,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Registered => "registered",
            ConnectionState::Error => "error",
        }
    }
}

/// Point-in-time counters, as returned by `BusClient::stats`.
#[derive(Debug, Clone)]
pub struct ClientStats {
    pub service_name: String,
    pub connection_state: ConnectionState,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub errors: u64,
    pub callbacks_registered: usize,
    pub outgoing_queue_depth: usize,
    pub pending_responses: usize,
    pub reconnect_attempts: u32,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub(crate) struct Counters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    errors: AtomicU64,
    reconnect_attempts: AtomicU32,
    connected_at: Mutex<Option<DateTime<Utc>>>,
    last_heartbeat: Mutex<Option<DateTime<Utc>>>,
}

impl Counters {
    pub(crate) fn inc_sent(&self) {
        let _ = self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_received(&self) {
        let _ = self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_errors(&self) {
        let _ = self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub(crate) fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub(crate) fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Bump and return the attempt number (1-based).
    pub(crate) fn next_reconnect_attempt(&self) -> u32 {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    pub(crate) fn reset_reconnect_attempts(&self) {
        self.reconnect_attempts.store(0, Ordering::Relaxed);
    }

    pub(crate) fn mark_connected(&self) {
        *self.connected_at.lock().expect("counters lock poisoned") = Some(Utc::now());
    }

    pub(crate) fn mark_heartbeat(&self) {
        *self.last_heartbeat.lock().expect("counters lock poisoned") = Some(Utc::now());
    }

    pub(crate) fn connected_at(&self) -> Option<DateTime<Utc>> {
        *self.connected_at.lock().expect("counters lock poisoned")
    }

    pub(crate) fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        *self.last_heartbeat.lock().expect("counters lock poisoned")
    }
}
