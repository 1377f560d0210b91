//! Broker counters, rendered into `pong.stats` and `heartbeat.server_stats`.

use crate::registry::Registry;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub struct BrokerStats {
    started_at: Instant,
    started_at_wall: chrono::DateTime<chrono::Utc>,
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    errors: AtomicU64,
    connections: AtomicU64,
}

impl BrokerStats {
    pub fn new() -> Self {
        BrokerStats {
            started_at: Instant::now(),
            started_at_wall: chrono::Utc::now(),
            messages_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            connections: AtomicU64::new(0),
        }
    }

    pub fn inc_received(&self) {
        let _ = self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sent(&self) {
        let _ = self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_errors(&self) {
        let _ = self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_connections(&self) {
        let _ = self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, registry: &Registry) -> Value {
        let queue_sizes: serde_json::Map<String, Value> = registry
            .queue_depths()
            .into_iter()
            .map(|(name, depth)| (name, json!(depth)))
            .collect();

        json!({
            "uptime_seconds": self.started_at.elapsed().as_secs(),
            "started_at": self.started_at_wall.to_rfc3339(),
            "connections": self.connections.load(Ordering::Relaxed),
            "active_services": registry.len(),
            "messages_received": self.messages_received.load(Ordering::Relaxed),
            "messages_sent": self.messages_sent.load(Ordering::Relaxed),
            "errors": self.errors.load(Ordering::Relaxed),
            "queue_sizes": queue_sizes,
            "timestamp": bus_protocol::now_timestamp(),
        })
    }
}

impl Default for BrokerStats {
    fn default() -> Self {
        BrokerStats::new()
    }
}
