//! Name → connection registry.
//!
//! All mutation happens under one lock.  A name maps to at most one live
//! connection; a second `register` for the same name supersedes the prior
//! connection, and the caller is handed the old connection to close *before*
//! re-binding.  The registry entry owns the outbound queue (it holds the
//! connection, and unbinding drops the broker's last strong reference).

use crate::connection::Connection;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Outcome of a bind attempt.
pub enum BindOutcome {
    /// The name is bound to this connection (fresh, or refreshed).
    Bound,
    /// The name belongs to another live connection.  Close it, then bind
    /// again.
    Superseded(Arc<Connection>),
    /// This connection is already registered under a different name.
    Conflict { existing: String },
}

struct Entry {
    conn: Arc<Connection>,
    registered_at: DateTime<Utc>,
    /// Monotonic liveness stamp, advanced on any inbound frame.
    last_seen: Instant,
    /// Wall-clock mirror of `last_seen` for the discover snapshot.
    last_seen_wall: DateTime<Utc>,
    message_count: u64,
}

impl Entry {
    fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.last_seen_wall = Utc::now();
    }
}

/// One registered service as reported by `discover_response`.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    pub name: String,
    pub address: String,
    pub registered_at: String,
    pub last_seen: String,
    pub message_count: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    by_conn: HashMap<u64, String>,
}

#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn bind(&self, name: &str, conn: &Arc<Connection>) -> BindOutcome {
        let mut inner = self.inner.lock().expect("registry lock poisoned");

        if let Some(existing) = inner.by_conn.get(&conn.id()) {
            if existing != name {
                return BindOutcome::Conflict {
                    existing: existing.clone(),
                };
            }
        }

        match inner.entries.get_mut(name) {
            Some(entry) if entry.conn.id() == conn.id() => {
                entry.touch();
                BindOutcome::Bound
            }
            Some(entry) => BindOutcome::Superseded(entry.conn.clone()),
            None => {
                let now = Utc::now();
                inner.entries.insert(
                    name.to_owned(),
                    Entry {
                        conn: conn.clone(),
                        registered_at: now,
                        last_seen: Instant::now(),
                        last_seen_wall: now,
                        message_count: 0,
                    },
                );
                inner.by_conn.insert(conn.id(), name.to_owned());
                BindOutcome::Bound
            }
        }
    }

    /// Remove whichever name maps to this connection.
    pub fn unbind(&self, conn_id: u64) -> Option<String> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let name = inner.by_conn.remove(&conn_id)?;
        let _ = inner.entries.remove(&name);
        Some(name)
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Connection>> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.entries.get(name).map(|e| e.conn.clone())
    }

    pub fn name_of(&self, conn_id: u64) -> Option<String> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.by_conn.get(&conn_id).cloned()
    }

    pub fn is_registered(&self, conn_id: u64) -> bool {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.by_conn.contains_key(&conn_id)
    }

    /// Advance `last_seen` for the service bound to this connection.
    pub fn touch_conn(&self, conn_id: u64) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        if let Some(name) = inner.by_conn.get(&conn_id).cloned() {
            if let Some(entry) = inner.entries.get_mut(&name) {
                entry.touch();
            }
        }
    }

    /// Count a routed message against a service and refresh its liveness.
    pub fn record_routed(&self, name: &str) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        if let Some(entry) = inner.entries.get_mut(name) {
            entry.message_count += 1;
            entry.touch();
        }
    }

    /// Registered service names, sorted.
    pub fn names(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        let mut names: Vec<String> = inner.entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot for `discover_response`, sorted by name.
    pub fn snapshot(&self) -> Vec<ServiceSnapshot> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        let mut services: Vec<ServiceSnapshot> = inner
            .entries
            .iter()
            .map(|(name, entry)| ServiceSnapshot {
                name: name.clone(),
                address: entry.conn.addr().to_string(),
                registered_at: entry.registered_at.to_rfc3339(),
                last_seen: entry.last_seen_wall.to_rfc3339(),
                message_count: entry.message_count,
            })
            .collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        services
    }

    /// Connections of every registered service, minus an optional exclusion.
    pub fn registered_conns(&self, exclude_conn: Option<u64>) -> Vec<Arc<Connection>> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner
            .entries
            .values()
            .filter(|e| Some(e.conn.id()) != exclude_conn)
            .map(|e| e.conn.clone())
            .collect()
    }

    /// Connections whose `last_seen` predates `deadline`.
    pub fn reap_candidates(&self, deadline: Instant) -> Vec<Arc<Connection>> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner
            .entries
            .values()
            .filter(|e| e.last_seen < deadline)
            .map(|e| e.conn.clone())
            .collect()
    }

    /// Queue depth per registered service, for the stats snapshot.
    pub fn queue_depths(&self) -> Vec<(String, usize)> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        let mut depths: Vec<(String, usize)> = inner
            .entries
            .iter()
            .map(|(name, e)| (name.clone(), e.conn.queue_len()))
            .collect();
        depths.sort_by(|a, b| a.0.cmp(&b.0));
        depths
    }

    #[cfg(test)]
    fn last_seen_of(&self, name: &str) -> Option<Instant> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.entries.get(name).map(|e| e.last_seen)
    }
}
