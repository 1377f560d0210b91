//! The JSON envelope exchanged on the bus.
//!
//! Recognised fields are typed; everything else is captured in `extra` so
//! unknown fields survive a broker forward byte-for-byte (value-for-value).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Well-known action names
// ---------------------------------------------------------------------------

/// Frozen control-plane action names.
///
/// Any envelope carrying a `destination` and an action outside this set is
/// application traffic and is forwarded verbatim by the broker.
pub mod actions {
    pub const WELCOME: &str = "welcome";
    pub const REGISTER: &str = "register";
    pub const REGISTERED: &str = "registered";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const DISCOVER: &str = "discover";
    pub const DISCOVER_RESPONSE: &str = "discover_response";
    pub const BROADCAST: &str = "broadcast";
    pub const BROADCAST_SENT: &str = "broadcast_sent";
    pub const ROUTED: &str = "routed";
    pub const SERVICE_CONNECTED: &str = "service_connected";
    pub const SERVICE_DISCONNECTED: &str = "service_disconnected";
    pub const RESPONSE: &str = "response";
    pub const ERROR: &str = "error";

    /// Control envelopes are retained when an outbound queue is compacted;
    /// application envelopes are dropped first.
    pub fn is_control(action: &str) -> bool {
        matches!(
            action,
            WELCOME
                | REGISTERED
                | PONG
                | HEARTBEAT
                | DISCOVER_RESPONSE
                | BROADCAST_SENT
                | ROUTED
                | SERVICE_CONNECTED
                | SERVICE_DISCONNECTED
                | ERROR
        )
    }
}

// ---------------------------------------------------------------------------
// Routing trace
// ---------------------------------------------------------------------------

/// Broker-added routing trace (`_routed`).
///
/// `hop_count` is incremented on every forward.  The topology is single-hop
/// today, so nothing interprets the value; it is carried for forward
/// compatibility with broker federation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RoutedTrace {
    #[serde(default)]
    pub hop_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Originating peer endpoint, for log correlation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_addr: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One JSON object on the wire.
///
/// `action` is the only required field.  `sender` is required on
/// client-to-broker traffic; the broker validates it where it matters
/// (registration, routing) rather than at parse time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Informational ISO-8601 wall-clock stamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(
        rename = "_routed",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub routed: Option<RoutedTrace>,
    /// Unknown fields, preserved when forwarding.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    /// A bare envelope with only `action` and a fresh timestamp.
    pub fn new(action: impl Into<String>) -> Self {
        Envelope {
            action: action.into(),
            sender: None,
            destination: None,
            data: None,
            request_id: None,
            timestamp: Some(now_timestamp()),
            routed: None,
            extra: Map::new(),
        }
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Insert a top-level field outside the recognised set.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        let _ = self.extra.insert(key.into(), value);
        self
    }

    /// Fresh v4 correlation token.
    pub fn new_request_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Current wall-clock time as an RFC 3339 string, the envelope `timestamp`
/// format.
pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}
