//! Public client API.

use crate::config::ClientConfig;
use crate::runtime::Shared;
use crate::state::{ClientStats, ConnectionState};
use bus_protocol::Envelope;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not connected to the bus")]
    NotConnected,
    #[error("outbound queue full")]
    QueueFull,
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("no registration confirmation within {0:?}")]
    RegistrationTimeout(Duration),
    #[error("connection lost")]
    ConnectionLost,
    #[error("timed out waiting for response to request {request_id}")]
    ResponseTimeout { request_id: String },
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// A service's handle on the bus.
///
/// Cheap to clone; clones share one connection, one callback table, and one
/// set of counters.  Handlers registered with [`register_callback`] run on
/// the dispatch task: they may block and may call [`send`], but they must not
/// manage the connection itself.
///
/// [`register_callback`]: BusClient::register_callback
/// [`send`]: BusClient::send
#[derive(Clone)]
pub struct BusClient {
    shared: Arc<Shared>,
}

impl BusClient {
    pub fn new(service_name: impl Into<String>, cfg: ClientConfig) -> Self {
        BusClient {
            shared: Arc::new(Shared::new(service_name.into(), cfg)),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.shared.service_name
    }

    /// Connect to the broker and register this service's name.  Returns once
    /// the broker has confirmed the registration, or with the first failure.
    ///
    /// After a later transport failure the runtime reconnects and
    /// re-registers by itself, up to the configured attempt budget.
    pub async fn connect(&self, timeout: Duration) -> Result<(), ClientError> {
        if self.shared.state() == ConnectionState::Registered {
            warn!(service = %self.shared.service_name, "already connected");
            return Ok(());
        }
        let _ = self.shared.client_running.send(true);
        self.shared.counters.reset_reconnect_attempts();
        self.shared.connect_once(timeout).await
    }

    /// Tear the connection down and stop all tasks.  Idempotent.  Pending
    /// responses fail with [`ClientError::ConnectionLost`]; registered
    /// callbacks survive for a later `connect`.
    pub async fn disconnect(&self) {
        let _ = self.shared.client_running.send(false);
        self.shared.set_state(ConnectionState::Disconnected);
        self.shared.teardown_conn();
        info!(service = %self.shared.service_name, "disconnected from bus");
    }

    /// Send `action` with `data` to the service registered as `destination`.
    ///
    /// With `wait_for_response`, blocks until the destination's reply arrives
    /// (matched by a fresh `request_id`) or `timeout` (default: the config's
    /// `response_timeout`) elapses.  Exactly one of three outcomes is
    /// observed: the response envelope, [`ClientError::ResponseTimeout`], or
    /// a transport failure.
    pub async fn send(
        &self,
        destination: &str,
        action: &str,
        data: Value,
        wait_for_response: bool,
        timeout: Option<Duration>,
    ) -> Result<Option<Envelope>, ClientError> {
        if self.shared.state() != ConnectionState::Registered {
            return Err(ClientError::NotConnected);
        }

        let request_id = Envelope::new_request_id();
        let envelope = Envelope::new(action)
            .with_sender(self.shared.service_name.clone())
            .with_destination(destination)
            .with_data(data)
            .with_request_id(request_id.clone());

        if !wait_for_response {
            self.shared.enqueue(envelope)?;
            return Ok(None);
        }

        let (slot_tx, slot_rx) = oneshot::channel();
        {
            let mut pending = self
                .shared
                .pending
                .lock()
                .expect("pending lock poisoned");
            let _ = pending.insert(request_id.clone(), slot_tx);
        }

        if let Err(e) = self.shared.enqueue(envelope) {
            let _ = self
                .shared
                .pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&request_id);
            return Err(e);
        }

        let wait = timeout.unwrap_or(self.shared.cfg.response_timeout);
        match tokio::time::timeout(wait, slot_rx).await {
            Ok(Ok(response)) => Ok(Some(response)),
            // Slot dropped by connection teardown.
            Ok(Err(_)) => Err(ClientError::ConnectionLost),
            Err(_) => {
                // Remove the slot; a response landing after this point is
                // discarded by the dispatch task.
                let _ = self
                    .shared
                    .pending
                    .lock()
                    .expect("pending lock poisoned")
                    .remove(&request_id);
                Err(ClientError::ResponseTimeout { request_id })
            }
        }
    }

    /// Fan `data` out to every other registered service.  The broker
    /// confirms with a `broadcast_sent` envelope, which the runtime logs and
    /// discards.
    pub fn broadcast(&self, data: Value) -> Result<(), ClientError> {
        if self.shared.state() != ConnectionState::Registered {
            return Err(ClientError::NotConnected);
        }
        let envelope = Envelope::new(bus_protocol::actions::BROADCAST)
            .with_sender(self.shared.service_name.clone())
            .with_data(data);
        self.shared.enqueue(envelope)
    }

    /// Install `handler` for `action`, replacing any prior handler.
    ///
    /// The handler receives the envelope's `data` and, when it returns
    /// `Some`, the runtime sends a `response` envelope back to the original
    /// sender carrying the request's `request_id`.
    pub fn register_callback(
        &self,
        action: impl Into<String>,
        handler: impl Fn(Value) -> Option<Value> + Send + Sync + 'static,
    ) {
        let action = action.into();
        let mut callbacks = self
            .shared
            .callbacks
            .lock()
            .expect("callbacks lock poisoned");
        let _ = callbacks.insert(action, Arc::new(handler));
    }

    /// Called after every successful registration (including re-registration
    /// after a reconnect).
    pub fn on_connect(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self
            .shared
            .hooks
            .on_connect
            .lock()
            .expect("hooks lock poisoned") = Some(Box::new(hook));
    }

    /// Called when the reconnect budget is exhausted and the runtime gives
    /// up; the host decides whether to `connect` again.
    pub fn on_disconnect(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self
            .shared
            .hooks
            .on_disconnect
            .lock()
            .expect("hooks lock poisoned") = Some(Box::new(hook));
    }

    /// Called on every transport error, before the reconnect attempt.
    pub fn on_error(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self
            .shared
            .hooks
            .on_error
            .lock()
            .expect("hooks lock poisoned") = Some(Box::new(hook));
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_registered(&self) -> bool {
        self.shared.state() == ConnectionState::Registered
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            service_name: self.shared.service_name.clone(),
            connection_state: self.shared.state(),
            messages_sent: self.shared.counters.messages_sent(),
            messages_received: self.shared.counters.messages_received(),
            errors: self.shared.counters.errors(),
            callbacks_registered: self
                .shared
                .callbacks
                .lock()
                .expect("callbacks lock poisoned")
                .len(),
            outgoing_queue_depth: self.shared.outgoing_depth(),
            pending_responses: self
                .shared
                .pending
                .lock()
                .expect("pending lock poisoned")
                .len(),
            reconnect_attempts: self.shared.counters.reconnect_attempts(),
            connected_at: self.shared.counters.connected_at(),
            last_heartbeat: self.shared.counters.last_heartbeat(),
        }
    }
}
