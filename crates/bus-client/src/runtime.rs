//! The peer runtime: connection bring-up and the four cooperating tasks.
//!
//! One physical connection is one *generation*.  Each generation owns an
//! outbound channel, a shutdown flag, and its set of spawned tasks; a
//! transport error tears the generation down and schedules a reconnect, and a
//! stale generation reporting an error after supersession is ignored.

use crate::client::ClientError;
use crate::config::ClientConfig;
use crate::state::{ConnectionState, Counters};
use bus_protocol::{Envelope, FrameError, actions, now_timestamp, read_envelope, write_envelope};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub(crate) type Handler = Arc<dyn Fn(Value) -> Option<Value> + Send + Sync>;
type LifecycleHook = Box<dyn Fn() + Send + Sync>;
type ErrorHook = Box<dyn Fn(&str) + Send + Sync>;

const OUTGOING_CAPACITY: usize = 1000;

#[derive(Default)]
pub(crate) struct Hooks {
    pub(crate) on_connect: Mutex<Option<LifecycleHook>>,
    pub(crate) on_disconnect: Mutex<Option<LifecycleHook>>,
    pub(crate) on_error: Mutex<Option<ErrorHook>>,
}

/// Handle on the current connection generation.
pub(crate) struct ConnHandle {
    generation: u64,
    outgoing_tx: mpsc::Sender<Envelope>,
    conn_running: watch::Sender<bool>,
}

pub(crate) struct Shared {
    pub(crate) service_name: String,
    pub(crate) cfg: ClientConfig,
    pub(crate) state: Mutex<ConnectionState>,
    pub(crate) callbacks: Mutex<HashMap<String, Handler>>,
    pub(crate) pending: Mutex<HashMap<String, oneshot::Sender<Envelope>>>,
    registered_slot: Mutex<Option<oneshot::Sender<Envelope>>>,
    conn: Mutex<Option<ConnHandle>>,
    pub(crate) counters: Counters,
    pub(crate) hooks: Hooks,
    /// False once `disconnect` is called; gates reconnect scheduling.
    pub(crate) client_running: watch::Sender<bool>,
    reconnecting: AtomicBool,
    generation: AtomicU64,
}

impl Shared {
    pub(crate) fn new(service_name: String, cfg: ClientConfig) -> Self {
        let (client_running, _) = watch::channel(false);
        Shared {
            service_name,
            cfg,
            state: Mutex::new(ConnectionState::Disconnected),
            callbacks: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            registered_slot: Mutex::new(None),
            conn: Mutex::new(None),
            counters: Counters::default(),
            hooks: Hooks::default(),
            client_running,
            reconnecting: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub(crate) fn set_state(&self, next: ConnectionState) {
        *self.state.lock().expect("state lock poisoned") = next;
    }

    pub(crate) fn outgoing_depth(&self) -> usize {
        let conn = self.conn.lock().expect("conn lock poisoned");
        conn.as_ref()
            .map_or(0, |h| OUTGOING_CAPACITY - h.outgoing_tx.capacity())
    }

    /// Queue an envelope on the current generation's outbound channel.
    pub(crate) fn enqueue(&self, envelope: Envelope) -> Result<(), ClientError> {
        let tx = {
            let conn = self.conn.lock().expect("conn lock poisoned");
            conn.as_ref().map(|h| h.outgoing_tx.clone())
        };
        let Some(tx) = tx else {
            return Err(ClientError::NotConnected);
        };
        tx.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ClientError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ClientError::NotConnected,
        })
    }

    // -----------------------------------------------------------------------
    // Connection bring-up
    // -----------------------------------------------------------------------

    /// Dial the broker, start the generation's tasks, and complete the
    /// register handshake.  The `register` envelope is only sent after the
    /// receive task signals readiness, so the broker's synchronous
    /// `registered` reply cannot arrive before anyone is reading.
    pub(crate) async fn connect_once(self: &Arc<Self>, connect_timeout: Duration) -> Result<(), ClientError> {
        self.set_state(ConnectionState::Connecting);
        info!(
            service = %self.service_name,
            host = %self.cfg.host,
            port = self.cfg.port,
            "connecting to bus"
        );

        let stream = match timeout(
            connect_timeout,
            TcpStream::connect((self.cfg.host.as_str(), self.cfg.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.set_state(ConnectionState::Error);
                return Err(ClientError::Io(e));
            }
            Err(_) => {
                self.set_state(ConnectionState::Error);
                return Err(ClientError::ConnectTimeout(connect_timeout));
            }
        };
        self.set_state(ConnectionState::Connected);

        let (reader, writer) = stream.into_split();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_CAPACITY);
        let (incoming_tx, incoming_rx) = mpsc::channel(OUTGOING_CAPACITY);
        let (conn_running, _) = watch::channel(true);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (registered_tx, registered_rx) = oneshot::channel();

        *self.registered_slot.lock().expect("slot lock poisoned") = Some(registered_tx);
        {
            let mut conn = self.conn.lock().expect("conn lock poisoned");
            if let Some(old) = conn.take() {
                let _ = old.conn_running.send(false);
            }
            *conn = Some(ConnHandle {
                generation,
                outgoing_tx: outgoing_tx.clone(),
                conn_running: conn_running.clone(),
            });
        }

        tokio::spawn(receive_task(
            self.clone(),
            generation,
            reader,
            ready_tx,
            incoming_tx,
            conn_running.subscribe(),
        ));
        tokio::spawn(send_task(
            self.clone(),
            generation,
            writer,
            outgoing_rx,
            conn_running.subscribe(),
        ));
        tokio::spawn(dispatch_task(
            self.clone(),
            incoming_rx,
            conn_running.subscribe(),
        ));
        tokio::spawn(heartbeat_task(self.clone(), conn_running.subscribe()));

        // Startup-race guard: wait for the receive loop's first iteration.
        if timeout(self.cfg.ready_timeout, ready_rx).await.is_err() {
            warn!(service = %self.service_name, "receive task did not come up in time");
            self.set_state(ConnectionState::Error);
            self.teardown_conn();
            return Err(ClientError::ConnectTimeout(self.cfg.ready_timeout));
        }

        let register = Envelope::new(actions::REGISTER)
            .with_sender(self.service_name.clone())
            .with_data(json!({ "service_name": self.service_name }));
        if let Err(e) = outgoing_tx.send(register).await {
            debug!(error = %e, "failed to queue register");
            self.set_state(ConnectionState::Error);
            self.teardown_conn();
            return Err(ClientError::NotConnected);
        }

        match timeout(self.cfg.register_timeout, registered_rx).await {
            Ok(Ok(confirmation)) => {
                debug!(
                    service = %self.service_name,
                    services = ?confirmation.extra.get("registered_services"),
                    "registration confirmed"
                );
                self.set_state(ConnectionState::Registered);
                self.counters.mark_connected();
                self.counters.reset_reconnect_attempts();
                info!(service = %self.service_name, "registered on bus");
                self.fire_on_connect();
                Ok(())
            }
            Ok(Err(_)) => {
                // Slot dropped: the generation died while we waited.
                self.set_state(ConnectionState::Error);
                self.teardown_conn();
                Err(ClientError::ConnectionLost)
            }
            Err(_) => {
                warn!(service = %self.service_name, "no registration confirmation from broker");
                self.set_state(ConnectionState::Error);
                self.teardown_conn();
                Err(ClientError::RegistrationTimeout(self.cfg.register_timeout))
            }
        }
    }

    /// Stop the current generation's tasks and fail every caller blocked on a
    /// response.  Callbacks are preserved.
    pub(crate) fn teardown_conn(&self) {
        if let Some(handle) = self.conn.lock().expect("conn lock poisoned").take() {
            let _ = handle.conn_running.send(false);
        }
        *self.registered_slot.lock().expect("slot lock poisoned") = None;
        let failed: Vec<oneshot::Sender<Envelope>> = {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            pending.drain().map(|(_, slot)| slot).collect()
        };
        // Dropping the senders wakes the waiters with a connection-lost error.
        drop(failed);
    }

    // -----------------------------------------------------------------------
    // Error handling and reconnect
    // -----------------------------------------------------------------------

    /// Transport failure from one of the generation's tasks.
    pub(crate) fn transport_error(self: &Arc<Self>, generation: u64, message: &str) {
        {
            let conn = self.conn.lock().expect("conn lock poisoned");
            match conn.as_ref() {
                Some(handle) if handle.generation == generation => {}
                _ => return, // stale generation
            }
        }
        if !*self.client_running.borrow() {
            return; // disconnect in progress
        }

        warn!(service = %self.service_name, error = %message, "transport error");
        self.counters.inc_errors();
        self.set_state(ConnectionState::Error);
        self.fire_on_error(message);
        self.teardown_conn();

        if !self.reconnecting.swap(true, Ordering::SeqCst) {
            let shared = self.clone();
            tokio::spawn(async move {
                shared.reconnect_loop().await;
                shared.reconnecting.store(false, Ordering::SeqCst);
            });
        }
    }

    /// Bounded-backoff reconnect.  Preserves the callback table; pending
    /// responses were already failed.  Interruptible by `disconnect`.
    async fn reconnect_loop(self: &Arc<Self>) {
        loop {
            let attempt = self.counters.next_reconnect_attempt();
            if attempt > self.cfg.max_reconnect_attempts {
                warn!(
                    service = %self.service_name,
                    attempts = self.cfg.max_reconnect_attempts,
                    "reconnect budget exhausted"
                );
                self.set_state(ConnectionState::Disconnected);
                self.fire_on_disconnect();
                return;
            }

            let delay = self.cfg.reconnect_delay * attempt.min(3);
            info!(
                service = %self.service_name,
                attempt,
                max = self.cfg.max_reconnect_attempts,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );

            let mut running = self.client_running.subscribe();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = running.changed() => {}
            }
            if !*self.client_running.borrow() {
                return;
            }

            match self.connect_once(self.cfg.connect_timeout).await {
                Ok(()) => {
                    info!(service = %self.service_name, "reconnected");
                    return;
                }
                Err(e) => {
                    warn!(service = %self.service_name, error = %e, "reconnect attempt failed");
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inbound classification (receive task)
    // -----------------------------------------------------------------------

    async fn classify(&self, envelope: Envelope, incoming: &mpsc::Sender<Envelope>) {
        // A matching correlation slot wins regardless of action: `response`
        // and `error` replies both fulfil the caller's rendezvous.
        if let Some(request_id) = envelope.request_id.clone() {
            let slot = self
                .pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&request_id);
            if let Some(slot) = slot {
                let _ = slot.send(envelope);
                return;
            }
        }

        match envelope.action.as_str() {
            actions::HEARTBEAT => {
                self.counters.mark_heartbeat();
                let pong = Envelope::new(actions::PONG)
                    .with_sender(self.service_name.clone())
                    .with_data(json!({ "timestamp": now_timestamp() }));
                if let Err(e) = self.enqueue(pong) {
                    debug!(error = %e, "could not queue pong");
                }
            }
            actions::REGISTERED => {
                let slot = self
                    .registered_slot
                    .lock()
                    .expect("slot lock poisoned")
                    .take();
                match slot {
                    Some(slot) => {
                        let _ = slot.send(envelope);
                    }
                    None => debug!("registered confirmation with no waiter"),
                }
            }
            actions::WELCOME | actions::PONG | actions::ROUTED | actions::BROADCAST_SENT => {
                debug!(action = %envelope.action, "control envelope");
            }
            actions::SERVICE_CONNECTED | actions::SERVICE_DISCONNECTED => {
                let service_name = envelope
                    .extra
                    .get("service_name")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                info!(
                    action = %envelope.action,
                    service = service_name,
                    "bus lifecycle event"
                );
                let _ = incoming.send(envelope).await;
            }
            _ => {
                let _ = incoming.send(envelope).await;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Handler execution (dispatch task)
    // -----------------------------------------------------------------------

    fn handle_incoming(&self, envelope: Envelope) {
        let callback = self
            .callbacks
            .lock()
            .expect("callbacks lock poisoned")
            .get(&envelope.action)
            .cloned();

        let Some(callback) = callback else {
            match envelope.action.as_str() {
                // A reply whose waiter already timed out: discard.
                actions::RESPONSE | actions::ERROR => {
                    debug!(
                        request_id = envelope.request_id.as_deref().unwrap_or("none"),
                        "discarding unmatched reply"
                    );
                }
                actions::SERVICE_CONNECTED | actions::SERVICE_DISCONNECTED => {}
                other => debug!(action = %other, "no handler registered, dropping"),
            }
            return;
        };

        let data = envelope.data.clone().unwrap_or_else(|| json!({}));
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| callback(data)));

        let (request_id, reply_to) = (envelope.request_id, envelope.sender);
        match outcome {
            Ok(Some(response_data)) => {
                if let (Some(request_id), Some(reply_to)) = (request_id, reply_to) {
                    let response = Envelope::new(actions::RESPONSE)
                        .with_sender(self.service_name.clone())
                        .with_destination(reply_to)
                        .with_data(response_data)
                        .with_request_id(request_id);
                    if let Err(e) = self.enqueue(response) {
                        debug!(error = %e, "could not queue handler response");
                    }
                }
            }
            Ok(None) => {}
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(
                    service = %self.service_name,
                    action = %envelope.action,
                    error = %message,
                    "handler panicked"
                );
                self.counters.inc_errors();
                if let (Some(request_id), Some(reply_to)) = (request_id, reply_to) {
                    let error = Envelope::new(actions::ERROR)
                        .with_sender(self.service_name.clone())
                        .with_destination(reply_to)
                        .with_data(json!({
                            "error": message,
                            "original_action": envelope.action,
                        }))
                        .with_request_id(request_id);
                    if let Err(e) = self.enqueue(error) {
                        debug!(error = %e, "could not queue handler error");
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Hooks
    // -----------------------------------------------------------------------

    pub(crate) fn fire_on_connect(&self) {
        if let Some(hook) = self
            .hooks
            .on_connect
            .lock()
            .expect("hooks lock poisoned")
            .as_ref()
        {
            hook();
        }
    }

    pub(crate) fn fire_on_disconnect(&self) {
        if let Some(hook) = self
            .hooks
            .on_disconnect
            .lock()
            .expect("hooks lock poisoned")
            .as_ref()
        {
            hook();
        }
    }

    pub(crate) fn fire_on_error(&self, message: &str) {
        if let Some(hook) = self
            .hooks
            .on_error
            .lock()
            .expect("hooks lock poisoned")
            .as_ref()
        {
            hook(message);
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_owned()
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Reads frames and classifies envelopes.  Signals readiness before the first
/// read so `connect` knows the `registered` reply has a listener.
async fn receive_task(
    shared: Arc<Shared>,
    generation: u64,
    mut reader: OwnedReadHalf,
    ready: oneshot::Sender<()>,
    incoming: mpsc::Sender<Envelope>,
    mut running: watch::Receiver<bool>,
) {
    let _ = ready.send(());
    loop {
        // The read future is only ever cancelled by shutdown, so a partially
        // read frame is never abandoned on a connection we keep using.
        tokio::select! {
            biased;
            _ = running.changed() => {
                if !*running.borrow() {
                    break;
                }
            }
            result = read_envelope(&mut reader, shared.cfg.max_frame_len) => {
                match result {
                    Ok(envelope) => {
                        shared.counters.inc_received();
                        shared.classify(envelope, &incoming).await;
                    }
                    Err(FrameError::Closed) => {
                        shared.transport_error(generation, "connection closed by broker");
                        break;
                    }
                    Err(e) => {
                        shared.transport_error(generation, &e.to_string());
                        break;
                    }
                }
            }
        }
    }
    debug!(service = %shared.service_name, generation, "receive task stopped");
}

/// Drains the outbound channel onto the socket.
async fn send_task(
    shared: Arc<Shared>,
    generation: u64,
    mut writer: OwnedWriteHalf,
    mut outgoing: mpsc::Receiver<Envelope>,
    mut running: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = running.changed() => {
                if !*running.borrow() {
                    break;
                }
            }
            maybe = outgoing.recv() => {
                let Some(envelope) = maybe else { break };
                match write_envelope(&mut writer, &envelope, shared.cfg.max_frame_len).await {
                    Ok(()) => shared.counters.inc_sent(),
                    Err(e) => {
                        shared.transport_error(generation, &e.to_string());
                        break;
                    }
                }
            }
        }
    }
    debug!(service = %shared.service_name, generation, "send task stopped");
}

/// Runs handlers away from the socket reader so a slow handler cannot stall
/// frame reads.
async fn dispatch_task(
    shared: Arc<Shared>,
    mut incoming: mpsc::Receiver<Envelope>,
    mut running: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = running.changed() => {
                if !*running.borrow() {
                    break;
                }
            }
            maybe = incoming.recv() => {
                let Some(envelope) = maybe else { break };
                shared.handle_incoming(envelope);
            }
        }
    }
    debug!(service = %shared.service_name, "dispatch task stopped");
}

/// Periodic `ping` to the broker; the broker's `pong` (and any other inbound
/// traffic) keeps this peer's `last_seen` fresh on the other side.
async fn heartbeat_task(shared: Arc<Shared>, mut running: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = running.changed() => {
                if !*running.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(shared.cfg.heartbeat_interval) => {
                if shared.state() == ConnectionState::Registered {
                    let ping = Envelope::new(actions::PING)
                        .with_sender(shared.service_name.clone())
                        .with_data(json!({ "timestamp": now_timestamp() }));
                    if let Err(e) = shared.enqueue(ping) {
                        debug!(error = %e, "could not queue heartbeat ping");
                    }
                }
            }
        }
    }
    debug!(service = %shared.service_name, "heartbeat task stopped");
}
