//! Message classification and handling.
//!
//! Control actions (`register`, `ping`, `discover`, `broadcast`) are handled
//! here; anything else with a `destination` is forwarded to that peer's
//! outbound queue, and the rest is rejected as unrecognised.
//!
//! Control replies (`registered`, `pong`, `discover_response`,
//! `broadcast_sent`, `routed`, errors) are written directly on the sender's
//! socket rather than queued.  For `registered` this is a hard protocol
//! requirement; for the others it keeps request/reply latency independent of
//! the routed-traffic queue.

use crate::Shared;
use crate::connection::Connection;
use crate::registry::BindOutcome;
use bus_protocol::{Envelope, RoutedTrace, actions, now_timestamp};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub(crate) async fn handle_envelope(shared: &Arc<Shared>, conn: &Arc<Connection>, envelope: Envelope) {
    shared.stats.inc_received();
    shared.registry.touch_conn(conn.id());

    debug!(
        conn = conn.id(),
        action = %envelope.action,
        sender = envelope.sender.as_deref().unwrap_or("unknown"),
        "inbound message"
    );

    match envelope.action.as_str() {
        actions::REGISTER => handle_register(shared, conn, &envelope).await,
        actions::PING => handle_ping(shared, conn).await,
        // Liveness reply to a broker heartbeat; the touch above is the point.
        actions::PONG => {}
        actions::DISCOVER => handle_discover(shared, conn).await,
        actions::BROADCAST => handle_broadcast(shared, conn, envelope).await,
        _ if envelope.destination.is_some() => route(shared, conn, envelope).await,
        other => {
            warn!(conn = conn.id(), action = %other, "unrecognised action");
            send_error(
                shared,
                conn,
                &format!("unrecognised action: {other}"),
                envelope.request_id.as_deref(),
            )
            .await;
        }
    }
}

async fn handle_register(shared: &Arc<Shared>, conn: &Arc<Connection>, envelope: &Envelope) {
    let Some(name) = envelope
        .data
        .as_ref()
        .and_then(|d| d.get("service_name"))
        .and_then(Value::as_str)
        .map(str::to_owned)
    else {
        send_error(
            shared,
            conn,
            "service name required",
            envelope.request_id.as_deref(),
        )
        .await;
        return;
    };

    loop {
        match shared.registry.bind(&name, conn) {
            BindOutcome::Bound => break,
            BindOutcome::Superseded(prior) => {
                info!(service = %name, old_conn = prior.id(), new_conn = conn.id(), "service reconnecting, superseding prior connection");
                shared.reap(&prior, "superseded");
            }
            BindOutcome::Conflict { existing } => {
                send_error(
                    shared,
                    conn,
                    &format!("connection already registered as '{existing}'"),
                    envelope.request_id.as_deref(),
                )
                .await;
                return;
            }
        }
    }

    info!(service = %name, addr = %conn.addr(), "service registered");

    // The client blocks on this reply before enabling general dispatch, so it
    // must go out on the socket now, ahead of anything sitting in the queue.
    let reply = Envelope::new(actions::REGISTERED)
        .with_field("service_name", json!(name))
        .with_field("message", json!(format!("service {name} registered")))
        .with_field("registered_services", json!(shared.registry.names()));
    if !shared.send_direct(conn, &reply).await {
        return;
    }

    let notice = Envelope::new(actions::SERVICE_CONNECTED)
        .with_field("service_name", json!(name));
    let _ = shared.broadcast_enqueue(notice, Some(conn.id()));
}

async fn handle_ping(shared: &Arc<Shared>, conn: &Arc<Connection>) {
    let reply = Envelope::new(actions::PONG)
        .with_field("server_time", json!(now_timestamp()))
        .with_field("services_count", json!(shared.registry.len()))
        .with_field("stats", shared.stats.snapshot(&shared.registry));
    let _ = shared.send_direct(conn, &reply).await;
}

async fn handle_discover(shared: &Arc<Shared>, conn: &Arc<Connection>) {
    let services = shared.registry.snapshot();
    let reply = Envelope::new(actions::DISCOVER_RESPONSE)
        .with_field("total_services", json!(services.len()))
        .with_field("services", json!(services));
    let _ = shared.send_direct(conn, &reply).await;
}

async fn handle_broadcast(shared: &Arc<Shared>, conn: &Arc<Connection>, envelope: Envelope) {
    let sender = envelope.sender.clone().unwrap_or_else(|| "unknown".to_owned());

    let mut outgoing = Envelope::new(actions::BROADCAST)
        .with_sender(sender.clone())
        .with_data(envelope.data.clone().unwrap_or_else(|| json!({})));
    if let Some(original) = envelope.timestamp {
        outgoing = outgoing.with_field("original_timestamp", json!(original));
    }

    let recipients = shared.broadcast_enqueue(outgoing, Some(conn.id()));
    info!(sender = %sender, recipients, "broadcast fan-out");

    let confirmation = Envelope::new(actions::BROADCAST_SENT)
        .with_field("recipients", json!(recipients))
        .with_field("total_services", json!(shared.registry.len()));
    let _ = shared.send_direct(conn, &confirmation).await;
}

async fn route(shared: &Arc<Shared>, conn: &Arc<Connection>, mut envelope: Envelope) {
    let destination = envelope
        .destination
        .clone()
        .unwrap_or_default();

    let Some(dest_conn) = shared.registry.lookup(&destination) else {
        send_error(
            shared,
            conn,
            &format!("destination service '{destination}' not registered"),
            envelope.request_id.as_deref(),
        )
        .await;
        return;
    };

    let hop_count = envelope.routed.as_ref().map_or(0, |r| r.hop_count) + 1;
    envelope.routed = Some(RoutedTrace {
        hop_count,
        timestamp: Some(now_timestamp()),
        sender_addr: Some(conn.addr().to_string()),
        extra: serde_json::Map::new(),
    });

    shared.registry.record_routed(&destination);
    if let Some(sender) = envelope.sender.clone() {
        shared.registry.record_routed(&sender);
    }

    let sender = envelope.sender.clone().unwrap_or_else(|| "unknown".to_owned());
    let action = envelope.action.clone();
    let depth = dest_conn.enqueue(envelope, shared.cfg.queue_high_water);
    debug!(from = %sender, to = %destination, action = %action, queue = depth, "routed");

    // Confirmation to the sender.  Deliberately no request_id echo: the
    // sender's correlation slot is waiting for the destination's response,
    // not for this hop acknowledgement.
    let confirmation = Envelope::new(actions::ROUTED)
        .with_field("destination", json!(destination))
        .with_field("message", json!(format!("message routed to {destination}")))
        .with_field("queue_size", json!(depth));
    let _ = shared.send_direct(conn, &confirmation).await;
}

/// Direct error reply.  Echoes the offending request's `request_id` (when it
/// carried one) so a caller blocked on a response observes the failure
/// instead of timing out.
pub(crate) async fn send_error(
    shared: &Arc<Shared>,
    conn: &Arc<Connection>,
    message: &str,
    request_id: Option<&str>,
) {
    shared.stats.inc_errors();
    let mut reply = Envelope::new(actions::ERROR).with_field("error", json!(message));
    if let Some(id) = request_id {
        reply = reply.with_request_id(id);
    }
    let _ = shared.send_direct(conn, &reply).await;
}
