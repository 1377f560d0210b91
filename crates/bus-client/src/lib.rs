//! bus-client: the peer runtime for the message bus.
//!
//! Owns one TCP connection to the broker, performs the register handshake,
//! and runs four cooperating tasks (receive, send, dispatch, heartbeat).
//! Offers request/response correlation over the single socket, per-action
//! callbacks, and automatic reconnect with re-registration.
//!
//! # Usage
//! ```rust,no_run
//! # async fn example() -> Result<(), bus_client::ClientError> {
//! use bus_client::{BusClient, ClientConfig};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! let client = BusClient::new("auth", ClientConfig::from_env());
//! client.register_callback("validate_token", |data| {
//!     Some(json!({ "valid": data.get("token").is_some() }))
//! });
//! client.connect(Duration::from_secs(10)).await?;
//!
//! let reply = client
//!     .send("users", "get_user", json!({"user_id": 7}), true, None)
//!     .await?;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod runtime;
mod state;

pub use client::{BusClient, ClientError};
pub use config::ClientConfig;
pub use state::{ClientStats, ConnectionState};
