//! medibus: a TCP message bus for backend services.
//!
//! One central broker routes length-prefixed JSON envelopes between named
//! services; each service links the client runtime and talks to everything
//! else by name.  This crate re-exports the public surface of the workspace
//! members; the integration suites under `tests/integration/` exercise the
//! broker and client together.

pub use broker::{Broker, BrokerConfig, BrokerHandle, RunError};
pub use bus_client::{BusClient, ClientConfig, ClientError, ClientStats, ConnectionState};
pub use bus_protocol::{Envelope, FrameError, RoutedTrace, actions};
