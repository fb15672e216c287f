//! Reverse-tunnel connector for the cranker routing fabric.
//!
//! A local HTTP service does not expose an inbound listener. Instead this
//! connector dials *out* to one or more cranker routers over WebSocket and
//! registers the service under a route name. The router dispatches each
//! incoming client request down an idle socket; the connector replays it
//! against the local service and streams the response back, then the socket
//! closes. One socket, one exchange.
//!
//! # Architecture Overview
//!
//! ```text
//!                ┌────────────────────────────────────────────────┐
//!                │                  CONNECTOR                     │
//!                │                                                │
//!  cranker ◀─wss─┼─ worker ◀─┐                                    │
//!  router A      │  worker ◀─┴─ engine (sliding window, router A) │
//!                │                      ▲                         │
//!  cranker ◀─wss─┼─ worker ◀─── engine (sliding window, router B) │
//!  router B      │                      ▲                         │
//!                │                discovery diff ◀── Discoverer   │
//!                │                                                │
//!                │  worker ───HTTP──▶ local service               │
//!                └────────────────────────────────────────────────┘
//! ```
//!
//! Each worker carries exactly one request/response over a freshly dialed
//! socket. The engine keeps up to N workers parked in the registered state so
//! a dispatched request always finds a waiting socket; the slot is handed
//! back the moment a worker receives its request, which is what makes the
//! window slide instead of serializing.

// Core subsystems
pub mod config;
pub mod connector;
pub mod protocol;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod pool;
pub mod resilience;

pub use config::ConnectorConfig;
pub use connector::{Connector, RouterEngine};
pub use lifecycle::{Shutdown, Signal};
