//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Connector shutdown:
//!     root Shutdown triggered
//!     → discovery/launch tasks stop
//!     → each engine's Shutdown triggered (sigTerm for its workers)
//!     → workers parked on reads exit at once
//!     → workers serving a request get a grace window (sigKill) to finish
//!     → engine completion latches fire, shutdown() returns
//! ```
//!
//! # Design Decisions
//! - Signals are level-triggered: a subscriber created after the trigger
//!   still observes the cancellation
//! - Grace is a derived signal, not a deadline on the parent: the parent
//!   cancels promptly, the child holds on for the grace period
//! - A dropped owner counts as cancelled, so nothing waits forever

pub mod shutdown;

pub use shutdown::{Shutdown, Signal};
