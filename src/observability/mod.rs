//! Observability subsystem.
//!
//! # Design Decisions
//! - Structured logging via `tracing` fields; the worker id threads through
//!   every log line of an exchange for correlation
//! - Metrics go through the `metrics` facade; installing an exporter is the
//!   embedding process's business
//! - Downstream failures surface to end clients as an `errorId` that matches
//!   the logged error

pub mod metrics;
