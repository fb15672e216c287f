//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Worker dial:
//!     → retry.rs (drive the dial op until success or stop)
//!     → backoff.rs (exponential delay with jitter between attempts)
//! ```
//!
//! # Design Decisions
//! - A strategy is a small mutable object; jitter is a decorator around it
//! - The op signals the distinguished end-of-retry on cancellation so a
//!   shutdown never queues another attempt
//! - The driver itself holds no timers beyond the current sleep; dropping its
//!   future cancels the sleep, so callers race it against shutdown

pub mod backoff;
pub mod retry;

pub use backoff::{BackoffStrategy, ExpBackoff, Jittered};
pub use retry::{retry, OpError, RetryError};
