//! Cranker wire protocol (v1).
//!
//! # Data Flow
//! ```text
//! Router-to-connector request:
//!     one text frame: HTTP/1.x request head + 2-byte marker ("_1" or "_2")
//!     if "_1": binary frames with body bytes, then one text frame "_3"
//!
//! Connector-to-router response:
//!     one text frame: "<proto> <status>\r\n<headers>\r\n"
//!     binary frames with body bytes
//!     end-of-body: connector closes the socket (normal closure)
//! ```
//!
//! # Design Decisions
//! - Framing is pure parse/serialize; the worker owns all socket I/O
//! - A socket carries exactly one exchange, so there is no frame multiplexing
//! - Anything that violates the framing is fatal for that socket only; the
//!   engine dials a replacement

pub mod framing;

pub use framing::{ProtocolError, RequestHead};

/// Trailing marker of a request head frame when body frames follow.
pub const MARKER_REQ_BODY_PENDING: &[u8; 2] = b"_1";
/// Trailing marker of a request head frame when the request has no body.
pub const MARKER_REQ_HAS_NO_BODY: &[u8; 2] = b"_2";
/// Payload of the text frame that terminates a streamed request body.
pub const MARKER_REQ_BODY_ENDED: &[u8; 2] = b"_3";
