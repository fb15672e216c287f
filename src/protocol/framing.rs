//! Serialization and parsing of the cranker wire format.

use bytes::BytesMut;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Version};
use thiserror::Error;

use crate::protocol::{MARKER_REQ_BODY_ENDED, MARKER_REQ_BODY_PENDING, MARKER_REQ_HAS_NO_BODY};

/// Error type for wire-format violations. All of these are fatal for the
/// socket they occur on.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("header frame too short: {0} bytes")]
    HeaderFrameTooShort(usize),

    #[error("unexpected marker {0:?}")]
    UnexpectedMarker(Vec<u8>),

    #[error("request not started with a text message")]
    NonTextHeaderFrame,

    #[error("malformed request head: {0}")]
    MalformedHead(httparse::Error),

    #[error("request head is not a complete HTTP/1.x message")]
    IncompleteHead,

    #[error("invalid header in request head")]
    InvalidHeader,

    #[error("expected a body-end marker, got a {0}-byte text frame")]
    NotABodyEndMarker(usize),
}

/// The parsed head of a proxied request. The target is kept as received,
/// service-name prefix included; the worker strips it when rewriting.
#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub headers: HeaderMap,
}

/// Parse the first text frame of an exchange: an HTTP/1.x request head whose
/// final two bytes are the has-body marker.
///
/// Returns the head and whether body frames follow.
pub fn parse_request(payload: &[u8]) -> Result<(RequestHead, bool), ProtocolError> {
    if payload.len() < 3 {
        return Err(ProtocolError::HeaderFrameTooShort(payload.len()));
    }

    let (head, marker) = payload.split_at(payload.len() - 2);
    let has_body = if marker == MARKER_REQ_BODY_PENDING {
        true
    } else if marker == MARKER_REQ_HAS_NO_BODY {
        false
    } else {
        return Err(ProtocolError::UnexpectedMarker(marker.to_vec()));
    };

    Ok((parse_head(head)?, has_body))
}

/// True when a text frame received during a body stream is the body-end
/// marker.
pub fn is_body_end(payload: &[u8]) -> bool {
    payload == MARKER_REQ_BODY_ENDED
}

fn parse_head(head: &[u8]) -> Result<RequestHead, ProtocolError> {
    // The header block may carry any number of headers; grow the slot table
    // instead of assuming a fixed bound.
    let mut capacity = 32;
    loop {
        let mut slots = vec![httparse::EMPTY_HEADER; capacity];
        let mut parsed = httparse::Request::new(&mut slots);

        match parsed.parse(head) {
            Ok(httparse::Status::Complete(_)) => {
                let method = parsed
                    .method
                    .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
                    .ok_or(ProtocolError::IncompleteHead)?;
                let target = parsed.path.ok_or(ProtocolError::IncompleteHead)?.to_owned();

                let mut headers = HeaderMap::with_capacity(parsed.headers.len());
                for h in parsed.headers.iter() {
                    let name = HeaderName::from_bytes(h.name.as_bytes())
                        .map_err(|_| ProtocolError::InvalidHeader)?;
                    let value = HeaderValue::from_bytes(h.value)
                        .map_err(|_| ProtocolError::InvalidHeader)?;
                    headers.append(name, value);
                }

                return Ok(RequestHead {
                    method,
                    target,
                    headers,
                });
            }
            Ok(httparse::Status::Partial) => return Err(ProtocolError::IncompleteHead),
            Err(httparse::Error::TooManyHeaders) if capacity < 1024 => {
                capacity *= 2;
                continue;
            }
            Err(e) => return Err(ProtocolError::MalformedHead(e)),
        }
    }
}

/// Serialize a response head into `buf`: status line, header block in
/// HTTP/1.x wire form, terminating CRLF.
pub fn write_response_head(
    buf: &mut BytesMut,
    version: Version,
    status: StatusCode,
    reason: &str,
    headers: &HeaderMap,
) {
    let proto = if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    };

    buf.extend_from_slice(proto.as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(status.as_str().as_bytes());
    if !reason.is_empty() {
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(reason.as_bytes());
    }
    buf.extend_from_slice(b"\r\n");

    for (name, value) in headers.iter() {
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    buf.extend_from_slice(b"\r\n");
}
