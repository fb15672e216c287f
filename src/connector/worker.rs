//! Per-socket worker: one registration, one exchange.
//!
//! A worker dials the router, parks until the router dispatches a request
//! down the socket, replays the request against the local service, streams
//! the response back, closes the socket and exits. Workers are never reused.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http::header::{HeaderValue, CONNECTION, TRANSFER_ENCODING};
use http::{HeaderMap, StatusCode, Version};
use reqwest::Body;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{
    connect_async_tls_with_config, Connector as WsConnector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::lifecycle::Signal;
use crate::observability::metrics;
use crate::pool::{BufferPool, SlabPool, SLAB_SIZE};
use crate::protocol::framing::{self, ProtocolError, RequestHead};
use crate::resilience::{retry, ExpBackoff, Jittered, OpError, RetryError};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

const DIAL_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);
const DIAL_BACKOFF_MIN: Duration = Duration::from_secs(5);
const DIAL_BACKOFF_MAX: Duration = Duration::from_secs(30);
const DIAL_BACKOFF_JITTER: Duration = Duration::from_secs(5);
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

/// WebSocket-level failures. Recoverable through backoff while dialing,
/// fatal for the socket afterwards.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("handshake request could not be built: {0}")]
    Handshake(tungstenite::Error),

    #[error("dial failed: {0}")]
    Dial(tungstenite::Error),

    #[error("dial attempt timed out")]
    DialTimeout,

    #[error("read failed: {0}")]
    Read(tungstenite::Error),

    #[error("write failed: {0}")]
    Write(tungstenite::Error),

    #[error("socket closed by router")]
    ClosedByRouter,
}

/// Terminal outcome of one worker. Never propagates to sibling workers.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker cancelled")]
    Cancelled,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("error reading response from service: {0}")]
    Downstream(reqwest::Error),
}

#[derive(Debug, Error)]
enum DownstreamError {
    #[error("request cancelled")]
    Cancelled,

    #[error(transparent)]
    Http(reqwest::Error),
}

/// What goes back over the socket: the service's answer, or a synthesized
/// error page when the service could not be reached.
enum ServiceResponse {
    Upstream(reqwest::Response),
    Synthesized { status: StatusCode, body: Bytes },
}

impl ServiceResponse {
    fn synthesized(error_id: Uuid) -> Self {
        Self::Synthesized {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: Bytes::from(format!("errorId={error_id}\n")),
        }
    }
}

pub(crate) struct WssWorker {
    id: Uuid,
    register_url: String,
    service_name: String,
    service_prefix: String,
    service_url: Url,
    shutdown_timeout: Duration,
    wss_connector: Option<WsConnector>,
    service_client: reqwest::Client,
    buffers: Arc<BufferPool>,
    slabs: Arc<SlabPool>,
}

impl WssWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        register_url: String,
        service_name: String,
        service_url: Url,
        shutdown_timeout: Duration,
        wss_connector: Option<WsConnector>,
        service_client: reqwest::Client,
        buffers: Arc<BufferPool>,
        slabs: Arc<SlabPool>,
    ) -> Self {
        let service_prefix = format!("/{service_name}");
        Self {
            id: Uuid::new_v4(),
            register_url,
            service_name,
            service_prefix,
            service_url,
            shutdown_timeout,
            wss_connector,
            service_client,
            buffers,
            slabs,
        }
    }

    /// Dial the router's register URL, retrying with jittered exponential
    /// backoff until connected or `sig_term` fires.
    pub(crate) async fn dial(
        &self,
        sig_term: &Signal,
    ) -> Result<WsStream, RetryError<TransportError>> {
        info!(worker_id = %self.id, register_url = %self.register_url, "dialing");

        let backoff = Jittered::new(
            ExpBackoff::new(DIAL_BACKOFF_MIN, DIAL_BACKOFF_MAX),
            DIAL_BACKOFF_JITTER,
        );

        // Dropping the retry future cancels its backoff sleep, so shutdown
        // never waits out a pending delay.
        tokio::select! {
            biased;
            _ = sig_term.cancelled() => Err(RetryError::EndOfRetry),
            res = retry(|| self.dial_once(sig_term), backoff) => res,
        }
    }

    async fn dial_once(&self, sig_term: &Signal) -> Result<WsStream, OpError<TransportError>> {
        if sig_term.is_cancelled() {
            return Err(OpError::EndOfRetry);
        }

        let mut request = self
            .register_url
            .as_str()
            .into_client_request()
            .map_err(|e| OpError::Retry(TransportError::Handshake(e)))?;

        let route = match HeaderValue::from_str(&self.service_name) {
            Ok(route) => route,
            Err(_) => {
                error!(worker_id = %self.id, service_name = %self.service_name,
                    "service name is not a valid header value");
                return Err(OpError::EndOfRetry);
            }
        };
        let headers = request.headers_mut();
        headers.insert("CrankerProtocol", HeaderValue::from_static("1.0"));
        headers.insert("Route", route);

        let attempt = tokio::time::timeout(
            DIAL_ATTEMPT_TIMEOUT,
            connect_async_tls_with_config(request, None, false, self.wss_connector.clone()),
        );

        tokio::select! {
            biased;
            _ = sig_term.cancelled() => Err(OpError::EndOfRetry),
            res = attempt => match res {
                Err(_) => {
                    warn!(worker_id = %self.id, register_url = %self.register_url, "dial attempt timed out");
                    metrics::record_dial(&self.register_url, false);
                    Err(OpError::Retry(TransportError::DialTimeout))
                }
                Ok(Err(e)) => {
                    warn!(worker_id = %self.id, register_url = %self.register_url, err = %e,
                        "failed to connect to cranker router");
                    metrics::record_dial(&self.register_url, false);
                    Err(OpError::Retry(TransportError::Dial(e)))
                }
                Ok(Ok((ws, response))) => {
                    info!(worker_id = %self.id, status = %response.status(), "wss connected");
                    metrics::record_dial(&self.register_url, true);
                    Ok(ws)
                }
            },
        }
    }

    /// Carry one exchange over the connected socket, then close it.
    ///
    /// The window `permit` is released the moment the request head has been
    /// read, or on any earlier exit; either way a replacement worker can
    /// dial while this one still streams.
    pub(crate) async fn serve(
        &self,
        sig_term: &Signal,
        permit: OwnedSemaphorePermit,
        ws: WsStream,
    ) -> Result<(), WorkerError> {
        let (mut sink, source) = ws.split();

        let result = self.serve_inner(sig_term, permit, &mut sink, source).await;

        // One exchange per socket: close regardless of what happened above.
        // Bounded by wall clock, not sig_kill (which may already have
        // fired); a stalled peer must not hold up the engine's drain.
        let finish = async {
            let close = Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "close requested by client".into(),
            }));
            if let Err(e) = sink.send(close).await {
                debug!(worker_id = %self.id, err = %e, "error closing wss connection");
            }
            let _ = sink.close().await;
        };
        if tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, finish).await.is_err() {
            debug!(worker_id = %self.id, "timed out closing wss connection");
        }

        result
    }

    async fn serve_inner(
        &self,
        sig_term: &Signal,
        permit: OwnedSemaphorePermit,
        sink: &mut WsSink,
        mut source: WsSource,
    ) -> Result<(), WorkerError> {
        info!(worker_id = %self.id, "waiting for request");

        let received = self.next_request(sig_term, &mut source).await;

        // Hand the window slot back before serving: this is what makes the
        // window slide instead of degrading into a serial pipeline.
        drop(permit);
        metrics::record_idle_registrations(&self.register_url, -1);

        let (head, has_body) = received?;

        // From here on the exchange survives sigTerm by the grace period.
        let sig_kill = sig_term.with_grace(self.shutdown_timeout);

        let body = if has_body {
            let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(1);
            let pump = BodyPump {
                worker_id: self.id,
                source,
                out: tx,
                sig_kill: sig_kill.clone(),
            };
            tokio::spawn(pump.run());

            let chunks = futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|chunk| (chunk, rx))
            });
            Some(Body::wrap_stream(chunks))
        } else {
            debug!(worker_id = %self.id, "request without body");
            None
        };

        let response = match self.send_request(&sig_kill, head, body).await {
            Ok(response) => ServiceResponse::Upstream(response),
            Err(e) => {
                let error_id = Uuid::new_v4();
                error!(worker_id = %self.id, error_id = %error_id, err = %e,
                    "error sending request to service");
                ServiceResponse::synthesized(error_id)
            }
        };

        self.send_response(&sig_kill, sink, response).await
    }

    async fn next_request(
        &self,
        sig_term: &Signal,
        source: &mut WsSource,
    ) -> Result<(RequestHead, bool), WorkerError> {
        loop {
            let msg = tokio::select! {
                biased;
                _ = sig_term.cancelled() => return Err(WorkerError::Cancelled),
                msg = source.next() => match msg {
                    None => return Err(TransportError::ClosedByRouter.into()),
                    Some(Err(e)) => return Err(TransportError::Read(e).into()),
                    Some(Ok(msg)) => msg,
                },
            };

            match msg {
                Message::Text(payload) => {
                    let (head, has_body) = framing::parse_request(payload.as_bytes())?;
                    info!(worker_id = %self.id, method = %head.method, target = %head.target,
                        "received request");
                    return Ok((head, has_body));
                }
                Message::Binary(_) => {
                    error!(worker_id = %self.id, "protocol error: request not started with text message");
                    return Err(ProtocolError::NonTextHeaderFrame.into());
                }
                Message::Close(_) => return Err(TransportError::ClosedByRouter.into()),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }

    async fn send_request(
        &self,
        sig_kill: &Signal,
        head: RequestHead,
        body: Option<Body>,
    ) -> Result<reqwest::Response, DownstreamError> {
        let url = self.rewrite_url(&head.target);
        info!(worker_id = %self.id, url = %url, "proxying request");

        let mut headers = head.headers;
        headers.remove(CONNECTION);
        headers.remove(TRANSFER_ENCODING);

        let mut builder = self.service_client.request(head.method, url).headers(headers);
        if let Some(body) = body {
            builder = builder.body(body);
        }

        tokio::select! {
            biased;
            _ = sig_kill.cancelled() => Err(DownstreamError::Cancelled),
            res = builder.send() => res.map_err(DownstreamError::Http),
        }
    }

    /// `/<service-name><rest>` becomes `<service-url><rest>`, query string
    /// preserved.
    fn rewrite_url(&self, target: &str) -> Url {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (target, None),
        };

        let rest = path.strip_prefix(&self.service_prefix).unwrap_or(path);

        let mut url = self.service_url.clone();
        let base = url.path().trim_end_matches('/').to_owned();
        let joined = format!("{base}{rest}");
        url.set_path(if joined.is_empty() { "/" } else { &joined });
        url.set_query(query);
        url
    }

    async fn send_response(
        &self,
        sig_kill: &Signal,
        sink: &mut WsSink,
        response: ServiceResponse,
    ) -> Result<(), WorkerError> {
        let mut head = self.buffers.get();
        match &response {
            ServiceResponse::Upstream(r) => {
                let reason = r.status().canonical_reason().unwrap_or("");
                // The body travels as frames; hop-by-hop framing headers
                // must not leak through to the router.
                let mut headers = r.headers().clone();
                headers.remove(TRANSFER_ENCODING);
                headers.remove(CONNECTION);
                framing::write_response_head(&mut head, r.version(), r.status(), reason, &headers);
            }
            ServiceResponse::Synthesized { status, .. } => {
                framing::write_response_head(
                    &mut head,
                    Version::HTTP_11,
                    *status,
                    "Server Error",
                    &HeaderMap::new(),
                );
            }
        }

        debug!(worker_id = %self.id, bytes = head.len(), "sending response headers");
        let frame = Message::text(String::from_utf8_lossy(&head).into_owned());
        self.buffers.release(head);

        tokio::select! {
            biased;
            _ = sig_kill.cancelled() => return Err(WorkerError::Cancelled),
            res = sink.send(frame) => res.map_err(TransportError::Write)?,
        }

        let status = match response {
            ServiceResponse::Upstream(mut r) => {
                let status = r.status();
                loop {
                    let chunk = tokio::select! {
                        biased;
                        _ = sig_kill.cancelled() => return Err(WorkerError::Cancelled),
                        c = r.chunk() => c.map_err(WorkerError::Downstream)?,
                    };
                    let Some(chunk) = chunk else { break };
                    if chunk.is_empty() {
                        continue;
                    }
                    self.relay_body_chunk(sig_kill, sink, &chunk).await?;
                }
                status
            }
            ServiceResponse::Synthesized { status, body } => {
                self.relay_body_chunk(sig_kill, sink, &body).await?;
                status
            }
        };

        metrics::record_request_proxied(&self.register_url, status.as_u16());
        Ok(())
    }

    /// Relay one chunk of response body as binary frames of at most
    /// [`SLAB_SIZE`] bytes, staged through a pooled scratch slab.
    async fn relay_body_chunk(
        &self,
        sig_kill: &Signal,
        sink: &mut WsSink,
        chunk: &[u8],
    ) -> Result<(), WorkerError> {
        for piece in chunk.chunks(SLAB_SIZE) {
            let mut slab = self.slabs.get();
            slab.extend_from_slice(piece);
            let frame = Message::binary(Bytes::copy_from_slice(&slab));
            self.slabs.release(slab);

            tokio::select! {
                biased;
                _ = sig_kill.cancelled() => return Err(WorkerError::Cancelled),
                res = sink.send(frame) => res.map_err(TransportError::Write)?,
            }
            debug!(worker_id = %self.id, bytes_sent = piece.len(), "response chunk sent");
        }
        Ok(())
    }
}

/// Drains binary body frames off the socket into the pipe feeding the
/// downstream request, until the body-end marker arrives.
struct BodyPump {
    worker_id: Uuid,
    source: WsSource,
    out: mpsc::Sender<Result<Bytes, io::Error>>,
    sig_kill: Signal,
}

impl BodyPump {
    async fn run(mut self) {
        loop {
            let msg = tokio::select! {
                biased;
                _ = self.sig_kill.cancelled() => {
                    debug!(worker_id = %self.worker_id, "body pump cancelled");
                    let _ = self
                        .out
                        .try_send(Err(io::Error::from(io::ErrorKind::Interrupted)));
                    return;
                }
                msg = self.source.next() => msg,
            };

            match msg {
                Some(Ok(Message::Binary(chunk))) => {
                    let n = chunk.len();
                    if self.out.send(Ok(chunk)).await.is_err() {
                        // Downstream abandoned the body.
                        return;
                    }
                    debug!(worker_id = %self.worker_id, bytes_recv = n, "pumped request body chunk");
                }
                Some(Ok(Message::Text(payload))) => {
                    if framing::is_body_end(payload.as_bytes()) {
                        debug!(worker_id = %self.worker_id, "request body ended");
                        // Dropping the sender closes the pipe.
                        return;
                    }
                    error!(worker_id = %self.worker_id, len = payload.len(),
                        "protocol error: not a body-end marker");
                    let _ = self.out.try_send(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "unexpected text frame in body stream",
                    )));
                    return;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) | None => {
                    let _ = self
                        .out
                        .try_send(Err(io::Error::from(io::ErrorKind::UnexpectedEof)));
                    return;
                }
                Some(Err(e)) => {
                    error!(worker_id = %self.worker_id, err = %e, "failed to read request body");
                    let _ = self.out.try_send(Err(io::Error::other(e)));
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{BufferPool, SlabPool};

    fn worker(service_url: &str) -> WssWorker {
        WssWorker::new(
            "wss://router.example/register".into(),
            "demo".into(),
            Url::parse(service_url).unwrap(),
            Duration::from_secs(5),
            None,
            reqwest::Client::new(),
            Arc::new(BufferPool::new()),
            Arc::new(SlabPool::new()),
        )
    }

    #[test]
    fn test_rewrite_strips_service_prefix() {
        let w = worker("http://127.0.0.1:3000");
        let url = w.rewrite_url("/demo/widgets/1");
        assert_eq!(url.as_str(), "http://127.0.0.1:3000/widgets/1");
    }

    #[test]
    fn test_rewrite_keeps_query() {
        let w = worker("http://127.0.0.1:3000");
        let url = w.rewrite_url("/demo/search?q=hello&limit=2");
        assert_eq!(url.as_str(), "http://127.0.0.1:3000/search?q=hello&limit=2");
    }

    #[test]
    fn test_rewrite_appends_to_base_path() {
        let w = worker("http://127.0.0.1:3000/api/");
        let url = w.rewrite_url("/demo/widgets");
        assert_eq!(url.as_str(), "http://127.0.0.1:3000/api/widgets");
    }

    #[test]
    fn test_rewrite_bare_prefix_hits_root() {
        let w = worker("http://127.0.0.1:3000");
        let url = w.rewrite_url("/demo");
        assert_eq!(url.as_str(), "http://127.0.0.1:3000/");
    }

    #[test]
    fn test_rewrite_leaves_unprefixed_target_alone() {
        let w = worker("http://127.0.0.1:3000");
        let url = w.rewrite_url("/other/thing");
        assert_eq!(url.as_str(), "http://127.0.0.1:3000/other/thing");
    }
}
