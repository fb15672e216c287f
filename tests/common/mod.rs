//! Shared utilities for integration testing: a mock cranker router and a
//! mock local service.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use axum::extract::Path;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

/// A router-side endpoint speaking cranker v1: accepts registrations, hands
/// each one exactly one request, collects the response frames.
#[allow(dead_code)]
pub struct MockRouter {
    addr: SocketAddr,
    sockets: Mutex<mpsc::UnboundedReceiver<RouterSocket>>,
    /// Registrations accepted and not yet dispatched a request.
    pub idle: Arc<AtomicUsize>,
    /// High-water mark of `idle`.
    pub peak_idle: Arc<AtomicUsize>,
    /// Total registrations accepted.
    pub accepted: Arc<AtomicUsize>,
    /// `(CrankerProtocol, Route)` header pairs seen during handshakes.
    pub handshakes: Arc<StdMutex<Vec<(String, String)>>>,
}

#[allow(dead_code)]
impl MockRouter {
    pub async fn start() -> MockRouter {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let idle = Arc::new(AtomicUsize::new(0));
        let peak_idle = Arc::new(AtomicUsize::new(0));
        let accepted = Arc::new(AtomicUsize::new(0));
        let handshakes = Arc::new(StdMutex::new(Vec::new()));

        {
            let idle = idle.clone();
            let peak_idle = peak_idle.clone();
            let accepted = accepted.clone();
            let handshakes = handshakes.clone();

            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };

                    let handshakes = handshakes.clone();
                    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                        let header = |name: &str| {
                            req.headers()
                                .get(name)
                                .and_then(|v| v.to_str().ok())
                                .unwrap_or_default()
                                .to_string()
                        };
                        handshakes
                            .lock()
                            .unwrap()
                            .push((header("CrankerProtocol"), header("Route")));
                        Ok(resp)
                    };

                    if let Ok(ws) = accept_hdr_async(stream, callback).await {
                        accepted.fetch_add(1, Ordering::SeqCst);
                        let now = idle.fetch_add(1, Ordering::SeqCst) + 1;
                        peak_idle.fetch_max(now, Ordering::SeqCst);
                        if tx.send(RouterSocket { ws }).is_err() {
                            break;
                        }
                    }
                }
            });
        }

        MockRouter {
            addr,
            sockets: Mutex::new(rx),
            idle,
            peak_idle,
            accepted,
            handshakes,
        }
    }

    pub fn register_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Pop the next idle registration, ready to be dispatched a request.
    pub async fn next_socket(&self) -> RouterSocket {
        let mut rx = self.sockets.lock().await;
        let socket = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a registration")
            .expect("router accept loop gone");
        self.idle.fetch_sub(1, Ordering::SeqCst);
        socket
    }
}

/// One registered connector socket, as the router sees it.
pub struct RouterSocket {
    ws: WebSocketStream<TcpStream>,
}

#[allow(dead_code)]
impl RouterSocket {
    pub async fn send_text(&mut self, payload: &str) {
        self.ws.send(Message::text(payload.to_string())).await.unwrap();
    }

    pub async fn send_binary(&mut self, payload: &[u8]) {
        self.ws.send(Message::binary(payload.to_vec())).await.unwrap();
    }

    /// Dispatch a request head frame; `marker` is `"_1"` or `"_2"`.
    pub async fn send_request_head(&mut self, head: &str, marker: &str) {
        self.send_text(&format!("{head}{marker}")).await;
    }

    pub async fn send_body_end(&mut self) {
        self.send_text("_3").await;
    }

    /// Collect the response: the head text frame and the concatenation of
    /// binary frames, until the connector closes the socket. `None` when the
    /// socket closes before any head arrives.
    pub async fn read_response(mut self) -> Option<(String, Vec<u8>)> {
        let mut head = None;
        let mut body = Vec::new();

        let collect = async {
            while let Some(msg) = self.ws.next().await {
                match msg {
                    Ok(Message::Text(t)) => head = Some(t.to_string()),
                    Ok(Message::Binary(b)) => body.extend_from_slice(&b),
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(15), collect)
            .await
            .expect("timed out reading response");

        head.map(|head| (head, body))
    }

    /// True when the connector closes the socket without sending anything.
    pub async fn wait_closed(mut self) -> bool {
        let next_data = async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Text(_) | Message::Binary(_))) => return false,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return true,
                    Some(Ok(_)) => continue,
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), next_data)
            .await
            .expect("timed out waiting for close")
    }
}

/// Spawn the local service under test on an ephemeral port.
#[allow(dead_code)]
pub async fn start_mock_service() -> SocketAddr {
    let app = Router::new()
        .route("/get", get(|| async { "world" }))
        .route("/echo", post(|body: axum::body::Bytes| async move { body }))
        .route("/slow/{ms}", get(slow))
        .route("/big", get(big));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn slow(Path(ms): Path<u64>) -> &'static str {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    "done"
}

/// Echoes the length of the `x-big` request header and responds with a
/// response header well past the scratch-slab size.
async fn big(headers: HeaderMap) -> ([(&'static str, String); 1], String) {
    let len = headers.get("x-big").map(|v| v.len()).unwrap_or(0);
    ([("x-big-echo", "y".repeat(9_000))], format!("{len}"))
}

/// Poll `cond` until it holds or a 5 s deadline passes.
#[allow(dead_code)]
pub async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}
