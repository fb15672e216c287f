//! End-to-end exchanges against a mock router and a mock service.

use std::sync::atomic::Ordering;
use std::time::Duration;

use cranker_connector::{Connector, ConnectorConfig};

mod common;
use common::{start_mock_service, MockRouter};

fn test_connector(service: std::net::SocketAddr, router_url: String, window: usize) -> Connector {
    let connector = Connector::new(ConnectorConfig {
        service_name: "test".into(),
        service_url: format!("http://{service}"),
        shutdown_timeout_ms: 3_000,
        rediscovery_interval_ms: 0,
    });
    connector
        .connect(move || vec![router_url.clone()], window)
        .unwrap();
    connector
}

#[tokio::test]
async fn test_get_request_without_body() {
    let service = start_mock_service().await;
    let router = MockRouter::start().await;
    let connector = test_connector(service, router.register_url(), 2);

    let mut socket = router.next_socket().await;
    socket
        .send_request_head(
            "GET /test/get HTTP/1.1\r\nHost: localhost\r\nX-Probe: smoke\r\n\r\n",
            "_2",
        )
        .await;

    let (head, body) = socket.read_response().await.expect("no response");
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head was: {head}");
    assert!(head.ends_with("\r\n\r\n"));
    assert_eq!(body, b"world");

    // The handshake carried the registration headers.
    {
        let handshakes = router.handshakes.lock().unwrap();
        assert!(!handshakes.is_empty());
        assert!(handshakes
            .iter()
            .all(|(proto, route)| proto == "1.0" && route == "test"));
    }

    connector.shutdown().await;
    assert_eq!(connector.engine_count(), 0);
}

#[tokio::test]
async fn test_post_request_with_streamed_body() {
    let service = start_mock_service().await;
    let router = MockRouter::start().await;
    let connector = test_connector(service, router.register_url(), 2);

    let mut socket = router.next_socket().await;
    socket
        .send_request_head(
            "POST /test/echo HTTP/1.1\r\nHost: localhost\r\nContent-Length: 11\r\n\r\n",
            "_1",
        )
        .await;
    socket.send_binary(b"hello ").await;
    socket.send_binary(b"world").await;
    socket.send_body_end().await;

    let (head, body) = socket.read_response().await.expect("no response");
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head was: {head}");
    assert_eq!(body, b"hello world");

    connector.shutdown().await;
}

#[tokio::test]
async fn test_large_header_blocks_roundtrip() {
    let service = start_mock_service().await;
    let router = MockRouter::start().await;
    let connector = test_connector(service, router.register_url(), 2);

    // Request header block well past the 8 KiB scratch size in one value.
    let big = "a".repeat(16 * 1024);
    let mut socket = router.next_socket().await;
    socket
        .send_request_head(
            &format!("GET /test/big HTTP/1.1\r\nHost: localhost\r\nX-Big: {big}\r\n\r\n"),
            "_2",
        )
        .await;

    let (head, body) = socket.read_response().await.expect("no response");
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head was: {head}");
    // The service saw the full header value...
    assert_eq!(body, b"16384");
    // ...and its own oversized response header came back intact.
    assert!(head.contains(&format!("x-big-echo: {}", "y".repeat(9_000))));

    connector.shutdown().await;
}

#[tokio::test]
async fn test_sequential_requests_stay_within_window() {
    let service = start_mock_service().await;
    let router = MockRouter::start().await;
    let connector = test_connector(service, router.register_url(), 2);

    for i in 0..60 {
        let mut socket = router.next_socket().await;
        socket
            .send_request_head("GET /test/get HTTP/1.1\r\nHost: localhost\r\n\r\n", "_2")
            .await;
        let (head, body) = socket
            .read_response()
            .await
            .unwrap_or_else(|| panic!("request {i} got no response"));
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(body, b"world");

        tokio::time::sleep(Duration::from_micros(100)).await;
    }

    // Replacements dial while exchanges stream, yet the window cap holds.
    assert!(router.peak_idle.load(Ordering::SeqCst) <= 2);
    assert!(router.accepted.load(Ordering::SeqCst) >= 60);

    connector.shutdown().await;
}

#[tokio::test]
async fn test_protocol_error_closes_socket_and_replaces_worker() {
    let service = start_mock_service().await;
    let router = MockRouter::start().await;
    let connector = test_connector(service, router.register_url(), 1);

    // A binary frame before any request head violates the framing.
    let mut socket = router.next_socket().await;
    socket.send_binary(b"not a request").await;
    assert!(socket.wait_closed().await);

    // The engine dials a replacement, and that one serves normally.
    let mut replacement = router.next_socket().await;
    replacement
        .send_request_head("GET /test/get HTTP/1.1\r\nHost: localhost\r\n\r\n", "_2")
        .await;
    let (head, body) = replacement.read_response().await.expect("no response");
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"world");

    connector.shutdown().await;
}

#[tokio::test]
async fn test_downstream_failure_synthesizes_error_page() {
    // Point the connector at a dead service port.
    let router = MockRouter::start().await;
    let connector = Connector::new(ConnectorConfig {
        service_name: "test".into(),
        service_url: "http://127.0.0.1:9".into(),
        shutdown_timeout_ms: 3_000,
        rediscovery_interval_ms: 0,
    });
    let url = router.register_url();
    connector.connect(move || vec![url.clone()], 1).unwrap();

    let mut socket = router.next_socket().await;
    socket
        .send_request_head("GET /test/get HTTP/1.1\r\nHost: localhost\r\n\r\n", "_2")
        .await;

    let (head, body) = socket.read_response().await.expect("no response");
    assert!(head.starts_with("HTTP/1.1 500 Server Error\r\n"), "head was: {head}");
    let body = String::from_utf8(body).unwrap();
    assert!(body.starts_with("errorId="), "body was: {body}");
    assert!(body.ends_with('\n'));

    connector.shutdown().await;
}
