//! Metrics collection.

use metrics::{counter, gauge};

/// Record the outcome of one WebSocket dial attempt.
pub fn record_dial(router: &str, success: bool) {
    let labels = [
        ("router", router.to_string()),
        ("outcome", if success { "ok" } else { "error" }.to_string()),
    ];

    counter!("cranker_dials_total", &labels).increment(1);
}

/// Track how many idle registrations a router currently holds.
pub fn record_idle_registrations(router: &str, delta: i64) {
    gauge!("cranker_idle_registrations", "router" => router.to_string()).increment(delta as f64);
}

/// Record a proxied exchange and its response status.
pub fn record_request_proxied(router: &str, status: u16) {
    let labels = [
        ("router", router.to_string()),
        ("status", status.to_string()),
    ];

    counter!("cranker_requests_total", &labels).increment(1);
}
