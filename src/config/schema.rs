//! Configuration schema definitions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the connector.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Route name the service is published under at the router.
    /// An incoming request to `/<service_name>/rest` is forwarded as `/rest`.
    pub service_name: String,

    /// Base URL of the local service (scheme, host, port, optional path).
    pub service_url: String,

    /// Grace extended to in-flight requests once shutdown starts, in
    /// milliseconds. Requests still running past the grace are cancelled.
    pub shutdown_timeout_ms: u64,

    /// Period between discovery sweeps, in milliseconds. Zero means discover
    /// once and never again.
    pub rediscovery_interval_ms: u64,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            service_name: String::new(),
            service_url: String::new(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            rediscovery_interval_ms: 0,
        }
    }
}

fn default_shutdown_timeout_ms() -> u64 {
    5_000
}

impl ConnectorConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// `None` when rediscovery is disabled.
    pub fn rediscovery_interval(&self) -> Option<Duration> {
        match self.rediscovery_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}
