//! Cranker connector CLI.
//!
//! Registers a local HTTP service with one or more cranker routers and
//! serves until interrupted.

use std::net::SocketAddr;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cranker_connector::{Connector, ConnectorConfig};

#[derive(Parser)]
#[command(name = "cranker-connector")]
#[command(about = "Reverse-tunnel connector for the cranker routing fabric", long_about = None)]
struct Cli {
    /// Router register URL (repeat for multiple routers).
    #[arg(long = "router", required = true)]
    routers: Vec<String>,

    /// Route name the service is published under.
    #[arg(long)]
    service_name: String,

    /// Base URL of the local service.
    #[arg(long)]
    service_url: String,

    /// Idle registrations to keep per router.
    #[arg(long, default_value_t = 2)]
    window: usize,

    /// Grace period for in-flight requests on shutdown, in milliseconds.
    #[arg(long, default_value_t = 5_000)]
    shutdown_timeout_ms: u64,

    /// Rediscovery period in milliseconds; 0 discovers once.
    #[arg(long, default_value_t = 0)]
    rediscovery_interval_ms: u64,

    /// Skip TLS certificate verification on both clients.
    #[arg(long)]
    insecure: bool,

    /// Expose Prometheus metrics on this address.
    #[arg(long)]
    metrics_address: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cranker_connector=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    if let Some(addr) = cli.metrics_address {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;
        tracing::info!(address = %addr, "metrics server listening");
    }

    let mut connector = Connector::new(ConnectorConfig {
        service_name: cli.service_name.clone(),
        service_url: cli.service_url.clone(),
        shutdown_timeout_ms: cli.shutdown_timeout_ms,
        rediscovery_interval_ms: cli.rediscovery_interval_ms,
    });

    if cli.insecure {
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .build()?;
        let service_client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()?;
        connector = connector
            .with_wss_connector(cranker_connector::connector::WsConnector::NativeTls(tls))
            .with_service_client(service_client);
    }

    let routers = cli.routers.clone();
    connector.connect(move || routers.clone(), cli.window)?;

    tracing::info!(
        routers = ?cli.routers,
        service_name = %cli.service_name,
        service_url = %cli.service_url,
        window = cli.window,
        "connector running, press ctrl-c to stop"
    );

    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down...");
    connector.shutdown().await;
    tracing::info!("shutdown finished");

    Ok(())
}
