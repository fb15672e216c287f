//! Connector subsystem.
//!
//! # Data Flow
//! ```text
//! Connect(discover, window):
//!     discovery task ── every rediscovery interval ──▶ discover()
//!         new URLs ──▶ launch queue ──▶ launch task ──▶ RouterEngine
//!         vanished URLs ──▶ engine removed from map, shut down
//!
//! Shutdown():
//!     root signal ──▶ discovery/launch tasks stop
//!     engine map drained ──▶ every engine shut down in parallel
//! ```
//!
//! # Design Decisions
//! - `connect` returns as soon as the background tasks are launched; it
//!   never waits for a socket to become ready
//! - The engine map mutex is held only across insertion/removal; engines
//!   are never touched under the lock
//! - Discovery diffs are applied in the order discovery returns them

pub mod engine;
mod worker;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;
use url::Url;

pub use engine::{EngineError, RouterEngine};
pub use tokio_tungstenite::Connector as WsConnector;

use crate::config::validation::validate_config;
use crate::config::{ConfigError, ConnectorConfig};
use crate::lifecycle::Shutdown;
use crate::pool::{BufferPool, SlabPool};

/// How many router URLs may sit in the launch queue before discovery blocks.
const LAUNCH_QUEUE_DEPTH: usize = 10;

/// Connects a local service to a changing set of cranker routers.
///
/// ```no_run
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// use cranker_connector::{Connector, ConnectorConfig};
///
/// let connector = Connector::new(ConnectorConfig {
///     service_name: "demo".into(),
///     service_url: "http://127.0.0.1:3000".into(),
///     ..Default::default()
/// });
///
/// connector.connect(|| vec!["wss://router:16488/register".into()], 2)?;
/// // ... serve until it is time to leave ...
/// connector.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Connector {
    config: ConnectorConfig,
    wss_connector: Option<WsConnector>,
    service_client: Option<reqwest::Client>,
    root: Shutdown,
    engines: Arc<Mutex<HashMap<String, Arc<RouterEngine>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    buffers: Arc<BufferPool>,
    slabs: Arc<SlabPool>,
    started: AtomicBool,
}

impl Connector {
    pub fn new(config: ConnectorConfig) -> Self {
        Self {
            config,
            wss_connector: None,
            service_client: None,
            root: Shutdown::new(),
            engines: Arc::new(Mutex::new(HashMap::new())),
            tasks: Mutex::new(Vec::new()),
            buffers: Arc::new(BufferPool::new()),
            slabs: Arc::new(SlabPool::new()),
            started: AtomicBool::new(false),
        }
    }

    /// TLS setup for the router-facing WebSocket handshake. Defaults to a
    /// plain connection for `ws://` and library-default TLS for `wss://`.
    pub fn with_wss_connector(mut self, wss_connector: WsConnector) -> Self {
        self.wss_connector = Some(wss_connector);
        self
    }

    /// HTTP client used to call the local service. Defaults to a plain
    /// client.
    pub fn with_service_client(mut self, client: reqwest::Client) -> Self {
        self.service_client = Some(client);
        self
    }

    /// Validate the configuration and start the discovery and engine-launch
    /// tasks. Returns once they are running; no dial is awaited.
    pub fn connect<D>(&self, discover: D, sliding_window: usize) -> Result<(), ConfigError>
    where
        D: Fn() -> Vec<String> + Send + Sync + 'static,
    {
        let service_url = validate_config(&self.config, sliding_window)?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ConfigError::AlreadyStarted);
        }

        let (launch_tx, launch_rx) = mpsc::channel::<String>(LAUNCH_QUEUE_DEPTH);

        {
            let mut tasks = self.tasks.lock().expect("task list poisoned");
            tasks.push(self.spawn_discovery(discover, launch_tx));
            tasks.push(self.spawn_launcher(service_url, sliding_window, launch_rx));
        }

        info!(
            service_name = %self.config.service_name,
            service_url = %self.config.service_url,
            "connector started"
        );

        Ok(())
    }

    /// Shut every engine down in parallel and wait for all of them. After
    /// this returns the engine map is empty, the discovery and launch tasks
    /// have exited, and in-flight requests have either finished or been
    /// cancelled past the grace period.
    pub async fn shutdown(&self) {
        self.root.trigger();

        // The discovery and launch tasks stop at their next select point;
        // wait for them so no engine can be launched behind the drain.
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().expect("task list poisoned");
            tasks.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }

        let drained: Vec<Arc<RouterEngine>> = {
            let mut map = self.engines.lock().expect("engine map poisoned");
            map.drain().map(|(_, engine)| engine).collect()
        };

        join_all(drained.iter().map(|engine| engine.shutdown())).await;

        info!("connector shutdown complete");
    }

    fn spawn_discovery<D>(&self, discover: D, launch_tx: mpsc::Sender<String>) -> JoinHandle<()>
    where
        D: Fn() -> Vec<String> + Send + Sync + 'static,
    {
        let engines = self.engines.clone();
        let sig = self.root.signal();
        let interval = self.config.rediscovery_interval();

        tokio::spawn(async move {
            loop {
                let urls = discover();
                let latest: HashSet<String> = urls.iter().cloned().collect();

                for url in urls {
                    let known = engines
                        .lock()
                        .expect("engine map poisoned")
                        .contains_key(&url);
                    if known {
                        continue;
                    }
                    // The queue is bounded; a full one must not hold this
                    // task past shutdown.
                    tokio::select! {
                        _ = sig.cancelled() => return,
                        sent = launch_tx.send(url) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }

                let removed: Vec<Arc<RouterEngine>> = {
                    let mut map = engines.lock().expect("engine map poisoned");
                    let stale: Vec<String> = map
                        .keys()
                        .filter(|url| !latest.contains(*url))
                        .cloned()
                        .collect();
                    stale.iter().filter_map(|url| map.remove(url)).collect()
                };
                for engine in removed {
                    info!(
                        register_url = %engine.register_url(),
                        "router no longer discovered, shutting engine down"
                    );
                    tokio::spawn(async move { engine.shutdown().await });
                }

                let Some(interval) = interval else {
                    // One sweep only; dropping the sender closes the queue.
                    return;
                };
                tokio::select! {
                    _ = sig.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        })
    }

    fn spawn_launcher(
        &self,
        service_url: Url,
        sliding_window: usize,
        mut launch_rx: mpsc::Receiver<String>,
    ) -> JoinHandle<()> {
        let engines = self.engines.clone();
        let sig = self.root.signal();
        let service_name = self.config.service_name.clone();
        let shutdown_timeout = self.config.shutdown_timeout();
        let wss_connector = self.wss_connector.clone();
        let service_client = self.service_client.clone().unwrap_or_default();
        let buffers = self.buffers.clone();
        let slabs = self.slabs.clone();

        tokio::spawn(async move {
            loop {
                let url = tokio::select! {
                    _ = sig.cancelled() => return,
                    url = launch_rx.recv() => match url {
                        Some(url) => url,
                        None => return,
                    },
                };

                let engine = Arc::new(RouterEngine::new(
                    url.clone(),
                    service_name.clone(),
                    service_url.clone(),
                    sliding_window,
                    shutdown_timeout,
                    wss_connector.clone(),
                    service_client.clone(),
                    buffers.clone(),
                    slabs.clone(),
                ));

                {
                    let mut map = engines.lock().expect("engine map poisoned");
                    // Shutdown drains the map under this lock; checking the
                    // signal while holding it means an engine is either
                    // drained there or never inserted here.
                    if sig.is_cancelled() {
                        return;
                    }
                    // A sweep may have re-enqueued a URL the launcher already
                    // handled; the first engine wins.
                    if map.contains_key(&url) {
                        continue;
                    }
                    map.insert(url.clone(), engine.clone());
                }

                tokio::spawn(async move {
                    match engine.connect_and_serve().await {
                        EngineError::Cancelled => {
                            info!(register_url = %url, "engine exiting gracefully");
                        }
                    }
                });
            }
        })
    }

    /// Number of engines currently running. Mostly useful in tests and
    /// health endpoints.
    pub fn engine_count(&self) -> usize {
        self.engines.lock().expect("engine map poisoned").len()
    }
}
