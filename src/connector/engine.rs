//! Per-router connection engine.
//!
//! # Responsibilities
//! - Keep up to N workers registered against one router URL
//! - Replace a worker as soon as it receives its request (sliding window)
//! - Drain every spawned worker before its own termination completes
//!
//! # Design Decisions
//! - A counting semaphore is the only concurrency control; the worker owns
//!   its permit and drops it at header-read time
//! - Worker failures never touch sibling workers; the engine just dials a
//!   replacement
//! - Termination is two-phase: stop acquiring, then drain the join set

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_tungstenite::Connector as WsConnector;
use tracing::{error, info, warn};
use url::Url;

use crate::connector::worker::{WorkerError, WssWorker};
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::pool::{BufferPool, SlabPool};
use crate::resilience::RetryError;

/// Why the control loop stopped. The only way it stops is cancellation.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine cancelled")]
    Cancelled,
}

/// Maintains a sliding window of idle registrations against one router.
pub struct RouterEngine {
    register_url: String,
    service_name: String,
    service_url: Url,
    sliding_window: usize,
    shutdown_timeout: Duration,
    wss_connector: Option<WsConnector>,
    service_client: reqwest::Client,
    buffers: Arc<BufferPool>,
    slabs: Arc<SlabPool>,
    cancel: Shutdown,
    done: watch::Sender<bool>,
}

impl RouterEngine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        register_url: String,
        service_name: String,
        service_url: Url,
        sliding_window: usize,
        shutdown_timeout: Duration,
        wss_connector: Option<WsConnector>,
        service_client: reqwest::Client,
        buffers: Arc<BufferPool>,
        slabs: Arc<SlabPool>,
    ) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            register_url,
            service_name,
            service_url,
            sliding_window,
            shutdown_timeout,
            wss_connector,
            service_client,
            buffers,
            slabs,
            cancel: Shutdown::new(),
            done,
        }
    }

    pub fn register_url(&self) -> &str {
        &self.register_url
    }

    /// Run the acquire-and-spawn loop until [`shutdown`](Self::shutdown) is
    /// called, then drain every outstanding worker.
    pub async fn connect_and_serve(&self) -> EngineError {
        info!(
            register_url = %self.register_url,
            service_name = %self.service_name,
            sliding_window = self.sliding_window,
            "connect_and_serve starting"
        );

        let slots = Arc::new(Semaphore::new(self.sliding_window));
        let mut workers: JoinSet<()> = JoinSet::new();
        let sig = self.cancel.signal();

        loop {
            tokio::select! {
                biased;
                _ = sig.cancelled() => break,
                permit = slots.clone().acquire_owned() => {
                    let Ok(permit) = permit else { break };
                    self.spawn_worker(&mut workers, permit);
                }
                // Reap finished workers so the set does not accumulate.
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = joined {
                        error!(register_url = %self.register_url, err = %e, "worker task panicked");
                    }
                }
            }
        }

        info!(register_url = %self.register_url, "terminating, draining workers");
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(register_url = %self.register_url, err = %e, "worker task panicked");
            }
        }
        // send_replace stores the value even with no subscriber yet; a
        // shutdown() arriving later must still observe completion.
        self.done.send_replace(true);

        EngineError::Cancelled
    }

    /// Cancel the control loop and block until every spawned worker has
    /// exited.
    pub async fn shutdown(&self) {
        info!(register_url = %self.register_url, "shutting down");
        self.cancel.trigger();

        let mut done = self.done.subscribe();
        let _ = done.wait_for(|finished| *finished).await;
    }

    fn spawn_worker(&self, workers: &mut JoinSet<()>, permit: OwnedSemaphorePermit) {
        let worker = WssWorker::new(
            self.register_url.clone(),
            self.service_name.clone(),
            self.service_url.clone(),
            self.shutdown_timeout,
            self.wss_connector.clone(),
            self.service_client.clone(),
            self.buffers.clone(),
            self.slabs.clone(),
        );
        let sig = self.cancel.signal();
        let register_url = self.register_url.clone();

        workers.spawn(async move {
            let ws = match worker.dial(&sig).await {
                Ok(ws) => ws,
                Err(RetryError::EndOfRetry) => return,
                Err(RetryError::Exhausted(e)) => {
                    warn!(register_url = %register_url, err = %e, "giving up dialing router");
                    return;
                }
            };

            metrics::record_idle_registrations(&register_url, 1);

            match worker.serve(&sig, permit, ws).await {
                Ok(()) => {}
                Err(WorkerError::Cancelled) => {
                    info!(register_url = %register_url, "worker exiting on shutdown");
                }
                Err(e) => {
                    error!(register_url = %register_url, err = %e, "worker failed");
                }
            }
        });
    }
}
