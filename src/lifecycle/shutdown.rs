//! Shutdown coordination.

use std::time::Duration;

use tokio::sync::watch;

/// Owner side of a cancellation scope.
///
/// Long-running tasks hold a [`Signal`] and stop when it fires. Triggering is
/// idempotent and observable by subscribers created afterwards.
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Subscribe to the cancellation signal.
    pub fn signal(&self) -> Signal {
        Signal {
            rx: self.tx.subscribe(),
        }
    }

    /// Fire the signal. Subscribers created afterwards still observe it.
    pub fn trigger(&self) {
        // send_replace stores the value even when no subscriber exists yet.
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscriber side of a cancellation scope. Cheap to clone.
#[derive(Clone)]
pub struct Signal {
    rx: watch::Receiver<bool>,
}

impl Signal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the scope is cancelled. A dropped owner counts as
    /// cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Derive a child signal that fires `period` after this one.
    ///
    /// The child is what a worker hands to its serving phase: when the
    /// parent fires the request keeps running for up to `period`, then the
    /// child fires and all remaining I/O is abandoned.
    pub fn with_grace(&self, period: Duration) -> Signal {
        let (tx, rx) = watch::channel(false);
        let parent = self.clone();

        tokio::spawn(async move {
            parent.cancelled().await;
            tokio::time::sleep(period).await;
            tx.send_replace(true);
        });

        Signal { rx }
    }
}
