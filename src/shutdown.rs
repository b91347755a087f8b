//! Kill-signal coordination for Cairn tasks.
//!
//! The kill channel is the single cancellation primitive in the protocol
//! stack: every potentially-unbounded wait selects on it. Sending a kill
//! never blocks; receivers close their owned resources (pipes, child
//! tasks) and return, which cascades cancellation across connected peers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// A cloneable kill handle shared by a supervisor and its tasks.
#[derive(Clone)]
pub struct Kill {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
    fired: Arc<AtomicBool>,
}

impl Kill {
    /// Create a new, unfired kill handle.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Fire the kill signal. Idempotent; never blocks.
    pub fn kill(&self) {
        if self
            .fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let _ = self.tx.send(true);
        }
    }

    /// Check whether the kill signal has fired.
    pub fn is_killed(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Wait for the kill signal (for use in `select!` arms).
    pub async fn killed(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

impl Default for Kill {
    fn default() -> Self {
        Self::new()
    }
}

/// OS signal handler that fires a kill handle on termination signals.
pub struct SignalHandler {
    kill: Kill,
}

impl SignalHandler {
    pub fn new(kill: Kill) -> Self {
        Self { kill }
    }

    /// Install signal handlers and wait; fires the kill on the first
    /// termination signal.
    #[cfg(unix)]
    pub async fn run(self) {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }

        self.kill.kill();
    }

    #[cfg(windows)]
    pub async fn run(self) {
        tokio::signal::ctrl_c().await.expect("install Ctrl+C handler");
        info!("received Ctrl+C");
        self.kill.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_kill_fires_once() {
        let kill = Kill::new();
        assert!(!kill.is_killed());

        kill.kill();
        kill.kill();
        assert!(kill.is_killed());
    }

    #[tokio::test]
    async fn test_killed_wakes_waiter() {
        let kill = Kill::new();
        let waiter = kill.clone();

        let task = tokio::spawn(async move { waiter.killed().await });
        kill.kill();

        tokio::time::timeout(Duration::from_millis(100), task)
            .await
            .expect("waiter woke")
            .unwrap();
    }

    #[tokio::test]
    async fn test_killed_returns_immediately_after_fire() {
        let kill = Kill::new();
        kill.kill();
        tokio::time::timeout(Duration::from_millis(50), kill.killed())
            .await
            .expect("already-fired kill resolves immediately");
    }
}
