//! Cooperative shutdown signal.
//!
//! The registry requests shutdown when the last session goes idle; the
//! server loop observes the request and stops accepting. Nothing here
//! kills the process, so embedders can run several servers in one
//! runtime or ignore the signal entirely.

use tokio::sync::watch;

/// Cloneable shutdown handle backed by a watch channel.
#[derive(Clone)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    /// Flag shutdown. Idempotent.
    pub fn request(&self) {
        let _ = self.tx.send(true);
    }

    pub fn requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been requested.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
