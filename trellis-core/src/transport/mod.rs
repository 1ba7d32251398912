//! Transports: the write half of a connected browser.
//!
//! A session can hold several transports at once (several tabs, or a
//! WebSocket plus an SSE fallback during a reconnect window). Each
//! transport is an unbounded string channel; the owning connection task
//! drains the channel into its socket, so broadcasting never blocks on a
//! slow client.

mod bridge;
mod http;
mod protocol;

pub use bridge::BRIDGE_JS;
pub use http::{Server, ServerConfig};
pub use protocol::{ClientEvent, ServerMessage};

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

static TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// How the browser is connected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    /// Bidirectional WebSocket.
    Primary,
    /// SSE downstream; events arrive separately over POST.
    Fallback,
}

/// Write handle for one connected browser.
#[derive(Clone, Debug)]
pub struct Transport {
    id: u64,
    kind: TransportKind,
    tx: mpsc::UnboundedSender<String>,
}

impl Transport {
    /// A transport plus the receiver its connection task drains.
    pub fn channel(kind: TransportKind) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: TRANSPORT_ID.fetch_add(1, Ordering::Relaxed),
                kind,
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Queue a message. Returns `false` when the connection is gone and
    /// the transport should be pruned.
    pub fn send(&self, message: &str) -> bool {
        self.tx.send(message.to_string()).is_ok()
    }

    /// Resolves when the connection task drops its receiver.
    pub async fn closed(&self) {
        self.tx.closed().await;
    }
}
