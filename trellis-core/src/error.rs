//! Error types for the trellis runtime.
//!
//! The taxonomy mirrors how failures are recovered:
//!
//! - [`Error::Render`]: a dynamic child or dirty node failed while building
//!   HTML. Recovered inline during page renders, aborts the whole batch
//!   during update collection.
//! - [`Error::Callback`]: an event handler failed. Reported to the client
//!   as a protocol error message; the session survives.
//! - [`Error::Transport`]: a write to a stale connection failed. The
//!   connection is pruned silently.
//! - [`Error::NodeGone`]: a node key outlived its slot (stale generation).

use crate::tree::NodeKey;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A dynamic child producer or node render failed.
    #[error("render failed for node {id}: {detail}")]
    Render { id: String, detail: String },

    /// An event callback failed (or one of its steps did).
    #[error("callback failed: {0}")]
    Callback(String),

    /// A transport write was refused.
    #[error("transport write failed")]
    Transport,

    /// A wire message could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    /// Socket or listener failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A node key refers to a freed arena slot.
    #[error("node {0:?} no longer exists")]
    NodeGone(NodeKey),
}

impl Error {
    /// Build a callback error from any displayable value.
    ///
    /// Handy inside event handlers: `return Err(Error::callback("boom"))`.
    pub fn callback(detail: impl std::fmt::Display) -> Self {
        Error::Callback(detail.to_string())
    }

    pub(crate) fn render(id: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        Error::Render {
            id: id.into(),
            detail: detail.to_string(),
        }
    }
}
