//! Trellis Core
//!
//! This crate provides the core runtime for the Trellis server-driven UI
//! framework. The server owns the entire interface as a tree of tag
//! nodes; the browser runs a small bridge script and does nothing but
//! report events and apply `outerHTML` patches. It implements:
//!
//! - The server-owned tag tree with dirty tracking and lifecycle hooks
//! - Reactive cells that mark their observing nodes dirty on write
//! - HTML rendering and minimal update collection
//! - Per-browser sessions with a multi-transport sync protocol
//!   (WebSocket primary, SSE + POST fallback)
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `tree`: the tag node arena, document operations, and the shared
//!   [`Tree`] handle
//! - `reactive`: [`Cell`] values and the render [`Scope`]
//! - `render` / `reconcile`: HTML output and dirty-node collection
//! - `event`: event objects and the three handler shapes
//! - `session`: per-browser sessions and the registry
//! - `transport`: the HTTP server, wire protocol, and bridge script
//!
//! # Example
//!
//! ```rust,ignore
//! use trellis_core::{AppSource, Cell, Handler, Server, ServerConfig, Tree, View};
//!
//! let source = AppSource::factory(|| {
//!     let tree = Tree::body();
//!     let count = Cell::new(0i64);
//!     tree.update(|doc| {
//!         let root = doc.root();
//!         let label = doc.create("span");
//!         let reader = count.clone();
//!         doc.append_dynamic(label, move |scope| Ok(View::text(reader.get(scope))));
//!         let button = doc.create("button");
//!         doc.append_text(button, "+1");
//!         let bumper = count.clone();
//!         doc.bind(button, "click", Handler::direct(move |_ev| {
//!             bumper.update(|v| v + 1);
//!             Ok(())
//!         }));
//!         doc.append_child(root, label);
//!         doc.append_child(root, button);
//!     });
//!     tree
//! });
//!
//! Server::new(source, ServerConfig::default()).run().await?;
//! ```

pub mod error;
pub mod event;
pub mod reactive;
pub mod reconcile;
pub(crate) mod render;
pub mod session;
pub mod shutdown;
pub mod transport;
pub mod tree;

pub use error::{Error, Result};
pub use event::{EventResult, Handler, Stepper, TagEvent};
pub use reactive::{Cell, Scope, View};
pub use reconcile::UpdateBatch;
pub use session::{AppSource, Registry, Session};
pub use shutdown::Shutdown;
pub use transport::{ClientEvent, Server, ServerConfig, ServerMessage, Transport, TransportKind};
pub use tree::{AttrValue, Document, EventBinding, NodeKey, Tree};
