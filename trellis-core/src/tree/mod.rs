//! The server-owned tag tree.
//!
//! Nodes live in a generational [`arena`]; [`Document`] owns the arena and
//! enforces the structural invariants; [`Tree`] is the shared handle that
//! sessions, transports, and application callbacks clone freely.

mod arena;
mod document;
mod node;

pub use arena::{Arena, NodeKey};
pub use document::{DirtyInbox, Document, Tree};
pub use node::{AttrValue, BindingAction, Child, EventBinding, LifecycleHook, Producer, TagNode};
