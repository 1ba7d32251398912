//! Render scope.
//!
//! The scope tracks which node is currently rendering so reactive cell
//! reads can register it as an observer. Unlike ambient thread-local
//! tracking, the scope is passed explicitly: the renderer pushes the
//! owning node onto the context stack before invoking a dynamic child,
//! and [`Cell::get`](super::Cell::get) consults the scope it is handed.
//!
//! This keeps dependency tracking visible in signatures and safe under
//! any threading model.

use std::sync::Weak;

use crate::tree::{DirtyInbox, Document, NodeKey};

/// Per-pass render context: the current-renderer stack plus policy flags.
pub struct RenderCx {
    pub(crate) stack: Vec<NodeKey>,
    pub(crate) inbox: Weak<DirtyInbox>,
    pub(crate) debug: bool,
    /// Lenient passes (full page loads) replace producer failures with an
    /// inline error fragment; strict passes (update collection) propagate.
    pub(crate) lenient: bool,
}

impl RenderCx {
    pub(crate) fn new(inbox: Weak<DirtyInbox>, debug: bool, lenient: bool) -> Self {
        Self {
            stack: Vec::new(),
            inbox,
            debug,
            lenient,
        }
    }
}

/// What a dynamic child producer sees while it runs: mutable access to the
/// document (to build nodes) plus the tracking context (so cell reads
/// observe the right node).
pub struct Scope<'a> {
    pub(crate) doc: &'a mut Document,
    pub(crate) cx: &'a RenderCx,
}

impl<'a> Scope<'a> {
    /// The document, for creating or inspecting nodes mid-render.
    pub fn doc(&mut self) -> &mut Document {
        self.doc
    }

    /// The node currently being rendered, if any.
    pub fn current(&self) -> Option<NodeKey> {
        self.cx.stack.last().copied()
    }

    /// Whether a key still points at a live node in this document.
    pub fn contains(&self, key: NodeKey) -> bool {
        self.doc.contains(key)
    }

    /// Whether the session is running in debug mode.
    pub fn debug(&self) -> bool {
        self.cx.debug
    }

    pub(crate) fn inbox(&self) -> Weak<DirtyInbox> {
        self.cx.inbox.clone()
    }
}

/// The value a dynamic child producer yields.
///
/// Scalars, nodes, and nested sequences are all permitted; the renderer
/// flattens the result in order.
pub enum View {
    Empty,
    Text(String),
    Node(NodeKey),
    Many(Vec<View>),
}

impl View {
    /// Render any displayable value as a text fragment.
    pub fn text(value: impl std::fmt::Display) -> Self {
        View::Text(value.to_string())
    }

    pub(crate) fn flatten_into(self, out: &mut Vec<ViewFrag>) {
        match self {
            View::Empty => {}
            View::Text(text) => out.push(ViewFrag::Text(text)),
            View::Node(key) => out.push(ViewFrag::Node(key)),
            View::Many(items) => {
                for item in items {
                    item.flatten_into(out);
                }
            }
        }
    }
}

impl From<&str> for View {
    fn from(v: &str) -> Self {
        View::Text(v.to_string())
    }
}

impl From<String> for View {
    fn from(v: String) -> Self {
        View::Text(v)
    }
}

impl From<NodeKey> for View {
    fn from(v: NodeKey) -> Self {
        View::Node(v)
    }
}

impl From<Vec<View>> for View {
    fn from(v: Vec<View>) -> Self {
        View::Many(v)
    }
}

/// A flattened producer result entry.
pub(crate) enum ViewFrag {
    Text(String),
    Node(NodeKey),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_flattening_preserves_order() {
        let mut doc = Document::new("body");
        let a = doc.create("span");
        let b = doc.create("span");

        let view = View::Many(vec![
            View::from("hello"),
            View::Node(a),
            View::Many(vec![View::Empty, View::text(42), View::Node(b)]),
        ]);

        let mut frags = Vec::new();
        view.flatten_into(&mut frags);

        assert_eq!(frags.len(), 4);
        assert!(matches!(&frags[0], ViewFrag::Text(t) if t == "hello"));
        assert!(matches!(&frags[1], ViewFrag::Node(k) if *k == a));
        assert!(matches!(&frags[2], ViewFrag::Text(t) if t == "42"));
        assert!(matches!(&frags[3], ViewFrag::Node(k) if *k == b));
    }
}
