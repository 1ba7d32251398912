//! Tag nodes.
//!
//! A [`TagNode`] is one element of the server-owned tree: a tag name, an
//! ordered attribute map, event bindings, children, and the bookkeeping the
//! sync engine needs (dirty flag, queued script calls, the cache of nodes
//! produced by dynamic children).
//!
//! Nodes are plain data; all structural operations (insertion, removal,
//! mount notifications) go through [`Document`](super::Document) so the
//! tree invariants stay in one place.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use smallvec::SmallVec;
use uuid::Uuid;

use crate::event::Handler;
use crate::reactive::{Scope, View};
use crate::Result;

use super::arena::NodeKey;

/// A dynamic child: a zero-argument producer evaluated at render time.
///
/// The producer receives the current render [`Scope`], so reactive cell
/// reads inside it register the owning node as an observer.
pub type Producer = Arc<dyn Fn(&mut Scope<'_>) -> Result<View> + Send + Sync>;

/// Mount/unmount notification hook.
///
/// Hooks run while the document lock is held; they must not call back into
/// the owning [`Tree`](super::Tree).
pub type LifecycleHook = Arc<dyn Fn() + Send + Sync>;

/// An attribute value.
///
/// `Flag(true)` renders as a bare attribute name, `Flag(false)` is omitted
/// entirely; everything else renders escaped as `name="value"`.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Text(String),
    Flag(bool),
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Text(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Text(v)
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Flag(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Text(v.to_string())
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Text(v.to_string())
    }
}

/// What a bound event does when it fires in the browser.
#[derive(Clone)]
pub enum BindingAction {
    /// A literal script fragment rendered into the `on{event}` attribute.
    Script(String),
    /// A server-side callback dispatched over the wire.
    Callback(Handler),
}

/// One event binding, at most one per event name per node.
#[derive(Clone)]
pub struct EventBinding {
    pub action: BindingAction,
    /// Prefix the dispatch with `event.preventDefault()`.
    pub prevent_default: bool,
    /// Prefix the dispatch with `event.stopPropagation()`.
    pub stop_propagation: bool,
}

impl EventBinding {
    pub fn callback(handler: Handler) -> Self {
        Self {
            action: BindingAction::Callback(handler),
            prevent_default: false,
            stop_propagation: false,
        }
    }

    pub fn script(js: impl Into<String>) -> Self {
        Self {
            action: BindingAction::Script(js.into()),
            prevent_default: false,
            stop_propagation: false,
        }
    }

    pub fn prevent(mut self) -> Self {
        self.prevent_default = true;
        self
    }

    pub fn stop(mut self) -> Self {
        self.stop_propagation = true;
        self
    }
}

/// One entry of a node's ordered child list.
#[derive(Clone)]
pub enum Child {
    Text(String),
    Node(NodeKey),
    Dynamic(Producer),
}

/// A single element of the server-owned tree.
pub struct TagNode {
    /// Element name, already in its final hyphenated form.
    pub tag: String,
    /// Stable identity; the DOM anchor and wire-protocol key.
    pub dom_id: String,
    pub attrs: IndexMap<String, AttrValue>,
    pub events: IndexMap<String, EventBinding>,
    pub children: SmallVec<[Child; 4]>,
    /// Set on any attribute/event/child mutation, cleared by a full render.
    pub dirty: bool,
    /// One-shot client-side script fragments, drained at collection time.
    pub js_calls: Vec<String>,
    /// Last output of each dynamic child, keyed by child slot. Needed so
    /// traversal and event-target search can reach produced nodes.
    pub dyn_cache: HashMap<usize, Vec<NodeKey>>,
    /// Style/script fragments this node kind wants delivered once per
    /// browser load.
    pub statics: Vec<String>,
    pub parent: Option<NodeKey>,
    pub mounted: bool,
    pub on_mount: Option<LifecycleHook>,
    pub on_unmount: Option<LifecycleHook>,
}

impl TagNode {
    /// Create a detached node. Underscores in the tag name become hyphens
    /// (`sl_button` -> `sl-button`), matching custom-element conventions.
    pub fn new(tag: &str) -> Self {
        let tag = if tag.is_empty() { "div" } else { tag };
        Self {
            tag: tag.replace('_', "-"),
            dom_id: Uuid::new_v4().to_string(),
            attrs: IndexMap::new(),
            events: IndexMap::new(),
            children: SmallVec::new(),
            dirty: true,
            js_calls: Vec::new(),
            dyn_cache: HashMap::new(),
            statics: Vec::new(),
            parent: None,
            mounted: false,
            on_mount: None,
            on_unmount: None,
        }
    }

    /// Every node key reachable from this node: literal children plus the
    /// cached output of dynamic children.
    pub fn child_keys(&self) -> Vec<NodeKey> {
        let mut keys = Vec::new();
        for child in &self.children {
            if let Child::Node(key) = child {
                keys.push(*key);
            }
        }
        for produced in self.dyn_cache.values() {
            keys.extend(produced.iter().copied());
        }
        keys
    }
}

impl std::fmt::Debug for TagNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagNode")
            .field("tag", &self.tag)
            .field("dom_id", &self.dom_id)
            .field("dirty", &self.dirty)
            .field("children", &self.children.len())
            .field("mounted", &self.mounted)
            .finish()
    }
}
