//! The document: one session's server-owned tree.
//!
//! All structural mutation goes through [`Document`] so the tree
//! invariants hold everywhere:
//!
//! - a node belongs to at most one parent (re-adding detaches first),
//! - any attribute/event/child mutation flips the node's dirty flag,
//! - mount/unmount notifications fire exactly once per reachability
//!   change, for literal and dynamically-produced children alike.
//!
//! [`Tree`] is the shared, cloneable handle: an `Arc<Mutex<Document>>`.
//! The mutex is the per-tree lock of the concurrency model; event
//! callbacks, render passes, and background writers all serialize on it.
//! Reactive cells never take this lock; they post observed node keys to
//! the document's [`DirtyInbox`], which is folded into dirty flags each
//! time the document is next locked.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::event::Handler;
use crate::reactive::{Scope, View};
use crate::Result;

use super::arena::{Arena, NodeKey};
use super::node::{AttrValue, Child, EventBinding, LifecycleHook, Producer, TagNode};

/// Deferred dirty notifications from reactive cells.
///
/// Has its own small lock so cells can post from any context, including a
/// producer running inside a render that already holds the document lock.
pub struct DirtyInbox {
    pending: Mutex<Vec<NodeKey>>,
}

impl DirtyInbox {
    fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn push(&self, key: NodeKey) {
        self.pending.lock().push(key);
    }

    fn drain(&self) -> Vec<NodeKey> {
        std::mem::take(&mut *self.pending.lock())
    }
}

/// One session's tree of tag nodes.
pub struct Document {
    pub(crate) arena: Arena,
    root: NodeKey,
    inbox: Arc<DirtyInbox>,
}

impl Document {
    /// Create a document whose root carries the given tag. The root is
    /// mounted from birth.
    pub fn new(tag: &str) -> Self {
        let mut arena = Arena::new();
        let mut root_node = TagNode::new(tag);
        root_node.mounted = true;
        let root = arena.insert(root_node);
        Self {
            arena,
            root,
            inbox: Arc::new(DirtyInbox::new()),
        }
    }

    pub fn root(&self) -> NodeKey {
        self.root
    }

    pub(crate) fn inbox(&self) -> &Arc<DirtyInbox> {
        &self.inbox
    }

    /// Fold pending reactive notifications into node dirty flags.
    /// Stale keys (freed slots) are ignored.
    pub fn flush_dirty(&mut self) {
        for key in self.inbox.drain() {
            if let Some(node) = self.arena.get_mut(key) {
                node.dirty = true;
            }
        }
    }

    /// Create a detached node.
    pub fn create(&mut self, tag: &str) -> NodeKey {
        let node = TagNode::new(tag);
        debug!(tag = %node.tag, id = %node.dom_id, "created node");
        self.arena.insert(node)
    }

    pub fn node(&self, key: NodeKey) -> Option<&TagNode> {
        self.arena.get(key)
    }

    pub fn node_mut(&mut self, key: NodeKey) -> Option<&mut TagNode> {
        self.arena.get_mut(key)
    }

    pub fn contains(&self, key: NodeKey) -> bool {
        self.arena.contains(key)
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn dom_id(&self, key: NodeKey) -> Option<&str> {
        self.arena.get(key).map(|n| n.dom_id.as_str())
    }

    pub fn tag(&self, key: NodeKey) -> Option<&str> {
        self.arena.get(key).map(|n| n.tag.as_str())
    }

    /// Dirty check, folding in any pending reactive notifications first.
    pub fn is_dirty(&mut self, key: NodeKey) -> bool {
        self.flush_dirty();
        self.arena.get(key).map(|n| n.dirty).unwrap_or(false)
    }

    pub fn mark_dirty(&mut self, key: NodeKey) {
        if let Some(node) = self.arena.get_mut(key) {
            node.dirty = true;
        }
    }

    pub fn is_mounted(&self, key: NodeKey) -> bool {
        self.arena.get(key).map(|n| n.mounted).unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Children
    // ------------------------------------------------------------------

    /// Append a node child. If the child is already parented elsewhere it
    /// is detached from its previous parent first (one-parent invariant).
    /// Mount fires when the new parent is reachable from the root.
    pub fn append_child(&mut self, parent: NodeKey, child: NodeKey) {
        if parent == child || self.is_ancestor(child, parent) {
            warn!("refusing to append a node to its own subtree");
            return;
        }
        if !self.arena.contains(parent) || !self.arena.contains(child) {
            return;
        }

        self.detach(child);

        if let Some(node) = self.arena.get_mut(child) {
            node.parent = Some(parent);
        }
        let parent_mounted = {
            let node = match self.arena.get_mut(parent) {
                Some(node) => node,
                None => return,
            };
            node.children.push(Child::Node(child));
            node.dirty = true;
            node.mounted
        };
        if parent_mounted {
            self.mount_subtree(child);
        }
    }

    /// Append a literal text child (escaped at render time).
    pub fn append_text(&mut self, parent: NodeKey, text: impl Into<String>) {
        if let Some(node) = self.arena.get_mut(parent) {
            node.children.push(Child::Text(text.into()));
            node.dirty = true;
        }
    }

    /// Append a dynamic child: a producer evaluated on every render of the
    /// parent, with its output cached for traversal between renders.
    pub fn append_dynamic<F>(&mut self, parent: NodeKey, producer: F)
    where
        F: Fn(&mut Scope<'_>) -> Result<View> + Send + Sync + 'static,
    {
        let producer: Producer = Arc::new(producer);
        if let Some(node) = self.arena.get_mut(parent) {
            node.children.push(Child::Dynamic(producer));
            node.dirty = true;
        }
    }

    /// Remove a node child. The child survives, detached, and may be
    /// re-added later.
    pub fn remove_child(&mut self, parent: NodeKey, child: NodeKey) {
        let had = match self.arena.get_mut(parent) {
            Some(node) => {
                let before = node.children.len();
                node.children
                    .retain(|c| !matches!(c, Child::Node(k) if *k == child));
                if node.children.len() != before {
                    node.dirty = true;
                    true
                } else {
                    false
                }
            }
            None => false,
        };
        if had {
            let was_mounted = self.is_mounted(child);
            if let Some(node) = self.arena.get_mut(child) {
                node.parent = None;
            }
            if was_mounted {
                self.unmount_subtree(child);
            }
        }
    }

    /// Detach a node from its parent, if it has one.
    pub fn detach(&mut self, child: NodeKey) {
        if let Some(parent) = self.arena.get(child).and_then(|n| n.parent) {
            self.remove_child(parent, child);
        }
    }

    /// Drop all children. Node children are detached (and unmounted);
    /// nodes produced by dynamic children are freed outright, since
    /// nothing can reach them once their producer is gone.
    pub fn clear(&mut self, key: NodeKey) {
        let (children, produced) = match self.arena.get_mut(key) {
            Some(node) => {
                let children = std::mem::take(&mut node.children);
                let produced: Vec<NodeKey> =
                    node.dyn_cache.drain().flat_map(|(_, keys)| keys).collect();
                node.dirty = true;
                (children, produced)
            }
            None => return,
        };
        for child in children {
            if let Child::Node(child_key) = child {
                let was_mounted = self.is_mounted(child_key);
                if let Some(node) = self.arena.get_mut(child_key) {
                    node.parent = None;
                }
                if was_mounted {
                    self.unmount_subtree(child_key);
                }
            }
        }
        for produced_key in produced {
            self.free(produced_key);
        }
    }

    /// Unmount and free a whole subtree, invalidating its keys.
    pub fn free(&mut self, key: NodeKey) {
        self.detach(key);
        if self.is_mounted(key) {
            self.unmount_subtree(key);
        }
        let mut stack = vec![key];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.arena.remove(current) {
                stack.extend(node.child_keys());
            }
        }
    }

    fn is_ancestor(&self, candidate: NodeKey, node: NodeKey) -> bool {
        let mut current = self.arena.get(node).and_then(|n| n.parent);
        while let Some(key) = current {
            if key == candidate {
                return true;
            }
            current = self.arena.get(key).and_then(|n| n.parent);
        }
        false
    }

    // ------------------------------------------------------------------
    // Mount / unmount
    // ------------------------------------------------------------------

    /// Mark a subtree reachable and fire `on_mount` hooks, children-last.
    /// Already-mounted nodes are skipped so counts stay balanced.
    pub(crate) fn mount_subtree(&mut self, key: NodeKey) {
        let mut hooks: Vec<LifecycleHook> = Vec::new();
        let mut stack = vec![key];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.arena.get_mut(current) {
                if node.mounted {
                    continue;
                }
                node.mounted = true;
                if let Some(hook) = &node.on_mount {
                    hooks.push(Arc::clone(hook));
                }
                stack.extend(node.child_keys());
            }
        }
        for hook in hooks {
            hook();
        }
    }

    pub(crate) fn unmount_subtree(&mut self, key: NodeKey) {
        let mut hooks: Vec<LifecycleHook> = Vec::new();
        let mut stack = vec![key];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.arena.get_mut(current) {
                if !node.mounted {
                    continue;
                }
                node.mounted = false;
                if let Some(hook) = &node.on_unmount {
                    hooks.push(Arc::clone(hook));
                }
                stack.extend(node.child_keys());
            }
        }
        for hook in hooks {
            hook();
        }
    }

    pub fn set_on_mount<F>(&mut self, key: NodeKey, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if let Some(node) = self.arena.get_mut(key) {
            node.on_mount = Some(Arc::new(hook));
        }
    }

    pub fn set_on_unmount<F>(&mut self, key: NodeKey, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if let Some(node) = self.arena.get_mut(key) {
            node.on_unmount = Some(Arc::new(hook));
        }
    }

    // ------------------------------------------------------------------
    // Attributes, events, classes
    // ------------------------------------------------------------------

    /// Set an HTML attribute. Underscores in the name render as hyphens.
    pub fn set_attr(&mut self, key: NodeKey, name: &str, value: impl Into<AttrValue>) {
        if let Some(node) = self.arena.get_mut(key) {
            node.attrs.insert(name.to_string(), value.into());
            node.dirty = true;
        }
    }

    /// Set a boolean (presence-only) attribute.
    pub fn set_flag(&mut self, key: NodeKey, name: &str, on: bool) {
        self.set_attr(key, name, AttrValue::Flag(on));
    }

    pub fn attr(&self, key: NodeKey, name: &str) -> Option<AttrValue> {
        self.arena.get(key).and_then(|n| n.attrs.get(name).cloned())
    }

    pub fn remove_attr(&mut self, key: NodeKey, name: &str) {
        if let Some(node) = self.arena.get_mut(key) {
            if node.attrs.shift_remove(name).is_some() {
                node.dirty = true;
            }
        }
    }

    /// Write an attribute without flipping the dirty flag. Used for client
    /// value echoes so an input element is not re-rendered mid-typing.
    pub(crate) fn echo_attr(&mut self, key: NodeKey, name: &str, value: impl Into<AttrValue>) {
        if let Some(node) = self.arena.get_mut(key) {
            node.attrs.insert(name.to_string(), value.into());
        }
    }

    /// Bind an application callback to an event name. At most one binding
    /// per event name; rebinding replaces.
    pub fn bind(&mut self, key: NodeKey, event: &str, handler: Handler) {
        self.bind_with(key, event, EventBinding::callback(handler));
    }

    /// Bind a literal script fragment to an event name.
    pub fn bind_script(&mut self, key: NodeKey, event: &str, js: impl Into<String>) {
        self.bind_with(key, event, EventBinding::script(js));
    }

    pub fn bind_with(&mut self, key: NodeKey, event: &str, binding: EventBinding) {
        if let Some(node) = self.arena.get_mut(key) {
            node.events.insert(event.to_string(), binding);
            node.dirty = true;
        }
    }

    pub fn unbind(&mut self, key: NodeKey, event: &str) {
        if let Some(node) = self.arena.get_mut(key) {
            if node.events.shift_remove(event).is_some() {
                node.dirty = true;
            }
        }
    }

    pub fn class_has(&self, key: NodeKey, name: &str) -> bool {
        match self.attr(key, "class") {
            Some(AttrValue::Text(classes)) => classes.split_whitespace().any(|c| c == name),
            _ => false,
        }
    }

    pub fn class_add(&mut self, key: NodeKey, name: &str) {
        if self.class_has(key, name) {
            return;
        }
        let current = match self.attr(key, "class") {
            Some(AttrValue::Text(classes)) if !classes.is_empty() => format!("{classes} {name}"),
            _ => name.to_string(),
        };
        self.set_attr(key, "class", current);
    }

    pub fn class_remove(&mut self, key: NodeKey, name: &str) {
        if !self.class_has(key, name) {
            return;
        }
        let current = match self.attr(key, "class") {
            Some(AttrValue::Text(classes)) => classes
                .split_whitespace()
                .filter(|c| *c != name)
                .collect::<Vec<_>>()
                .join(" "),
            _ => String::new(),
        };
        self.set_attr(key, "class", current);
    }

    pub fn class_toggle(&mut self, key: NodeKey, name: &str) {
        if self.class_has(key, name) {
            self.class_remove(key, name);
        } else {
            self.class_add(key, name);
        }
    }

    // ------------------------------------------------------------------
    // Scripts, statics, lookup
    // ------------------------------------------------------------------

    /// Queue a one-shot client-side script call, drained at the next
    /// update collection. Does not dirty the node.
    pub fn call_js(&mut self, key: NodeKey, script: impl Into<String>) {
        if let Some(node) = self.arena.get_mut(key) {
            node.js_calls.push(script.into());
        }
    }

    /// Declare a static asset fragment (style/script) for this node kind,
    /// delivered at most once per browser load.
    pub fn push_static(&mut self, key: NodeKey, fragment: impl Into<String>) {
        if let Some(node) = self.arena.get_mut(key) {
            node.statics.push(fragment.into());
        }
    }

    /// Locate a node by its wire id, across literal children and the
    /// cached output of dynamic children.
    pub fn find_by_dom_id(&self, dom_id: &str) -> Option<NodeKey> {
        let mut stack = vec![self.root];
        while let Some(key) = stack.pop() {
            if let Some(node) = self.arena.get(key) {
                if node.dom_id == dom_id {
                    return Some(key);
                }
                stack.extend(node.child_keys());
            }
        }
        None
    }
}

/// Shared handle to one session's document.
///
/// Cloning is cheap; all clones refer to the same tree. Locking happens
/// per closure call, and pending reactive notifications are folded in on
/// every lock acquisition.
#[derive(Clone)]
pub struct Tree {
    doc: Arc<Mutex<Document>>,
    root: NodeKey,
}

impl Tree {
    pub fn new(tag: &str) -> Self {
        let doc = Document::new(tag);
        let root = doc.root();
        Self {
            doc: Arc::new(Mutex::new(doc)),
            root,
        }
    }

    /// A tree rooted at `body`, the usual shape for a full-page app.
    pub fn body() -> Self {
        Self::new("body")
    }

    pub fn root(&self) -> NodeKey {
        self.root
    }

    /// Read access. Pending reactive notifications are flushed first.
    pub fn with<R>(&self, f: impl FnOnce(&Document) -> R) -> R {
        let mut guard = self.doc.lock();
        guard.flush_dirty();
        f(&guard)
    }

    /// Write access. Pending reactive notifications are flushed first.
    pub fn update<R>(&self, f: impl FnOnce(&mut Document) -> R) -> R {
        let mut guard = self.doc.lock();
        guard.flush_dirty();
        f(&mut guard)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Document> {
        let mut guard = self.doc.lock();
        guard.flush_dirty();
        guard
    }
}
