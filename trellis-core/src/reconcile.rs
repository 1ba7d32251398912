//! Update collection.
//!
//! # How It Works
//!
//! A collection pass walks the tree once. Dirty nodes are rendered in
//! pre-order, so a dirty parent swallows its dirty descendants into one
//! fragment and the batch never carries overlapping updates. Queued
//! script calls drain in post-order, so a child's scripts run before its
//! parent's in the browser.
//!
//! Producers may write cells while the pass renders them. Writes that
//! land on nodes outside the rendered subtrees survive to the next pass;
//! a node that re-dirties itself during its own render is force-cleared
//! with a warning, otherwise it would re-render on every pass forever.

use indexmap::IndexMap;
use tracing::warn;

use crate::reactive::RenderCx;
use crate::render::render_node;
use crate::tree::{Child, Document, NodeKey};
use crate::Result;

/// One pass's worth of wire traffic: `outerHTML` fragments keyed by DOM
/// id, plus drained script calls.
#[derive(Debug, Default)]
pub struct UpdateBatch {
    pub updates: IndexMap<String, String>,
    pub js: Vec<String>,
}

impl UpdateBatch {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.js.is_empty()
    }
}

/// Collect every pending update reachable from the root.
pub(crate) fn collect(doc: &mut Document, cx: &mut RenderCx) -> Result<UpdateBatch> {
    doc.flush_dirty();
    let mut batch = UpdateBatch::default();
    let mut rendered = Vec::new();
    let mut drained = Vec::new();
    if let Err(err) = visit(doc, cx, doc.root(), &mut batch, &mut rendered, &mut drained) {
        // The batch is discarded, so everything this pass consumed has to
        // stay pending or the next pass would never resend it.
        for key in rendered {
            doc.mark_dirty(key);
        }
        for (key, js) in drained {
            if let Some(node) = doc.node_mut(key) {
                node.js_calls = js;
            }
        }
        return Err(err);
    }
    for (_, mut js) in drained {
        batch.js.append(&mut js);
    }

    // Fold in cell writes made by producers during this pass, then clear
    // any node that dirtied itself inside its own render.
    doc.flush_dirty();
    for key in rendered {
        clear_rendered(doc, key);
    }
    Ok(batch)
}

fn visit(
    doc: &mut Document,
    cx: &mut RenderCx,
    key: NodeKey,
    batch: &mut UpdateBatch,
    rendered: &mut Vec<NodeKey>,
    drained: &mut Vec<(NodeKey, Vec<String>)>,
) -> Result<()> {
    if doc.node(key).map(|n| n.dirty).unwrap_or(false) {
        let html = render_node(doc, cx, key)?;
        if let Some(id) = doc.dom_id(key) {
            batch.updates.insert(id.to_string(), html);
        }
        rendered.push(key);
    }

    // Children in slot order; dynamic slots contribute their cached keys.
    let children: Vec<NodeKey> = match doc.node(key) {
        Some(node) => {
            let mut keys = Vec::new();
            for (slot, child) in node.children.iter().enumerate() {
                match child {
                    Child::Node(child_key) => keys.push(*child_key),
                    Child::Dynamic(_) => {
                        if let Some(produced) = node.dyn_cache.get(&slot) {
                            keys.extend(produced.iter().copied());
                        }
                    }
                    Child::Text(_) => {}
                }
            }
            keys
        }
        None => return Ok(()),
    };
    for child_key in children {
        visit(doc, cx, child_key, batch, rendered, drained)?;
    }

    if let Some(node) = doc.node_mut(key) {
        if !node.js_calls.is_empty() {
            drained.push((key, std::mem::take(&mut node.js_calls)));
        }
    }
    Ok(())
}

fn clear_rendered(doc: &mut Document, key: NodeKey) {
    let mut stack = vec![key];
    while let Some(current) = stack.pop() {
        if let Some(node) = doc.node_mut(current) {
            if node.dirty {
                warn!(id = %node.dom_id, tag = %node.tag, "node re-dirtied during its own render");
                node.dirty = false;
            }
            stack.extend(node.child_keys());
        }
    }
}

/// Every static fragment reachable from the root, deduplicated in
/// first-seen document order.
pub(crate) fn collect_statics(doc: &Document) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    let mut queue = vec![doc.root()];
    let mut index = 0;
    while index < queue.len() {
        let key = queue[index];
        index += 1;
        if let Some(node) = doc.node(key) {
            for fragment in &node.statics {
                if seen.insert(fragment.clone()) {
                    out.push(fragment.clone());
                }
            }
            for (slot, child) in node.children.iter().enumerate() {
                match child {
                    Child::Node(child_key) => queue.push(*child_key),
                    Child::Dynamic(_) => {
                        if let Some(produced) = node.dyn_cache.get(&slot) {
                            queue.extend(produced.iter().copied());
                        }
                    }
                    Child::Text(_) => {}
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{Cell, View};
    use std::sync::Arc;

    fn cx_for(doc: &Document) -> RenderCx {
        RenderCx::new(Arc::downgrade(doc.inbox()), true, false)
    }

    fn drain(doc: &mut Document) {
        let mut cx = cx_for(doc);
        collect(doc, &mut cx).unwrap();
    }

    #[test]
    fn clean_tree_yields_empty_batch() {
        let mut doc = Document::new("body");
        let div = doc.create("div");
        let root = doc.root();
        doc.append_child(root, div);
        drain(&mut doc);

        let mut cx = cx_for(&doc);
        let batch = collect(&mut doc, &mut cx).unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn child_mutation_updates_only_the_child() {
        let mut doc = Document::new("body");
        let parent = doc.create("div");
        let child = doc.create("span");
        let root = doc.root();
        doc.append_child(root, parent);
        doc.append_child(parent, child);
        drain(&mut doc);

        doc.set_attr(child, "class", "hot");
        let mut cx = cx_for(&doc);
        let batch = collect(&mut doc, &mut cx).unwrap();

        let child_id = doc.dom_id(child).unwrap();
        assert_eq!(batch.updates.len(), 1);
        assert!(batch.updates.contains_key(child_id));
    }

    #[test]
    fn dirty_parent_swallows_dirty_child() {
        let mut doc = Document::new("body");
        let parent = doc.create("div");
        let child = doc.create("span");
        let root = doc.root();
        doc.append_child(root, parent);
        doc.append_child(parent, child);
        drain(&mut doc);

        doc.set_attr(parent, "class", "a");
        doc.set_attr(child, "class", "b");
        let mut cx = cx_for(&doc);
        let batch = collect(&mut doc, &mut cx).unwrap();

        let parent_id = doc.dom_id(parent).unwrap().to_string();
        assert_eq!(batch.updates.len(), 1);
        assert!(batch.updates.contains_key(&parent_id));
        assert!(batch.updates[&parent_id].contains("class=\"b\""));
    }

    #[test]
    fn js_calls_drain_children_first() {
        let mut doc = Document::new("body");
        let parent = doc.create("div");
        let child = doc.create("span");
        let root = doc.root();
        doc.append_child(root, parent);
        doc.append_child(parent, child);
        drain(&mut doc);

        doc.call_js(parent, "parent()");
        doc.call_js(child, "child()");
        let mut cx = cx_for(&doc);
        let batch = collect(&mut doc, &mut cx).unwrap();

        assert!(batch.updates.is_empty());
        assert_eq!(batch.js, vec!["child()".to_string(), "parent()".to_string()]);
        assert!(doc.node(child).unwrap().js_calls.is_empty());
    }

    #[test]
    fn cell_write_reaches_the_next_batch() {
        let mut doc = Document::new("body");
        let div = doc.create("div");
        let root = doc.root();
        doc.append_child(root, div);

        let count = Cell::new(0i64);
        let reader = count.clone();
        doc.append_dynamic(div, move |scope| {
            Ok(View::text(format!("Count: {}", reader.get(scope))))
        });
        drain(&mut doc);

        count.set(1);
        let mut cx = cx_for(&doc);
        let batch = collect(&mut doc, &mut cx).unwrap();
        let div_id = doc.dom_id(div).unwrap();
        assert_eq!(batch.updates.len(), 1);
        assert!(batch.updates[div_id].contains("Count: 1"));
    }

    #[test]
    fn failed_pass_keeps_earlier_updates_pending() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let mut doc = Document::new("body");
        let label = doc.create("span");
        let broken = doc.create("div");
        let root = doc.root();
        doc.append_child(root, label);
        doc.append_child(root, broken);
        let failing = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&failing);
        doc.append_dynamic(broken, move |_scope| {
            if flag.load(Ordering::SeqCst) {
                Err(crate::Error::callback("boom"))
            } else {
                Ok(View::text("ok"))
            }
        });
        drain(&mut doc);

        // The label renders and drains before the failing node is reached.
        doc.set_attr(label, "class", "hot");
        doc.call_js(label, "tick()");
        doc.mark_dirty(broken);
        failing.store(true, Ordering::SeqCst);
        let mut cx = cx_for(&doc);
        assert!(collect(&mut doc, &mut cx).is_err());

        failing.store(false, Ordering::SeqCst);
        let mut cx = cx_for(&doc);
        let batch = collect(&mut doc, &mut cx).unwrap();
        let label_id = doc.dom_id(label).unwrap();
        assert!(batch.updates.contains_key(label_id));
        assert_eq!(batch.js, vec!["tick()".to_string()]);
    }

    #[test]
    fn self_observing_producer_is_force_cleared() {
        let mut doc = Document::new("body");
        let div = doc.create("div");
        let root = doc.root();
        doc.append_child(root, div);

        let count = Cell::new(0i64);
        let inner = count.clone();
        doc.append_dynamic(div, move |scope| {
            let n = inner.get(scope);
            inner.set(n + 1); // writes what it reads
            Ok(View::text(n))
        });

        let mut cx = cx_for(&doc);
        let batch = collect(&mut doc, &mut cx).unwrap();
        assert_eq!(batch.updates.len(), 1);

        // The re-dirty was suppressed; the tree settles.
        let batch = collect(&mut doc, &mut cx).unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn statics_dedupe_in_document_order() {
        let mut doc = Document::new("body");
        let a = doc.create("widget");
        let b = doc.create("widget");
        let root = doc.root();
        doc.append_child(root, a);
        doc.append_child(root, b);
        doc.push_static(a, "<style>.w{}</style>");
        doc.push_static(a, "<script>w()</script>");
        doc.push_static(b, "<style>.w{}</style>");

        let statics = collect_statics(&doc);
        assert_eq!(
            statics,
            vec!["<style>.w{}</style>".to_string(), "<script>w()</script>".to_string()]
        );
    }
}
