//! HTML rendering.
//!
//! # How It Works
//!
//! Rendering a node produces its full `outerHTML` fragment and clears the
//! dirty flag of every node the pass touched. The client patches by
//! replacing the element whose `id` matches, so a fragment is always a
//! complete, self-contained subtree.
//!
//! Dynamic children are evaluated here: the renderer pushes the owning
//! node onto the context stack, runs the producer with a [`Scope`], and
//! diffs the produced node keys against the previous pass. Keys that
//! dropped out are freed; nothing else can reach them once their producer
//! stops returning them.
//!
//! Attribute order is the insertion order of the attribute map, with the
//! `id` attribute rendered last so fragments for the same node stay
//! byte-stable across passes.

use tracing::error;

use crate::error::Error;
use crate::reactive::{RenderCx, Scope, ViewFrag};
use crate::tree::{AttrValue, BindingAction, Child, Document, NodeKey};
use crate::Result;

/// Elements with no closing tag and no children.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

/// Elements whose value edits are echoed to the server even without an
/// explicit `input` binding.
const VALUE_ELEMENTS: &[&str] = &["input", "textarea", "select"];

/// Escape text content: `&`, `<`, `>`.
pub(crate) fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Escape an attribute value: text escapes plus `"`.
fn escape_attr(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Render one node to its `outerHTML`, evaluating dynamic children and
/// clearing dirty flags along the way.
pub(crate) fn render_node(doc: &mut Document, cx: &mut RenderCx, key: NodeKey) -> Result<String> {
    let (tag, dom_id, open_attrs, children) = {
        let node = doc.node_mut(key).ok_or(Error::NodeGone(key))?;
        node.dirty = false;

        let mut open = String::new();
        for (name, value) in &node.attrs {
            let name = name.replace('_', "-");
            match value {
                AttrValue::Text(text) => {
                    open.push_str(&format!(" {name}=\"{}\"", escape_attr(text)));
                }
                AttrValue::Flag(true) => {
                    open.push_str(&format!(" {name}"));
                }
                AttrValue::Flag(false) => {}
            }
        }

        for (event, binding) in &node.events {
            let mut js = String::new();
            if binding.prevent_default {
                js.push_str("event.preventDefault();");
            }
            if binding.stop_propagation {
                js.push_str("event.stopPropagation();");
            }
            match &binding.action {
                BindingAction::Script(script) => js.push_str(script),
                BindingAction::Callback(_) => {
                    js.push_str(&format!("trellis.emit(event,'{}','{event}')", node.dom_id));
                }
            }
            open.push_str(&format!(" on{event}=\"{}\"", escape_attr(&js)));
        }

        // Value-bearing elements echo edits even with no app binding.
        if VALUE_ELEMENTS.contains(&node.tag.as_str()) && !node.events.contains_key("input") {
            open.push_str(&format!(
                " oninput=\"trellis.emit(event,'{}','input')\"",
                node.dom_id
            ));
        }

        (
            node.tag.clone(),
            node.dom_id.clone(),
            open,
            node.children.iter().cloned().collect::<Vec<_>>(),
        )
    };

    let mut html = format!("<{tag}{open_attrs} id=\"{dom_id}\"");

    if VOID_ELEMENTS.contains(&tag.as_str()) {
        html.push_str("/>");
        return Ok(html);
    }
    html.push('>');

    for (slot, child) in children.into_iter().enumerate() {
        match child {
            Child::Text(text) => html.push_str(&escape(&text)),
            Child::Node(child_key) => html.push_str(&render_node(doc, cx, child_key)?),
            Child::Dynamic(producer) => {
                html.push_str(&render_dynamic(doc, cx, key, slot, &producer)?);
            }
        }
    }

    html.push_str(&format!("</{tag}>"));
    Ok(html)
}

/// Evaluate one dynamic child slot: run the producer, render its output,
/// and reconcile the slot's node cache.
fn render_dynamic(
    doc: &mut Document,
    cx: &mut RenderCx,
    owner: NodeKey,
    slot: usize,
    producer: &crate::tree::Producer,
) -> Result<String> {
    cx.stack.push(owner);
    let outcome = {
        let mut scope = Scope { doc, cx };
        producer(&mut scope)
    };
    cx.stack.pop();

    let view = match outcome {
        Ok(view) => view,
        Err(err) => {
            let owner_id = doc.dom_id(owner).unwrap_or("?").to_string();
            error!(owner = %owner_id, error = %err, "dynamic child failed");
            if cx.lenient {
                let detail = if cx.debug {
                    escape(&err.to_string())
                } else {
                    "render error".to_string()
                };
                return Ok(format!("<span class=\"trellis-error\">{detail}</span>"));
            }
            return Err(Error::render(owner_id, err.to_string()));
        }
    };

    let mut frags = Vec::new();
    view.flatten_into(&mut frags);

    let mut html = String::new();
    let mut produced = Vec::new();
    for frag in frags {
        match frag {
            ViewFrag::Text(text) => html.push_str(&escape(&text)),
            ViewFrag::Node(child_key) => {
                produced.push(child_key);
                html.push_str(&render_node(doc, cx, child_key)?);
            }
        }
    }

    // Swap the slot cache, then free node keys the producer stopped
    // returning. Nodes still returned keep their identity across passes.
    let (stale, owner_mounted) = match doc.node_mut(owner) {
        Some(node) => {
            let previous = node.dyn_cache.insert(slot, produced.clone()).unwrap_or_default();
            let stale: Vec<NodeKey> = previous
                .into_iter()
                .filter(|k| !produced.contains(k))
                .collect();
            (stale, node.mounted)
        }
        None => (Vec::new(), false),
    };
    for key in stale {
        doc.free(key);
    }
    if owner_mounted {
        for key in produced {
            if let Some(node) = doc.node_mut(key) {
                if node.parent.is_none() {
                    node.parent = Some(owner);
                }
            }
            doc.mount_subtree(key);
        }
    }

    Ok(html)
}
