//! Sessions.
//!
//! # How It Works
//!
//! A session is one browser identity: a tree, the set of transports
//! currently connected for it, and the statics bookkeeping for the
//! current page load. Sessions are created on first page request, keyed
//! by a cookie, and survive transport drops so a reconnecting tab
//! resumes the same tree.
//!
//! Event handling is the main loop: resolve the target under the tree
//! lock, echo any input value (without dirtying, so typing never fights
//! the renderer), release the lock, run the handler, then collect and
//! broadcast the resulting updates. Stepped handlers broadcast once per
//! pause. All of a session's handlers serialize on the tree lock, never
//! on each other's I/O.

mod registry;

pub use registry::{AppSource, Registry, RegistryConfig};

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::event::TagEvent;
use crate::reactive::RenderCx;
use crate::reconcile;
use crate::render;
use crate::transport::{ClientEvent, ServerMessage, Transport, TransportKind, BRIDGE_JS};
use crate::tree::{BindingAction, Tree};
use crate::{Error, Result};

/// One browser identity and its server-owned tree.
pub struct Session {
    sid: String,
    tree: Tree,
    title: String,
    debug: bool,
    transports: Mutex<Vec<Transport>>,
    /// Static fragments already delivered in this page load.
    sent_statics: Mutex<HashSet<String>>,
    registry: Weak<Registry>,
}

impl Session {
    pub(crate) fn new(
        sid: String,
        tree: Tree,
        title: String,
        debug: bool,
        registry: Weak<Registry>,
    ) -> Self {
        Self {
            sid,
            tree,
            title,
            debug,
            transports: Mutex::new(Vec::new()),
            sent_statics: Mutex::new(HashSet::new()),
            registry,
        }
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    // ------------------------------------------------------------------
    // Transports
    // ------------------------------------------------------------------

    pub fn attach(&self, transport: Transport) {
        debug!(sid = %self.sid, transport = transport.id(), "transport attached");
        self.transports.lock().push(transport);
    }

    /// Attach a transport and push one frame with the full current render
    /// to it, so a connecting (or reconnecting) browser is brought up to
    /// date without a page reload.
    pub fn connect(&self, transport: Transport) {
        if let Some(json) = self.initial_frame() {
            transport.send(&json);
        }
        self.attach(transport);
        // Script calls queued since the last broadcast are owed to every
        // transport, not just the connecting one; they go out here rather
        // than inside the connect frame.
        self.flush();
    }

    /// The full-render frame sent on transport connect: the whole root
    /// subtree and undelivered statics. Producer failures degrade to
    /// inline fragments, as on a page load.
    fn initial_frame(&self) -> Option<String> {
        let mut doc = self.tree.lock();
        let root = doc.root();
        doc.mark_dirty(root);
        let mut cx = RenderCx::new(Arc::downgrade(doc.inbox()), self.debug, true);
        let message = match reconcile::collect(&mut doc, &mut cx) {
            Ok(mut batch) => {
                // Queued script calls stay queued for the broadcast that
                // follows the attach.
                for call in std::mem::take(&mut batch.js) {
                    doc.call_js(root, call);
                }
                let statics = self.new_statics(&reconcile::collect_statics(&doc));
                ServerMessage::update(batch, statics, None, None)
            }
            Err(err) => {
                error!(sid = %self.sid, error = %err, "initial frame failed");
                ServerMessage::error(self.gate(&err), None)
            }
        };
        match message.to_json() {
            Ok(json) => Some(json),
            Err(err) => {
                error!(sid = %self.sid, error = %err, "frame serialization failed");
                None
            }
        }
    }

    pub fn detach(&self, transport_id: u64) {
        let empty = {
            let mut transports = self.transports.lock();
            transports.retain(|t| t.id() != transport_id);
            transports.is_empty()
        };
        debug!(sid = %self.sid, transport = transport_id, "transport detached");
        if empty {
            self.notify_idle();
        }
    }

    pub fn transport_count(&self) -> usize {
        self.transports.lock().len()
    }

    fn notify_idle(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.maybe_idle();
        }
    }

    // ------------------------------------------------------------------
    // Rendering
    // ------------------------------------------------------------------

    /// Render the full page for a fresh browser load. Resets the
    /// delivered-statics set, since a new document has none of them.
    pub fn render_page(&self) -> Result<String> {
        let (body, statics) = {
            let mut doc = self.tree.lock();
            let mut cx = RenderCx::new(Arc::downgrade(doc.inbox()), self.debug, true);
            let root = doc.root();
            let body = render::render_node(&mut doc, &mut cx, root)?;
            (body, reconcile::collect_statics(&doc))
        };

        let mut sent = self.sent_statics.lock();
        sent.clear();
        sent.extend(statics.iter().cloned());

        info!(sid = %self.sid, "page rendered");
        Ok(format!(
            "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\"/>\n\
             <title>{title}</title>\n{statics}\n<script>\n{bridge}\n</script>\n</head>\n\
             {body}\n</html>",
            title = render::escape(&self.title),
            statics = statics.join("\n"),
            bridge = BRIDGE_JS,
        ))
    }

    /// Collect and broadcast pending updates, if any. Called when a
    /// transport connects so changes made between page render and socket
    /// open are not lost.
    pub fn flush(&self) {
        self.broadcast_updates(None, None);
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Dispatch one client event. `origin` is the reporting transport for
    /// WebSocket events and `None` for POSTed fallback events.
    pub async fn handle_event(&self, event: ClientEvent, origin: Option<u64>) {
        let callback_id = event.callback_id().map(str::to_string);

        let resolved = {
            let mut doc = self.tree.lock();
            match doc.find_by_dom_id(&event.id) {
                Some(target) => {
                    // Echo the client's value without dirtying, so the
                    // element is not re-rendered under the user's cursor.
                    if let Some(value) = event.data.get("value").and_then(|v| v.as_str()) {
                        doc.echo_attr(target, "value", value.to_string());
                    }
                    doc.node(target).map(|node| {
                        let handler = node.events.get(&event.name).and_then(|b| match &b.action {
                            BindingAction::Callback(h) => Some(h.clone()),
                            BindingAction::Script(_) => None,
                        });
                        (target, node.tag.clone(), handler)
                    })
                }
                None => {
                    warn!(sid = %self.sid, id = %event.id, "event for unknown node");
                    None
                }
            }
        };

        let handler = match resolved {
            Some((target, tag, Some(handler))) => Some((target, tag, handler)),
            // Echo-only (or stale) events still flush pending updates and
            // settle any waiting promise.
            Some((_, _, None)) | None => {
                self.broadcast_updates(callback_id, None);
                return;
            }
        };

        if let Some((target, tag, handler)) = handler {
            let tag_event = TagEvent {
                target,
                target_id: event.id.clone(),
                tag,
                name: event.name.clone(),
                data: event.data.clone(),
            };
            let outcome = handler
                .run(tag_event, || async {
                    self.broadcast_updates(None, None);
                })
                .await;
            match outcome {
                Ok(result) => self.broadcast_updates(callback_id, result.into_wire()),
                Err(err) => {
                    error!(sid = %self.sid, event = %event.name, error = %err, "callback failed");
                    self.send_error(&err, callback_id, origin);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Broadcasting
    // ------------------------------------------------------------------

    /// Run a collection pass and broadcast the batch. Empty batches are
    /// skipped unless a promise is waiting on the frame. A render failure
    /// during collection discards the partial batch and broadcasts an
    /// error frame instead.
    fn broadcast_updates(&self, callback_id: Option<String>, result: Option<Value>) {
        let message = {
            let mut doc = self.tree.lock();
            let mut cx = RenderCx::new(Arc::downgrade(doc.inbox()), self.debug, false);
            match reconcile::collect(&mut doc, &mut cx) {
                Ok(batch) => {
                    let statics = self.new_statics(&reconcile::collect_statics(&doc));
                    if batch.is_empty()
                        && statics.is_empty()
                        && callback_id.is_none()
                        && result.is_none()
                    {
                        return;
                    }
                    ServerMessage::update(batch, statics, callback_id, result)
                }
                Err(err) => {
                    error!(sid = %self.sid, error = %err, "update collection failed");
                    ServerMessage::error(self.gate(&err), callback_id)
                }
            }
        };
        self.broadcast(&message);
    }

    /// Send a frame to every transport, pruning dead ones.
    pub fn broadcast(&self, message: &ServerMessage) {
        let json = match message.to_json() {
            Ok(json) => json,
            Err(err) => {
                error!(sid = %self.sid, error = %err, "frame serialization failed");
                return;
            }
        };
        let empty = {
            let mut transports = self.transports.lock();
            transports.retain(|t| t.send(&json));
            transports.is_empty()
        };
        if empty {
            self.notify_idle();
        }
    }

    /// Route a callback failure: to the reporting transport when the
    /// event arrived over WebSocket, otherwise to every fallback
    /// transport (the POST response already returned).
    fn send_error(&self, err: &Error, callback_id: Option<String>, origin: Option<u64>) {
        let message = ServerMessage::error(self.gate(err), callback_id);
        let json = match message.to_json() {
            Ok(json) => json,
            Err(err) => {
                error!(sid = %self.sid, error = %err, "frame serialization failed");
                return;
            }
        };
        let mut transports = self.transports.lock();
        match origin {
            Some(id) if transports.iter().any(|t| t.id() == id) => {
                transports.retain(|t| t.id() != id || t.send(&json));
            }
            _ => {
                transports.retain(|t| t.kind() != TransportKind::Fallback || t.send(&json));
            }
        }
    }

    /// Statics not yet delivered in this page load, marked as sent.
    fn new_statics(&self, all: &[String]) -> Vec<String> {
        let mut sent = self.sent_statics.lock();
        all.iter()
            .filter(|s| sent.insert((*s).clone()))
            .cloned()
            .collect()
    }

    /// Error text the client may see: full detail only in debug mode.
    fn gate(&self, err: &Error) -> String {
        if self.debug {
            err.to_string()
        } else {
            "Internal Server Error".to_string()
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("sid", &self.sid)
            .field("transports", &self.transport_count())
            .finish()
    }
}
