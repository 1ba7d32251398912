//! Event objects and handler shapes.
//!
//! An inbound client message resolves to a [`TagEvent`] and, when a
//! callback is bound for that event name, one of three [`Handler`] shapes:
//!
//! 1. `Direct`: a synchronous function returning a result (or nothing).
//! 2. `Future`: an async function, suspending on I/O.
//! 3. `Stepped`: a cooperative multi-step task. Each [`Stepper::pause`]
//!    requests an intermediate reconciliation broadcast and resumes only
//!    after it was sent; the task's return value is the final result.
//!
//! The stepped shape is an explicit channel protocol rather than language
//! coroutines: the task sends `Pause`/`Done`/`Fail` messages, and the
//! dispatcher drives broadcasts between steps. All three shapes are
//! treated identically by the dispatcher.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::error;

use crate::tree::NodeKey;
use crate::{Error, Result};

/// A DOM event delivered to a server-side callback.
///
/// Payload fields from the client message are exposed by name through
/// [`TagEvent::field`]; the common ones have typed accessors.
#[derive(Clone, Debug)]
pub struct TagEvent {
    /// The node the event targets.
    pub target: NodeKey,
    /// The target's wire id.
    pub target_id: String,
    /// The target's tag name.
    pub tag: String,
    /// Event name, e.g. `click` or `input`.
    pub name: String,
    /// Raw payload fields echoed by the client.
    pub data: Map<String, Value>,
}

impl TagEvent {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    /// The echoed input value, when the event carries one.
    pub fn value(&self) -> Option<&str> {
        self.field("value").and_then(|v| v.as_str())
    }

    /// The pressed key, for keyboard events.
    pub fn key(&self) -> Option<&str> {
        self.field("key").and_then(|v| v.as_str())
    }

    /// Correlation id the client uses to resolve its pending promise.
    pub fn callback_id(&self) -> Option<&str> {
        self.field("callback_id").and_then(|v| v.as_str())
    }
}

/// What a callback hands back to the client.
///
/// A returned node is not wire-serializable; the dispatcher coerces it to
/// a simple `true` before transmission.
#[derive(Clone, Debug)]
pub enum EventResult {
    None,
    Value(Value),
    Node(NodeKey),
}

impl EventResult {
    /// Wire form of the result: `Node` collapses to `true`.
    pub(crate) fn into_wire(self) -> Option<Value> {
        match self {
            EventResult::None => None,
            EventResult::Value(v) => Some(v),
            EventResult::Node(_) => Some(Value::Bool(true)),
        }
    }
}

impl From<Value> for EventResult {
    fn from(v: Value) -> Self {
        EventResult::Value(v)
    }
}

impl From<&str> for EventResult {
    fn from(v: &str) -> Self {
        EventResult::Value(Value::String(v.to_string()))
    }
}

impl From<String> for EventResult {
    fn from(v: String) -> Self {
        EventResult::Value(Value::String(v))
    }
}

impl From<bool> for EventResult {
    fn from(v: bool) -> Self {
        EventResult::Value(Value::Bool(v))
    }
}

impl From<i64> for EventResult {
    fn from(v: i64) -> Self {
        EventResult::Value(Value::from(v))
    }
}

impl From<NodeKey> for EventResult {
    fn from(v: NodeKey) -> Self {
        EventResult::Node(v)
    }
}

impl From<()> for EventResult {
    fn from(_: ()) -> Self {
        EventResult::None
    }
}

/// Message protocol between a stepped callback task and the dispatcher.
pub(crate) enum StepMsg {
    /// Request an intermediate broadcast; the sender waits on the ack.
    Pause(oneshot::Sender<()>),
    Done(EventResult),
    Fail(String),
}

/// Handed to a stepped callback; each `pause` yields control for one
/// intermediate broadcast.
#[derive(Clone)]
pub struct Stepper {
    tx: mpsc::UnboundedSender<StepMsg>,
}

impl Stepper {
    /// Yield control: the dispatcher broadcasts the current tree state,
    /// then the task resumes. Returns `Err` if the session dropped the
    /// dispatch (the task should wind down).
    pub async fn pause(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(StepMsg::Pause(ack_tx))
            .map_err(|_| Error::callback("dispatcher gone"))?;
        ack_rx.await.map_err(|_| Error::callback("dispatcher gone"))
    }

    fn finish(&self, result: EventResult) {
        let _ = self.tx.send(StepMsg::Done(result));
    }

    fn fail(&self, detail: String) {
        let _ = self.tx.send(StepMsg::Fail(detail));
    }
}

type DirectFn = dyn Fn(TagEvent) -> Result<EventResult> + Send + Sync;
type FutureFn = dyn Fn(TagEvent) -> BoxFuture<'static, Result<EventResult>> + Send + Sync;
type SteppedFn = dyn Fn(TagEvent, Stepper) + Send + Sync;

/// A bound event callback.
#[derive(Clone)]
pub enum Handler {
    Direct(Arc<DirectFn>),
    Future(Arc<FutureFn>),
    Stepped(Arc<SteppedFn>),
}

impl Handler {
    /// A synchronous callback.
    pub fn direct<F, R>(f: F) -> Self
    where
        F: Fn(TagEvent) -> Result<R> + Send + Sync + 'static,
        R: Into<EventResult>,
    {
        Handler::Direct(Arc::new(move |ev| f(ev).map(Into::into)))
    }

    /// An async callback.
    pub fn future<F, Fut, R>(f: F) -> Self
    where
        F: Fn(TagEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<R>> + Send + 'static,
        R: Into<EventResult>,
    {
        Handler::Future(Arc::new(move |ev| {
            let fut = f(ev);
            Box::pin(async move { fut.await.map(Into::into) })
        }))
    }

    /// A cooperative multi-step callback. The task runs on the runtime;
    /// `stepper.pause().await` triggers an intermediate broadcast.
    pub fn stepped<F, Fut, R>(f: F) -> Self
    where
        F: Fn(TagEvent, Stepper) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<R>> + Send + 'static,
        R: Into<EventResult>,
    {
        Handler::Stepped(Arc::new(move |ev, stepper| {
            let fut = f(ev, stepper.clone());
            tokio::spawn(async move {
                match fut.await {
                    Ok(result) => stepper.finish(result.into()),
                    Err(err) => stepper.fail(err.to_string()),
                }
            });
        }))
    }

    /// Run the handler to completion. `on_pause` is awaited for every
    /// intermediate yield of a stepped callback.
    pub(crate) async fn run<P, PFut>(&self, event: TagEvent, mut on_pause: P) -> Result<EventResult>
    where
        P: FnMut() -> PFut,
        PFut: std::future::Future<Output = ()>,
    {
        match self {
            Handler::Direct(f) => f(event),
            Handler::Future(f) => f(event).await,
            Handler::Stepped(factory) => {
                let (tx, mut rx) = mpsc::unbounded_channel();
                factory(event, Stepper { tx });
                loop {
                    match rx.recv().await {
                        Some(StepMsg::Pause(ack)) => {
                            on_pause().await;
                            if ack.send(()).is_err() {
                                // Task went away between pause and ack.
                                error!("stepped callback dropped before resuming");
                            }
                        }
                        Some(StepMsg::Done(result)) => return Ok(result),
                        Some(StepMsg::Fail(detail)) => return Err(Error::Callback(detail)),
                        None => return Ok(EventResult::None),
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shape = match self {
            Handler::Direct(_) => "Direct",
            Handler::Future(_) => "Future",
            Handler::Stepped(_) => "Stepped",
        };
        f.debug_tuple("Handler").field(&shape).finish()
    }
}
