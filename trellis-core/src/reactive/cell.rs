//! Reactive cells.
//!
//! A [`Cell`] is a value box that remembers which nodes last read it
//! during a render. Writing a changed value marks exactly those nodes
//! dirty; [`Cell::notify`] forces the marking even without a value change,
//! for in-place mutation of composite values.
//!
//! # How observation works
//!
//! 1. A dynamic child producer reads the cell through its [`Scope`].
//! 2. The cell records the currently-rendering node's key together with a
//!    weak handle to the document's dirty inbox.
//! 3. A later `set` pushes the observed keys into that inbox; the document
//!    folds them into node dirty flags the next time it is locked.
//!
//! Routing dirtiness through the inbox instead of the document lock means
//! a cell can be written from anywhere: an event callback, a background
//! task, or even a producer that is itself mid-render.
//!
//! Observer entries hold node keys, not references; a key whose arena slot
//! was freed is ignored at flush time, so dead nodes never leak through a
//! cell. Entries whose document is gone are pruned on notification, and
//! entries whose slot was freed are pruned on the next tracked read.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::tree::{DirtyInbox, NodeKey};

use super::Scope;

static CELL_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

struct Observer {
    key: NodeKey,
    inbox: Weak<DirtyInbox>,
}

struct CellInner<T> {
    id: u64,
    value: RwLock<T>,
    observers: Mutex<Vec<Observer>>,
}

/// A reactive value observed by rendering nodes.
///
/// Cloning a `Cell` shares the underlying value and observer set.
pub struct Cell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    inner: Arc<CellInner<T>>,
}

impl<T> Cell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(CellInner {
                id: CELL_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
                value: RwLock::new(value),
                observers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Read the value, registering the currently-rendering node (taken
    /// from the scope) as an observer.
    pub fn get(&self, scope: &Scope<'_>) -> T {
        if let Some(key) = scope.current() {
            let inbox = scope.inbox();
            let mut observers = self.inner.observers.lock();
            // Entries for this document whose slot was freed are dropped
            // here, so the list stays bounded under node churn.
            observers.retain(|o| !Weak::ptr_eq(&o.inbox, &inbox) || scope.contains(o.key));
            if !observers
                .iter()
                .any(|o| o.key == key && Weak::ptr_eq(&o.inbox, &inbox))
            {
                observers.push(Observer { key, inbox });
            }
        }
        self.inner.value.read().clone()
    }

    /// Read without establishing an observation.
    pub fn get_untracked(&self) -> T {
        self.inner.value.read().clone()
    }

    /// Write a new value. Observers are marked dirty only when the value
    /// actually changed (by `PartialEq`).
    pub fn set(&self, value: T) {
        {
            let mut guard = self.inner.value.write();
            if *guard == value {
                return;
            }
            *guard = value;
        }
        self.notify();
    }

    /// Compute a new value from the current one.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let next = {
            let guard = self.inner.value.read();
            f(&guard)
        };
        self.set(next);
    }

    /// Mark every observer dirty regardless of value equality. Use after
    /// mutating a composite value in place.
    pub fn notify(&self) {
        // Snapshot under the cell lock, deliver without it: the inbox has
        // its own lock and must stay the innermost one.
        let snapshot: Vec<(NodeKey, Weak<DirtyInbox>)> = {
            let observers = self.inner.observers.lock();
            observers.iter().map(|o| (o.key, o.inbox.clone())).collect()
        };

        let mut dead = Vec::new();
        for (key, inbox) in snapshot {
            match inbox.upgrade() {
                Some(inbox) => inbox.push(key),
                None => dead.push(key),
            }
        }

        if !dead.is_empty() {
            let mut observers = self.inner.observers.lock();
            observers.retain(|o| !dead.contains(&o.key));
        }
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.lock().len()
    }
}

impl<T> Clone for Cell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Cell<T>
where
    T: Clone + PartialEq + Send + Sync + std::fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cell")
            .field("id", &self.inner.id)
            .field("value", &self.get_untracked())
            .field("observers", &self.observer_count())
            .finish()
    }
}
