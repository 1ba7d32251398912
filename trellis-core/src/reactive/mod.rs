//! Reactive primitives.
//!
//! A [`Cell`] holds one value and tracks which nodes read it during a
//! render; writing a changed value marks exactly those nodes dirty. The
//! tracking context is the explicit [`Scope`] handed to dynamic child
//! producers; there is no ambient thread-local state.

mod cell;
mod scope;

pub use cell::Cell;
pub use scope::{RenderCx, Scope, View};

pub(crate) use scope::ViewFrag;
