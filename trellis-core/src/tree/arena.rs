//! Generational node arena.
//!
//! Tree nodes live in a slot arena rather than behind `Rc`/`Weak`
//! references. A [`NodeKey`] is an index plus a generation counter; freeing
//! a slot bumps the generation, so stale keys held elsewhere (for example
//! by a reactive cell's observer list) simply read as absent instead of
//! dangling. This gives the runtime weak-reference semantics without
//! garbage collection.

use super::node::TagNode;

/// Stable handle to a node slot.
///
/// Keys are cheap to copy and remain valid until the slot is freed. After
/// that, lookups with the old key return `None` (generation mismatch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeKey {
    index: u32,
    generation: u32,
}

impl NodeKey {
    /// Raw slot index, mainly useful for debug output.
    pub fn index(&self) -> u32 {
        self.index
    }
}

struct Slot {
    generation: u32,
    node: Option<TagNode>,
}

/// Slot arena holding every node of one document.
pub struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl Arena {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Insert a node, reusing a freed slot when one is available.
    pub fn insert(&mut self, node: TagNode) -> NodeKey {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            NodeKey {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                node: Some(node),
            });
            NodeKey {
                index,
                generation: 0,
            }
        }
    }

    pub fn get(&self, key: NodeKey) -> Option<&TagNode> {
        let slot = self.slots.get(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.node.as_ref()
    }

    pub fn get_mut(&mut self, key: NodeKey) -> Option<&mut TagNode> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.node.as_mut()
    }

    /// Free a slot, invalidating every outstanding key to it.
    pub fn remove(&mut self, key: NodeKey) -> Option<TagNode> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        self.live -= 1;
        Some(node)
    }

    /// Liveness check used by observers holding old keys.
    pub fn contains(&self, key: NodeKey) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}
