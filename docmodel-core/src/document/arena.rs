//! Node storage for a document tree.
//!
//! Subdocuments live in an arena owned by their top-level [`Document`](super::Document) and
//! point back at their parent through a [`ParentLink`]. Handles carry a generation so a
//! [`NodeId`] held after its node was replaced is rejected rather than aliasing a new node.

use std::{collections::BTreeMap, fmt, ops::{Index, IndexMut}, sync::Arc};

use crate::{
    error::{CastError, ValidatorError},
    path,
    schema::Schema,
    tracker::ChangeTracker,
    value::{Mapping, Value},
};

/// Handle to a node inside a document.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}v{})", self.index, self.generation)
    }
}

/// Where a node sits inside its parent: the parent handle and the slot path relative to the
/// parent, such as `child` or `items.3`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ParentLink {
    pub node: NodeId,
    pub slot: String,
}

impl ParentLink {
    pub fn new(node: NodeId, slot: impl Into<String>) -> Self {
        Self {
            node,
            slot: slot.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub schema: Arc<Schema>,
    pub raw: Mapping,
    pub parent: Option<ParentLink>,
    pub tracker: ChangeTracker,
    pub cast_errors: BTreeMap<String, CastError>,
    pub invalidated: BTreeMap<String, ValidatorError>,
    /// Set while the node is being populated from input; marks stay local until cleared.
    pub building: bool,
}

impl Node {
    pub fn new(schema: Arc<Schema>, raw: Mapping, parent: Option<ParentLink>) -> Self {
        Self {
            schema,
            raw,
            parent,
            tracker: ChangeTracker::new(),
            cast_errors: BTreeMap::new(),
            invalidated: BTreeMap::new(),
            building: false,
        }
    }

    /// Drop recorded errors at `rel` and below.
    pub fn clear_errors(&mut self, rel: &str) {
        self.cast_errors
            .retain(|path, _| path != rel && !path::is_ancestor(rel, path));
        self.invalidated
            .retain(|path, _| path != rel && !path::is_ancestor(rel, path));
    }
}

#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Arena {
    pub fn alloc(&mut self, node: Node) -> NodeId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.generation += 1;
                slot.node = Some(node);
                NodeId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                NodeId {
                    index,
                    generation: 0,
                }
            }
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    /// Nodes directly held in `id`'s raw values.
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        if let Some(node) = self.get(id) {
            for value in node.raw.values() {
                value.embedded_nodes(&mut out);
            }
        }
        out
    }

    /// Release a node and every node below it.
    pub fn free_subtree(&mut self, id: NodeId) {
        let mut pending = vec![id];
        while let Some(current) = pending.pop() {
            pending.extend(self.children(current));
            if let Some(slot) = self.slots.get_mut(current.index as usize) {
                if slot.generation == current.generation && slot.node.take().is_some() {
                    self.free.push(current.index);
                }
            }
        }
    }

    /// Release every node held by a value.
    pub fn free_value(&mut self, value: &Value) {
        let mut held = Vec::new();
        value.embedded_nodes(&mut held);
        for id in held {
            self.free_subtree(id);
        }
    }
}

impl Index<NodeId> for Arena {
    type Output = Node;

    fn index(&self, id: NodeId) -> &Node {
        match self.get(id) {
            Some(node) => node,
            None => panic!("stale node handle {:?}", id),
        }
    }
}

impl IndexMut<NodeId> for Arena {
    fn index_mut(&mut self, id: NodeId) -> &mut Node {
        match self.get_mut(id) {
            Some(node) => node,
            None => panic!("stale node handle {:?}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Arc<Schema> {
        Schema::builder().build().unwrap()
    }

    #[test]
    fn freed_handles_are_stale() {
        let mut arena = Arena::default();
        let parent = arena.alloc(Node::new(schema(), Mapping::new(), None));
        let child = arena.alloc(Node::new(
            schema(),
            Mapping::new(),
            Some(ParentLink::new(parent, "child")),
        ));
        arena[parent].raw.insert("child", Value::Embedded(child));

        arena.free_subtree(parent);
        assert!(!arena.contains(parent));
        assert!(!arena.contains(child));

        let reused = arena.alloc(Node::new(schema(), Mapping::new(), None));
        assert!(arena.contains(reused));
        assert!(!arena.contains(child));
        assert!(!arena.contains(parent));
    }
}
