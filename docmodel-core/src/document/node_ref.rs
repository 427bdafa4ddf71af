use std::{fmt, sync::Arc};

use bson::Bson;

use super::{Document, GetOptions, NodeId};
use crate::{error::DocumentResult, schema::Schema, serialize::ToObjectOptions};

/// Read-only view of one node of a document: the root or an embedded subdocument.
///
/// Setters, getters, defaults, virtuals and validators receive the node that owns the path
/// they run for, so they can read sibling values and walk up to their ancestors.
#[derive(Clone, Copy)]
pub struct NodeRef<'a> {
    doc: &'a Document,
    id: NodeId,
}

impl<'a> NodeRef<'a> {
    pub(crate) fn new(doc: &'a Document, id: NodeId) -> Self {
        Self { doc, id }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Read `path` relative to this node, with getters and virtuals.
    pub fn get(&self, path: &str) -> Bson {
        self.doc.read(self.id, path, GetOptions::default())
    }

    pub fn get_with(&self, path: &str, options: GetOptions) -> Bson {
        self.doc.read(self.id, path, options)
    }

    /// Read the stored value at `path`, skipping getters and virtuals.
    pub fn get_raw(&self, path: &str) -> Bson {
        self.doc.read(self.id, path, GetOptions::raw())
    }

    /// True if `path`, relative to this node, was modified since the last reset.
    pub fn is_modified(&self, path: &str) -> bool {
        self.doc
            .arena
            .get(self.id)
            .is_some_and(|node| node.tracker.is_modified(path))
    }

    pub fn parent(&self) -> Option<NodeRef<'a>> {
        let link = self.doc.arena.get(self.id)?.parent.as_ref()?;
        self.doc.node(link.node)
    }

    pub fn is_root(&self) -> bool {
        self.id == self.doc.root
    }

    /// The top-level document this node belongs to.
    pub fn owner_document(&self) -> &'a Document {
        self.doc
    }

    /// Path of this node from the root; empty for the root itself.
    pub fn full_path(&self) -> String {
        self.doc.full_path(self.id, "")
    }

    pub fn schema(&self) -> &'a Arc<Schema> {
        &self.doc.arena[self.id].schema
    }

    pub fn is_new(&self) -> bool {
        self.doc.is_new
    }

    /// Project this node on its own, applying its schema's transform.
    pub fn to_object(&self, options: ToObjectOptions) -> DocumentResult<bson::Document> {
        self.doc.to_object_node(self.id, options)
    }
}

impl fmt::Debug for NodeRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRef")
            .field("id", &self.id)
            .field("path", &self.full_path())
            .finish()
    }
}
