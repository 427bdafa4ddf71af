//! Schema-bound, change-tracked documents.
//!
//! A [`Document`] owns a tree of nodes: the root and every embedded subdocument, stored in
//! an arena and addressed by [`NodeId`]. Reads and writes take dotted paths relative to the
//! root (or to a node, through [`NodeRef`] and the `*_node` variants) and route through the
//! schema: values are cast on write, getters and virtuals apply on read, and every effective
//! write is recorded in the change tracker of the node that owns the path and of each of its
//! ancestors.
//!
//! # Example
//!
//! ```ignore
//! use bson::doc;
//! use docmodel_core::{document::Document, schema::{PathOptions, Schema}};
//!
//! let schema = Schema::builder()
//!     .path("name", PathOptions::string().required(true))
//!     .path("nested.age", PathOptions::number())
//!     .build()?;
//!
//! let mut doc = Document::new(schema, doc! { "name": "Ann", "nested": { "age": "3" } })?;
//! assert_eq!(doc.get("nested.age"), bson::Bson::Double(3.0));
//!
//! doc.set("nested", doc! { "age": 4 })?;
//! assert_eq!(doc.direct_modified_paths(), vec!["name", "nested"]);
//! ```

mod arena;
mod array;
mod build;
mod changes;
mod get;
mod node_ref;
mod populate;
mod set;

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, Mutex},
};

use bson::Bson;

use crate::{
    cast::display_bson,
    error::{DocumentError, DocumentResult, PathError, ValidatorError, ValidatorKind},
    path,
    schema::{HookPoint, Schema},
    selection::Selection,
    validate::InFlight,
    value::{Value, bson_equal, bson_is_nullish},
};

pub use arena::NodeId;
pub use node_ref::NodeRef;
pub use populate::{PopulationState, RefValue};

pub(crate) use arena::{Arena, Node, ParentLink};
pub(crate) use get::{Route, apply_getters};
pub(crate) use set::WriteMode;

/// Read options for [`Document::get_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetOptions {
    /// Apply getter chains.
    pub getters: bool,
    /// Resolve virtual paths.
    pub virtuals: bool,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            getters: true,
            virtuals: true,
        }
    }
}

impl GetOptions {
    /// Stored values only: no getters, no virtuals.
    pub fn raw() -> Self {
        Self {
            getters: false,
            virtuals: false,
        }
    }
}

/// Write options for [`Document::set_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Merge object values into nested paths and subdocuments instead of replacing them.
    pub merge: bool,
}

/// A document instance bound to a schema.
pub struct Document {
    pub(crate) schema: Arc<Schema>,
    pub(crate) arena: Arena,
    pub(crate) root: NodeId,
    pub(crate) is_new: bool,
    pub(crate) selection: Option<Selection>,
    pub(crate) populated: HashMap<String, PopulationState>,
    pub(crate) validating: Mutex<HashMap<NodeId, Vec<InFlight>>>,
    pub(crate) model_name: Option<String>,
}

impl Document {
    fn empty(schema: Arc<Schema>, is_new: bool, selection: Option<Selection>) -> Self {
        let mut arena = Arena::default();
        let root = arena.alloc(Node::new(schema.clone(), build::scaffold(&schema, ""), None));

        Self {
            schema,
            arena,
            root,
            is_new,
            selection,
            populated: HashMap::new(),
            validating: Mutex::new(HashMap::new()),
            model_name: None,
        }
    }

    /// Build a new document from untrusted input.
    ///
    /// Constant defaults are applied first, then every input key is set (running setters
    /// and casts, and marking the path modified), then function defaults fill whatever is
    /// still missing. Cast failures are recorded on their paths and surface on the next
    /// validation.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::ObjectParameter`] if `input` is not a document, or
    /// [`DocumentError::StrictMode`] if it carries an undeclared key and the schema is in
    /// throw mode.
    pub fn new(schema: Arc<Schema>, input: impl Into<Bson>) -> DocumentResult<Self> {
        let input = match input.into() {
            Bson::Document(input) => input,
            Bson::Undefined | Bson::Null => bson::Document::new(),
            other => {
                return Err(DocumentError::ObjectParameter {
                    name: "obj".to_string(),
                    value: other,
                });
            }
        };

        let mut doc = Self::empty(schema, true, None);
        let root = doc.root;
        doc.populate_new(root, input)?;
        tracing::trace!(paths = doc.arena[root].tracker.direct_modified_paths().len(), "constructed document");

        Ok(doc)
    }

    /// Load a document from trusted, already-cast data, such as a stored record.
    ///
    /// No setters run and nothing is marked modified. Paths excluded by `selection` receive
    /// no default and read as undefined.
    pub fn init(
        schema: Arc<Schema>,
        data: bson::Document,
        selection: Option<Selection>,
    ) -> DocumentResult<Self> {
        let mut doc = Self::empty(schema, false, selection);
        let root = doc.root;
        doc.populate_init(root, data)?;
        Ok(doc)
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn root_ref(&self) -> NodeRef<'_> {
        NodeRef::new(self, self.root)
    }

    /// True until the document has been persisted once.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn set_is_new(&mut self, is_new: bool) {
        self.is_new = is_new;
    }

    pub fn model_name(&self) -> Option<&str> {
        self.model_name.as_deref()
    }

    pub fn set_model_name(&mut self, name: impl Into<String>) {
        self.model_name = Some(name.into());
    }

    pub fn selection(&self) -> Option<&Selection> {
        self.selection.as_ref()
    }

    /// Returns true if `path` was loaded, i.e. not excluded by the selection the document was
    /// initialized with.
    pub fn is_selected(&self, path: &str) -> bool {
        self.selection
            .as_ref()
            .is_none_or(|selection| selection.is_selected(&path::schema_path(path)))
    }

    /// The stored `_id`, or undefined.
    pub fn id(&self) -> Bson {
        self.lookup_value(self.root, "_id")
            .map(|value| self.plain_value(value, true))
            .unwrap_or(Bson::Undefined)
    }

    /// A handle to a live node of this document.
    pub fn node(&self, id: NodeId) -> Option<NodeRef<'_>> {
        self.arena.contains(id).then(|| NodeRef::new(self, id))
    }

    /// The embedded document stored at `path`, if any.
    pub fn subdocument(&self, path: &str) -> Option<NodeRef<'_>> {
        match self.route(self.root, path) {
            Route::Node { node, rel } => self
                .lookup_value(node, &rel)
                .and_then(Value::as_embedded)
                .map(|id| NodeRef::new(self, id)),
            _ => None,
        }
    }

    pub(crate) fn check_node(&self, id: NodeId) -> DocumentResult<()> {
        if self.arena.contains(id) {
            Ok(())
        } else {
            Err(DocumentError::InvalidPath(
                format!("{:?}", id),
                "node handle does not belong to a live node of this document".to_string(),
            ))
        }
    }

    /// Path of `rel` inside `node`, relative to the root.
    pub(crate) fn full_path(&self, node: NodeId, rel: &str) -> String {
        let mut full = rel.to_string();
        let mut current = node;
        while let Some(link) = self.arena.get(current).and_then(|node| node.parent.as_ref()) {
            full = path::join(&link.slot, &full);
            current = link.node;
        }
        full
    }

    /// The node that stores `path` (relative to `start`), with the path relative to it.
    pub(crate) fn locate(&self, start: NodeId, path: &str) -> (NodeId, String) {
        match self.route(start, path) {
            Route::Node { node, rel } => (node, rel),
            Route::Inner { node, rel, rest } | Route::Populated { node, rel, rest, .. } => {
                (node, path::join(&rel, &rest))
            }
        }
    }

    /// Every live node reachable from the root, parents first, with its path from the root.
    pub(crate) fn walk_nodes(&self) -> Vec<(NodeId, String)> {
        let mut out = Vec::new();
        let mut pending = vec![(self.root, String::new())];
        while let Some((id, prefix)) = pending.pop() {
            let mut children: Vec<(NodeId, String)> = self
                .arena
                .children(id)
                .into_iter()
                .filter_map(|child| {
                    let slot = &self.arena.get(child)?.parent.as_ref()?.slot;
                    Some((child, path::join(&prefix, slot)))
                })
                .collect();
            children.reverse();
            out.push((id, prefix));
            pending.extend(children);
        }
        out
    }

    /// Identifier equality.
    ///
    /// Documents with identifiers compare by the canonical string form of `_id`. When neither
    /// document has an identifier, their depopulated stored values are compared structurally.
    pub fn equals(&self, other: &Document) -> bool {
        let (mine, theirs) = (self.id(), other.id());
        match (bson_is_nullish(&mine), bson_is_nullish(&theirs)) {
            (false, false) => display_bson(&mine) == display_bson(&theirs),
            (true, true) => bson_equal(
                &Bson::Document(self.plain_node(self.root, true)),
                &Bson::Document(other.plain_node(other.root, true)),
            ),
            _ => false,
        }
    }

    /// True if the object at `path` (or the root, for `""`) has no defined keys. Non-object
    /// values are never empty.
    pub fn is_empty_at(&self, path: &str) -> bool {
        if path.is_empty() {
            return self.arena[self.root].raw.defined_len() == 0;
        }

        let (node, rel) = self.locate(self.root, path);
        match self.lookup_value(node, &rel) {
            Some(Value::Mapping(mapping)) => mapping.defined_len() == 0,
            Some(Value::Embedded(child)) => self.arena[*child].raw.defined_len() == 0,
            Some(Value::Primitive(Bson::Document(doc))) => doc.is_empty(),
            _ => false,
        }
    }

    /// Pending cast errors and user invalidations, keyed by path from the root.
    pub fn errors(&self) -> BTreeMap<String, PathError> {
        let mut out = BTreeMap::new();
        for (id, prefix) in self.walk_nodes() {
            let node = &self.arena[id];
            for (rel, err) in &node.cast_errors {
                out.insert(path::join(&prefix, rel), PathError::Cast(err.clone().prefixed(&prefix)));
            }
            for (rel, err) in &node.invalidated {
                out.insert(
                    path::join(&prefix, rel),
                    PathError::Validator(err.clone().prefixed(&prefix)),
                );
            }
        }
        out
    }

    /// Record a user-defined validation failure on `path`. It is reported by the next
    /// validation pass unless the path is written first.
    pub fn invalidate(&mut self, path: &str, message: impl Into<String>) {
        let value = self.storage_value(path);
        let (node, rel) = self.locate(self.root, path);
        let message = message.into();
        tracing::debug!(path, %message, "path invalidated");

        self.arena[node].invalidated.insert(
            rel.clone(),
            ValidatorError {
                path: rel,
                value,
                kind: ValidatorKind::UserDefined,
                message,
                reason: None,
            },
        );
    }

    /// Invoke a schema-declared instance method, wrapped in its pre and post hooks.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::MethodNotFound`] for an undeclared method and
    /// [`DocumentError::Hook`] if a hook or the method body fails.
    pub fn call(&mut self, name: &str, args: &[Bson]) -> DocumentResult<Bson> {
        let schema = self.schema.clone();
        let method = schema
            .method(name)
            .cloned()
            .ok_or_else(|| DocumentError::MethodNotFound(name.to_string()))?;
        let point = HookPoint::Method(name.to_string());

        schema.hooks().run_pre(&point, self)?;
        let result = method(self, args).map_err(|message| DocumentError::Hook {
            point: point.to_string(),
            message,
        })?;
        schema.hooks().run_post(&point, self)?;

        Ok(result)
    }
}

impl Clone for Document {
    fn clone(&self) -> Self {
        Self {
            schema: self.schema.clone(),
            arena: self.arena.clone(),
            root: self.root,
            is_new: self.is_new,
            selection: self.selection.clone(),
            populated: self.populated.clone(),
            validating: Mutex::new(HashMap::new()),
            model_name: self.model_name.clone(),
        }
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("model", &self.model_name)
            .field("is_new", &self.is_new)
            .field("value", &self.plain_node(self.root, false))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;
    use crate::schema::{PathOptions, SchemaOptions};

    fn schema() -> Arc<Schema> {
        let child = Schema::builder()
            .path("title", PathOptions::string())
            .build()
            .unwrap();

        Schema::builder()
            .path("name", PathOptions::string())
            .path("child", PathOptions::embedded(child.clone()))
            .path("items", PathOptions::document_array(child))
            .path("info", PathOptions::mixed())
            .build()
            .unwrap()
    }

    #[test]
    fn non_object_input_is_rejected() {
        let err = Document::new(schema(), Bson::Int32(3)).unwrap_err();
        assert!(matches!(err, DocumentError::ObjectParameter { .. }));
    }

    #[test]
    fn walk_reports_full_paths() {
        let doc = Document::new(
            schema(),
            doc! { "child": { "title": "a" }, "items": [ { "title": "b" }, { "title": "c" } ] },
        )
        .unwrap();

        let paths: Vec<String> = doc.walk_nodes().into_iter().map(|(_, path)| path).collect();
        assert_eq!(paths, vec!["", "child", "items.0", "items.1"]);

        let item = doc.subdocument("items.1").unwrap();
        assert_eq!(item.full_path(), "items.1");
        assert_eq!(item.get("title"), Bson::String("c".into()));
    }

    #[test]
    fn equality_uses_identifiers_then_structure() {
        let a = Document::new(schema(), doc! { "name": "x" }).unwrap();
        let mut b = a.clone();
        b.set("name", "y").unwrap();
        assert!(a.equals(&b));

        let c = Document::new(schema(), doc! { "name": "x" }).unwrap();
        assert!(!a.equals(&c));

        let bare = Schema::builder()
            .path("name", PathOptions::string())
            .options(SchemaOptions::default().id_path(false))
            .build()
            .unwrap();
        let x = Document::new(bare.clone(), doc! { "name": "x" }).unwrap();
        let y = Document::new(bare.clone(), doc! { "name": "x" }).unwrap();
        let z = Document::new(bare, doc! { "name": "z" }).unwrap();
        assert!(x.equals(&y));
        assert!(!x.equals(&z));
    }

    #[test]
    fn emptiness_of_objects() {
        let mut doc = Document::new(schema(), doc! { "info": {} }).unwrap();
        assert!(doc.is_empty_at("info"));
        assert!(!doc.is_empty_at("name"));

        doc.set("child", doc! {}).unwrap();
        // the subdocument carries a generated _id
        assert!(!doc.is_empty_at("child"));
    }

    #[test]
    fn methods_run_between_hooks() {
        let schema = Schema::builder()
            .path("count", PathOptions::number().default_value(0))
            .method("bump", |doc: &mut Document, args: &[Bson]| {
                let by = args.first().and_then(Bson::as_i32).unwrap_or(1);
                let next = doc.get("count").as_f64().unwrap_or_default() + f64::from(by);
                doc.set("count", next).map_err(|err| err.to_string())?;
                Ok(Bson::Double(next))
            })
            .pre(HookPoint::Method("bump".into()), |doc: &mut Document| {
                doc.set("count", 10).map_err(|err| err.to_string())
            })
            .build()
            .unwrap();

        let mut doc = Document::new(schema, doc! {}).unwrap();
        assert_eq!(doc.call("bump", &[Bson::Int32(2)]).unwrap(), Bson::Double(12.0));
        assert!(matches!(
            doc.call("missing", &[]),
            Err(DocumentError::MethodNotFound(_))
        ));
    }
}
