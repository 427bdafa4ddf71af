//! Read routing and plain-value projection.

use bson::Bson;

use super::{Document, GetOptions, NodeId, NodeRef};
use crate::{
    cast::cast_scalar,
    error::DocumentResult,
    path,
    schema::{PathOptions, SchemaType, StringNormalize},
    serialize::ResolvedOptions,
    value::{Mapping, Value, bson_assign, bson_lookup},
};

/// Where a path from some start node ends up.
pub(crate) enum Route<'a> {
    /// `rel` lies inside `node` (it may not exist yet).
    Node { node: NodeId, rel: String },
    /// `rel` holds a plain value (such as a `Mixed` object) and `rest` lies inside it.
    Inner {
        node: NodeId,
        rel: String,
        rest: String,
    },
    /// `rel` holds a populated document and `rest` lies inside it.
    Populated {
        doc: &'a Document,
        node: NodeId,
        rel: String,
        rest: String,
    },
}

pub(crate) fn apply_getters(options: &PathOptions, value: Bson, node: &NodeRef<'_>) -> Bson {
    options
        .getters
        .iter()
        .rev()
        .fold(value, |value, getter| getter(value, node))
}

impl Document {
    /// Read `path` with getters and virtuals applied.
    ///
    /// The empty path reads as undefined, as does any path that holds no value, including
    /// paths excluded by the selection the document was loaded with.
    pub fn get(&self, path: &str) -> Bson {
        self.get_with(path, GetOptions::default())
    }

    pub fn get_with(&self, path: &str, options: GetOptions) -> Bson {
        self.read(self.root, path, options)
    }

    /// Read `path` and cast the result to `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::Cast`](crate::error::DocumentError::Cast) if the value does
    /// not cast.
    pub fn get_as(&self, path: &str, kind: &SchemaType) -> DocumentResult<Bson> {
        let value = self.get(path);
        let config = self.schema.cast_config().clone();
        Ok(cast_scalar(kind, value, path, &config, StringNormalize::default())?)
    }

    /// Walk `path` from `start`, switching nodes at embedded documents.
    pub(crate) fn route(&self, start: NodeId, path: &str) -> Route<'_> {
        let mut node = start;
        let mut rel = String::new();
        let mut current: Option<&Value> = None;
        let mut segments = path::segments(path).peekable();

        while let Some(segment) = segments.next() {
            let next = match current {
                None => self.arena.get(node).and_then(|owner| owner.raw.get(segment)),
                Some(Value::Mapping(mapping)) => mapping.get(segment),
                Some(Value::Array(items)) => path::as_index(segment).and_then(|index| items.get(index)),
                Some(_) => None,
            };
            rel = path::join(&rel, segment);
            let more = segments.peek().is_some();

            match next {
                Some(Value::Embedded(child)) if more => {
                    node = *child;
                    rel.clear();
                    current = None;
                }
                Some(Value::Primitive(_)) if more => {
                    let rest = segments.collect::<Vec<_>>().join(".");
                    return Route::Inner { node, rel, rest };
                }
                Some(Value::Populated(doc)) if more => {
                    let rest = segments.collect::<Vec<_>>().join(".");
                    return Route::Populated {
                        doc,
                        node,
                        rel,
                        rest,
                    };
                }
                Some(value) => current = Some(value),
                None => {
                    let rest = segments.collect::<Vec<_>>().join(".");
                    return Route::Node {
                        node,
                        rel: path::join(&rel, &rest),
                    };
                }
            }
        }

        Route::Node { node, rel }
    }

    /// The value stored at `rel` inside one node. Does not descend into embedded documents.
    pub(crate) fn lookup_value(&self, node: NodeId, rel: &str) -> Option<&Value> {
        let mut segments = path::segments(rel);
        let mut current = self.arena.get(node)?.raw.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                Value::Mapping(mapping) => mapping.get(segment)?,
                Value::Array(items) => items.get(path::as_index(segment)?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub(crate) fn lookup_value_mut(&mut self, node: NodeId, rel: &str) -> Option<&mut Value> {
        let mut segments = path::segments(rel);
        let mut current = self.arena.get_mut(node)?.raw.get_mut(segments.next()?)?;
        for segment in segments {
            current = match current {
                Value::Mapping(mapping) => mapping.get_mut(segment)?,
                Value::Array(items) => items.get_mut(path::as_index(segment)?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Read `path` relative to `node`.
    pub(crate) fn read(&self, node: NodeId, path: &str, options: GetOptions) -> Bson {
        if path.is_empty() {
            return Bson::Undefined;
        }
        let Some(owner) = self.arena.get(node) else {
            return Bson::Undefined;
        };
        let schema = &owner.schema;
        let path = schema.resolve_alias(path).unwrap_or(path);

        if let Some(path_options) = schema.path(path) {
            let value = self.read_stored(node, path, options.getters);
            return if options.getters && !path_options.getters.is_empty() {
                apply_getters(path_options, value, &NodeRef::new(self, node))
            } else {
                value
            };
        }

        if schema.is_nested(path) || (options.virtuals && schema.virtuals().has_descendants(path)) {
            return self.read_prefix(node, path, options);
        }

        if let Some(virtual_path) = schema.virtuals().get(path) {
            return match (&virtual_path.getter, options.virtuals) {
                (Some(getter), true) => getter(&NodeRef::new(self, node)),
                _ => Bson::Undefined,
            };
        }

        if let Some((prefix, _, rest)) = schema.find_prefix(path) {
            return self.read_below(node, prefix, rest, options);
        }

        self.plain_at(node, path)
    }

    /// The stored value at a declared path, projected with getters of inner paths but not
    /// of the path itself.
    fn read_stored(&self, node: NodeId, rel: &str, getters: bool) -> Bson {
        match self.lookup_value(node, rel) {
            Some(value) => self.read_value(node, rel, value, getters),
            None => Bson::Undefined,
        }
    }

    fn read_value(&self, node: NodeId, rel: &str, value: &Value, getters: bool) -> Bson {
        self.project_value(node, rel, value, &ResolvedOptions::reading(getters))
            .unwrap_or_else(|_| self.plain_value(value, false))
    }

    /// A nested prefix as an object: stored leaves plus any virtuals below it.
    fn read_prefix(&self, node: NodeId, prefix: &str, options: GetOptions) -> Bson {
        let inner = GetOptions {
            virtuals: false,
            ..options
        };
        let mut out = bson::Document::new();
        let mut null_base = false;

        match self.lookup_value(node, prefix) {
            Some(Value::Mapping(mapping)) => {
                for key in mapping.keys() {
                    let value = self.read(node, &path::join(prefix, key), inner);
                    if !matches!(value, Bson::Undefined) {
                        out.insert(key, value);
                    }
                }
            }
            Some(Value::Primitive(Bson::Null)) => null_base = true,
            _ => {}
        }

        if options.virtuals {
            let owner = &self.arena[node];
            for (rel, virtual_path) in owner.schema.virtuals().descendants(prefix) {
                if let Some(getter) = &virtual_path.getter {
                    let value = getter(&NodeRef::new(self, node));
                    if !matches!(value, Bson::Undefined) {
                        bson_assign(&mut out, rel, value);
                    }
                }
            }
        }

        if null_base && out.is_empty() {
            Bson::Null
        } else {
            Bson::Document(out)
        }
    }

    fn read_below(&self, node: NodeId, prefix: &str, rest: &str, options: GetOptions) -> Bson {
        match self.lookup_value(node, prefix) {
            Some(Value::Mapping(mapping)) => {
                let (key, tail) = path::split_first(rest);
                mapping
                    .get(key)
                    .map(|value| self.read_slot(node, &path::join(prefix, key), value, tail, options))
                    .unwrap_or(Bson::Undefined)
            }
            Some(Value::Array(items)) => self.read_items(node, prefix, items, rest, options),
            Some(value) => self.read_slot(node, prefix, value, Some(rest), options),
            None => Bson::Undefined,
        }
    }

    fn read_slot(
        &self,
        node: NodeId,
        rel: &str,
        value: &Value,
        tail: Option<&str>,
        options: GetOptions,
    ) -> Bson {
        match (value, tail) {
            (Value::Embedded(child), Some(tail)) => self.read(*child, tail, options),
            (Value::Populated(doc), Some(tail)) => doc.get_with(tail, options),
            (Value::Array(items), Some(tail)) => self.read_items(node, rel, items, tail, options),
            (value, Some(tail)) => {
                let base = self.read_value(node, rel, value, options.getters);
                bson_lookup(&base, tail).cloned().unwrap_or(Bson::Undefined)
            }
            (value, None) => self.read_value(node, rel, value, options.getters),
        }
    }

    /// `arr.3.x` reads one element; `arr.x` maps `x` over every element.
    fn read_items(
        &self,
        node: NodeId,
        rel: &str,
        items: &[Value],
        path: &str,
        options: GetOptions,
    ) -> Bson {
        let (head, tail) = path::split_first(path);
        match path::as_index(head) {
            Some(index) => items
                .get(index)
                .map(|item| self.read_slot(node, &path::join(rel, head), item, tail, options))
                .unwrap_or(Bson::Undefined),
            None => Bson::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(index, item)| {
                        self.read_slot(node, &path::join(rel, &index.to_string()), item, Some(path), options)
                    })
                    .collect(),
            ),
        }
    }

    /// Plain form of a stored value: no getters, virtuals or transforms. Undefined array
    /// items read as null.
    pub(crate) fn plain_value(&self, value: &Value, depopulate: bool) -> Bson {
        match value {
            Value::Undefined => Bson::Undefined,
            Value::Primitive(value) => value.clone(),
            Value::Mapping(mapping) => Bson::Document(self.plain_mapping(mapping, depopulate)),
            Value::Embedded(child) => Bson::Document(self.plain_node(*child, depopulate)),
            Value::Array(items) => Bson::Array(
                items
                    .iter()
                    .map(|item| match self.plain_value(item, depopulate) {
                        Bson::Undefined => Bson::Null,
                        other => other,
                    })
                    .collect(),
            ),
            Value::Populated(doc) if depopulate => doc.id(),
            Value::Populated(doc) => Bson::Document(doc.plain_node(doc.root, false)),
        }
    }

    fn plain_mapping(&self, mapping: &Mapping, depopulate: bool) -> bson::Document {
        let mut out = bson::Document::new();
        for (key, value) in mapping.iter() {
            if value.is_undefined() {
                continue;
            }
            out.insert(key, self.plain_value(value, depopulate));
        }
        out
    }

    pub(crate) fn plain_node(&self, node: NodeId, depopulate: bool) -> bson::Document {
        self.arena
            .get(node)
            .map(|owner| self.plain_mapping(&owner.raw, depopulate))
            .unwrap_or_default()
    }

    /// Plain value at `rel` from `node`, following embedded documents.
    pub(crate) fn plain_at(&self, node: NodeId, rel: &str) -> Bson {
        self.resolve_plain(node, rel, false)
    }

    /// Stored form of `path` from the root, with populated references reduced to ids.
    pub(crate) fn storage_value(&self, path: &str) -> Bson {
        self.resolve_plain(self.root, path, true)
    }

    fn resolve_plain(&self, start: NodeId, path: &str, depopulate: bool) -> Bson {
        match self.route(start, path) {
            Route::Node { node, rel } => self
                .lookup_value(node, &rel)
                .map(|value| self.plain_value(value, depopulate))
                .unwrap_or(Bson::Undefined),
            Route::Inner { node, rel, rest } => self
                .lookup_value(node, &rel)
                .and_then(Value::as_primitive)
                .and_then(|value| bson_lookup(value, &rest))
                .cloned()
                .unwrap_or(Bson::Undefined),
            Route::Populated { doc, rest, .. } => doc.resolve_plain(doc.root, &rest, depopulate),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bson::doc;

    use super::*;
    use crate::schema::{Schema, SchemaOptions, VirtualPath};

    fn schema() -> Arc<Schema> {
        let item = Schema::builder()
            .path("name", PathOptions::string())
            .options(SchemaOptions::default().id_path(false))
            .build()
            .unwrap();

        Schema::builder()
            .path(
                "name",
                PathOptions::string().getter(|value, _| match value {
                    Bson::String(s) => Bson::String(s.to_uppercase()),
                    other => other,
                }),
            )
            .path("nested.age", PathOptions::number())
            .path("items", PathOptions::document_array(item))
            .path("meta", PathOptions::mixed())
            .path("scores", PathOptions::map(SchemaType::Number))
            .virtual_path(
                "nested.label",
                VirtualPath::new().get(|node| match node.get("nested.age") {
                    Bson::Double(age) => Bson::String(format!("age {}", age)),
                    _ => Bson::Undefined,
                }),
            )
            .build()
            .unwrap()
    }

    fn doc() -> Document {
        Document::new(
            schema(),
            doc! {
                "name": "ann",
                "nested": { "age": 3 },
                "items": [ { "name": "a" }, { "name": "b" } ],
                "meta": { "deep": { "x": 1 } },
                "scores": { "math": 9 },
            },
        )
        .unwrap()
    }

    #[test]
    fn getters_apply_unless_suppressed() {
        let doc = doc();
        assert_eq!(doc.get("name"), Bson::String("ANN".into()));
        assert_eq!(doc.get_with("name", GetOptions::raw()), Bson::String("ann".into()));
        assert_eq!(doc.get(""), Bson::Undefined);
    }

    #[test]
    fn nested_prefixes_include_virtuals() {
        let doc = doc();
        assert_eq!(
            doc.get("nested"),
            Bson::Document(doc! { "age": 3.0, "label": "age 3" })
        );
        assert_eq!(doc.get_with("nested", GetOptions::raw()), Bson::Document(doc! { "age": 3.0 }));
        assert_eq!(doc.get("nested.label"), Bson::String("age 3".into()));
    }

    #[test]
    fn paths_below_arrays_mixed_and_maps() {
        let doc = doc();
        assert_eq!(doc.get("items.1.name"), Bson::String("b".into()));
        assert_eq!(
            doc.get("items.name"),
            Bson::Array(vec![Bson::String("a".into()), Bson::String("b".into())])
        );
        assert_eq!(doc.get("meta.deep.x"), Bson::Int32(1));
        assert_eq!(doc.get("scores.math"), Bson::Double(9.0));
        assert_eq!(doc.get("items.7.name"), Bson::Undefined);
    }

    #[test]
    fn get_as_casts_the_read_value() {
        let doc = doc();
        assert_eq!(doc.get_as("nested.age", &SchemaType::String).unwrap(), Bson::String("3".into()));
        assert!(doc.get_as("name", &SchemaType::Number).is_err());
    }

    #[test]
    fn routes_cross_subdocuments() {
        let doc = doc();
        match doc.route(doc.root, "items.1.name") {
            Route::Node { node, rel } => {
                assert_ne!(node, doc.root);
                assert_eq!(rel, "name");
            }
            _ => panic!("expected a node route"),
        }
        match doc.route(doc.root, "meta.deep.x") {
            Route::Inner { rel, rest, .. } => assert_eq!((rel.as_str(), rest.as_str()), ("meta", "deep.x")),
            _ => panic!("expected an inner route"),
        }
    }
}
