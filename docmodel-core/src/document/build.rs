//! Populating nodes from input: construction, trusted init and default application.

use std::sync::Arc;

use bson::Bson;

use super::{Document, Node, NodeId, NodeRef, ParentLink, WriteMode};
use crate::{
    cast::cast_scalar,
    error::DocumentResult,
    path,
    schema::{DefaultValue, Schema, SchemaType, Strict, StringNormalize},
    value::{Mapping, Value, bson_lookup},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DefaultPhase {
    Constant,
    Function,
}

/// Placeholder mapping for a schema level: undefined leaves and nested objects in
/// declaration order, so output follows the schema rather than the input.
pub(crate) fn scaffold(schema: &Schema, prefix: &str) -> Mapping {
    let mut mapping = Mapping::new();
    for key in schema.child_keys(prefix) {
        let full = path::join(prefix, key);
        let value = if schema.is_nested(&full) {
            Value::Mapping(scaffold(schema, &full))
        } else {
            Value::Undefined
        };
        mapping.insert(key.clone(), value);
    }
    mapping
}

/// Returns true if `input` carries a value for `path`, under its own name, as a literal
/// dotted key, or through an alias.
fn provided(input: &Bson, schema: &Schema, path: &str) -> bool {
    let defined = |value: &Bson| !matches!(value, Bson::Undefined);

    if bson_lookup(input, path).is_some_and(defined) {
        return true;
    }
    let Bson::Document(input) = input else {
        return false;
    };
    if input.get(path).is_some_and(defined) {
        return true;
    }
    schema
        .path(path)
        .and_then(|options| options.alias_name())
        .is_some_and(|alias| input.get(alias).is_some_and(defined))
}

impl Document {
    /// Allocate an unattached-looking node: the parent link is set so paths resolve, but
    /// marks stay local while it is being populated.
    fn alloc_child(&mut self, schema: Arc<Schema>, link: ParentLink) -> NodeId {
        let raw = scaffold(&schema, "");
        let mut node = Node::new(schema, raw, Some(link));
        node.building = true;
        self.arena.alloc(node)
    }

    /// Build a subdocument from untrusted input.
    pub(crate) fn build_child(
        &mut self,
        schema: Arc<Schema>,
        link: ParentLink,
        input: bson::Document,
    ) -> DocumentResult<NodeId> {
        let id = self.alloc_child(schema, link);
        match self.populate_new(id, input) {
            Ok(()) => {
                self.arena[id].building = false;
                Ok(id)
            }
            Err(err) => {
                self.arena.free_subtree(id);
                Err(err)
            }
        }
    }

    /// Build a subdocument from trusted data.
    pub(crate) fn init_child(
        &mut self,
        schema: Arc<Schema>,
        link: ParentLink,
        data: bson::Document,
    ) -> DocumentResult<NodeId> {
        let id = self.alloc_child(schema, link);
        match self.populate_init(id, data) {
            Ok(()) => {
                self.arena[id].building = false;
                Ok(id)
            }
            Err(err) => {
                self.arena.free_subtree(id);
                Err(err)
            }
        }
    }

    pub(crate) fn populate_new(&mut self, node: NodeId, input: bson::Document) -> DocumentResult<()> {
        let schema = self.arena[node].schema.clone();
        let snapshot = Bson::Document(input.clone());

        self.apply_defaults(node, &schema, Some(&snapshot), DefaultPhase::Constant)?;
        for (key, value) in input {
            self.write(node, &key, value, WriteMode::construct())?;
        }
        self.apply_defaults(node, &schema, Some(&snapshot), DefaultPhase::Function)
    }

    pub(crate) fn populate_init(&mut self, node: NodeId, data: bson::Document) -> DocumentResult<()> {
        let schema = self.arena[node].schema.clone();
        self.init_mapping(node, &schema, "", data)?;
        self.apply_defaults(node, &schema, None, DefaultPhase::Constant)?;
        self.apply_defaults(node, &schema, None, DefaultPhase::Function)
    }

    /// Fill absent, selected paths from their default providers.
    ///
    /// Arrays without a declared default start empty. Defaults are written through the
    /// regular write path, so setters run, but are recorded as defaults rather than
    /// modifications.
    fn apply_defaults(
        &mut self,
        node: NodeId,
        schema: &Arc<Schema>,
        input: Option<&Bson>,
        phase: DefaultPhase,
    ) -> DocumentResult<()> {
        for (name, options) in schema.paths() {
            if input.is_some_and(|input| provided(input, schema, name)) {
                continue;
            }
            if !self.is_selected(&self.full_path(node, name)) {
                continue;
            }
            if self
                .lookup_value(node, name)
                .is_some_and(|value| !value.is_undefined())
            {
                continue;
            }

            let value = match (&options.default, phase) {
                (Some(DefaultValue::Value(value)), DefaultPhase::Constant) => value.clone(),
                (Some(DefaultValue::Fn(func)), DefaultPhase::Function) => {
                    func(&NodeRef::new(self, node))
                }
                (None, DefaultPhase::Constant) if options.kind().is_array() => Bson::Array(Vec::new()),
                _ => continue,
            };
            if matches!(value, Bson::Undefined) {
                continue;
            }

            self.write(node, name, value, WriteMode::default_value())?;
        }
        Ok(())
    }

    fn init_mapping(
        &mut self,
        node: NodeId,
        schema: &Arc<Schema>,
        prefix: &str,
        data: bson::Document,
    ) -> DocumentResult<()> {
        for (key, value) in data {
            let name = path::join(prefix, &key);
            if path::is_reserved(&key) {
                tracing::warn!(path = %name, "skipping reserved key in stored data");
                continue;
            }

            if let Some(options) = schema.path(&name) {
                let value = self.init_value(node, &name, options.kind(), value)?;
                self.store(node, &name, value);
            } else if schema.is_nested(&name) {
                match value {
                    Bson::Document(inner) => self.init_mapping(node, schema, &name, inner)?,
                    Bson::Null => self.store(node, &name, Value::null()),
                    other => {
                        tracing::warn!(path = %name, value = %other, "ignoring non-object stored at a nested path");
                        continue;
                    }
                }
            } else if schema.options().strict_mode() == Strict::Accept {
                self.store(node, &name, Value::Primitive(value));
            } else {
                tracing::trace!(path = %name, "dropping undeclared stored key");
                continue;
            }

            self.arena[node].tracker.mark_init(&name);
        }
        Ok(())
    }

    /// Convert a stored value without setters. Values that fail to cast are kept verbatim.
    fn init_value(
        &mut self,
        node: NodeId,
        rel: &str,
        kind: &SchemaType,
        value: Bson,
    ) -> DocumentResult<Value> {
        let value = match (kind, value) {
            (_, Bson::Undefined) => Value::Undefined,
            (_, Bson::Null) => Value::null(),
            (SchemaType::Embedded(schema), Bson::Document(data)) => {
                Value::Embedded(self.init_child(schema.clone(), ParentLink::new(node, rel), data)?)
            }
            (SchemaType::Array(inner), Bson::Array(items)) => {
                let mut out = Vec::with_capacity(items.len());
                for (index, item) in items.into_iter().enumerate() {
                    out.push(self.init_value(node, &path::join(rel, &index.to_string()), inner, item)?);
                }
                Value::Array(out)
            }
            (SchemaType::Map(inner), Bson::Document(entries)) => {
                let mut mapping = Mapping::new();
                for (key, item) in entries {
                    let item = self.init_value(node, &path::join(rel, &key), inner, item)?;
                    mapping.insert(key, item);
                }
                Value::Mapping(mapping)
            }
            (SchemaType::Mixed, value) => Value::Primitive(value),
            (SchemaType::Embedded(_) | SchemaType::Array(_) | SchemaType::Map(_), value) => {
                tracing::warn!(path = rel, kind = kind.name(), "stored value does not match the declared shape");
                Value::Primitive(value)
            }
            (kind, value) => {
                let config = self.arena[node].schema.cast_config().clone();
                match cast_scalar(kind, value.clone(), rel, &config, StringNormalize::default()) {
                    Ok(cast) => Value::Primitive(cast),
                    Err(err) => {
                        tracing::warn!(path = rel, error = %err, "keeping stored value that does not cast");
                        Value::Primitive(value)
                    }
                }
            }
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;
    use crate::{
        schema::{PathOptions, SchemaOptions},
        selection::Selection,
    };

    fn schema() -> Arc<Schema> {
        Schema::builder()
            .path("name", PathOptions::string().default_value("anon"))
            .path("nested.age", PathOptions::number())
            .path("nested.path", PathOptions::string().default_fn(|_| Bson::String("p".into())))
            .path("tags", PathOptions::array(SchemaType::Number))
            .options(SchemaOptions::default().id_path(false))
            .build()
            .unwrap()
    }

    #[test]
    fn scaffold_follows_declaration_order() {
        let mapping = scaffold(&schema(), "");
        assert_eq!(mapping.keys().collect::<Vec<_>>(), vec!["name", "nested", "tags"]);
        assert_eq!(
            mapping.get("nested").and_then(Value::as_mapping).map(|m| m.keys().collect::<Vec<_>>()),
            Some(vec!["age", "path"])
        );
    }

    #[test]
    fn construction_applies_defaults_around_input() {
        let doc = Document::new(schema(), doc! { "nested": { "age": "4" } }).unwrap();

        assert_eq!(doc.get("name"), Bson::String("anon".into()));
        assert_eq!(doc.get("nested.age"), Bson::Double(4.0));
        assert_eq!(doc.get("nested.path"), Bson::String("p".into()));
        assert_eq!(doc.get("tags"), Bson::Array(vec![]));
        assert!(doc.is_default("name"));
        assert!(doc.is_default("tags"));
        assert!(!doc.is_modified("name"));
        assert!(doc.is_modified("nested.age"));
    }

    #[test]
    fn init_is_trusted_and_respects_selection() {
        let doc = Document::init(
            schema(),
            doc! { "nested": { "age": 9 }, "tags": [1, 2], "ghost": true },
            Some(Selection::include(["nested.age", "tags"])),
        )
        .unwrap();

        assert!(!doc.is_new());
        assert!(doc.direct_modified_paths().is_empty());
        assert_eq!(doc.get("nested.age"), Bson::Double(9.0));
        assert_eq!(doc.get("name"), Bson::Undefined);
        assert_eq!(doc.get("nested.path"), Bson::Undefined);
        assert_eq!(doc.get("ghost"), Bson::Undefined);
        assert!(doc.is_init("tags"));
    }

    #[test]
    fn init_keeps_values_that_fail_to_cast() {
        let doc = Document::init(schema(), doc! { "nested": { "age": "old" } }, None).unwrap();
        assert_eq!(doc.get("nested.age"), Bson::String("old".into()));
        assert!(doc.errors().is_empty());
    }
}
