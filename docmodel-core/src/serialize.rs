//! Plain-data projections of documents.
//!
//! [`Document::to_object`] and [`Document::to_json`] walk the node tree bottom-up:
//! subdocuments are projected before the object that holds them, so a transform on a
//! parent observes its children's finished output. Options resolve per call, then per
//! schema (`to_object` or `to_json` in [`SchemaOptions`](crate::schema::SchemaOptions)),
//! then fall back to defaults.

use std::{fmt, sync::Arc};

use bson::Bson;

use crate::{
    document::{Document, NodeId, NodeRef, apply_getters},
    error::{DocumentError, DocumentResult},
    path,
    schema::{Schema, SchemaType},
    selection::Selection,
    value::{Mapping, Value, bson_assign, bson_lookup},
};

/// Post-projection hook. It may edit the projected object in place, or return a value that
/// replaces it.
pub type TransformFn = Arc<
    dyn Fn(&NodeRef<'_>, &mut bson::Document, &ResolvedOptions) -> Result<Option<Bson>, String>
        + Send
        + Sync,
>;

/// The `transform` option: a function, or a toggle for the schema's own transform.
#[derive(Clone)]
pub enum Transform {
    Enabled(bool),
    Fn(TransformFn),
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transform::Enabled(enabled) => f.debug_tuple("Enabled").field(enabled).finish(),
            Transform::Fn(_) => f.write_str("Fn(..)"),
        }
    }
}

/// Options for [`Document::to_object`] and [`Document::to_json`]. Unset fields fall back to
/// the schema's option set, then to defaults.
#[derive(Clone, Default)]
pub struct ToObjectOptions {
    pub getters: Option<bool>,
    pub virtuals: Option<bool>,
    pub minimize: Option<bool>,
    pub depopulate: Option<bool>,
    pub flatten_maps: Option<bool>,
    pub transform: Option<Transform>,
    pub use_projection: Option<bool>,
    pub aliases: Option<bool>,
}

impl ToObjectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn getters(mut self, getters: bool) -> Self {
        self.getters = Some(getters);
        self
    }

    pub fn virtuals(mut self, virtuals: bool) -> Self {
        self.virtuals = Some(virtuals);
        self
    }

    pub fn minimize(mut self, minimize: bool) -> Self {
        self.minimize = Some(minimize);
        self
    }

    pub fn depopulate(mut self, depopulate: bool) -> Self {
        self.depopulate = Some(depopulate);
        self
    }

    pub fn flatten_maps(mut self, flatten_maps: bool) -> Self {
        self.flatten_maps = Some(flatten_maps);
        self
    }

    pub fn use_projection(mut self, use_projection: bool) -> Self {
        self.use_projection = Some(use_projection);
        self
    }

    pub fn aliases(mut self, aliases: bool) -> Self {
        self.aliases = Some(aliases);
        self
    }

    /// Enable or disable the schema-level transform.
    pub fn transform(mut self, enabled: bool) -> Self {
        self.transform = Some(Transform::Enabled(enabled));
        self
    }

    /// Apply `func` to every projected node, in place of the schema-level transform.
    pub fn transform_fn<F>(mut self, func: F) -> Self
    where
        F: Fn(&NodeRef<'_>, &mut bson::Document, &ResolvedOptions) -> Result<Option<Bson>, String>
            + Send
            + Sync
            + 'static,
    {
        self.transform = Some(Transform::Fn(Arc::new(func)));
        self
    }
}

impl fmt::Debug for ToObjectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToObjectOptions")
            .field("getters", &self.getters)
            .field("virtuals", &self.virtuals)
            .field("minimize", &self.minimize)
            .field("depopulate", &self.depopulate)
            .field("flatten_maps", &self.flatten_maps)
            .field("transform", &self.transform)
            .field("use_projection", &self.use_projection)
            .field("aliases", &self.aliases)
            .finish()
    }
}

/// Options of one projection after call-time, schema and default values were merged.
#[derive(Clone)]
pub struct ResolvedOptions {
    pub getters: bool,
    pub virtuals: bool,
    pub minimize: bool,
    pub depopulate: bool,
    pub flatten_maps: bool,
    pub use_projection: bool,
    pub aliases: bool,
    /// True when projecting for [`Document::to_json`].
    pub json: bool,
    call_transform: Option<TransformFn>,
    schema_transform: Option<TransformFn>,
    call: ToObjectOptions,
}

impl ResolvedOptions {
    pub fn resolve(schema: &Schema, call: &ToObjectOptions, json: bool) -> Self {
        let configured = if json {
            &schema.options().to_json
        } else {
            &schema.options().to_object
        };
        let pick = |field: fn(&ToObjectOptions) -> Option<bool>, default: bool| {
            field(call).or(field(configured)).unwrap_or(default)
        };

        let (call_transform, schema_transform) = match &call.transform {
            Some(Transform::Fn(func)) => (Some(func.clone()), None),
            Some(Transform::Enabled(false)) => (None, None),
            Some(Transform::Enabled(true)) | None => match &configured.transform {
                Some(Transform::Fn(func)) => (None, Some(func.clone())),
                _ => (None, None),
            },
        };

        Self {
            getters: pick(|o| o.getters, false),
            virtuals: pick(|o| o.virtuals, false),
            minimize: pick(|o| o.minimize, schema.options().minimize),
            depopulate: pick(|o| o.depopulate, false),
            flatten_maps: pick(|o| o.flatten_maps, json),
            use_projection: pick(|o| o.use_projection, false),
            aliases: pick(|o| o.aliases, true),
            json,
            call_transform,
            schema_transform,
            call: call.clone(),
        }
    }

    /// Projection used by reads: stored values with inner getters, nothing dropped and no
    /// transforms.
    pub(crate) fn reading(getters: bool) -> Self {
        let call = ToObjectOptions {
            getters: Some(getters),
            virtuals: Some(false),
            minimize: Some(false),
            depopulate: Some(false),
            flatten_maps: Some(true),
            transform: Some(Transform::Enabled(false)),
            use_projection: Some(false),
            aliases: Some(false),
        };
        Self::fixed(call, false)
    }

    /// Stored form: identifiers for references, maps as objects, nothing computed.
    fn storage(minimize: bool) -> Self {
        let call = ToObjectOptions {
            getters: Some(false),
            virtuals: Some(false),
            minimize: Some(minimize),
            depopulate: Some(true),
            flatten_maps: Some(true),
            transform: Some(Transform::Enabled(false)),
            use_projection: Some(false),
            aliases: Some(false),
        };
        Self::fixed(call, false)
    }

    fn fixed(call: ToObjectOptions, json: bool) -> Self {
        Self {
            getters: call.getters.unwrap_or_default(),
            virtuals: call.virtuals.unwrap_or_default(),
            minimize: call.minimize.unwrap_or_default(),
            depopulate: call.depopulate.unwrap_or_default(),
            flatten_maps: call.flatten_maps.unwrap_or_default(),
            use_projection: call.use_projection.unwrap_or_default(),
            aliases: call.aliases.unwrap_or_default(),
            json,
            call_transform: None,
            schema_transform: None,
            call,
        }
    }

    /// The call-time options this projection was resolved from.
    pub fn call_options(&self) -> &ToObjectOptions {
        &self.call
    }
}

impl fmt::Debug for ResolvedOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedOptions")
            .field("getters", &self.getters)
            .field("virtuals", &self.virtuals)
            .field("minimize", &self.minimize)
            .field("depopulate", &self.depopulate)
            .field("flatten_maps", &self.flatten_maps)
            .field("use_projection", &self.use_projection)
            .field("aliases", &self.aliases)
            .field("json", &self.json)
            .finish_non_exhaustive()
    }
}

fn expect_document(value: Bson) -> DocumentResult<bson::Document> {
    match value {
        Bson::Document(doc) => Ok(doc),
        other => Err(DocumentError::Transform(format!(
            "expected an object projection, got {}",
            other
        ))),
    }
}

impl Document {
    /// Project the document to a plain BSON object.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::Transform`] if a transform fails or replaces the top-level
    /// object with a non-object.
    pub fn to_object(&self, options: ToObjectOptions) -> DocumentResult<bson::Document> {
        expect_document(self.project_top(&options, false)?)
    }

    /// Project the document to JSON. Maps are flattened to objects unless the options say
    /// otherwise, and BSON-only types use their extended JSON form.
    pub fn to_json(&self, options: ToObjectOptions) -> DocumentResult<serde_json::Value> {
        let projected = self.project_top(&options, true)?;
        Ok(serde_json::to_value(&projected)?)
    }

    /// Project one node on its own. The node's schema options and transform apply to it as
    /// the top of the projection.
    pub fn to_object_node(&self, id: NodeId, options: ToObjectOptions) -> DocumentResult<bson::Document> {
        self.check_node(id)?;
        let schema = self.arena[id].schema.clone();
        let resolved = ResolvedOptions::resolve(&schema, &options, false);
        expect_document(self.project_node(id, &resolved, true)?)
    }

    /// The form a persistence backend stores: populated references reduced to identifiers,
    /// no getters, virtuals or transforms.
    pub fn to_bson_for_storage(&self) -> DocumentResult<bson::Document> {
        let resolved = ResolvedOptions::storage(self.schema.options().minimize);
        expect_document(self.project_node(self.root, &resolved, true)?)
    }

    fn project_top(&self, call: &ToObjectOptions, json: bool) -> DocumentResult<Bson> {
        let resolved = ResolvedOptions::resolve(&self.schema, call, json);
        self.project_node(self.root, &resolved, true)
    }

    fn project_node(&self, id: NodeId, options: &ResolvedOptions, top: bool) -> DocumentResult<Bson> {
        self.check_node(id)?;
        let owner = &self.arena[id];
        let schema = &owner.schema;
        let mut out = self.project_mapping(id, "", &owner.raw, options)?;

        if options.virtuals {
            for (name, virtual_path) in schema.virtuals().iter() {
                let Some(getter) = &virtual_path.getter else {
                    continue;
                };
                if options.use_projection && !self.virtual_selected(id, name, &virtual_path.depends_on) {
                    continue;
                }
                let value = getter(&NodeRef::new(self, id));
                if !matches!(value, Bson::Undefined) {
                    bson_assign(&mut out, name, value);
                }
            }

            if options.aliases {
                for (target, path_options) in schema.paths() {
                    let Some(alias) = path_options.alias_name() else {
                        continue;
                    };
                    let source = Bson::Document(out.clone());
                    if let Some(value) = bson_lookup(&source, target) {
                        bson_assign(&mut out, alias, value.clone());
                    }
                }
            }
        }

        let transform = match (&options.call_transform, top) {
            (Some(func), _) => Some(func),
            (None, true) => options.schema_transform.as_ref(),
            (None, false) => None,
        };
        if let Some(func) = transform {
            match func(&NodeRef::new(self, id), &mut out, options) {
                Ok(Some(replacement)) => return Ok(replacement),
                Ok(None) => {}
                Err(message) => return Err(DocumentError::Transform(message)),
            }
        }

        Ok(Bson::Document(out))
    }

    /// A virtual is left out of a projected load when one of the paths it reads was not
    /// loaded, or when it was excluded by name.
    fn virtual_selected(&self, id: NodeId, name: &str, depends_on: &[String]) -> bool {
        let Some(selection) = &self.selection else {
            return true;
        };
        if matches!(selection, Selection::Exclude(_)) && !self.is_selected(&self.full_path(id, name)) {
            return false;
        }
        depends_on
            .iter()
            .all(|dependency| self.is_selected(&self.full_path(id, dependency)))
    }

    fn project_mapping(
        &self,
        node: NodeId,
        prefix: &str,
        mapping: &Mapping,
        options: &ResolvedOptions,
    ) -> DocumentResult<bson::Document> {
        let schema = &self.arena[node].schema;
        let mut out = bson::Document::new();

        for (key, value) in mapping.iter() {
            if value.is_undefined() {
                continue;
            }
            let rel = path::join(prefix, key);
            if options.use_projection && !self.is_selected(&self.full_path(node, &rel)) {
                continue;
            }

            let mut projected = self.project_value(node, &rel, value, options)?;
            if options.getters {
                if let Some(path_options) = schema.path(&rel).filter(|o| !o.getters.is_empty()) {
                    projected = apply_getters(path_options, projected, &NodeRef::new(self, node));
                }
            }

            match &projected {
                Bson::Undefined => continue,
                Bson::Document(inner) if options.minimize && inner.is_empty() => continue,
                _ => {}
            }
            out.insert(key, projected);
        }

        Ok(out)
    }

    /// Project a stored value found at `rel` inside `node`.
    pub(crate) fn project_value(
        &self,
        node: NodeId,
        rel: &str,
        value: &Value,
        options: &ResolvedOptions,
    ) -> DocumentResult<Bson> {
        match value {
            Value::Undefined => Ok(Bson::Undefined),
            Value::Primitive(value) => Ok(value.clone()),
            Value::Mapping(mapping) => {
                let projected = self.project_mapping(node, rel, mapping, options)?;
                let is_map = self.arena[node]
                    .schema
                    .path(rel)
                    .is_some_and(|o| matches!(o.kind(), SchemaType::Map(_)));

                if is_map && !options.flatten_maps {
                    Ok(Bson::Array(
                        projected
                            .into_iter()
                            .map(|(key, value)| Bson::Array(vec![Bson::String(key), value]))
                            .collect(),
                    ))
                } else {
                    Ok(Bson::Document(projected))
                }
            }
            Value::Embedded(child) => self.project_node(*child, options, false),
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(index, item)| {
                    let slot = path::join(rel, &index.to_string());
                    Ok(match self.project_value(node, &slot, item, options)? {
                        Bson::Undefined => Bson::Null,
                        other => other,
                    })
                })
                .collect::<DocumentResult<Vec<_>>>()
                .map(Bson::Array),
            Value::Populated(doc) if options.depopulate => Ok(doc.id()),
            Value::Populated(doc) => doc.project_top(&options.call, options.json),
        }
    }
}

#[cfg(test)]
mod tests {
    use bson::{doc, oid::ObjectId};

    use super::*;
    use crate::schema::{PathOptions, SchemaOptions, VirtualPath};

    fn schema(options: SchemaOptions) -> Arc<Schema> {
        Schema::builder()
            .path(
                "name",
                PathOptions::string().alias("nm").getter(|value, _| match value {
                    Bson::String(s) => Bson::String(format!("Mr. {}", s)),
                    other => other,
                }),
            )
            .path("nested.age", PathOptions::number())
            .path("empty.inner", PathOptions::string())
            .path("scores", PathOptions::map(SchemaType::Number))
            .path("meta", PathOptions::mixed())
            .virtual_path(
                "greeting",
                VirtualPath::new()
                    .get(|node| match node.get_raw("name") {
                        Bson::String(name) => Bson::String(format!("hi {}", name)),
                        _ => Bson::Undefined,
                    })
                    .depends_on(["name"]),
            )
            .options(options.id_path(false))
            .build()
            .unwrap()
    }

    fn doc(options: SchemaOptions) -> Document {
        Document::new(
            schema(options),
            doc! { "name": "x", "nested": { "age": 2 }, "scores": { "a": 1 }, "meta": {} },
        )
        .unwrap()
    }

    #[test]
    fn defaults_minimize_and_skip_computed_values() {
        let out = doc(SchemaOptions::default()).to_object(ToObjectOptions::new()).unwrap();
        assert_eq!(
            out,
            doc! { "name": "x", "nested": { "age": 2.0 }, "scores": [["a", 1.0]] }
        );

        let out = doc(SchemaOptions::default())
            .to_object(ToObjectOptions::new().minimize(false).flatten_maps(true))
            .unwrap();
        assert_eq!(out.get_document("empty").unwrap(), &doc! {});
        assert_eq!(out.get_document("meta").unwrap(), &doc! {});
        assert_eq!(out.get_document("scores").unwrap(), &doc! { "a": 1.0 });
    }

    #[test]
    fn getters_virtuals_and_aliases() {
        let out = doc(SchemaOptions::default())
            .to_object(ToObjectOptions::new().getters(true).virtuals(true))
            .unwrap();
        assert_eq!(out.get_str("name").unwrap(), "Mr. x");
        assert_eq!(out.get_str("nm").unwrap(), "Mr. x");
        assert_eq!(out.get_str("greeting").unwrap(), "hi x");

        let out = doc(SchemaOptions::default())
            .to_object(ToObjectOptions::new().virtuals(true).aliases(false))
            .unwrap();
        assert!(!out.contains_key("nm"));
    }

    #[test]
    fn schema_options_apply_unless_overridden() {
        let options = SchemaOptions::default()
            .to_object(ToObjectOptions::new().virtuals(true))
            .to_json(ToObjectOptions::new().getters(true));
        let doc = doc(options);

        assert!(doc.to_object(ToObjectOptions::new()).unwrap().contains_key("greeting"));
        assert!(!doc.to_object(ToObjectOptions::new().virtuals(false)).unwrap().contains_key("greeting"));

        let json = doc.to_json(ToObjectOptions::new()).unwrap();
        assert_eq!(json["name"], serde_json::json!("Mr. x"));
        assert_eq!(json["scores"], serde_json::json!({ "a": 1.0 }));
    }

    #[test]
    fn transforms_resolve_per_call() {
        let options = SchemaOptions::default().to_object(ToObjectOptions::new().transform_fn(|_, out, _| {
            out.remove("nested");
            Ok(None)
        }));
        let doc = doc(options);

        assert!(!doc.to_object(ToObjectOptions::new()).unwrap().contains_key("nested"));
        assert!(doc.to_object(ToObjectOptions::new().transform(false)).unwrap().contains_key("nested"));

        let replaced = doc
            .to_object(ToObjectOptions::new().transform_fn(|node, _, _| {
                Ok(node.is_root().then(|| Bson::Document(doc! { "only": true })))
            }))
            .unwrap();
        assert_eq!(replaced, doc! { "only": true });

        let err = doc
            .to_object(ToObjectOptions::new().transform_fn(|_, _, _| Err("nope".into())))
            .unwrap_err();
        assert!(matches!(err, DocumentError::Transform(message) if message == "nope"));
    }

    #[test]
    fn child_transforms_apply_only_to_explicit_child_projection() {
        let child = Schema::builder()
            .path("title", PathOptions::string())
            .path("secret", PathOptions::string())
            .options(SchemaOptions::default().to_object(ToObjectOptions::new().transform_fn(|_, out, _| {
                out.remove("secret");
                Ok(None)
            })))
            .build()
            .unwrap();
        let parent = Schema::builder()
            .path("child", PathOptions::embedded(child))
            .build()
            .unwrap();

        let doc = Document::new(parent, doc! { "child": { "title": "t", "secret": "s" } }).unwrap();
        let out = doc.to_object(ToObjectOptions::new()).unwrap();
        assert_eq!(out.get_document("child").unwrap().get_str("secret").unwrap(), "s");

        let child = doc.subdocument("child").unwrap();
        let own = child.to_object(ToObjectOptions::new()).unwrap();
        assert!(!own.contains_key("secret"));
        assert_eq!(own.get_str("title").unwrap(), "t");
    }

    #[test]
    fn projection_respects_selection() {
        let doc = Document::init(
            schema(SchemaOptions::default()),
            doc! { "nested": { "age": 4 } },
            Some(Selection::include(["nested.age"])),
        )
        .unwrap();

        let out = doc
            .to_object(ToObjectOptions::new().virtuals(true).use_projection(true))
            .unwrap();
        assert!(!out.contains_key("greeting"));
        assert_eq!(out.get_document("nested").unwrap(), &doc! { "age": 4.0 });
    }

    #[test]
    fn storage_form_depopulates() {
        let person = Schema::builder().path("name", PathOptions::string()).build().unwrap();
        let story = Schema::builder()
            .path("author", PathOptions::object_id().ref_model("Person"))
            .build()
            .unwrap();

        let author_id = ObjectId::new();
        let author = Document::init(person, doc! { "_id": author_id, "name": "ann" }, None).unwrap();
        let mut story = Document::init(story, doc! { "_id": ObjectId::new(), "author": author_id }, None).unwrap();
        story.set_populated("author", author).unwrap();

        let out = story.to_object(ToObjectOptions::new()).unwrap();
        assert_eq!(out.get_document("author").unwrap().get_str("name").unwrap(), "ann");

        let out = story.to_object(ToObjectOptions::new().depopulate(true)).unwrap();
        assert_eq!(out.get_object_id("author").unwrap(), author_id);
        assert_eq!(story.to_bson_for_storage().unwrap().get_object_id("author").unwrap(), author_id);
    }
}
