//! Schema descriptors.
//!
//! A [`Schema`] is compiled once by a [`SchemaBuilder`] into a flat map from dotted path to
//! [`PathOptions`], plus the set of implicit nested prefixes, aliases, virtuals, instance
//! methods and hooks. Schemas are immutable after [`SchemaBuilder::build`] and shared behind
//! an `Arc` by every document of their type.
//!
//! # Example
//!
//! ```ignore
//! use docmodel_core::schema::{PathOptions, Schema};
//!
//! let schema = Schema::builder()
//!     .path("name", PathOptions::string().required(true))
//!     .path("nested.age", PathOptions::number())
//!     .build()?;
//! ```

mod hooks;
mod options;
mod path_options;
mod virtuals;

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use bson::{Bson, oid::ObjectId};

use crate::{
    cast::CastConfig,
    document::Document,
    error::{DocumentError, DocumentResult},
    path,
};

pub use hooks::{HookPoint, Hooks, MethodFn, PostHookFn, PreHookFn, ValidateHookFn};
pub use options::{SchemaOptions, Strict, Timestamps};
pub use path_options::{
    AsyncValidatorFn, DefaultFn, DefaultValue, GetterFn, Immutable, NodePredicate, PathOptions,
    Required, SchemaType, SetterFn, SyncValidatorFn, ValidatorFn, ValidatorSpec,
};
pub use virtuals::{VirtualGetter, VirtualPath, VirtualRegistry, VirtualSetter, VirtualWriter};

pub(crate) use hooks::Methods;
pub(crate) use path_options::StringNormalize;

/// How a dotted path resolves against a schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathType {
    /// A declared path.
    Real,
    /// An implicit object prefix of declared paths.
    Nested,
    /// A computed path.
    Virtual,
    /// Below a `Mixed` or `Map` path, where any key is accepted.
    Adhoc,
    Unknown,
}

/// Compiled schema descriptor.
#[derive(Debug)]
pub struct Schema {
    paths: HashMap<String, PathOptions>,
    order: Vec<String>,
    nested: HashSet<String>,
    children: HashMap<String, Vec<String>>,
    aliases: HashMap<String, String>,
    virtuals: VirtualRegistry,
    methods: Methods,
    hooks: Hooks,
    options: SchemaOptions,
    cast: Arc<CastConfig>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn path(&self, path: &str) -> Option<&PathOptions> {
        self.paths.get(path)
    }

    /// Declared paths in declaration order.
    pub fn paths(&self) -> impl Iterator<Item = (&str, &PathOptions)> {
        self.order
            .iter()
            .filter_map(|name| self.paths.get(name).map(|options| (name.as_str(), options)))
    }

    pub fn is_nested(&self, path: &str) -> bool {
        self.nested.contains(path)
    }

    /// Immediate child keys of a nested prefix (or of the root for `""`), in declaration order.
    pub fn child_keys(&self, prefix: &str) -> &[String] {
        self.children
            .get(prefix)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The shortest declared path that is a strict prefix of `path`, with the remainder.
    pub fn find_prefix<'p>(&self, path: &'p str) -> Option<(&'p str, &PathOptions, &'p str)> {
        path::ancestors(path)
            .into_iter()
            .find_map(|prefix| {
                self.paths
                    .get(prefix)
                    .map(|options| (prefix, options, &path[prefix.len() + 1..]))
            })
    }

    pub fn path_type(&self, path: &str) -> PathType {
        let path = self.resolve_alias(path).unwrap_or(path);
        if self.paths.contains_key(path) {
            return PathType::Real;
        }
        if self.nested.contains(path) {
            return PathType::Nested;
        }
        if self.virtuals.contains(path) {
            return PathType::Virtual;
        }

        match self.find_prefix(path) {
            Some((_, options, rest)) => match options.kind() {
                SchemaType::Mixed | SchemaType::Map(_) => PathType::Adhoc,
                SchemaType::Embedded(schema) => schema.path_type(rest),
                SchemaType::Array(inner) => {
                    let (head, tail) = path::split_first(rest);
                    match (path::as_index(head), tail, inner.as_ref()) {
                        (Some(_), None, _) => PathType::Real,
                        (Some(_), Some(tail), SchemaType::Embedded(schema)) => schema.path_type(tail),
                        (None, _, SchemaType::Embedded(schema)) => schema.path_type(rest),
                        _ => PathType::Unknown,
                    }
                }
                _ => PathType::Unknown,
            },
            None => PathType::Unknown,
        }
    }

    /// Real path an alias points to.
    pub fn resolve_alias(&self, alias: &str) -> Option<&str> {
        self.aliases.get(alias).map(String::as_str)
    }

    pub fn aliases(&self) -> impl Iterator<Item = (&str, &str)> {
        self.aliases
            .iter()
            .map(|(alias, target)| (alias.as_str(), target.as_str()))
    }

    pub fn virtuals(&self) -> &VirtualRegistry {
        &self.virtuals
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    pub fn options(&self) -> &SchemaOptions {
        &self.options
    }

    pub fn cast_config(&self) -> &Arc<CastConfig> {
        &self.cast
    }

    pub fn method(&self, name: &str) -> Option<&MethodFn> {
        self.methods.get(name)
    }

    /// Returns true if the schema declares an `_id` path.
    pub fn has_id(&self) -> bool {
        self.paths.contains_key("_id")
    }
}

/// Builder for [`Schema`].
#[derive(Default)]
pub struct SchemaBuilder {
    paths: Vec<(String, PathOptions)>,
    virtuals: VirtualRegistry,
    methods: Methods,
    hooks: Hooks,
    options: SchemaOptions,
    cast: Option<Arc<CastConfig>>,
}

impl SchemaBuilder {
    pub fn path(mut self, name: impl Into<String>, options: PathOptions) -> Self {
        self.paths.push((name.into(), options));
        self
    }

    pub fn virtual_path(mut self, name: impl Into<String>, virtual_path: VirtualPath) -> Self {
        self.virtuals.define(name, virtual_path);
        self
    }

    pub fn method<F>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(&mut Document, &[Bson]) -> Result<Bson, String> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Arc::new(method));
        self
    }

    pub fn pre<F>(mut self, point: HookPoint, hook: F) -> Self
    where
        F: Fn(&mut Document) -> Result<(), String> + Send + Sync + 'static,
    {
        self.hooks.add_pre(point, Arc::new(hook));
        self
    }

    pub fn post<F>(mut self, point: HookPoint, hook: F) -> Self
    where
        F: Fn(&Document) -> Result<(), String> + Send + Sync + 'static,
    {
        self.hooks.add_post(point, Arc::new(hook));
        self
    }

    pub fn pre_validate<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Document) -> Result<(), String> + Send + Sync + 'static,
    {
        self.hooks.add_pre_validate(Arc::new(hook));
        self
    }

    pub fn post_validate<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Document) -> Result<(), String> + Send + Sync + 'static,
    {
        self.hooks.add_post_validate(Arc::new(hook));
        self
    }

    pub fn options(mut self, options: SchemaOptions) -> Self {
        self.options = options;
        self
    }

    /// Share a boolean-cast table with other schemas.
    pub fn cast_config(mut self, config: Arc<CastConfig>) -> Self {
        self.cast = Some(config);
        self
    }

    /// Compile the declared paths.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::Schema`] if a path is empty, contains a reserved or
    /// positional segment, is declared twice, or is both a declared path and the prefix of
    /// another declared path, or if an alias collides with a declared path.
    pub fn build(self) -> DocumentResult<Arc<Schema>> {
        let SchemaBuilder {
            paths: declared,
            mut virtuals,
            methods,
            hooks,
            options,
            cast,
        } = self;

        let mut entries: Vec<(String, PathOptions)> = Vec::with_capacity(declared.len() + 3);

        if options.id_path && !declared.iter().any(|(name, _)| name == "_id") {
            entries.push((
                "_id".to_string(),
                PathOptions::object_id().default_fn(|_| Bson::ObjectId(ObjectId::new())),
            ));
        }
        entries.extend(declared);

        if let Some(timestamps) = &options.timestamps {
            for name in [&timestamps.created_at, &timestamps.updated_at]
                .into_iter()
                .flatten()
            {
                if !entries.iter().any(|(existing, _)| existing == name) {
                    entries.push((name.clone(), PathOptions::date()));
                }
            }
        }

        let mut paths = HashMap::with_capacity(entries.len());
        let mut order = Vec::with_capacity(entries.len());
        let mut nested = HashSet::new();
        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        let mut aliases = HashMap::new();

        for (name, path_options) in entries {
            validate_path_name(&name)?;
            if paths.contains_key(&name) {
                return Err(DocumentError::Schema(format!("path `{}` is declared twice", name)));
            }

            let mut parent = String::new();
            for segment in path::segments(&name) {
                let siblings = children.entry(parent.clone()).or_default();
                if !siblings.iter().any(|existing| existing == segment) {
                    siblings.push(segment.to_string());
                }
                parent = path::join(&parent, segment);
            }
            for ancestor in path::ancestors(&name) {
                nested.insert(ancestor.to_string());
            }

            if let Some(alias) = path_options.alias_name() {
                aliases.insert(alias.to_string(), name.clone());
            }

            order.push(name.clone());
            paths.insert(name, path_options);
        }

        if let Some(conflict) = order.iter().find(|name| nested.contains(name.as_str())) {
            return Err(DocumentError::Schema(format!(
                "path `{}` is declared and also used as a nested prefix",
                conflict
            )));
        }
        if let Some((alias, _)) = aliases
            .iter()
            .find(|(alias, _)| paths.contains_key(alias.as_str()) || nested.contains(alias.as_str()))
        {
            return Err(DocumentError::Schema(format!(
                "alias `{}` collides with a declared path",
                alias
            )));
        }

        if options.id_virtual
            && paths.contains_key("_id")
            && !paths.contains_key("id")
            && !virtuals.contains("id")
        {
            virtuals.define(
                "id",
                VirtualPath::new()
                    .get(|node| match node.get_raw("_id") {
                        Bson::ObjectId(oid) => Bson::String(oid.to_hex()),
                        Bson::Undefined | Bson::Null => Bson::Undefined,
                        other => Bson::String(crate::cast::display_bson(&other)),
                    })
                    .depends_on(["_id"]),
            );
        }

        tracing::debug!(
            paths = order.len(),
            nested = nested.len(),
            virtuals = virtuals.len(),
            "compiled schema"
        );

        Ok(Arc::new(Schema {
            paths,
            order,
            nested,
            children,
            aliases,
            virtuals,
            methods,
            hooks,
            options,
            cast: cast.unwrap_or_default(),
        }))
    }
}

fn validate_path_name(name: &str) -> DocumentResult<()> {
    if name.is_empty() || path::segments(name).any(str::is_empty) {
        return Err(DocumentError::Schema(format!("invalid path `{}`", name)));
    }
    if path::is_reserved(name) {
        return Err(DocumentError::Schema(format!("path `{}` uses a reserved key", name)));
    }
    if path::segments(name).any(|segment| path::as_index(segment).is_some()) {
        return Err(DocumentError::Schema(format!(
            "path `{}` contains a positional segment",
            name
        )));
    }
    Ok(())
}
