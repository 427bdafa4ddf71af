//! Write routing.
//!
//! A write resolves its path against the owning node's schema (alias, declared path,
//! nested prefix, virtual, or a path below a declared one) and then casts, stores and
//! marks. Cast failures never abort a write: they are recorded against the path and
//! reported by the next validation pass.

use bson::Bson;

use super::{Document, NodeId, NodeRef, ParentLink, SetOptions};
use crate::{
    cast::{cast_scalar, wrap_to_depth},
    error::{CastError, CastKind, DocumentError, DocumentResult},
    path,
    schema::{Immutable, PathOptions, Schema, SchemaType, Strict, StringNormalize, VirtualPath, VirtualWriter},
    value::{MAX_ARRAY_PADDING, Mapping, Value, bson_assign, bson_equal, bson_lookup, bson_remove},
};

/// How a write is recorded.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct WriteMode {
    /// Populating a fresh node: no equality short-circuit, and objects merge into nested
    /// paths.
    pub constructing: bool,
    /// Record as a default rather than a modification.
    pub default: bool,
    pub merge: bool,
    pub skip_setters: bool,
}

impl WriteMode {
    pub fn construct() -> Self {
        Self {
            constructing: true,
            ..Self::default()
        }
    }

    pub fn default_value() -> Self {
        Self {
            constructing: true,
            default: true,
            ..Self::default()
        }
    }
}

fn to_value(value: Bson) -> Value {
    match value {
        Bson::Undefined => Value::Undefined,
        other => Value::Primitive(other),
    }
}

impl Document {
    /// Assign `value` to `path`, replacing object values wholesale.
    ///
    /// Cast and setter failures are deferred to validation.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::StrictMode`] for an undeclared path (or an immutable one)
    /// when the schema is in throw mode, and [`DocumentError::InvalidPath`] for an empty path
    /// or an array index past the end of the array.
    pub fn set(&mut self, path: &str, value: impl Into<Bson>) -> DocumentResult<()> {
        self.set_with(path, value, SetOptions::default())
    }

    pub fn set_with(
        &mut self,
        path: &str,
        value: impl Into<Bson>,
        options: SetOptions,
    ) -> DocumentResult<()> {
        let mode = WriteMode {
            merge: options.merge,
            ..WriteMode::default()
        };
        self.write(self.root, path, value.into(), mode)
    }

    /// Assign every key of `values`, in order.
    pub fn set_all(&mut self, values: bson::Document) -> DocumentResult<()> {
        for (key, value) in values {
            self.write(self.root, &key, value, WriteMode::default())?;
        }
        Ok(())
    }

    /// Assign `path` relative to a node of this document.
    pub fn set_node(&mut self, node: NodeId, path: &str, value: impl Into<Bson>) -> DocumentResult<()> {
        self.check_node(node)?;
        self.write(node, path, value.into(), WriteMode::default())
    }

    /// Clear `path`. The next change set removes it from storage.
    pub fn unset(&mut self, path: &str) -> DocumentResult<()> {
        self.set(path, Bson::Undefined)
    }

    /// Place a copy of an existing subdocument at `path`.
    ///
    /// The target path's setters run once against the source's stored values. If they leave
    /// the value unchanged the source subtree is cloned into place; otherwise the setter
    /// output is cast like any other assignment. The source is never shared.
    pub fn set_subdocument(&mut self, path: &str, source: NodeId) -> DocumentResult<()> {
        self.check_node(source)?;
        let (node, rel) = self.locate(self.root, path);
        let schema = self.arena[node].schema.clone();
        let rel = schema.resolve_alias(&rel).map(str::to_string).unwrap_or(rel);

        let (target, options) = match schema.path(&rel) {
            Some(options) => match options.kind() {
                SchemaType::Embedded(target) => (target.clone(), Some(options)),
                _ => return Err(not_a_subdocument(path)),
            },
            None => match schema.find_prefix(&rel) {
                Some((_, options, rest)) if path::as_index(rest).is_some() => {
                    match options.kind() {
                        SchemaType::Array(inner) => match inner.as_ref() {
                            SchemaType::Embedded(target) => (target.clone(), None),
                            _ => return Err(not_a_subdocument(path)),
                        },
                        _ => return Err(not_a_subdocument(path)),
                    }
                }
                _ => return Err(not_a_subdocument(path)),
            },
        };

        let projected = Bson::Document(self.plain_node(source, false));
        let output = match options {
            Some(options) if !options.setters.is_empty() => {
                match self.run_setters(node, &rel, options, projected.clone()) {
                    Ok(output) => output,
                    Err(err) => {
                        self.record_cast_error(node, err);
                        return Ok(());
                    }
                }
            }
            _ => projected.clone(),
        };

        let same_schema = std::sync::Arc::ptr_eq(&self.arena[source].schema, &target);
        if !bson_equal(&output, &projected) || !same_schema {
            let mode = WriteMode {
                skip_setters: true,
                ..WriteMode::default()
            };
            return self.write(node, &rel, output, mode);
        }

        if let Some(array) = path::parent(&rel).filter(|_| options.is_none()) {
            let index = path::as_index(path::segments(&rel).last().unwrap_or_default());
            self.ensure_array_slot(node, array, index.unwrap_or(usize::MAX))?;
        }

        let copy = self.clone_subtree(source, ParentLink::new(node, rel.clone()));
        self.put(node, &rel, Value::Embedded(copy), WriteMode::default())
    }

    /// Deep-copy a node and its descendants under a new parent.
    pub(crate) fn clone_subtree(&mut self, source: NodeId, link: ParentLink) -> NodeId {
        let mut node = self.arena[source].clone();
        node.parent = Some(link);
        node.building = false;
        let mut raw = std::mem::take(&mut node.raw);
        let id = self.arena.alloc(node);

        for (key, value) in raw.iter_mut() {
            self.reown(id, key, value);
        }
        self.arena[id].raw = raw;
        id
    }

    fn reown(&mut self, owner: NodeId, slot: &str, value: &mut Value) {
        match value {
            Value::Embedded(child) => {
                *child = self.clone_subtree(*child, ParentLink::new(owner, slot));
            }
            Value::Array(items) => {
                for (index, item) in items.iter_mut().enumerate() {
                    self.reown(owner, &path::join(slot, &index.to_string()), item);
                }
            }
            Value::Mapping(mapping) => {
                for (key, item) in mapping.iter_mut() {
                    self.reown(owner, &path::join(slot, key), item);
                }
            }
            _ => {}
        }
    }

    /// Route a write, recording cast failures instead of returning them.
    pub(crate) fn write(
        &mut self,
        node: NodeId,
        path: &str,
        value: Bson,
        mode: WriteMode,
    ) -> DocumentResult<()> {
        match self.write_path(node, path, value, mode) {
            Err(DocumentError::Cast(err)) => {
                self.record_cast_error(node, err);
                Ok(())
            }
            other => other,
        }
    }

    pub(crate) fn record_cast_error(&mut self, node: NodeId, err: CastError) {
        tracing::debug!(
            path = %self.full_path(node, &err.path),
            kind = %err.kind,
            "deferring cast error"
        );
        self.arena[node].cast_errors.insert(err.path.clone(), err);
    }

    fn write_path(
        &mut self,
        node: NodeId,
        path: &str,
        value: Bson,
        mode: WriteMode,
    ) -> DocumentResult<()> {
        if path.is_empty() {
            return Err(DocumentError::InvalidPath(String::new(), "empty path".to_string()));
        }
        if path::is_reserved(path) {
            tracing::warn!(path, "ignoring write to a reserved key");
            return Ok(());
        }

        let schema = self.arena[node].schema.clone();
        let path = schema.resolve_alias(path).unwrap_or(path);

        if let Some(options) = schema.path(path) {
            return self.write_declared(node, path, options, value, mode);
        }
        if schema.is_nested(path) {
            return self.write_nested(node, path, value, mode);
        }
        if let Some(virtual_path) = schema.virtuals().get(path) {
            return self.write_virtual(node, path, virtual_path, value, mode);
        }
        if let Some((prefix, options, rest)) = schema.find_prefix(path) {
            return self.write_below(node, prefix, options, rest, value, mode);
        }

        self.write_undeclared(node, path, value, mode)
    }

    fn is_immutable(&self, node: NodeId, options: &PathOptions) -> bool {
        match &options.immutable {
            Immutable::No => false,
            Immutable::Yes => true,
            Immutable::If(predicate) => predicate(&NodeRef::new(self, node)),
        }
    }

    pub(crate) fn run_setters(
        &self,
        node: NodeId,
        rel: &str,
        options: &PathOptions,
        value: Bson,
    ) -> Result<Bson, CastError> {
        let node_ref = NodeRef::new(self, node);
        let original = value.clone();
        options
            .setters
            .iter()
            .try_fold(value, |value, setter| setter(value, &node_ref))
            .map_err(|reason| CastError::new(rel, original, CastKind::Setter).with_reason(reason))
    }

    /// True if `value` deep-equals what is stored at `rel`.
    fn unchanged(&self, node: NodeId, rel: &str, value: &Bson) -> bool {
        bson_equal(&self.plain_at(node, rel), value)
    }

    fn write_declared(
        &mut self,
        node: NodeId,
        rel: &str,
        options: &PathOptions,
        value: Bson,
        mode: WriteMode,
    ) -> DocumentResult<()> {
        if !mode.constructing && !self.is_new && self.is_immutable(node, options) {
            let full = self.full_path(node, rel);
            if self.arena[node].schema.options().strict_mode() == Strict::Throw {
                return Err(DocumentError::immutable(full));
            }
            tracing::debug!(path = %full, "ignoring write to an immutable path");
            return Ok(());
        }

        if !mode.constructing && self.unchanged(node, rel, &value) {
            self.arena[node].cast_errors.remove(rel);
            return Ok(());
        }

        let value = if mode.skip_setters || options.setters.is_empty() {
            value
        } else {
            self.run_setters(node, rel, options, value)?
        };

        match options.kind() {
            SchemaType::Embedded(schema) => self.write_embedded(node, rel, schema, value, mode),
            SchemaType::Array(inner) => {
                self.write_array(node, rel, options.kind(), inner, options.normalize, value, mode)
            }
            SchemaType::Map(inner) => self.write_map(node, rel, inner, options.normalize, value, mode),
            kind => {
                let config = self.arena[node].schema.cast_config().clone();
                let cast = cast_scalar(kind, value, rel, &config, options.normalize)?;
                self.put(node, rel, to_value(cast), mode)
            }
        }
    }

    fn write_embedded(
        &mut self,
        node: NodeId,
        rel: &str,
        schema: &std::sync::Arc<Schema>,
        value: Bson,
        mode: WriteMode,
    ) -> DocumentResult<()> {
        match value {
            Bson::Undefined | Bson::Null => self.put(node, rel, to_value(value), mode),
            Bson::Document(input) => {
                if mode.merge {
                    if let Some(Value::Embedded(child)) = self.lookup_value(node, rel) {
                        let child = *child;
                        for (key, value) in input {
                            self.write(child, &key, value, mode)?;
                        }
                        return Ok(());
                    }
                }

                let child = self.build_child(schema.clone(), ParentLink::new(node, rel), input)?;
                self.put(node, rel, Value::Embedded(child), mode)
            }
            other => Err(CastError::new(rel, other, CastKind::ObjectExpected).into()),
        }
    }

    fn write_nested(
        &mut self,
        node: NodeId,
        rel: &str,
        value: Bson,
        mode: WriteMode,
    ) -> DocumentResult<()> {
        match value {
            Bson::Document(input) => {
                if mode.merge || mode.constructing {
                    for (key, value) in input {
                        self.write(node, &path::join(rel, &key), value, mode)?;
                    }
                    return Ok(());
                }

                if self.unchanged(node, rel, &Bson::Document(input.clone())) {
                    // same content: fold any marked leaves into the object path
                    let has_marked_leaves = self.arena[node]
                        .tracker
                        .direct_modified_paths()
                        .iter()
                        .any(|marked| path::is_ancestor(rel, marked));
                    if has_marked_leaves {
                        self.mark(node, rel);
                    }
                    self.arena[node]
                        .cast_errors
                        .retain(|errored, _| !path::is_ancestor(rel, errored));
                    return Ok(());
                }

                self.store(node, rel, Value::Mapping(Mapping::new()));
                self.after_write(node, rel, mode);

                let inner = WriteMode { merge: true, ..mode };
                for (key, value) in input {
                    self.write(node, &path::join(rel, &key), value, inner)?;
                }
                Ok(())
            }
            Bson::Undefined => self.put(node, rel, Value::Undefined, mode),
            Bson::Null => self.put(node, rel, Value::null(), mode),
            other => Err(CastError::new(rel, other, CastKind::ObjectExpected).into()),
        }
    }

    fn write_virtual(
        &mut self,
        node: NodeId,
        rel: &str,
        virtual_path: &VirtualPath,
        value: Bson,
        mode: WriteMode,
    ) -> DocumentResult<()> {
        let Some(setter) = virtual_path.setter.clone() else {
            tracing::debug!(path = rel, "virtual has no setter; ignoring write");
            return Ok(());
        };

        let mut writer = VirtualWriter::default();
        let outcome = setter(value.clone(), &NodeRef::new(self, node), &mut writer);
        match outcome {
            Ok(()) => {
                for (target, value) in writer.into_writes() {
                    self.write(node, &target, value, mode)?;
                }
                Ok(())
            }
            Err(reason) => Err(CastError::new(rel, value, CastKind::Setter)
                .with_reason(reason)
                .into()),
        }
    }

    fn write_below(
        &mut self,
        node: NodeId,
        prefix: &str,
        options: &PathOptions,
        rest: &str,
        value: Bson,
        mode: WriteMode,
    ) -> DocumentResult<()> {
        match options.kind() {
            SchemaType::Embedded(schema) => {
                let child = match self.lookup_value(node, prefix) {
                    Some(Value::Embedded(child)) => *child,
                    _ if matches!(value, Bson::Undefined) => return Ok(()),
                    _ => {
                        let child = self.build_child(
                            schema.clone(),
                            ParentLink::new(node, prefix),
                            bson::Document::new(),
                        )?;
                        self.store(node, prefix, Value::Embedded(child));
                        self.after_write(node, prefix, mode);
                        child
                    }
                };
                self.write(child, rest, value, mode)
            }
            SchemaType::Array(inner) => {
                self.write_array_path(node, prefix, inner, options.normalize, rest, value, mode)
            }
            SchemaType::Mixed => self.write_adhoc(node, prefix, rest, value, mode),
            SchemaType::Map(inner) => {
                self.write_map_entry(node, prefix, inner, options.normalize, rest, value, mode)
            }
            _ => self.write_undeclared(node, &path::join(prefix, rest), value, mode),
        }
    }

    /// Make sure `array` holds an array long enough to address `index` (appending at the
    /// end is allowed).
    fn ensure_array_slot(&mut self, node: NodeId, array: &str, index: usize) -> DocumentResult<()> {
        let len = match self.lookup_value(node, array) {
            Some(Value::Array(items)) => items.len(),
            None => 0,
            Some(value) if value.is_nullish() => 0,
            Some(_) => {
                return Err(DocumentError::InvalidPath(
                    self.full_path(node, array),
                    "not an array".to_string(),
                ));
            }
        };

        if index > len {
            return Err(DocumentError::InvalidPath(
                self.full_path(node, &path::join(array, &index.to_string())),
                format!("index is past the end of an array of length {}", len),
            ));
        }
        if !matches!(self.lookup_value(node, array), Some(Value::Array(_))) {
            self.store(node, array, Value::Array(Vec::new()));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn write_array_path(
        &mut self,
        node: NodeId,
        array: &str,
        inner: &SchemaType,
        normalize: StringNormalize,
        rest: &str,
        value: Bson,
        mode: WriteMode,
    ) -> DocumentResult<()> {
        let (head, tail) = path::split_first(rest);
        let Some(index) = path::as_index(head) else {
            return self.write_undeclared(node, &path::join(array, rest), value, mode);
        };
        let slot = path::join(array, head);

        match (inner, tail) {
            (SchemaType::Embedded(schema), Some(tail)) => {
                let child = match self.lookup_value(node, &slot) {
                    Some(Value::Embedded(child)) => *child,
                    _ => {
                        self.ensure_array_slot(node, array, index)?;
                        let child = self.build_child(
                            schema.clone(),
                            ParentLink::new(node, slot.as_str()),
                            bson::Document::new(),
                        )?;
                        self.store(node, &slot, Value::Embedded(child));
                        self.after_write(node, &slot, mode);
                        child
                    }
                };
                self.write(child, tail, value, mode)
            }
            (SchemaType::Array(deeper), Some(tail)) => {
                self.write_array_path(node, &slot, deeper, normalize, tail, value, mode)
            }
            (_, Some(_)) => self.write_undeclared(node, &path::join(array, rest), value, mode),
            (_, None) => {
                self.ensure_array_slot(node, array, index)?;
                let value = wrap_to_depth(value, inner.array_depth());
                let element = self.cast_element(node, &slot, inner, normalize, value)?;
                self.put(node, &slot, element, mode)
            }
        }
    }

    /// Write below a `Mixed` path by editing the stored plain value in place.
    fn write_adhoc(
        &mut self,
        node: NodeId,
        prefix: &str,
        rest: &str,
        value: Bson,
        mode: WriteMode,
    ) -> DocumentResult<()> {
        let mut base = match self.lookup_value(node, prefix) {
            Some(Value::Primitive(Bson::Document(doc))) => doc.clone(),
            _ => bson::Document::new(),
        };

        if !mode.constructing {
            let current = bson_lookup(&Bson::Document(base.clone()), rest)
                .cloned()
                .unwrap_or(Bson::Undefined);
            if bson_equal(&current, &value) {
                return Ok(());
            }
        }

        if matches!(value, Bson::Undefined) {
            bson_remove(&mut base, rest);
        } else if !bson_assign(&mut base, rest, value) {
            return Err(DocumentError::InvalidPath(
                path::join(prefix, rest),
                format!(
                    "not an array index, or more than {} slots past the end of the array",
                    MAX_ARRAY_PADDING
                ),
            ));
        }
        self.store(node, prefix, Value::Primitive(Bson::Document(base)));
        self.after_write(node, &path::join(prefix, rest), mode);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn write_map_entry(
        &mut self,
        node: NodeId,
        map: &str,
        inner: &SchemaType,
        normalize: StringNormalize,
        rest: &str,
        value: Bson,
        mode: WriteMode,
    ) -> DocumentResult<()> {
        let (key, tail) = path::split_first(rest);
        if key.starts_with('$') {
            return Err(CastError::new(path::join(map, rest), value, CastKind::Map)
                .with_reason(format!("map keys cannot start with '$', got `{}`", key))
                .into());
        }
        if !matches!(self.lookup_value(node, map), Some(Value::Mapping(_))) {
            self.store(node, map, Value::Mapping(Mapping::new()));
        }
        let slot = path::join(map, key);

        match (inner, tail) {
            (_, None) => {
                let element = self.cast_element(node, &slot, inner, normalize, value)?;
                self.put(node, &slot, element, mode)
            }
            (SchemaType::Embedded(schema), Some(tail)) => {
                let child = match self.lookup_value(node, &slot) {
                    Some(Value::Embedded(child)) => *child,
                    _ => {
                        let child = self.build_child(
                            schema.clone(),
                            ParentLink::new(node, slot.as_str()),
                            bson::Document::new(),
                        )?;
                        self.store(node, &slot, Value::Embedded(child));
                        self.after_write(node, &slot, mode);
                        child
                    }
                };
                self.write(child, tail, value, mode)
            }
            (SchemaType::Mixed, Some(tail)) => self.write_adhoc(node, &slot, tail, value, mode),
            _ => self.write_undeclared(node, &path::join(map, rest), value, mode),
        }
    }

    fn write_undeclared(
        &mut self,
        node: NodeId,
        rel: &str,
        value: Bson,
        mode: WriteMode,
    ) -> DocumentResult<()> {
        match self.arena[node].schema.options().strict_mode() {
            Strict::Drop => {
                tracing::debug!(path = %self.full_path(node, rel), "dropping write to an undeclared path");
                Ok(())
            }
            Strict::Throw => Err(DocumentError::strict(self.full_path(node, rel))),
            Strict::Accept => self.put(node, rel, to_value(value), mode),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write_array(
        &mut self,
        node: NodeId,
        rel: &str,
        kind: &SchemaType,
        inner: &SchemaType,
        normalize: StringNormalize,
        value: Bson,
        mode: WriteMode,
    ) -> DocumentResult<()> {
        if matches!(value, Bson::Undefined | Bson::Null) {
            return self.put(node, rel, to_value(value), mode);
        }

        let items = match wrap_to_depth(value, kind.array_depth()) {
            Bson::Array(items) => items,
            other => return Err(CastError::new(rel, other, CastKind::Array).into()),
        };
        let original = Bson::Array(items.clone());
        match self.cast_items(node, rel, inner, normalize, items) {
            Ok(items) => self.put(node, rel, Value::Array(items), mode),
            Err(DocumentError::Cast(err)) => Err(CastError::new(rel, original, CastKind::Array)
                .with_reason(err.to_string())
                .into()),
            Err(err) => Err(err),
        }
    }

    fn write_map(
        &mut self,
        node: NodeId,
        rel: &str,
        inner: &SchemaType,
        normalize: StringNormalize,
        value: Bson,
        mode: WriteMode,
    ) -> DocumentResult<()> {
        match value {
            Bson::Undefined | Bson::Null => self.put(node, rel, to_value(value), mode),
            Bson::Document(entries) => {
                let mapping = self.cast_map(node, rel, inner, normalize, entries)?;
                self.put(node, rel, Value::Mapping(mapping), mode)
            }
            other => Err(CastError::new(rel, other, CastKind::Map).into()),
        }
    }

    pub(crate) fn cast_items(
        &mut self,
        node: NodeId,
        rel: &str,
        inner: &SchemaType,
        normalize: StringNormalize,
        items: Vec<Bson>,
    ) -> DocumentResult<Vec<Value>> {
        self.cast_items_from(node, rel, 0, inner, normalize, items)
    }

    /// Cast array elements whose slots start at index `first`.
    pub(crate) fn cast_items_from(
        &mut self,
        node: NodeId,
        rel: &str,
        first: usize,
        inner: &SchemaType,
        normalize: StringNormalize,
        items: Vec<Bson>,
    ) -> DocumentResult<Vec<Value>> {
        let mut out = Vec::with_capacity(items.len());
        for (offset, item) in items.into_iter().enumerate() {
            let slot = path::join(rel, &(first + offset).to_string());
            match self.cast_element(node, &slot, inner, normalize, item) {
                Ok(value) => out.push(value),
                Err(err) => {
                    self.arena.free_value(&Value::Array(out));
                    return Err(err);
                }
            }
        }
        Ok(out)
    }

    fn cast_map(
        &mut self,
        node: NodeId,
        rel: &str,
        inner: &SchemaType,
        normalize: StringNormalize,
        entries: bson::Document,
    ) -> DocumentResult<Mapping> {
        let mut mapping = Mapping::new();
        for (key, item) in entries {
            if key.contains('.') || key.starts_with('$') {
                self.arena.free_value(&Value::Mapping(mapping));
                return Err(CastError::new(path::join(rel, &key), item, CastKind::Map)
                    .with_reason(format!("map keys cannot contain '.' or start with '$', got `{}`", key))
                    .into());
            }
            match self.cast_element(node, &path::join(rel, &key), inner, normalize, item) {
                Ok(value) => {
                    mapping.insert(key, value);
                }
                Err(err) => {
                    self.arena.free_value(&Value::Mapping(mapping));
                    return Err(err);
                }
            }
        }
        Ok(mapping)
    }

    /// Cast one element of an array or map stored at `slot`.
    pub(crate) fn cast_element(
        &mut self,
        node: NodeId,
        slot: &str,
        kind: &SchemaType,
        normalize: StringNormalize,
        value: Bson,
    ) -> DocumentResult<Value> {
        match (kind, value) {
            (_, Bson::Undefined) => Ok(Value::Undefined),
            (_, Bson::Null) => Ok(Value::null()),
            (SchemaType::Embedded(schema), Bson::Document(input)) => Ok(Value::Embedded(
                self.build_child(schema.clone(), ParentLink::new(node, slot), input)?,
            )),
            (SchemaType::Embedded(_), other) => {
                Err(CastError::new(slot, other, CastKind::ObjectExpected).into())
            }
            (SchemaType::Array(inner), value) => match wrap_to_depth(value, kind.array_depth()) {
                Bson::Array(items) => Ok(Value::Array(self.cast_items(node, slot, inner, normalize, items)?)),
                other => Err(CastError::new(slot, other, CastKind::Array).into()),
            },
            (SchemaType::Map(inner), Bson::Document(entries)) => Ok(Value::Mapping(
                self.cast_map(node, slot, inner, normalize, entries)?,
            )),
            (SchemaType::Map(_), other) => Err(CastError::new(slot, other, CastKind::Map).into()),
            (kind, value) => {
                let config = self.arena[node].schema.cast_config().clone();
                Ok(to_value(cast_scalar(kind, value, slot, &config, normalize)?))
            }
        }
    }

    /// Store `value` at `rel` unless it equals what is already there, then mark.
    pub(crate) fn put(
        &mut self,
        node: NodeId,
        rel: &str,
        value: Value,
        mode: WriteMode,
    ) -> DocumentResult<()> {
        if !mode.constructing && self.unchanged(node, rel, &self.plain_value(&value, true)) {
            self.arena.free_value(&value);
            self.arena[node].cast_errors.remove(rel);
            return Ok(());
        }

        self.store(node, rel, value);
        self.after_write(node, rel, mode);
        Ok(())
    }

    /// Replace the value at `rel`, creating intermediate objects, and release the nodes the
    /// old value held.
    pub(crate) fn store(&mut self, node: NodeId, rel: &str, value: Value) {
        self.relink(node, rel, &value);
        match self.slot_mut(node, rel) {
            Some(slot) => {
                let old = std::mem::replace(slot, value);
                self.arena.free_value(&old);
            }
            None => {
                tracing::warn!(path = %self.full_path(node, rel), "no slot to store into");
                self.arena.free_value(&value);
            }
        }
    }

    /// Point the parent links of every node held by `value` at their slots under `rel`.
    pub(crate) fn relink(&mut self, node: NodeId, rel: &str, value: &Value) {
        match value {
            Value::Embedded(child) => {
                if let Some(child) = self.arena.get_mut(*child) {
                    child.parent = Some(ParentLink::new(node, rel));
                }
            }
            Value::Array(items) => {
                for (index, item) in items.iter().enumerate() {
                    self.relink(node, &path::join(rel, &index.to_string()), item);
                }
            }
            Value::Mapping(mapping) => {
                for (key, item) in mapping.iter() {
                    self.relink(node, &path::join(rel, key), item);
                }
            }
            _ => {}
        }
    }

    /// Mutable slot at `rel` inside a node, created on demand. An index equal to an array's
    /// length appends.
    fn slot_mut(&mut self, node: NodeId, rel: &str) -> Option<&mut Value> {
        let mut segments = path::segments(rel);
        let first = segments.next()?;
        let mut current = self
            .arena
            .get_mut(node)?
            .raw
            .get_or_insert_with(first, Value::default);

        for segment in segments {
            if current.is_nullish() {
                *current = Value::Mapping(Mapping::new());
            }
            current = match current {
                Value::Mapping(mapping) => mapping.get_or_insert_with(segment, Value::default),
                Value::Array(items) => {
                    let index = path::as_index(segment)?;
                    if index == items.len() {
                        items.push(Value::Undefined);
                    }
                    items.get_mut(index)?
                }
                _ => return None,
            };
        }
        Some(current)
    }

    /// Bookkeeping after an effective write: clear errors and population state under the
    /// path, then mark it (or record it as a default).
    pub(crate) fn after_write(&mut self, node: NodeId, rel: &str, mode: WriteMode) {
        self.arena[node].clear_errors(rel);
        let full = self.full_path(node, rel);
        self.populated
            .retain(|populated, _| populated != &full && !path::is_ancestor(&full, populated));

        if mode.default {
            self.arena[node].tracker.mark_default(rel);
        } else {
            self.mark(node, rel);
        }
    }

    /// The trackers that record a mark on `rel` in `node`: the node itself and each
    /// ancestor, with the path as seen from that ancestor. Stops at a node still being
    /// built.
    pub(crate) fn tracker_chain(&self, node: NodeId, rel: &str) -> Vec<(NodeId, String)> {
        let mut chain = vec![(node, rel.to_string())];
        let mut current = node;
        while let Some(owner) = self.arena.get(current) {
            if owner.building {
                break;
            }
            let Some(link) = &owner.parent else {
                break;
            };
            let above = path::join(&link.slot, &chain[chain.len() - 1].1);
            chain.push((link.node, above));
            current = link.node;
        }
        chain
    }

    pub(crate) fn mark(&mut self, node: NodeId, rel: &str) {
        for (owner, marked) in self.tracker_chain(node, rel) {
            self.arena[owner].tracker.mark(&marked);
        }
    }
}

fn not_a_subdocument(path: &str) -> DocumentError {
    DocumentError::InvalidPath(path.to_string(), "not an embedded document path".to_string())
}
