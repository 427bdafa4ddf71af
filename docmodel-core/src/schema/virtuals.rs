//! Computed paths layered over stored values.

use std::{collections::HashMap, fmt, sync::Arc};

use bson::Bson;

use crate::{document::NodeRef, path};

/// Computes a virtual's value from its owning node.
pub type VirtualGetter = Arc<dyn Fn(&NodeRef<'_>) -> Bson + Send + Sync>;
/// Receives an assigned value and schedules writes to real paths through the writer.
pub type VirtualSetter =
    Arc<dyn Fn(Bson, &NodeRef<'_>, &mut VirtualWriter) -> Result<(), String> + Send + Sync>;

/// Collects the writes a virtual setter makes. Writes are applied to the owning node, in
/// order, once the setter returns.
#[derive(Debug, Default)]
pub struct VirtualWriter {
    writes: Vec<(String, Bson)>,
}

impl VirtualWriter {
    pub fn set(&mut self, path: impl Into<String>, value: impl Into<Bson>) {
        self.writes.push((path.into(), value.into()));
    }

    pub(crate) fn into_writes(self) -> Vec<(String, Bson)> {
        self.writes
    }
}

/// A get/set pair bound to a virtual path.
#[derive(Clone, Default)]
pub struct VirtualPath {
    pub(crate) getter: Option<VirtualGetter>,
    pub(crate) setter: Option<VirtualSetter>,
    pub(crate) depends_on: Vec<String>,
}

impl VirtualPath {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<F>(mut self, getter: F) -> Self
    where
        F: Fn(&NodeRef<'_>) -> Bson + Send + Sync + 'static,
    {
        self.getter = Some(Arc::new(getter));
        self
    }

    pub fn set<F>(mut self, setter: F) -> Self
    where
        F: Fn(Bson, &NodeRef<'_>, &mut VirtualWriter) -> Result<(), String> + Send + Sync + 'static,
    {
        self.setter = Some(Arc::new(setter));
        self
    }

    /// Real paths the getter reads. A projection that excludes any of them omits the virtual.
    pub fn depends_on<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn has_getter(&self) -> bool {
        self.getter.is_some()
    }

    pub fn has_setter(&self) -> bool {
        self.setter.is_some()
    }
}

impl fmt::Debug for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualPath")
            .field("getter", &self.getter.is_some())
            .field("setter", &self.setter.is_some())
            .field("depends_on", &self.depends_on)
            .finish()
    }
}

/// Per-schema virtual paths, kept in definition order.
#[derive(Clone, Default, Debug)]
pub struct VirtualRegistry {
    order: Vec<String>,
    paths: HashMap<String, VirtualPath>,
}

impl VirtualRegistry {
    /// Define or replace a virtual. Redefinition keeps the original position.
    pub fn define(&mut self, path: impl Into<String>, virtual_path: VirtualPath) {
        let path = path.into();
        if self.paths.insert(path.clone(), virtual_path).is_none() {
            self.order.push(path);
        }
    }

    pub fn get(&self, path: &str) -> Option<&VirtualPath> {
        self.paths.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.paths.contains_key(path)
    }

    /// Returns true if some virtual lives strictly below `prefix`.
    pub fn has_descendants(&self, prefix: &str) -> bool {
        self.order
            .iter()
            .any(|path| path::is_ancestor(prefix, path))
    }

    /// Virtuals below `prefix`, with their paths relative to it.
    pub fn descendants<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a VirtualPath)> + 'a {
        self.iter()
            .filter_map(move |(path, virtual_path)| {
                path::relative_to(prefix, path).map(|rest| (rest, virtual_path))
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &VirtualPath)> {
        self.order
            .iter()
            .filter_map(|path| {
                self.paths
                    .get(path)
                    .map(|virtual_path| (path.as_str(), virtual_path))
            })
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn define_keeps_first_position() {
        let mut registry = VirtualRegistry::default();
        registry.define("fullName", VirtualPath::new());
        registry.define("a.b.c", VirtualPath::new().get(|_| Bson::Int32(1)));
        registry.define("fullName", VirtualPath::new().get(|_| Bson::Null));

        let paths: Vec<_> = registry.iter().map(|(path, _)| path).collect();
        assert_eq!(paths, vec!["fullName", "a.b.c"]);
        assert!(registry.get("fullName").unwrap().has_getter());
    }

    #[test]
    fn nested_virtuals_are_found_by_prefix() {
        let mut registry = VirtualRegistry::default();
        registry.define("a.b.c", VirtualPath::new());

        assert!(registry.has_descendants("a"));
        assert!(registry.has_descendants("a.b"));
        assert!(!registry.has_descendants("a.b.c"));

        let below: Vec<_> = registry.descendants("a").map(|(rest, _)| rest).collect();
        assert_eq!(below, vec!["b.c"]);
    }

    #[test]
    fn writer_records_in_order() {
        let mut writer = VirtualWriter::default();
        writer.set("name.first", "Ada");
        writer.set("name.last", "Lovelace");

        let writes = writer.into_writes();
        assert_eq!(writes[0].0, "name.first");
        assert_eq!(writes[1].1, Bson::String("Lovelace".into()));
    }
}
