//! Change-tracking surface and the persistence diff.

use bson::{Bson, doc};

use super::Document;
use crate::{
    path,
    tracker::{ArrayAtomic, ChangeTracker},
};

fn tail(items: &[Bson], start: usize, end: usize) -> Vec<Bson> {
    let end = end.min(items.len());
    items[start.min(end)..end].to_vec()
}

/// Every document key and array index below `prefix` in a plain value.
fn collect_leaves(prefix: &str, value: &Bson, out: &mut Vec<String>) {
    match value {
        Bson::Document(doc) => {
            for (key, value) in doc {
                let path = path::join(prefix, key);
                out.push(path.clone());
                collect_leaves(&path, value, out);
            }
        }
        Bson::Array(items) => {
            for (index, value) in items.iter().enumerate() {
                let path = path::join(prefix, &index.to_string());
                out.push(path.clone());
                collect_leaves(&path, value, out);
            }
        }
        _ => {}
    }
}

impl Document {
    fn root_tracker(&self) -> &ChangeTracker {
        &self.arena[self.root].tracker
    }

    /// Mark `path` as modified, for changes made behind the document's back (for example
    /// inside a `Mixed` value).
    pub fn mark_modified(&mut self, path: &str) {
        let (node, rel) = self.locate(self.root, path);
        self.mark(node, &rel);
    }

    /// Forget that `path` and everything below it was modified.
    pub fn unmark_modified(&mut self, path: &str) {
        let (node, rel) = self.locate(self.root, path);
        for (owner, marked) in self.tracker_chain(node, &rel) {
            self.arena[owner].tracker.unmark(&marked);
        }
        let below: Vec<_> = self
            .walk_nodes()
            .into_iter()
            .filter(|(_, prefix)| prefix == path || path::is_ancestor(path, prefix))
            .map(|(id, _)| id)
            .collect();
        for id in below {
            self.arena[id].tracker.unmark("");
        }
    }

    /// Leave `path` out of the next persistence diff and out of validation, without
    /// reverting its value.
    pub fn ignore(&mut self, path: &str) {
        let (node, rel) = self.locate(self.root, path);
        for (owner, ignored) in self.tracker_chain(node, &rel) {
            self.arena[owner].tracker.ignore(&ignored);
        }
    }

    pub fn is_ignored(&self, path: &str) -> bool {
        self.root_tracker().is_ignored(path)
    }

    /// True if `path`, one of its ancestors or one of its descendants was modified.
    pub fn is_modified(&self, path: &str) -> bool {
        self.is_modified_with(path, true)
    }

    /// Without `include_children`, only `path` itself and writes to its ancestors count.
    pub fn is_modified_with(&self, path: &str, include_children: bool) -> bool {
        let tracker = self.root_tracker();
        if include_children {
            return tracker.is_modified(path);
        }
        tracker
            .direct_modified_paths()
            .iter()
            .any(|direct| direct == path || path::is_ancestor(direct, path))
            || tracker.modified_paths().iter().any(|modified| modified == path)
    }

    /// Modified paths with their ancestors, ancestors first.
    pub fn modified_paths(&self) -> Vec<String> {
        self.root_tracker().modified_paths()
    }

    /// With `include_children`, also every key below a directly modified object or array.
    pub fn modified_paths_with(&self, include_children: bool) -> Vec<String> {
        let mut out = self.modified_paths();
        if !include_children {
            return out;
        }

        let mut leaves = Vec::new();
        for direct in self.root_tracker().direct_modified_paths() {
            collect_leaves(direct, &self.plain_at(self.root, direct), &mut leaves);
        }
        for leaf in leaves {
            if !out.contains(&leaf) {
                out.push(leaf);
            }
        }
        out
    }

    /// Paths that were the direct target of a write, in first-write order.
    pub fn direct_modified_paths(&self) -> Vec<String> {
        self.root_tracker().direct_modified_paths().to_vec()
    }

    pub fn is_direct_modified(&self, path: &str) -> bool {
        self.root_tracker().is_direct_modified(path)
    }

    /// True if `path` currently holds its default value.
    pub fn is_default(&self, path: &str) -> bool {
        let (node, rel) = self.locate(self.root, path);
        self.arena[node].tracker.is_default(&rel)
    }

    /// True if `path` was loaded by `init` or persisted since.
    pub fn is_init(&self, path: &str) -> bool {
        let (node, rel) = self.locate(self.root, path);
        self.arena[node].tracker.is_init(&rel)
    }

    /// The update a persistence backend needs to apply to bring the stored record in line
    /// with this document.
    ///
    /// Each directly modified path contributes one entry: pending array atomics become
    /// `$push` (with `$each` and `$position`), `$addToSet`, `$pullAll` or `$pop`; an undefined
    /// value becomes `$unset`; everything else is a `$set` of the stored form.
    pub fn get_changes(&self) -> bson::Document {
        let tracker = self.root_tracker();
        let mut set = bson::Document::new();
        let mut unset = bson::Document::new();
        let mut push = bson::Document::new();
        let mut add_to_set = bson::Document::new();
        let mut pull_all = bson::Document::new();
        let mut pop = bson::Document::new();

        for path in tracker.direct_modified_paths() {
            if tracker.is_ignored(path) {
                continue;
            }
            let value = self.storage_value(path);
            let items = match &value {
                Bson::Array(items) => items.as_slice(),
                _ => &[],
            };

            match tracker.atomic(path) {
                Some(ArrayAtomic::Push {
                    count,
                    position,
                    index,
                }) => {
                    let (start, end) = match position {
                        Some(_) => (*index, index + count),
                        None => (items.len().saturating_sub(*count), items.len()),
                    };
                    let mut each = doc! { "$each": tail(items, start, end) };
                    if position.is_some() {
                        each.insert("$position", start as i32);
                    }
                    push.insert(path, each);
                }
                Some(ArrayAtomic::AddToSet { count }) => {
                    let added = tail(items, items.len().saturating_sub(*count), items.len());
                    add_to_set.insert(path, doc! { "$each": added });
                }
                Some(ArrayAtomic::PullAll(values)) => {
                    pull_all.insert(path, values.clone());
                }
                Some(ArrayAtomic::Pop(direction)) => {
                    pop.insert(path, *direction);
                }
                Some(ArrayAtomic::Set) | None => match value {
                    Bson::Undefined => {
                        unset.insert(path, 1);
                    }
                    value => {
                        set.insert(path, value);
                    }
                },
            }
        }

        let mut changes = bson::Document::new();
        for (operator, entries) in [
            ("$set", set),
            ("$unset", unset),
            ("$push", push),
            ("$addToSet", add_to_set),
            ("$pullAll", pull_all),
            ("$pop", pop),
        ] {
            if !entries.is_empty() {
                changes.insert(operator, entries);
            }
        }
        changes
    }

    /// Acknowledge a persisted write: clear pending changes, recorded errors and array
    /// atomics on every node, and leave the new state.
    pub fn reset(&mut self) {
        for (id, _) in self.walk_nodes() {
            let node = &mut self.arena[id];
            node.tracker.reset();
            node.cast_errors.clear();
            node.invalidated.clear();
        }
        self.is_new = false;
        tracing::trace!("document reset");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::schema::{PathOptions, Schema, SchemaOptions, SchemaType};

    fn schema() -> Arc<Schema> {
        let child = Schema::builder()
            .path("title", PathOptions::string())
            .options(SchemaOptions::default().id_path(false))
            .build()
            .unwrap();

        Schema::builder()
            .path("name", PathOptions::string())
            .path("nested.age", PathOptions::number())
            .path("nested.path", PathOptions::string())
            .path("child", PathOptions::embedded(child))
            .path("tags", PathOptions::array(SchemaType::String))
            .build()
            .unwrap()
    }

    fn persisted() -> Document {
        let mut doc = Document::new(
            schema(),
            doc! { "name": "a", "nested": { "age": 1, "path": "p" }, "child": { "title": "t" } },
        )
        .unwrap();
        doc.reset();
        doc
    }

    #[test]
    fn changes_cover_only_direct_paths() {
        let mut doc = persisted();
        doc.set("nested.age", 2).unwrap();
        doc.set("child.title", "u").unwrap();
        doc.unset("name").unwrap();

        assert_eq!(
            doc.get_changes(),
            doc! {
                "$set": { "nested.age": 2.0, "child.title": "u" },
                "$unset": { "name": 1 },
            }
        );
        assert_eq!(doc.modified_paths(), vec!["nested", "nested.age", "child", "child.title", "name"]);
        assert!(doc.is_modified("nested"));
        assert!(doc.is_modified_with("nested", false));
        assert!(!doc.is_modified_with("nested.path", false));
    }

    #[test]
    fn whole_object_replace_is_one_entry() {
        let mut doc = persisted();
        doc.set("nested", doc! { "age": 5 }).unwrap();
        assert_eq!(doc.get_changes(), doc! { "$set": { "nested": { "age": 5.0 } } });
        assert_eq!(
            doc.modified_paths_with(true),
            vec!["nested", "nested.age"]
        );
    }

    #[test]
    fn subdocument_marks_reach_the_root() {
        let mut doc = persisted();
        doc.set("child.title", "x").unwrap();

        let child = doc.subdocument("child").unwrap();
        assert!(child.is_modified("title"));
        assert!(doc.is_direct_modified("child.title"));

        doc.unmark_modified("child");
        assert!(!doc.is_modified("child.title"));
        assert!(!doc.subdocument("child").unwrap().is_modified("title"));
    }

    #[test]
    fn ignored_paths_leave_the_diff() {
        let mut doc = persisted();
        doc.set("name", "b").unwrap();
        doc.set("nested.path", "q").unwrap();
        doc.ignore("name");

        assert!(doc.is_ignored("name"));
        assert_eq!(doc.get_changes(), doc! { "$set": { "nested.path": "q" } });
        assert_eq!(doc.get("name"), Bson::String("b".into()));
    }

    #[test]
    fn mark_modified_adds_untracked_writes() {
        let mut doc = persisted();
        doc.mark_modified("tags");
        assert_eq!(doc.get_changes(), doc! { "$set": { "tags": [] } });
    }

    #[test]
    fn reset_clears_state() {
        let mut doc = Document::new(schema(), doc! { "name": "a", "nested": { "age": "x" } }).unwrap();
        assert!(doc.is_new());
        assert!(!doc.errors().is_empty());

        doc.reset();
        assert!(!doc.is_new());
        assert!(doc.errors().is_empty());
        assert!(doc.get_changes().is_empty());
        assert!(doc.is_init("name"));
    }
}
