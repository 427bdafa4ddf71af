//! Array mutations that record atomic deltas.
//!
//! Each operation checks, before touching the array, that its delta can join the one
//! already pending for the array in this change window. A positional insert and any other
//! kind of array mutation cannot share a window and fail with
//! [`DocumentError::ArrayOperationConflict`].

use std::cmp::Ordering;

use bson::Bson;

use super::{Document, NodeId, ParentLink};
use crate::{
    cast::cast_scalar,
    error::{DocumentError, DocumentResult},
    path,
    schema::{SchemaType, StringNormalize},
    tracker::ArrayAtomic,
    value::{Value, bson_equal},
};

struct ArrayTarget {
    node: NodeId,
    rel: String,
    element: SchemaType,
    normalize: StringNormalize,
}

/// Parent links for every node held by `value`, stored at `slot`.
fn collect_links(value: &Value, slot: &str, out: &mut Vec<(NodeId, String)>) {
    match value {
        Value::Embedded(child) => out.push((*child, slot.to_string())),
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                collect_links(item, &path::join(slot, &index.to_string()), out);
            }
        }
        Value::Mapping(mapping) => {
            for (key, item) in mapping.iter() {
                collect_links(item, &path::join(slot, key), out);
            }
        }
        _ => {}
    }
}

fn matches_any(item: &Bson, values: &[Bson]) -> bool {
    values.iter().any(|value| {
        bson_equal(item, value)
            || match (item, value) {
                (Bson::Document(item), Bson::Document(value)) => {
                    item.get("_id").zip(value.get("_id")).is_some_and(|(a, b)| bson_equal(a, b))
                }
                (Bson::Document(item), value) => item.get("_id").is_some_and(|id| bson_equal(id, value)),
                _ => false,
            }
    })
}

impl Document {
    /// Resolve an array path, creating an empty array if nothing is stored there yet.
    fn array_target(&mut self, path: &str) -> DocumentResult<ArrayTarget> {
        let (node, rel) = self.locate(self.root, path);
        let schema = self.arena[node].schema.clone();
        let rel = schema.resolve_alias(&rel).map(str::to_string).unwrap_or(rel);
        let not_an_array = || DocumentError::InvalidPath(path.to_string(), "not an array path".to_string());

        let (kind, normalize) = match schema.path(&rel) {
            Some(options) => (options.kind().clone(), options.normalize),
            None => {
                let (_, options, rest) = schema.find_prefix(&rel).ok_or_else(not_an_array)?;
                let mut kind = options.kind().clone();
                for segment in path::segments(rest) {
                    kind = match (path::as_index(segment), kind) {
                        (Some(_), SchemaType::Array(inner)) => *inner,
                        _ => return Err(not_an_array()),
                    };
                }
                (kind, options.normalize)
            }
        };
        let SchemaType::Array(element) = kind else {
            return Err(not_an_array());
        };

        let missing = match self.lookup_value(node, &rel) {
            Some(Value::Array(_)) => false,
            None => true,
            Some(value) if value.is_nullish() => true,
            Some(_) => return Err(not_an_array()),
        };
        if missing {
            self.store(node, &rel, Value::Array(Vec::new()));
        }

        Ok(ArrayTarget {
            node,
            rel,
            element: *element,
            normalize,
        })
    }

    fn items(&self, node: NodeId, rel: &str) -> &[Value] {
        match self.lookup_value(node, rel) {
            Some(Value::Array(items)) => items,
            _ => &[],
        }
    }

    fn items_mut(&mut self, node: NodeId, rel: &str) -> DocumentResult<&mut Vec<Value>> {
        match self.lookup_value_mut(node, rel) {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(DocumentError::InvalidPath(
                rel.to_string(),
                "not an array".to_string(),
            )),
        }
    }

    /// The tracker that records array atomics for `rel`: the top-most one in the chain.
    fn atomic_owner(&self, node: NodeId, rel: &str) -> (NodeId, String) {
        self.tracker_chain(node, rel)
            .pop()
            .unwrap_or_else(|| (node, rel.to_string()))
    }

    fn check_array_op(&self, node: NodeId, rel: &str, atomic: &ArrayAtomic) -> DocumentResult<()> {
        let (owner, array) = self.atomic_owner(node, rel);
        if self.arena[owner].tracker.can_record(&array, atomic) {
            return Ok(());
        }

        let path = self.full_path(node, rel);
        tracing::debug!(%path, operation = atomic.operation(), "conflicting array operation");
        Err(DocumentError::ArrayOperationConflict {
            path,
            operation: atomic.operation().to_string(),
        })
    }

    fn commit_array_op(&mut self, node: NodeId, rel: &str, atomic: ArrayAtomic) {
        let mut chain = self.tracker_chain(node, rel);
        if let Some((owner, array)) = chain.pop() {
            for (intermediate, marked) in chain {
                self.arena[intermediate].tracker.mark_array(&marked);
            }
            self.arena[owner].tracker.record_array_op(&array, atomic);
        }
        self.arena[node].clear_errors(rel);
    }

    /// Point every element's parent link at its current index.
    fn reindex(&mut self, node: NodeId, rel: &str) {
        let mut links = Vec::new();
        if let Some(value) = self.lookup_value(node, rel) {
            collect_links(value, rel, &mut links);
        }
        for (child, slot) in links {
            if let Some(child) = self.arena.get_mut(child) {
                child.parent = Some(ParentLink::new(node, slot));
            }
        }
    }

    fn insert_items(
        &mut self,
        path: &str,
        values: Vec<Bson>,
        position: Option<i32>,
    ) -> DocumentResult<usize> {
        let target = self.array_target(path)?;
        let (node, rel) = (target.node, target.rel.as_str());

        let len = self.items(node, rel).len();
        let at = match position {
            None => len,
            Some(position) => {
                let (owner, array) = self.atomic_owner(node, rel);
                match self.arena[owner].tracker.atomic(&array) {
                    // Follow the elements already inserted at this position.
                    Some(ArrayAtomic::Push {
                        count,
                        position: Some(pending),
                        index,
                    }) if *pending == position => (index + count).min(len),
                    _ if position >= 0 => (position as usize).min(len),
                    _ => len.saturating_sub(position.unsigned_abs() as usize),
                }
            }
        };
        let atomic = ArrayAtomic::Push {
            count: values.len(),
            position,
            index: at,
        };
        self.check_array_op(node, rel, &atomic)?;

        let items = self.cast_items_from(node, rel, at, &target.element, target.normalize, values)?;
        let array = self.items_mut(node, rel)?;
        array.splice(at..at, items);
        let len = array.len();

        self.reindex(node, rel);
        self.commit_array_op(node, rel, atomic);
        Ok(len)
    }

    /// Append values to the array at `path`, casting each. Returns the new length.
    pub fn push<I, V>(&mut self, path: &str, values: I) -> DocumentResult<usize>
    where
        I: IntoIterator<Item = V>,
        V: Into<Bson>,
    {
        self.insert_items(path, values.into_iter().map(Into::into).collect(), None)
    }

    /// Insert values at `position` as a positional atomic insert. Negative positions count
    /// from the end.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::ArrayOperationConflict`] if any other kind of array
    /// operation, or an insert at another position, is pending on the array.
    pub fn push_at<I, V>(&mut self, path: &str, position: i32, values: I) -> DocumentResult<usize>
    where
        I: IntoIterator<Item = V>,
        V: Into<Bson>,
    {
        self.insert_items(path, values.into_iter().map(Into::into).collect(), Some(position))
    }

    /// Append the values that are not already present. Returns how many were added.
    pub fn add_to_set<I, V>(&mut self, path: &str, values: I) -> DocumentResult<usize>
    where
        I: IntoIterator<Item = V>,
        V: Into<Bson>,
    {
        let values: Vec<Bson> = values.into_iter().map(Into::into).collect();
        let target = self.array_target(path)?;
        let (node, rel) = (target.node, target.rel.as_str());
        self.check_array_op(node, rel, &ArrayAtomic::AddToSet { count: values.len() })?;

        let len = self.items(node, rel).len();
        let cast = self.cast_items_from(node, rel, len, &target.element, target.normalize, values)?;

        let mut seen: Vec<Bson> = self
            .items(node, rel)
            .iter()
            .map(|item| self.plain_value(item, true))
            .collect();
        let mut added = Vec::new();
        for item in cast {
            let plain = self.plain_value(&item, true);
            if seen.iter().any(|existing| bson_equal(existing, &plain)) {
                self.arena.free_value(&item);
                continue;
            }
            seen.push(plain);
            added.push(item);
        }

        let count = added.len();
        if count == 0 {
            return Ok(0);
        }
        self.items_mut(node, rel)?.extend(added);
        self.reindex(node, rel);
        self.commit_array_op(node, rel, ArrayAtomic::AddToSet { count });
        Ok(count)
    }

    /// Remove every element equal to one of `values`. Documents also match by `_id`.
    /// Returns how many elements were removed.
    pub fn pull<I, V>(&mut self, path: &str, values: I) -> DocumentResult<usize>
    where
        I: IntoIterator<Item = V>,
        V: Into<Bson>,
    {
        let target = self.array_target(path)?;
        let (node, rel) = (target.node, target.rel.as_str());
        self.check_array_op(node, rel, &ArrayAtomic::PullAll(Vec::new()))?;

        let config = self.arena[node].schema.cast_config().clone();
        let values: Vec<Bson> = values
            .into_iter()
            .map(Into::into)
            .map(|value| {
                cast_scalar(&target.element, value.clone(), rel, &config, target.normalize)
                    .unwrap_or(value)
            })
            .collect();

        let keep: Vec<bool> = self
            .items(node, rel)
            .iter()
            .map(|item| !matches_any(&self.plain_value(item, true), &values))
            .collect();
        if keep.iter().all(|keep| *keep) {
            return Ok(0);
        }

        let removed_plain: Vec<Bson> = self
            .items(node, rel)
            .iter()
            .zip(&keep)
            .filter(|(_, keep)| !**keep)
            .map(|(item, _)| self.plain_value(item, true))
            .collect();

        let array = self.items_mut(node, rel)?;
        let mut removed = Vec::new();
        let mut flags = keep.iter();
        array.retain_mut(|item| {
            let keep = flags.next().copied().unwrap_or(true);
            if !keep {
                removed.push(std::mem::take(item));
            }
            keep
        });
        for item in &removed {
            self.arena.free_value(item);
        }

        let count = removed.len();
        self.reindex(node, rel);
        self.commit_array_op(node, rel, ArrayAtomic::PullAll(removed_plain));
        Ok(count)
    }

    fn remove_end(&mut self, path: &str, direction: i32) -> DocumentResult<Bson> {
        let target = self.array_target(path)?;
        let (node, rel) = (target.node, target.rel.as_str());
        let atomic = ArrayAtomic::Pop(direction);
        self.check_array_op(node, rel, &atomic)?;

        let array = self.items_mut(node, rel)?;
        let removed = match (direction, array.is_empty()) {
            (_, true) => return Ok(Bson::Undefined),
            (1, _) => array.pop(),
            _ => Some(array.remove(0)),
        };
        let Some(removed) = removed else {
            return Ok(Bson::Undefined);
        };

        let plain = self.plain_value(&removed, false);
        self.arena.free_value(&removed);
        self.reindex(node, rel);
        self.commit_array_op(node, rel, atomic);
        Ok(plain)
    }

    /// Remove and return the last element; undefined if the array is empty.
    pub fn pop(&mut self, path: &str) -> DocumentResult<Bson> {
        self.remove_end(path, 1)
    }

    /// Remove and return the first element; undefined if the array is empty.
    pub fn shift(&mut self, path: &str) -> DocumentResult<Bson> {
        self.remove_end(path, -1)
    }

    /// Insert values at the front. Recorded as a whole-array replace.
    pub fn unshift<I, V>(&mut self, path: &str, values: I) -> DocumentResult<usize>
    where
        I: IntoIterator<Item = V>,
        V: Into<Bson>,
    {
        let values: Vec<Bson> = values.into_iter().map(Into::into).collect();
        let removed = self.splice(path, 0, 0, values)?;
        debug_assert!(removed.is_empty());
        let target = self.array_target(path)?;
        Ok(self.items(target.node, &target.rel).len())
    }

    /// Remove `delete_count` elements from `start` and insert `items` in their place.
    /// Returns the removed elements. Recorded as a whole-array replace.
    pub fn splice(
        &mut self,
        path: &str,
        start: usize,
        delete_count: usize,
        items: Vec<Bson>,
    ) -> DocumentResult<Vec<Bson>> {
        let target = self.array_target(path)?;
        let (node, rel) = (target.node, target.rel.as_str());
        self.check_array_op(node, rel, &ArrayAtomic::Set)?;

        let len = self.items(node, rel).len();
        let start = start.min(len);
        let end = start.saturating_add(delete_count).min(len);
        let inserted = self.cast_items_from(node, rel, start, &target.element, target.normalize, items)?;

        let array = self.items_mut(node, rel)?;
        let removed: Vec<Value> = array.splice(start..end, inserted).collect();
        let plain = removed
            .iter()
            .map(|item| self.plain_value(item, false))
            .collect();
        for item in &removed {
            self.arena.free_value(item);
        }

        self.reindex(node, rel);
        self.commit_array_op(node, rel, ArrayAtomic::Set);
        Ok(plain)
    }

    /// Sort the array in place by comparing the plain form of its elements.
    pub fn sort_by<F>(&mut self, path: &str, mut compare: F) -> DocumentResult<()>
    where
        F: FnMut(&Bson, &Bson) -> Ordering,
    {
        let target = self.array_target(path)?;
        let (node, rel) = (target.node, target.rel.as_str());
        self.check_array_op(node, rel, &ArrayAtomic::Set)?;

        let mut keyed: Vec<(Bson, Value)> = {
            let plain: Vec<Bson> = self
                .items(node, rel)
                .iter()
                .map(|item| self.plain_value(item, false))
                .collect();
            let array = self.items_mut(node, rel)?;
            plain.into_iter().zip(array.drain(..)).collect()
        };
        keyed.sort_by(|(a, _), (b, _)| compare(a, b));
        self.items_mut(node, rel)?
            .extend(keyed.into_iter().map(|(_, item)| item));

        self.reindex(node, rel);
        self.commit_array_op(node, rel, ArrayAtomic::Set);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bson::doc;

    use super::*;
    use crate::schema::{PathOptions, Schema, SchemaOptions};

    fn schema() -> Arc<Schema> {
        let item = Schema::builder()
            .path("name", PathOptions::string())
            .build()
            .unwrap();

        Schema::builder()
            .path("nums", PathOptions::array(SchemaType::Number))
            .path("items", PathOptions::document_array(item))
            .path("grid", PathOptions::array(SchemaType::array_of(SchemaType::Number)))
            .build()
            .unwrap()
    }

    fn persisted(data: bson::Document) -> Document {
        let mut doc = Document::new(schema(), data).unwrap();
        doc.reset();
        doc
    }

    #[test]
    fn pushes_cast_and_record_push() {
        let mut doc = persisted(doc! { "nums": [1] });
        assert_eq!(doc.push("nums", ["2", "3"]).unwrap(), 3);
        assert_eq!(
            doc.get_changes(),
            doc! { "$push": { "nums": { "$each": [2.0, 3.0] } } }
        );

        let err = doc.push("nums", ["x"]).unwrap_err();
        assert!(matches!(err, DocumentError::Cast(_)));
        assert_eq!(doc.get("nums"), Bson::Array(vec![1.0.into(), 2.0.into(), 3.0.into()]));
    }

    #[test]
    fn positional_inserts_stay_contiguous() {
        let mut doc = persisted(doc! { "nums": [1, 2, 3] });
        doc.push_at("nums", 1, [10]).unwrap();
        doc.push_at("nums", 1, [11]).unwrap();

        assert_eq!(
            doc.get("nums"),
            Bson::Array(vec![1.0.into(), 10.0.into(), 11.0.into(), 2.0.into(), 3.0.into()])
        );
        assert_eq!(
            doc.get_changes(),
            doc! { "$push": { "nums": { "$each": [10.0, 11.0], "$position": 1 } } }
        );
    }

    #[test]
    fn out_of_range_positions_clamp_to_the_bounds() {
        let mut doc = persisted(doc! { "nums": [1, 2] });
        doc.push_at("nums", 5, [3]).unwrap();
        doc.push_at("nums", 5, [4]).unwrap();
        assert_eq!(
            doc.get("nums"),
            Bson::Array(vec![1.0.into(), 2.0.into(), 3.0.into(), 4.0.into()])
        );
        assert_eq!(
            doc.get_changes(),
            doc! { "$push": { "nums": { "$each": [3.0, 4.0], "$position": 2 } } }
        );

        let mut doc = persisted(doc! { "nums": [1, 2] });
        doc.push_at("nums", -5, [0]).unwrap();
        doc.push_at("nums", -5, [0.5]).unwrap();
        assert_eq!(
            doc.get("nums"),
            Bson::Array(vec![0.0.into(), 0.5.into(), 1.0.into(), 2.0.into()])
        );
        assert_eq!(
            doc.get_changes(),
            doc! { "$push": { "nums": { "$each": [0.0, 0.5], "$position": 0 } } }
        );
    }

    #[test]
    fn negative_positions_count_from_the_end() {
        let mut doc = persisted(doc! { "nums": [1, 2, 3] });
        doc.push_at("nums", -1, [9]).unwrap();
        assert_eq!(
            doc.get("nums"),
            Bson::Array(vec![1.0.into(), 2.0.into(), 9.0.into(), 3.0.into()])
        );
        assert_eq!(
            doc.get_changes(),
            doc! { "$push": { "nums": { "$each": [9.0], "$position": 2 } } }
        );
    }

    #[test]
    fn positional_and_generic_operations_conflict() {
        let mut doc = persisted(doc! { "nums": [1] });
        doc.push_at("nums", 0, [0]).unwrap();

        let err = doc.push("nums", [2]).unwrap_err();
        assert!(matches!(err, DocumentError::ArrayOperationConflict { .. }));
        assert!(doc.pop("nums").is_err());
        assert_eq!(doc.get("nums"), Bson::Array(vec![0.0.into(), 1.0.into()]));

        doc.reset();
        doc.push("nums", [2]).unwrap();
    }

    #[test]
    fn mixed_generic_operations_become_a_set() {
        let mut doc = persisted(doc! { "nums": [1, 2, 3] });
        doc.push("nums", [4]).unwrap();
        assert_eq!(doc.pop("nums").unwrap(), Bson::Double(4.0));
        assert_eq!(doc.get_changes(), doc! { "$set": { "nums": [1.0, 2.0, 3.0] } });
    }

    #[test]
    fn add_to_set_pull_and_pop() {
        let mut doc = persisted(doc! { "nums": [1, 2] });
        assert_eq!(doc.add_to_set("nums", [2, 5, 5]).unwrap(), 1);
        assert_eq!(doc.get_changes(), doc! { "$addToSet": { "nums": { "$each": [5.0] } } });

        let mut doc = persisted(doc! { "nums": [1, 2, 1] });
        assert_eq!(doc.pull("nums", ["1"]).unwrap(), 2);
        assert_eq!(doc.get("nums"), Bson::Array(vec![2.0.into()]));
        assert_eq!(doc.get_changes(), doc! { "$pullAll": { "nums": [1.0, 1.0] } });

        let mut doc = persisted(doc! { "nums": [1, 2] });
        assert_eq!(doc.shift("nums").unwrap(), Bson::Double(1.0));
        assert_eq!(doc.get_changes(), doc! { "$pop": { "nums": -1 } });
    }

    #[test]
    fn document_arrays_keep_parent_links() {
        let mut doc = persisted(doc! { "items": [ { "name": "a" }, { "name": "b" } ] });
        let removed = doc.shift("items").unwrap();
        assert_eq!(removed.as_document().and_then(|d| d.get_str("name").ok()), Some("a"));

        let item = doc.subdocument("items.0").unwrap();
        assert_eq!(item.full_path(), "items.0");
        assert_eq!(item.get("name"), Bson::String("b".into()));

        doc.push("items", [doc! { "name": "c" }]).unwrap();
        doc.set("items.1.name", "d").unwrap();
        assert!(doc.is_modified("items.1.name"));
        assert!(doc.get_changes().contains_key("$set"));
    }

    #[test]
    fn pull_matches_documents_by_id() {
        let mut doc = persisted(doc! { "items": [ { "name": "a" }, { "name": "b" } ] });
        let id = doc.get("items.0._id");
        assert_eq!(doc.pull("items", [id]).unwrap(), 1);
        assert_eq!(doc.get("items.name"), Bson::Array(vec![Bson::String("b".into())]));
    }

    #[test]
    fn splice_sort_and_unshift_replace_the_array() {
        let mut doc = persisted(doc! { "nums": [3, 1, 2], "grid": [[1]] });
        assert_eq!(
            doc.splice("nums", 1, 1, vec![Bson::Int32(7), Bson::Int32(8)]).unwrap(),
            vec![Bson::Double(1.0)]
        );
        doc.sort_by("nums", |a, b| {
            crate::value::bson_as_f64(a)
                .partial_cmp(&crate::value::bson_as_f64(b))
                .unwrap_or(Ordering::Equal)
        })
        .unwrap();
        assert_eq!(doc.unshift("nums", [0]).unwrap(), 5);
        assert_eq!(
            doc.get("nums"),
            Bson::Array(vec![0.0.into(), 2.0.into(), 3.0.into(), 7.0.into(), 8.0.into()])
        );

        doc.push("grid", [5]).unwrap();
        assert_eq!(
            doc.get("grid"),
            Bson::Array(vec![Bson::Array(vec![1.0.into()]), Bson::Array(vec![5.0.into()])])
        );
        assert_eq!(
            doc.get_changes(),
            doc! {
                "$set": { "nums": [0.0, 2.0, 3.0, 7.0, 8.0] },
                "$push": { "grid": { "$each": [[5.0]] } },
            }
        );
    }

    #[test]
    fn array_operations_reject_other_paths() {
        let schema = Schema::builder()
            .path("name", PathOptions::string())
            .options(SchemaOptions::default().id_path(false))
            .build()
            .unwrap();
        let mut doc = Document::new(schema, doc! { "name": "x" }).unwrap();
        assert!(matches!(doc.push("name", [1]), Err(DocumentError::InvalidPath(..))));
    }
}
