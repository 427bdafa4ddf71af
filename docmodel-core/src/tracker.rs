//! Dirty-path bookkeeping.
//!
//! Every document node owns a [`ChangeTracker`] holding the paths that were the direct
//! target of a write, relative to that node. Marks made on an attached subdocument are
//! re-recorded on each ancestor with the slot prefix added, so the root tracker describes
//! the whole document. Pending array operations are recorded on the root tracker only.

use std::collections::{BTreeMap, BTreeSet};

use crate::path;

/// A pending atomic array operation, accumulated until the next reset.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayAtomic {
    /// Replace the whole array.
    Set,
    /// Append `count` elements, or insert them at `position`. `index` is where the first
    /// element landed, with out-of-range positions already clamped to the array bounds.
    Push {
        count: usize,
        position: Option<i32>,
        index: usize,
    },
    /// Append `count` elements that were not already present.
    AddToSet { count: usize },
    /// Remove every element equal to one of these values.
    PullAll(Vec<bson::Bson>),
    /// Remove the last (`1`) or first (`-1`) element.
    Pop(i32),
}

impl ArrayAtomic {
    pub(crate) fn operation(&self) -> &'static str {
        match self {
            ArrayAtomic::Set => "$set",
            ArrayAtomic::Push { .. } => "$push",
            ArrayAtomic::AddToSet { .. } => "$addToSet",
            ArrayAtomic::PullAll(_) => "$pullAll",
            ArrayAtomic::Pop(_) => "$pop",
        }
    }

    fn is_positional(&self) -> bool {
        matches!(self, ArrayAtomic::Push { position: Some(_), .. })
    }

    /// Fold a new operation into a pending one.
    ///
    /// Positional inserts only combine with further inserts at the same position; every
    /// other mix of distinct operations degrades to a whole-array `$set`.
    pub(crate) fn combine(pending: Option<&ArrayAtomic>, next: ArrayAtomic) -> Option<ArrayAtomic> {
        let Some(pending) = pending else {
            return Some(next);
        };

        match (pending, next) {
            (
                ArrayAtomic::Push {
                    count,
                    position,
                    index,
                },
                ArrayAtomic::Push {
                    count: more,
                    position: next_position,
                    ..
                },
            ) => (*position == next_position).then(|| ArrayAtomic::Push {
                count: count + more,
                position: *position,
                index: *index,
            }),
            (pending, _) if pending.is_positional() => None,
            (_, next) if next.is_positional() => None,
            (ArrayAtomic::AddToSet { count }, ArrayAtomic::AddToSet { count: more }) => {
                Some(ArrayAtomic::AddToSet { count: count + more })
            }
            (ArrayAtomic::PullAll(values), ArrayAtomic::PullAll(more)) => {
                let mut values = values.clone();
                values.extend(more);
                Some(ArrayAtomic::PullAll(values))
            }
            _ => Some(ArrayAtomic::Set),
        }
    }
}

/// Per-node change state.
#[derive(Debug, Clone, Default)]
pub struct ChangeTracker {
    modified: Vec<String>,
    ignored: BTreeSet<String>,
    defaults: BTreeSet<String>,
    init: BTreeSet<String>,
    atomics: BTreeMap<String, ArrayAtomic>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `path` as directly modified.
    ///
    /// A path under an already-marked ancestor is subsumed by it; marking a path drops its
    /// marked descendants. Any pending array operation on the path, or on an array the path
    /// lies inside, degrades to a whole-array `$set`.
    pub fn mark(&mut self, path: &str) {
        self.degrade_atomics(path);
        self.insert_modified(path);
    }

    /// Record a path touched by an array operation, without degrading its own atomics.
    pub(crate) fn mark_array(&mut self, path: &str) {
        let ancestors: Vec<String> = path::ancestors(path)
            .into_iter()
            .map(str::to_string)
            .collect();
        for ancestor in ancestors {
            if let Some(atomic) = self.atomics.get_mut(&ancestor) {
                *atomic = ArrayAtomic::Set;
            }
        }
        self.insert_modified(path);
    }

    fn insert_modified(&mut self, path: &str) {
        self.ignored.remove(path);
        self.defaults.remove(path);

        if self
            .modified
            .iter()
            .any(|existing| existing == path || path::is_ancestor(existing, path))
        {
            return;
        }

        self.modified
            .retain(|existing| !path::is_ancestor(path, existing));
        self.modified.push(path.to_string());
    }

    fn degrade_atomics(&mut self, path: &str) {
        for (array, atomic) in self.atomics.iter_mut() {
            if array == path || path::is_ancestor(array, path) {
                *atomic = ArrayAtomic::Set;
            }
        }
    }

    /// Remove `path` and its descendants from the modified set.
    pub fn unmark(&mut self, path: &str) {
        self.modified
            .retain(|existing| existing != path && !path::is_ancestor(path, existing));
        self.atomics
            .retain(|array, _| array != path && !path::is_ancestor(path, array));
    }

    /// Exclude `path` from the next persistence diff and from validation.
    pub fn ignore(&mut self, path: &str) {
        self.unmark(path);
        self.ignored.insert(path.to_string());
    }

    /// Returns true if `path` or one of its ancestors is ignored.
    pub fn is_ignored(&self, path: &str) -> bool {
        self.ignored
            .iter()
            .any(|ignored| ignored == path || path::is_ancestor(ignored, path))
    }

    pub(crate) fn mark_default(&mut self, path: &str) {
        self.defaults.insert(path.to_string());
    }

    pub(crate) fn mark_init(&mut self, path: &str) {
        self.init.insert(path.to_string());
    }

    pub fn is_default(&self, path: &str) -> bool {
        self.defaults.contains(path)
    }

    pub fn is_init(&self, path: &str) -> bool {
        self.init.contains(path)
    }

    /// Paths that were the direct target of a write, in first-write order.
    pub fn direct_modified_paths(&self) -> &[String] {
        &self.modified
    }

    pub fn is_direct_modified(&self, path: &str) -> bool {
        self.modified.iter().any(|existing| existing == path)
    }

    /// Direct paths plus all of their ancestors, each listed once, ancestors first.
    pub fn modified_paths(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for direct in &self.modified {
            for candidate in path::ancestors(direct)
                .into_iter()
                .chain(std::iter::once(direct.as_str()))
            {
                if seen.insert(candidate) {
                    out.push(candidate.to_string());
                }
            }
        }
        out
    }

    /// True if `path` was written, lies under a written path, or contains one.
    pub fn is_modified(&self, path: &str) -> bool {
        self.modified
            .iter()
            .any(|existing| path::overlaps(existing, path))
    }

    pub fn has_modifications(&self) -> bool {
        !self.modified.is_empty()
    }

    /// Check whether `next` can join the pending operation on `array`.
    pub(crate) fn can_record(&self, array: &str, next: &ArrayAtomic) -> bool {
        ArrayAtomic::combine(self.atomics.get(array), next.clone()).is_some()
    }

    /// Fold an array operation into the pending state and mark the array.
    ///
    /// Callers check [`can_record`](Self::can_record) before mutating the array; an
    /// operation recorded while descendants of the array are modified degrades to `$set`.
    pub(crate) fn record_array_op(&mut self, array: &str, next: ArrayAtomic) {
        let has_dirty_children = self
            .modified
            .iter()
            .any(|existing| path::is_ancestor(array, existing));
        let combined = ArrayAtomic::combine(self.atomics.get(array), next).unwrap_or(ArrayAtomic::Set);
        let combined = if has_dirty_children {
            ArrayAtomic::Set
        } else {
            combined
        };

        self.atomics.insert(array.to_string(), combined);
        self.mark_array(array);
    }

    pub fn atomic(&self, array: &str) -> Option<&ArrayAtomic> {
        self.atomics.get(array)
    }

    /// Forget every pending change. Called once a write has been acknowledged.
    pub fn reset(&mut self) {
        self.init.extend(std::mem::take(&mut self.defaults));
        for direct in self.modified.drain(..) {
            self.init.insert(direct);
        }
        self.ignored.clear();
        self.atomics.clear();
    }
}
