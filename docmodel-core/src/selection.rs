//! Field selection recorded when a document is loaded from storage.

use std::collections::BTreeSet;

use bson::{Bson, Document as BsonDocument};

use crate::{
    error::{DocumentError, DocumentResult},
    path,
    value::{bson_assign, bson_lookup},
};

/// An inclusive or exclusive projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Only these paths (and `_id`) were loaded.
    Include(BTreeSet<String>),
    /// Everything except these paths was loaded.
    Exclude(BTreeSet<String>),
}

impl Selection {
    pub fn include<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Selection::Include(paths.into_iter().map(Into::into).collect())
    }

    pub fn exclude<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Selection::Exclude(paths.into_iter().map(Into::into).collect())
    }

    /// Parse a `{ path: 1 }` / `{ path: 0 }` projection document.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::InvalidPath`] if the projection mixes inclusion and
    /// exclusion (other than excluding `_id`) or uses a non-numeric, non-boolean flag.
    pub fn from_projection(projection: &BsonDocument) -> DocumentResult<Self> {
        let mut included = BTreeSet::new();
        let mut excluded = BTreeSet::new();

        for (key, flag) in projection {
            let on = match flag {
                Bson::Int32(n) => *n != 0,
                Bson::Int64(n) => *n != 0,
                Bson::Double(n) => *n != 0.0,
                Bson::Boolean(b) => *b,
                other => {
                    return Err(DocumentError::InvalidPath(
                        key.to_string(),
                        format!("unsupported projection flag {}", other),
                    ));
                }
            };

            if on {
                included.insert(key.to_string());
            } else {
                excluded.insert(key.to_string());
            }
        }

        // `_id: 0` may accompany an inclusive projection
        if excluded.remove("_id") && included.is_empty() {
            excluded.insert("_id".to_string());
        }

        match (included.is_empty(), excluded.is_empty()) {
            (false, false) => Err(DocumentError::InvalidPath(
                excluded.into_iter().next().unwrap_or_default(),
                "projection cannot mix inclusion and exclusion".to_string(),
            )),
            (false, true) => Ok(Selection::Include(included)),
            _ => Ok(Selection::Exclude(excluded)),
        }
    }

    /// Returns true if values at `path` were loaded.
    pub fn is_selected(&self, path: &str) -> bool {
        match self {
            Selection::Include(paths) => {
                path == "_id"
                    || path::is_ancestor(path, "_id")
                    || paths.iter().any(|selected| path::overlaps(selected, path))
            }
            Selection::Exclude(paths) => !paths
                .iter()
                .any(|excluded| excluded == path || path::is_ancestor(excluded, path)),
        }
    }

    /// Returns true if `path` was excluded outright (as opposed to partially selected).
    pub fn is_excluded(&self, path: &str) -> bool {
        !self.is_selected(path)
    }

    /// Project a stored document down to the selected paths.
    pub fn apply(&self, document: &BsonDocument) -> BsonDocument {
        match self {
            Selection::Include(paths) => {
                let mut out = BsonDocument::new();
                let source = Bson::Document(document.clone());
                for selected in std::iter::once("_id").chain(paths.iter().map(String::as_str)) {
                    if let Some(value) = bson_lookup(&source, selected) {
                        bson_assign(&mut out, selected, value.clone());
                    }
                }
                out
            }
            Selection::Exclude(paths) => {
                let mut out = document.clone();
                for excluded in paths {
                    crate::value::bson_remove(&mut out, excluded);
                }
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;

    #[test]
    fn inclusive_selection_covers_ancestors_and_descendants() {
        let selection = Selection::include(["nested.age", "name"]);

        assert!(selection.is_selected("_id"));
        assert!(selection.is_selected("name"));
        assert!(selection.is_selected("nested"));
        assert!(selection.is_selected("nested.age"));
        assert!(!selection.is_selected("nested.path"));
        assert!(!selection.is_selected("email"));
    }

    #[test]
    fn exclusive_selection_hides_subtrees() {
        let selection = Selection::exclude(["nested"]);

        assert!(selection.is_selected("name"));
        assert!(!selection.is_selected("nested"));
        assert!(!selection.is_selected("nested.age"));
    }

    #[test]
    fn projection_documents_parse() {
        let selection = Selection::from_projection(&doc! { "name": 1, "_id": 0 }).unwrap();
        assert_eq!(selection, Selection::include(["name"]));

        let selection = Selection::from_projection(&doc! { "secret": 0 }).unwrap();
        assert_eq!(selection, Selection::exclude(["secret"]));

        assert!(Selection::from_projection(&doc! { "a": 1, "b": 0 }).is_err());
    }

    #[test]
    fn apply_keeps_only_selected_values() {
        let stored = doc! { "_id": 1, "name": "a", "nested": { "age": 3, "path": "p" }, "email": "e" };

        let included = Selection::include(["nested.age"]).apply(&stored);
        assert_eq!(included, doc! { "_id": 1, "nested": { "age": 3 } });

        let excluded = Selection::exclude(["nested", "email"]).apply(&stored);
        assert_eq!(excluded, doc! { "_id": 1, "name": "a" });
    }
}
