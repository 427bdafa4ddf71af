//! Accepting resolved references from a population resolver, and reverting them.

use bson::Bson;

use super::{Document, WriteMode};
use crate::{
    error::{DocumentError, DocumentResult},
    path,
    schema::{PathType, SchemaType},
    value::Value,
};

/// What a reference path currently holds.
#[derive(Debug, Clone, PartialEq)]
pub enum PopulationState {
    /// A single resolved document, with the identifier it replaced.
    Single(Bson),
    /// An array of resolved documents, with their identifiers in order.
    Many(Vec<Bson>),
    /// An array assigned by hand that holds both identifiers and resolved documents.
    Mixed,
}

/// One entry of a reference array assigned by hand.
#[derive(Debug, Clone)]
pub enum RefValue {
    Id(Bson),
    Document(Document),
}

impl Document {
    fn reference_path(&self, path: &str) -> DocumentResult<String> {
        let path = self.schema.resolve_alias(path).unwrap_or(path).to_string();
        match self.schema.path_type(&path) {
            PathType::Real => Ok(path),
            _ => Err(DocumentError::InvalidPath(
                path,
                "only declared paths can hold references".to_string(),
            )),
        }
    }

    /// Store a resolved document in place of the identifier at `path`.
    ///
    /// The path is not marked modified: the stored form is still the identifier.
    pub fn set_populated(&mut self, path: &str, document: Document) -> DocumentResult<()> {
        let path = self.reference_path(path)?;
        let (node, rel) = self.locate(self.root, &path);
        let id = document.id();

        self.store(node, &rel, Value::Populated(Box::new(document)));
        let full = self.full_path(node, &rel);
        tracing::trace!(path = %full, "populated reference");
        self.populated.insert(full, PopulationState::Single(id));
        Ok(())
    }

    /// Store resolved documents in place of the identifier array at `path`.
    pub fn set_populated_many(&mut self, path: &str, documents: Vec<Document>) -> DocumentResult<()> {
        let path = self.reference_path(path)?;
        let (node, rel) = self.locate(self.root, &path);
        let ids = documents.iter().map(Document::id).collect();
        let items = documents
            .into_iter()
            .map(|document| Value::Populated(Box::new(document)))
            .collect();

        self.store(node, &rel, Value::Array(items));
        let full = self.full_path(node, &rel);
        self.populated.insert(full, PopulationState::Many(ids));
        Ok(())
    }

    /// Assign a reference array by hand, mixing identifiers and resolved documents.
    ///
    /// This is an ordinary write and marks the path. Identifiers are cast to the declared
    /// element type. When every entry is a document the path reads as populated; when
    /// entries are mixed its state is [`PopulationState::Mixed`] until it is depopulated or
    /// written again.
    pub fn assign_refs(&mut self, path: &str, values: Vec<RefValue>) -> DocumentResult<()> {
        let path = self.reference_path(path)?;
        let (node, rel) = self.locate(self.root, &path);
        let schema = self.arena[node].schema.clone();
        let (element, normalize) = match schema.path(&rel).map(|options| (options.kind(), options.normalize)) {
            Some((SchemaType::Array(inner), normalize)) => (inner.as_ref().clone(), normalize),
            _ => {
                return Err(DocumentError::InvalidPath(
                    path,
                    "references can only be assigned to array paths".to_string(),
                ));
            }
        };

        let (mut ids, mut documents) = (Vec::new(), 0usize);
        let mut items = Vec::with_capacity(values.len());
        for (index, value) in values.into_iter().enumerate() {
            match value {
                RefValue::Id(id) => {
                    let slot = path::join(&rel, &index.to_string());
                    match self.cast_element(node, &slot, &element, normalize, id) {
                        Ok(item) => items.push(item),
                        Err(err) => {
                            self.arena.free_value(&Value::Array(items));
                            return Err(err);
                        }
                    }
                }
                RefValue::Document(document) => {
                    documents += 1;
                    ids.push(document.id());
                    items.push(Value::Populated(Box::new(document)));
                }
            }
        }

        let total = items.len();
        self.store(node, &rel, Value::Array(items));
        self.after_write(node, &rel, WriteMode::default());

        let full = self.full_path(node, &rel);
        if documents == 0 {
            self.populated.remove(&full);
        } else if documents == total {
            self.populated.insert(full, PopulationState::Many(ids));
        } else {
            self.populated.insert(full, PopulationState::Mixed);
        }
        Ok(())
    }

    /// Population state of `path`, or `None` if it holds plain identifiers.
    pub fn populated(&self, path: &str) -> Option<&PopulationState> {
        let path = self.schema.resolve_alias(path).unwrap_or(path);
        self.populated.get(path)
    }

    /// Replace every resolved document at `path` with its identifier. Not a modification.
    pub fn depopulate(&mut self, path: &str) -> DocumentResult<()> {
        let path = self.reference_path(path)?;
        let (node, rel) = self.locate(self.root, &path);

        if let Some(slot) = self.lookup_value_mut(node, &rel) {
            match slot {
                Value::Populated(document) => {
                    *slot = to_id(document.id());
                }
                Value::Array(items) => {
                    for item in items.iter_mut() {
                        if let Value::Populated(document) = item {
                            *item = to_id(document.id());
                        }
                    }
                }
                _ => {}
            }
        }

        let full = self.full_path(node, &rel);
        self.populated.remove(&full);
        Ok(())
    }
}

fn to_id(id: Bson) -> Value {
    match id {
        Bson::Undefined => Value::Undefined,
        id => Value::Primitive(id),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bson::{doc, oid::ObjectId};

    use super::*;
    use crate::schema::{PathOptions, Schema};

    fn person() -> Arc<Schema> {
        Schema::builder()
            .path("name", PathOptions::string())
            .build()
            .unwrap()
    }

    fn story() -> Arc<Schema> {
        Schema::builder()
            .path("title", PathOptions::string())
            .path("author", PathOptions::object_id().ref_model("Person"))
            .path("fans", PathOptions::array(SchemaType::ObjectId).ref_model("Person"))
            .build()
            .unwrap()
    }

    fn loaded(author: ObjectId, fans: &[ObjectId]) -> Document {
        Document::init(
            story(),
            doc! { "_id": ObjectId::new(), "title": "t", "author": author, "fans": fans.to_vec() },
            None,
        )
        .unwrap()
    }

    fn someone(name: &str) -> Document {
        Document::init(person(), doc! { "_id": ObjectId::new(), "name": name }, None).unwrap()
    }

    #[test]
    fn populated_reference_reads_through_and_depopulates() {
        let author = someone("ann");
        let author_id = author.id();
        let mut doc = loaded(author_id.as_object_id().unwrap(), &[]);

        doc.set_populated("author", author).unwrap();
        assert_eq!(doc.populated("author"), Some(&PopulationState::Single(author_id.clone())));
        assert_eq!(doc.get("author.name"), Bson::String("ann".into()));
        assert!(!doc.is_modified("author"));
        assert_eq!(doc.storage_value("author"), author_id);

        doc.depopulate("author").unwrap();
        assert_eq!(doc.populated("author"), None);
        assert_eq!(doc.get("author"), author_id);
    }

    #[test]
    fn populated_arrays_and_mixed_assignment() {
        let (a, b) = (someone("a"), someone("b"));
        let ids = vec![a.id(), b.id()];
        let mut doc = loaded(ObjectId::new(), &[]);

        doc.set_populated_many("fans", vec![a.clone(), b]).unwrap();
        assert_eq!(doc.populated("fans"), Some(&PopulationState::Many(ids.clone())));
        assert_eq!(doc.get("fans.1.name"), Bson::String("b".into()));

        let raw = ObjectId::new();
        doc.assign_refs("fans", vec![RefValue::Id(Bson::ObjectId(raw)), RefValue::Document(a)])
            .unwrap();
        assert_eq!(doc.populated("fans"), Some(&PopulationState::Mixed));
        assert!(doc.is_modified("fans"));
        assert_eq!(
            doc.storage_value("fans"),
            Bson::Array(vec![Bson::ObjectId(raw), ids[0].clone()])
        );

        doc.depopulate("fans").unwrap();
        assert_eq!(doc.populated("fans"), None);

        doc.assign_refs("fans", vec![RefValue::Id(Bson::ObjectId(raw))]).unwrap();
        assert_eq!(doc.populated("fans"), None);
    }

    #[test]
    fn writes_clear_population_state() {
        let author = someone("ann");
        let mut doc = loaded(ObjectId::new(), &[]);
        doc.set_populated("author", author).unwrap();

        doc.set("author", ObjectId::new()).unwrap();
        assert_eq!(doc.populated("author"), None);
    }

    #[test]
    fn references_need_declared_paths() {
        let mut doc = loaded(ObjectId::new(), &[]);
        assert!(matches!(
            doc.set_populated("nope", someone("x")),
            Err(DocumentError::InvalidPath(..))
        ));
        assert!(matches!(
            doc.assign_refs("author", vec![]),
            Err(DocumentError::InvalidPath(..))
        ));
    }
}
