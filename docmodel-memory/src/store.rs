//! In-memory persistence backend.
//!
//! Records are kept as BSON documents per collection, in insertion order, behind an
//! async-aware read-write lock.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use bson::Bson;
use mea::rwlock::RwLock;

use docmodel_core::{
    cast::display_bson,
    error::{DocumentError, DocumentResult},
    model::{PersistenceBackend, UpdateOutcome},
    value::{bson_equal, bson_lookup},
};

use crate::update::{apply_update, matches};

type Collection = Vec<bson::Document>;
type StoreMap = HashMap<String, Collection>;

/// Thread-safe in-memory persistence backend.
///
/// `InMemoryStore` is cloneable and keeps its state behind an `Arc`, so clones share the
/// same records. Lookups scan the collection; there are no indexes beyond the unique-key
/// checks made on insert and update.
///
/// # Unique keys
///
/// Every collection treats `_id` as unique. Further unique fields can be declared per
/// collection with [`InMemoryStoreBuilder::unique`]; a write that would duplicate one fails
/// with [`DocumentError::DuplicateKey`].
///
/// # Example
///
/// ```ignore
/// use docmodel_memory::InMemoryStore;
/// use docmodel_core::model::PersistenceBackend;
/// use bson::doc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = InMemoryStore::builder().unique("users", "email").build();
///
///     store.insert_one("users", doc! { "_id": 1, "email": "a@example.com" }).await?;
///     let found = store.find_one("users", doc! { "_id": 1 }).await?;
///     assert!(found.is_some());
///
///     Ok(())
/// }
/// ```
#[derive(Default, Clone, Debug)]
pub struct InMemoryStore {
    /// collection name -> records
    store: Arc<RwLock<StoreMap>>,
    /// collection name -> unique fields other than `_id`
    unique: Arc<HashMap<String, HashSet<String>>>,
}

impl InMemoryStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> InMemoryStoreBuilder {
        InMemoryStoreBuilder::default()
    }

    /// Snapshot of every record in `collection`.
    pub async fn records(&self, collection: &str) -> Vec<bson::Document> {
        self.store
            .read()
            .await
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn list_collections(&self) -> Vec<String> {
        self.store.read().await.keys().cloned().collect()
    }

    /// Removes `collection` and its records.
    pub async fn drop_collection(&self, collection: &str) -> DocumentResult<()> {
        match self.store.write().await.remove(collection) {
            Some(_) => Ok(()),
            None => Err(DocumentError::Backend(format!(
                "collection `{}` not found",
                collection
            ))),
        }
    }

    fn unique_fields(&self, collection: &str) -> impl Iterator<Item = &str> {
        std::iter::once("_id").chain(
            self.unique
                .get(collection)
                .into_iter()
                .flatten()
                .map(String::as_str),
        )
    }

    /// Fails if `candidate` shares a unique value with any record other than `skip`.
    fn check_unique(
        &self,
        collection: &str,
        records: &Collection,
        candidate: &bson::Document,
        skip: Option<usize>,
    ) -> DocumentResult<()> {
        let candidate_value = Bson::Document(candidate.clone());
        for field in self.unique_fields(collection) {
            let Some(value) = bson_lookup(&candidate_value, field) else {
                continue;
            };
            let taken = records.iter().enumerate().any(|(index, record)| {
                Some(index) != skip
                    && bson_lookup(&Bson::Document(record.clone()), field)
                        .is_some_and(|existing| bson_equal(existing, value))
            });
            if taken {
                return Err(DocumentError::DuplicateKey {
                    collection: collection.to_string(),
                    key: format!("{{ {}: {} }}", field, display_bson(value)),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceBackend for InMemoryStore {
    async fn insert_one(&self, collection: &str, document: bson::Document) -> DocumentResult<()> {
        let mut store = self.store.write().await;
        let records = store.entry(collection.to_string()).or_default();

        self.check_unique(collection, records, &document, None)?;
        tracing::trace!(collection, "inserted record");
        records.push(document);
        Ok(())
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: bson::Document,
        update: bson::Document,
    ) -> DocumentResult<UpdateOutcome> {
        let mut store = self.store.write().await;
        let Some(records) = store.get_mut(collection) else {
            return Ok(UpdateOutcome::default());
        };
        let Some(index) = records.iter().position(|record| matches(record, &filter)) else {
            return Ok(UpdateOutcome::default());
        };

        let mut updated = records[index].clone();
        let modified = apply_update(&mut updated, &update)?;
        self.check_unique(collection, records, &updated, Some(index))?;
        records[index] = updated;

        tracing::trace!(collection, modified, "updated record");
        Ok(UpdateOutcome {
            matched: 1,
            modified: modified as u64,
        })
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: bson::Document,
    ) -> DocumentResult<Option<bson::Document>> {
        Ok(self
            .store
            .read()
            .await
            .get(collection)
            .and_then(|records| records.iter().find(|record| matches(record, &filter)))
            .cloned())
    }

    async fn delete_one(&self, collection: &str, filter: bson::Document) -> DocumentResult<u64> {
        let mut store = self.store.write().await;
        let Some(records) = store.get_mut(collection) else {
            return Ok(0);
        };

        match records.iter().position(|record| matches(record, &filter)) {
            Some(index) => {
                records.remove(index);
                Ok(1)
            }
            None => Ok(0),
        }
    }
}

/// Builder for [`InMemoryStore`] instances.
///
/// # Example
///
/// ```ignore
/// use docmodel_memory::InMemoryStore;
///
/// let store = InMemoryStore::builder()
///     .unique("users", "email")
///     .build();
/// ```
#[derive(Default, Debug)]
pub struct InMemoryStoreBuilder {
    unique: HashMap<String, HashSet<String>>,
}

impl InMemoryStoreBuilder {
    /// Declare `field` unique within `collection`.
    pub fn unique(mut self, collection: impl Into<String>, field: impl Into<String>) -> Self {
        self.unique
            .entry(collection.into())
            .or_default()
            .insert(field.into());
        self
    }

    pub fn build(self) -> InMemoryStore {
        InMemoryStore {
            store: Arc::default(),
            unique: Arc::new(self.unique),
        }
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;

    #[tokio::test]
    async fn insert_find_update_delete() {
        let store = InMemoryStore::new();
        store.insert_one("users", doc! { "_id": 1, "name": "a" }).await.unwrap();

        let outcome = store
            .update_one("users", doc! { "_id": 1 }, doc! { "$set": { "name": "b" } })
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome { matched: 1, modified: 1 });

        let found = store.find_one("users", doc! { "_id": 1 }).await.unwrap();
        assert_eq!(found, Some(doc! { "_id": 1, "name": "b" }));

        assert_eq!(store.delete_one("users", doc! { "_id": 1 }).await.unwrap(), 1);
        assert_eq!(store.delete_one("users", doc! { "_id": 1 }).await.unwrap(), 0);
        assert!(store.records("users").await.is_empty());
    }

    #[tokio::test]
    async fn missing_targets_match_nothing() {
        let store = InMemoryStore::new();
        let outcome = store
            .update_one("users", doc! { "_id": 1 }, doc! { "$set": { "name": "b" } })
            .await
            .unwrap();
        assert_eq!(outcome.matched, 0);
        assert!(store.find_one("users", doc! { "_id": 1 }).await.unwrap().is_none());
        assert!(store.drop_collection("users").await.is_err());
    }

    #[tokio::test]
    async fn unique_keys_are_enforced() {
        let store = InMemoryStore::builder().unique("users", "email").build();
        store.insert_one("users", doc! { "_id": 1, "email": "a" }).await.unwrap();
        store.insert_one("users", doc! { "_id": 2, "email": "b" }).await.unwrap();

        let err = store
            .insert_one("users", doc! { "_id": 1, "email": "c" })
            .await
            .unwrap_err();
        assert!(matches!(&err, DocumentError::DuplicateKey { collection, .. } if collection == "users"));
        assert!(err.to_string().starts_with("E11000 duplicate key error"));

        let err = store
            .update_one("users", doc! { "_id": 2 }, doc! { "$set": { "email": "a" } })
            .await
            .unwrap_err();
        assert!(matches!(err, DocumentError::DuplicateKey { .. }));
        assert_eq!(
            store.find_one("users", doc! { "_id": 2 }).await.unwrap(),
            Some(doc! { "_id": 2, "email": "b" })
        );

        let clone = store.clone();
        assert_eq!(clone.records("users").await.len(), 2);
        assert_eq!(clone.list_collections().await, vec!["users".to_string()]);
    }
}
