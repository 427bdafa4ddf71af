//! Persistence collaborator contract.
//!
//! The document core does no I/O of its own. A [`Model`] binds a schema to a collection on a
//! [`PersistenceBackend`] and drives the save lifecycle: pre-save hooks, timestamps,
//! validation, an insert of the stored form or an update built from
//! [`Document::get_changes`], then [`Document::reset`] and post-save hooks.
//!
//! # Example
//!
//! ```ignore
//! use docmodel_core::model::{Model, SaveOptions};
//!
//! let users = Model::new("User", schema, backend);
//! let mut user = users.new_document(doc! { "name": "Ann" })?;
//! users.save(&mut user, SaveOptions::default()).await?;
//! ```

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use bson::{Bson, doc};

use crate::{
    document::Document,
    error::{DocumentError, DocumentResult},
    schema::{HookPoint, Schema},
    selection::Selection,
    validate::ValidateOptions,
    value::bson_is_nullish,
};

/// Result of an update: how many records matched the filter and how many changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub modified: u64,
}

/// Storage a [`Model`] persists documents to.
///
/// Implementations must be thread-safe. Filters are plain equality documents, and updates
/// use the operators produced by [`Document::get_changes`]: `$set`, `$unset`, `$push`
/// (with `$each` and `$position`), `$addToSet` (with `$each`), `$pullAll` and `$pop`.
#[async_trait]
pub trait PersistenceBackend: Send + Sync + Debug {
    /// Insert a new record.
    ///
    /// # Errors
    ///
    /// Implementations return [`DocumentError::DuplicateKey`] when a record with the same
    /// `_id` already exists.
    async fn insert_one(&self, collection: &str, document: bson::Document) -> DocumentResult<()>;

    /// Apply an update document to the first record matching `filter`.
    async fn update_one(
        &self,
        collection: &str,
        filter: bson::Document,
        update: bson::Document,
    ) -> DocumentResult<UpdateOutcome>;

    async fn find_one(
        &self,
        collection: &str,
        filter: bson::Document,
    ) -> DocumentResult<Option<bson::Document>>;

    /// Delete the first record matching `filter`, returning how many were deleted.
    async fn delete_one(&self, collection: &str, filter: bson::Document) -> DocumentResult<u64>;
}

#[async_trait]
impl<B> PersistenceBackend for &B
where
    B: PersistenceBackend,
{
    async fn insert_one(&self, collection: &str, document: bson::Document) -> DocumentResult<()> {
        (**self).insert_one(collection, document).await
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: bson::Document,
        update: bson::Document,
    ) -> DocumentResult<UpdateOutcome> {
        (**self).update_one(collection, filter, update).await
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: bson::Document,
    ) -> DocumentResult<Option<bson::Document>> {
        (**self).find_one(collection, filter).await
    }

    async fn delete_one(&self, collection: &str, filter: bson::Document) -> DocumentResult<u64> {
        (**self).delete_one(collection, filter).await
    }
}

#[async_trait]
impl<B> PersistenceBackend for Arc<B>
where
    B: PersistenceBackend,
{
    async fn insert_one(&self, collection: &str, document: bson::Document) -> DocumentResult<()> {
        (**self).insert_one(collection, document).await
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: bson::Document,
        update: bson::Document,
    ) -> DocumentResult<UpdateOutcome> {
        (**self).update_one(collection, filter, update).await
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: bson::Document,
    ) -> DocumentResult<Option<bson::Document>> {
        (**self).find_one(collection, filter).await
    }

    async fn delete_one(&self, collection: &str, filter: bson::Document) -> DocumentResult<u64> {
        (**self).delete_one(collection, filter).await
    }
}

/// Options for [`Model::save`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveOptions {
    /// Overrides the schema's `validate_before_save`.
    pub validate_before_save: Option<bool>,
    /// Overrides the schema's `validate_modified_only`.
    pub validate_modified_only: Option<bool>,
    /// Insert even if the document was loaded from storage.
    pub force_insert: bool,
}

/// A schema bound to a named collection on a backend.
#[derive(Debug)]
pub struct Model<B: PersistenceBackend> {
    name: String,
    collection: String,
    schema: Arc<Schema>,
    backend: B,
}

impl<B: PersistenceBackend> Model<B> {
    /// Creates a model whose collection is the lowercased name with an `s` appended.
    pub fn new(name: impl Into<String>, schema: Arc<Schema>, backend: B) -> Self {
        let name = name.into();
        let collection = format!("{}s", name.to_lowercase());
        Self {
            name,
            collection,
            schema,
            backend,
        }
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Build a new, unsaved document of this model.
    pub fn new_document(&self, input: impl Into<Bson>) -> DocumentResult<Document> {
        let mut doc = Document::new(self.schema.clone(), input)?;
        doc.set_model_name(&self.name);
        Ok(doc)
    }

    /// Wrap a stored record as a document of this model.
    pub fn init_document(
        &self,
        record: bson::Document,
        selection: Option<Selection>,
    ) -> DocumentResult<Document> {
        let mut doc = Document::init(self.schema.clone(), record, selection)?;
        doc.set_model_name(&self.name);
        Ok(doc)
    }

    /// Load a record by `_id`, keeping only the selected paths if a selection is given.
    pub async fn find_by_id(
        &self,
        id: impl Into<Bson>,
        selection: Option<Selection>,
    ) -> DocumentResult<Option<Document>> {
        let filter = doc! { "_id": id.into() };
        tracing::debug!(model = %self.name, filter = %filter, "finding by id");

        let Some(record) = self.backend.find_one(&self.collection, filter).await? else {
            return Ok(None);
        };
        let record = match &selection {
            Some(selection) => selection.apply(&record),
            None => record,
        };
        self.init_document(record, selection).map(Some)
    }

    /// Persist `doc`.
    ///
    /// New documents (and any document with `force_insert`) are inserted in their stored
    /// form; others are updated with their pending changes. On success the document's
    /// change state is reset and it is no longer new.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::Validation`] if validation fails,
    /// [`DocumentError::DocumentNotFound`] if the stored record no longer exists, backend
    /// errors such as [`DocumentError::DuplicateKey`] unchanged, and
    /// [`DocumentError::Hook`] if a save hook fails.
    pub async fn save(&self, doc: &mut Document, options: SaveOptions) -> DocumentResult<()> {
        let schema = doc.schema().clone();
        schema.hooks().run_pre(&HookPoint::Save, doc)?;
        apply_timestamps(doc)?;

        if options
            .validate_before_save
            .unwrap_or(schema.options().validate_before_save)
        {
            let modified_only = options
                .validate_modified_only
                .unwrap_or(schema.options().validate_modified_only);
            doc.validate_with(ValidateOptions::new().modified_only(modified_only))
                .await?;
        }

        if doc.is_new() || options.force_insert {
            let record = doc.to_bson_for_storage()?;
            tracing::debug!(model = %self.name, collection = %self.collection, "inserting document");
            self.backend.insert_one(&self.collection, record).await?;
        } else {
            let filter = doc! { "_id": doc.id() };
            let changes = doc.get_changes();

            let found = if changes.is_empty() {
                self.backend
                    .find_one(&self.collection, filter.clone())
                    .await?
                    .is_some()
            } else {
                tracing::debug!(model = %self.name, changes = %changes, "updating document");
                let outcome = self
                    .backend
                    .update_one(&self.collection, filter.clone(), changes)
                    .await?;
                outcome.matched > 0
            };

            if !found {
                return Err(self.not_found(&filter));
            }
        }

        doc.reset();
        schema.hooks().run_post(&HookPoint::Save, doc)
    }

    /// Delete the stored record of `doc`.
    pub async fn remove(&self, doc: &mut Document) -> DocumentResult<()> {
        let schema = doc.schema().clone();
        schema.hooks().run_pre(&HookPoint::Remove, doc)?;

        let filter = doc! { "_id": doc.id() };
        let deleted = self.backend.delete_one(&self.collection, filter.clone()).await?;
        if deleted == 0 {
            return Err(self.not_found(&filter));
        }
        tracing::debug!(model = %self.name, filter = %filter, "removed document");

        schema.hooks().run_post(&HookPoint::Remove, doc)
    }

    fn not_found(&self, filter: &bson::Document) -> DocumentError {
        DocumentError::DocumentNotFound {
            filter: filter.to_string(),
            model: self.name.clone(),
        }
    }
}

/// Set the configured update timestamp, and the creation timestamp on first save.
fn apply_timestamps(doc: &mut Document) -> DocumentResult<()> {
    let Some(timestamps) = doc.schema().options().timestamp_paths().cloned() else {
        return Ok(());
    };
    let now = Bson::DateTime(bson::DateTime::from_chrono(chrono::Utc::now()));

    if let Some(created_at) = &timestamps.created_at {
        if doc.is_new() && bson_is_nullish(&doc.get(created_at)) {
            doc.set(created_at, now.clone())?;
        }
    }
    if let Some(updated_at) = &timestamps.updated_at {
        doc.set(updated_at, now)?;
    }
    Ok(())
}
