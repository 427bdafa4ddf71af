//! Main docmodel crate: schema-driven documents with change tracking, validation and
//! persistence.
//!
//! This crate is the primary entry point for users of docmodel. It re-exports the core
//! types from `docmodel-core` and the in-memory backend from `docmodel-memory`.
//!
//! # Features
//!
//! - **Schemas** - Declare typed paths with defaults, getters, setters, constraints and virtuals
//! - **Change tracking** - Every write is cast and tracked, producing minimal update documents
//! - **Validation** - Built-in constraints plus synchronous and asynchronous validators
//! - **Serialization** - Plain-object and JSON projection with per-call and schema transforms
//! - **Persistence** - A backend trait and a save lifecycle with hooks and timestamps
//!
//! # Quick Start
//!
//! ```ignore
//! use docmodel::{prelude::*, memory::InMemoryStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let schema = Schema::builder()
//!         .path("name", PathOptions::string().required(true).trim())
//!         .path("tags", PathOptions::array(SchemaType::String))
//!         .options(SchemaOptions::default().timestamps(Timestamps::default()))
//!         .build()?;
//!
//!     let users = Model::new("User", schema, InMemoryStore::new());
//!
//!     let mut user = users.new_document(doc! { "name": "  Alice  " })?;
//!     users.save(&mut user, SaveOptions::default()).await?;
//!
//!     user.push("tags", ["admin"])?;
//!     assert!(user.is_modified("tags"));
//!     users.save(&mut user, SaveOptions::default()).await?;
//!
//!     println!("{}", user.to_json(ToObjectOptions::new().virtuals(true))?);
//!     Ok(())
//! }
//! ```
//!
//! # Backends
//!
//! - [`memory`] - In-memory storage for development and testing

pub mod prelude;

pub use docmodel_core::{
    cast, document, error, model, path, schema, selection, serialize, tracker, validate, value,
};

// Re-export BSON types for convenience
pub use bson;

/// In-memory storage backend implementations.
pub mod memory {
    pub use docmodel_memory::{InMemoryStore, InMemoryStoreBuilder};
}
