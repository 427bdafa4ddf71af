//! A schema-driven document model: typed paths, casting, change tracking and validation over
//! BSON values.
//!
//! This crate is the core of the docmodel project and provides:
//!
//! - **Schemas** ([`schema`]) - Declared paths with types, defaults, getters, setters,
//!   constraints, virtuals, aliases, hooks and methods
//! - **Documents** ([`document`]) - Live documents with casting on write, nested and embedded
//!   subdocuments, tracked arrays and population of references
//! - **Change tracking** ([`tracker`]) - Per-path states and the minimal update produced from them
//! - **Validation** ([`validate`]) - Built-in and user validators, synchronous and asynchronous
//! - **Serialization** ([`serialize`]) - Plain object and JSON projection with transforms
//! - **Persistence** ([`model`]) - The backend contract and the save lifecycle
//! - **Error handling** ([`error`]) - Cast, validation and document errors
//!
//! # Example
//!
//! ```ignore
//! use docmodel_core::{document::Document, schema::{PathOptions, Schema}};
//! use bson::doc;
//!
//! let schema = Schema::builder()
//!     .path("name", PathOptions::string().required(true))
//!     .path("age", PathOptions::number().min(0))
//!     .build()?;
//!
//! let mut doc = Document::new(schema, doc! { "name": "Ann", "age": "42" })?;
//! assert_eq!(doc.get("age"), bson::Bson::Double(42.0));
//!
//! doc.set("age", 43)?;
//! assert!(doc.is_modified("age"));
//! ```

#[allow(unused_extern_crates)]
extern crate self as docmodel_core;

pub mod cast;
pub mod document;
pub mod error;
pub mod model;
pub mod path;
pub mod schema;
pub mod selection;
pub mod serialize;
pub mod tracker;
pub mod validate;
pub mod value;
