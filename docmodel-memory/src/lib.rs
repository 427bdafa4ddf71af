//! In-memory persistence backend for docmodel.
//!
//! This crate provides a thread-safe, in-memory implementation of the
//! [`PersistenceBackend`](docmodel_core::model::PersistenceBackend) trait. It is ideal for
//! development and testing.
//!
//! # Features
//!
//! - **Thread-safe access** - Concurrent reads and writes using an async-aware RwLock
//! - **Update operators** - Applies the change sets documents produce, including array atomics
//! - **Unique keys** - `_id` plus any declared fields, reported as duplicate-key errors
//!
//! # Quick Start
//!
//! ```ignore
//! use docmodel::{prelude::*, memory::InMemoryStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let schema = Schema::builder()
//!         .path("name", PathOptions::string().required(true))
//!         .build()?;
//!     let users = Model::new("User", schema, InMemoryStore::new());
//!
//!     let mut user = users.new_document(doc! { "name": "Alice" })?;
//!     users.save(&mut user, SaveOptions::default()).await?;
//!
//!     Ok(())
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as docmodel_memory;

pub mod store;
mod update;

pub use store::{InMemoryStore, InMemoryStoreBuilder};
