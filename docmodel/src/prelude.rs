//! Convenient re-exports of commonly used types from docmodel.
//!
//! ```ignore
//! use docmodel::prelude::*;
//! ```
//!
//! This provides access to:
//! - Schemas, path options and hooks
//! - Documents and their read, write and validation options
//! - Models and the persistence backend trait
//! - Error types

pub use bson::{Bson, doc};

pub use docmodel_core::{
    document::{Document, GetOptions, NodeId, NodeRef, PopulationState, RefValue, SetOptions},
    error::{
        CastError, CastKind, DocumentError, DocumentResult, PathError, ValidationError,
        ValidatorError, ValidatorKind,
    },
    model::{Model, PersistenceBackend, SaveOptions, UpdateOutcome},
    schema::{
        HookPoint, PathOptions, Schema, SchemaOptions, SchemaType, Strict, Timestamps,
        ValidatorSpec, VirtualPath,
    },
    selection::Selection,
    serialize::{ToObjectOptions, Transform},
    validate::ValidateOptions,
};
