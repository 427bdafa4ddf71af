//! Typed path descriptors.
//!
//! A [`PathOptions`] describes one declared path: its [`SchemaType`], the setter and getter
//! chains, the required predicate, the default provider and the validators that apply to it.
//! Every user function takes the owning node as an explicit [`NodeRef`] argument.

use std::{fmt, sync::Arc};

use bson::Bson;
use futures::future::BoxFuture;
use regex::Regex;

use crate::{document::NodeRef, schema::Schema};

/// Transforms a raw value before it is cast. Returning `Err` records a cast error on the path.
pub type SetterFn = Arc<dyn Fn(Bson, &NodeRef<'_>) -> Result<Bson, String> + Send + Sync>;
/// Transforms a stored value on read.
pub type GetterFn = Arc<dyn Fn(Bson, &NodeRef<'_>) -> Bson + Send + Sync>;
/// A predicate evaluated against the owning node.
pub type NodePredicate = Arc<dyn Fn(&NodeRef<'_>) -> bool + Send + Sync>;
/// Produces a default value for the owning node.
pub type DefaultFn = Arc<dyn Fn(&NodeRef<'_>) -> Bson + Send + Sync>;
/// Synchronous validator: `Ok(false)` rejects the value, `Err` rejects it with a reason.
pub type SyncValidatorFn = Arc<dyn Fn(&Bson, &NodeRef<'_>) -> Result<bool, String> + Send + Sync>;
/// Asynchronous validator over an owned snapshot of the value.
pub type AsyncValidatorFn =
    Arc<dyn Fn(Bson) -> BoxFuture<'static, Result<bool, String>> + Send + Sync>;

/// Declared type of a path.
#[derive(Clone)]
pub enum SchemaType {
    String,
    Number,
    Boolean,
    Date,
    ObjectId,
    Uuid,
    /// Untyped; values are stored verbatim.
    Mixed,
    /// Array of the inner type. Nest for multi-dimensional arrays; an `Embedded` inner
    /// type makes a document array.
    Array(Box<SchemaType>),
    /// A single embedded document.
    Embedded(Arc<Schema>),
    /// String-keyed map of the inner type.
    Map(Box<SchemaType>),
}

impl SchemaType {
    pub fn array_of(inner: SchemaType) -> Self {
        SchemaType::Array(Box::new(inner))
    }

    pub fn map_of(inner: SchemaType) -> Self {
        SchemaType::Map(Box::new(inner))
    }

    /// Number of array levels: `[[Number]]` is 2.
    pub fn array_depth(&self) -> usize {
        match self {
            SchemaType::Array(inner) => 1 + inner.array_depth(),
            _ => 0,
        }
    }

    /// The element type once all array levels are removed.
    pub fn innermost(&self) -> &SchemaType {
        match self {
            SchemaType::Array(inner) => inner.innermost(),
            other => other,
        }
    }

    /// Schema of the embedded documents held by this path, single or array.
    pub fn embedded_schema(&self) -> Option<&Arc<Schema>> {
        match self {
            SchemaType::Embedded(schema) => Some(schema),
            SchemaType::Array(inner) => match inner.as_ref() {
                SchemaType::Embedded(schema) => Some(schema),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn is_document_array(&self) -> bool {
        matches!(self, SchemaType::Array(inner) if matches!(inner.as_ref(), SchemaType::Embedded(_)))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, SchemaType::Array(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            SchemaType::String => "String",
            SchemaType::Number => "Number",
            SchemaType::Boolean => "Boolean",
            SchemaType::Date => "Date",
            SchemaType::ObjectId => "ObjectId",
            SchemaType::Uuid => "UUID",
            SchemaType::Mixed => "Mixed",
            SchemaType::Array(inner) if matches!(inner.as_ref(), SchemaType::Embedded(_)) => {
                "DocumentArray"
            }
            SchemaType::Array(_) => "Array",
            SchemaType::Embedded(_) => "Embedded",
            SchemaType::Map(_) => "Map",
        }
    }
}

impl fmt::Debug for SchemaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaType::Array(inner) => write!(f, "Array<{:?}>", inner),
            SchemaType::Map(inner) => write!(f, "Map<{:?}>", inner),
            other => f.write_str(other.name()),
        }
    }
}

/// Required predicate of a path.
#[derive(Clone, Default)]
pub enum Required {
    #[default]
    No,
    Yes,
    /// Conditionally required, evaluated against the owning node at validation time.
    If(NodePredicate),
}

/// Immutability of a path once the document has been persisted.
#[derive(Clone, Default)]
pub enum Immutable {
    #[default]
    No,
    Yes,
    If(NodePredicate),
}

/// Default value provider.
#[derive(Clone)]
pub enum DefaultValue {
    /// Cast afresh for every document, so array and object defaults are never shared.
    Value(Bson),
    Fn(DefaultFn),
}

/// Validator implementation.
#[derive(Clone)]
pub enum ValidatorFn {
    Sync(SyncValidatorFn),
    Async(AsyncValidatorFn),
}

/// A user validator with its message template and kind.
#[derive(Clone)]
pub struct ValidatorSpec {
    pub(crate) func: ValidatorFn,
    pub(crate) message: Option<String>,
    pub(crate) kind: Option<String>,
}

impl ValidatorSpec {
    pub fn sync<F>(func: F) -> Self
    where
        F: Fn(&Bson, &NodeRef<'_>) -> Result<bool, String> + Send + Sync + 'static,
    {
        Self {
            func: ValidatorFn::Sync(Arc::new(func)),
            message: None,
            kind: None,
        }
    }

    pub fn asynchronous<F>(func: F) -> Self
    where
        F: Fn(Bson) -> BoxFuture<'static, Result<bool, String>> + Send + Sync + 'static,
    {
        Self {
            func: ValidatorFn::Async(Arc::new(func)),
            message: None,
            kind: None,
        }
    }

    /// Message template; `{PATH}`, `{VALUE}` and `{KIND}` are substituted.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Kind reported on failure instead of `user defined`.
    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn is_async(&self) -> bool {
        matches!(self.func, ValidatorFn::Async(_))
    }
}

/// Built-in constraints checked before user validators.
#[derive(Clone, Default)]
pub(crate) struct Constraints {
    pub enum_values: Option<Vec<Bson>>,
    pub min: Option<Bson>,
    pub max: Option<Bson>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub pattern: Option<Regex>,
}

/// Built-in string normalizers applied as part of string coercion.
#[derive(Clone, Copy, Default)]
pub(crate) struct StringNormalize {
    pub trim: bool,
    pub lowercase: bool,
    pub uppercase: bool,
}

/// Descriptor of one declared path.
#[derive(Clone)]
pub struct PathOptions {
    pub(crate) kind: SchemaType,
    pub(crate) required: Required,
    pub(crate) required_message: Option<String>,
    pub(crate) default: Option<DefaultValue>,
    pub(crate) setters: Vec<SetterFn>,
    pub(crate) getters: Vec<GetterFn>,
    pub(crate) validators: Vec<ValidatorSpec>,
    pub(crate) immutable: Immutable,
    pub(crate) alias: Option<String>,
    pub(crate) ref_model: Option<String>,
    pub(crate) constraints: Constraints,
    pub(crate) normalize: StringNormalize,
}

impl PathOptions {
    pub fn new(kind: SchemaType) -> Self {
        Self {
            kind,
            required: Required::No,
            required_message: None,
            default: None,
            setters: Vec::new(),
            getters: Vec::new(),
            validators: Vec::new(),
            immutable: Immutable::No,
            alias: None,
            ref_model: None,
            constraints: Constraints::default(),
            normalize: StringNormalize::default(),
        }
    }

    pub fn string() -> Self {
        Self::new(SchemaType::String)
    }

    pub fn number() -> Self {
        Self::new(SchemaType::Number)
    }

    pub fn boolean() -> Self {
        Self::new(SchemaType::Boolean)
    }

    pub fn date() -> Self {
        Self::new(SchemaType::Date)
    }

    pub fn object_id() -> Self {
        Self::new(SchemaType::ObjectId)
    }

    pub fn uuid() -> Self {
        Self::new(SchemaType::Uuid)
    }

    pub fn mixed() -> Self {
        Self::new(SchemaType::Mixed)
    }

    pub fn array(inner: SchemaType) -> Self {
        Self::new(SchemaType::array_of(inner))
    }

    pub fn embedded(schema: Arc<Schema>) -> Self {
        Self::new(SchemaType::Embedded(schema))
    }

    pub fn document_array(schema: Arc<Schema>) -> Self {
        Self::new(SchemaType::array_of(SchemaType::Embedded(schema)))
    }

    pub fn map(inner: SchemaType) -> Self {
        Self::new(SchemaType::map_of(inner))
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = if required { Required::Yes } else { Required::No };
        self
    }

    pub fn required_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&NodeRef<'_>) -> bool + Send + Sync + 'static,
    {
        self.required = Required::If(Arc::new(predicate));
        self
    }

    pub fn required_message(mut self, message: impl Into<String>) -> Self {
        self.required_message = Some(message.into());
        self
    }

    pub fn default_value(mut self, value: impl Into<Bson>) -> Self {
        self.default = Some(DefaultValue::Value(value.into()));
        self
    }

    pub fn default_fn<F>(mut self, func: F) -> Self
    where
        F: Fn(&NodeRef<'_>) -> Bson + Send + Sync + 'static,
    {
        self.default = Some(DefaultValue::Fn(Arc::new(func)));
        self
    }

    /// Append a setter; setters run in declaration order before type coercion.
    pub fn setter<F>(mut self, func: F) -> Self
    where
        F: Fn(Bson, &NodeRef<'_>) -> Result<Bson, String> + Send + Sync + 'static,
    {
        self.setters.push(Arc::new(func));
        self
    }

    /// Append a getter; getters run last-declared first.
    pub fn getter<F>(mut self, func: F) -> Self
    where
        F: Fn(Bson, &NodeRef<'_>) -> Bson + Send + Sync + 'static,
    {
        self.getters.push(Arc::new(func));
        self
    }

    pub fn validate(mut self, validator: ValidatorSpec) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn immutable(mut self, immutable: bool) -> Self {
        self.immutable = if immutable { Immutable::Yes } else { Immutable::No };
        self
    }

    pub fn immutable_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&NodeRef<'_>) -> bool + Send + Sync + 'static,
    {
        self.immutable = Immutable::If(Arc::new(predicate));
        self
    }

    /// Expose the path under a second name as a virtual.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Name of the model population resolves this path against.
    pub fn ref_model(mut self, model: impl Into<String>) -> Self {
        self.ref_model = Some(model.into());
        self
    }

    pub fn enum_values<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Bson>,
    {
        self.constraints.enum_values = Some(values.into_iter().map(Into::into).collect());
        self
    }

    pub fn min(mut self, min: impl Into<Bson>) -> Self {
        self.constraints.min = Some(min.into());
        self
    }

    pub fn max(mut self, max: impl Into<Bson>) -> Self {
        self.constraints.max = Some(max.into());
        self
    }

    pub fn min_length(mut self, len: usize) -> Self {
        self.constraints.min_length = Some(len);
        self
    }

    pub fn max_length(mut self, len: usize) -> Self {
        self.constraints.max_length = Some(len);
        self
    }

    pub fn match_pattern(mut self, pattern: Regex) -> Self {
        self.constraints.pattern = Some(pattern);
        self
    }

    pub fn trim(mut self) -> Self {
        self.normalize.trim = true;
        self
    }

    pub fn lowercase(mut self) -> Self {
        self.normalize.lowercase = true;
        self
    }

    pub fn uppercase(mut self) -> Self {
        self.normalize.uppercase = true;
        self
    }

    pub fn kind(&self) -> &SchemaType {
        &self.kind
    }

    pub fn is_required(&self) -> bool {
        !matches!(self.required, Required::No)
    }

    pub fn alias_name(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub fn reference(&self) -> Option<&str> {
        self.ref_model.as_deref()
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }
}

impl fmt::Debug for PathOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathOptions")
            .field("kind", &self.kind)
            .field("required", &self.is_required())
            .field("setters", &self.setters.len())
            .field("getters", &self.getters.len())
            .field("validators", &self.validators.len())
            .field("alias", &self.alias)
            .field("ref_model", &self.ref_model)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_depth_and_innermost() {
        let kind = SchemaType::array_of(SchemaType::array_of(SchemaType::Number));
        assert_eq!(kind.array_depth(), 2);
        assert!(matches!(kind.innermost(), SchemaType::Number));
        assert_eq!(format!("{:?}", kind), "Array<Array<Number>>");
    }

    #[test]
    fn builder_accumulates_setters_in_order() {
        let options = PathOptions::string()
            .setter(|v, _| Ok(v))
            .setter(|v, _| Ok(v))
            .required(true)
            .alias("n");

        assert_eq!(options.setters.len(), 2);
        assert!(options.is_required());
        assert_eq!(options.alias_name(), Some("n"));
    }
}
