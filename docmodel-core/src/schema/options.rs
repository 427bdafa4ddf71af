use crate::serialize::ToObjectOptions;

/// Policy for writes to paths the schema does not declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strict {
    /// Silently drop the write.
    #[default]
    Drop,
    /// Store the value verbatim, uncast.
    Accept,
    /// Fail the write with [`DocumentError::StrictMode`](crate::error::DocumentError::StrictMode).
    Throw,
}

/// Dotted target paths for creation and update timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timestamps {
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl Default for Timestamps {
    fn default() -> Self {
        Self {
            created_at: Some("createdAt".to_string()),
            updated_at: Some("updatedAt".to_string()),
        }
    }
}

impl Timestamps {
    pub fn new(created_at: Option<&str>, updated_at: Option<&str>) -> Self {
        Self {
            created_at: created_at.map(str::to_string),
            updated_at: updated_at.map(str::to_string),
        }
    }
}

/// Schema-level configuration.
#[derive(Debug, Clone)]
pub struct SchemaOptions {
    pub(crate) strict: Strict,
    pub(crate) id_path: bool,
    pub(crate) id_virtual: bool,
    pub(crate) minimize: bool,
    pub(crate) to_object: ToObjectOptions,
    pub(crate) to_json: ToObjectOptions,
    pub(crate) timestamps: Option<Timestamps>,
    pub(crate) validate_before_save: bool,
    pub(crate) validate_modified_only: bool,
    pub(crate) store_subdoc_validation_error: bool,
}

impl Default for SchemaOptions {
    fn default() -> Self {
        Self {
            strict: Strict::Drop,
            id_path: true,
            id_virtual: true,
            minimize: true,
            to_object: ToObjectOptions::default(),
            to_json: ToObjectOptions::default(),
            timestamps: None,
            validate_before_save: true,
            validate_modified_only: false,
            store_subdoc_validation_error: true,
        }
    }
}

impl SchemaOptions {
    pub fn strict(mut self, strict: Strict) -> Self {
        self.strict = strict;
        self
    }

    /// Declare an `_id` ObjectId path with a generated default.
    pub fn id_path(mut self, enabled: bool) -> Self {
        self.id_path = enabled;
        self
    }

    /// Expose `_id` as an `id` hex-string virtual.
    pub fn id_virtual(mut self, enabled: bool) -> Self {
        self.id_virtual = enabled;
        self
    }

    pub fn minimize(mut self, minimize: bool) -> Self {
        self.minimize = minimize;
        self
    }

    pub fn to_object(mut self, options: ToObjectOptions) -> Self {
        self.to_object = options;
        self
    }

    pub fn to_json(mut self, options: ToObjectOptions) -> Self {
        self.to_json = options;
        self
    }

    pub fn timestamps(mut self, timestamps: Timestamps) -> Self {
        self.timestamps = Some(timestamps);
        self
    }

    pub fn validate_before_save(mut self, enabled: bool) -> Self {
        self.validate_before_save = enabled;
        self
    }

    pub fn validate_modified_only(mut self, enabled: bool) -> Self {
        self.validate_modified_only = enabled;
        self
    }

    /// When false, a failing subdocument contributes only its leaf errors to the parent,
    /// without its own aggregate entry at the subdocument path.
    pub fn store_subdoc_validation_error(mut self, enabled: bool) -> Self {
        self.store_subdoc_validation_error = enabled;
        self
    }

    pub fn strict_mode(&self) -> Strict {
        self.strict
    }

    pub fn timestamp_paths(&self) -> Option<&Timestamps> {
        self.timestamps.as_ref()
    }
}
