//! Lifecycle extension points.
//!
//! The document core does not dispatch middleware chains; it only invokes the hooks
//! registered here at fixed points. Hook errors are reported on the channel of the
//! operation they wrap.

use std::{collections::HashMap, fmt, sync::Arc};

use bson::Bson;

use crate::{
    document::Document,
    error::{DocumentError, DocumentResult},
};

/// Runs before a mutating operation and may modify the document.
pub type PreHookFn = Arc<dyn Fn(&mut Document) -> Result<(), String> + Send + Sync>;
/// Runs after an operation has completed.
pub type PostHookFn = Arc<dyn Fn(&Document) -> Result<(), String> + Send + Sync>;
/// Runs around validation, which only borrows the document.
pub type ValidateHookFn = Arc<dyn Fn(&Document) -> Result<(), String> + Send + Sync>;
/// A custom instance method.
pub type MethodFn = Arc<dyn Fn(&mut Document, &[Bson]) -> Result<Bson, String> + Send + Sync>;

/// Operations that carry pre/post hooks with mutable access.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookPoint {
    Save,
    Remove,
    /// A user-defined instance method, by name.
    Method(String),
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookPoint::Save => f.write_str("save"),
            HookPoint::Remove => f.write_str("remove"),
            HookPoint::Method(name) => write!(f, "method `{}`", name),
        }
    }
}

#[derive(Clone, Default)]
pub struct Hooks {
    pre: HashMap<HookPoint, Vec<PreHookFn>>,
    post: HashMap<HookPoint, Vec<PostHookFn>>,
    pre_validate: Vec<ValidateHookFn>,
    post_validate: Vec<ValidateHookFn>,
}

impl Hooks {
    pub(crate) fn add_pre(&mut self, point: HookPoint, hook: PreHookFn) {
        self.pre.entry(point).or_default().push(hook);
    }

    pub(crate) fn add_post(&mut self, point: HookPoint, hook: PostHookFn) {
        self.post.entry(point).or_default().push(hook);
    }

    pub(crate) fn add_pre_validate(&mut self, hook: ValidateHookFn) {
        self.pre_validate.push(hook);
    }

    pub(crate) fn add_post_validate(&mut self, hook: ValidateHookFn) {
        self.post_validate.push(hook);
    }

    /// Run the pre hooks for `point` in registration order, stopping at the first error.
    pub fn run_pre(&self, point: &HookPoint, doc: &mut Document) -> DocumentResult<()> {
        for hook in self.pre.get(point).into_iter().flatten() {
            hook(doc).map_err(|message| hook_error("pre", point, message))?;
        }
        Ok(())
    }

    pub fn run_post(&self, point: &HookPoint, doc: &Document) -> DocumentResult<()> {
        for hook in self.post.get(point).into_iter().flatten() {
            hook(doc).map_err(|message| hook_error("post", point, message))?;
        }
        Ok(())
    }

    pub(crate) fn run_pre_validate(&self, doc: &Document) -> DocumentResult<()> {
        for hook in &self.pre_validate {
            hook(doc).map_err(|message| DocumentError::Hook {
                point: "pre validate".to_string(),
                message,
            })?;
        }
        Ok(())
    }

    pub(crate) fn run_post_validate(&self, doc: &Document) -> DocumentResult<()> {
        for hook in &self.post_validate {
            hook(doc).map_err(|message| DocumentError::Hook {
                point: "post validate".to_string(),
                message,
            })?;
        }
        Ok(())
    }
}

fn hook_error(phase: &str, point: &HookPoint, message: String) -> DocumentError {
    DocumentError::Hook {
        point: format!("{} {}", phase, point),
        message,
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("pre", &self.pre.keys().collect::<Vec<_>>())
            .field("post", &self.post.keys().collect::<Vec<_>>())
            .field("pre_validate", &self.pre_validate.len())
            .field("post_validate", &self.post_validate.len())
            .finish()
    }
}

/// Registered instance methods, by name.
#[derive(Clone, Default)]
pub(crate) struct Methods {
    methods: HashMap<String, MethodFn>,
}

impl Methods {
    pub fn insert(&mut self, name: String, method: MethodFn) {
        self.methods.insert(name, method);
    }

    pub fn get(&self, name: &str) -> Option<&MethodFn> {
        self.methods.get(name)
    }
}

impl fmt::Debug for Methods {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.methods.keys()).finish()
    }
}
