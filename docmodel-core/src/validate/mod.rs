//! Validation passes.
//!
//! A pass first plans which `(node, path)` pairs to check: every declared path (the
//! default), only modified paths, or an explicit list. Embedded documents under a planned
//! path are descended into, and recorded cast errors and invalidations are always
//! included. Each pair is then checked once: recorded errors, the required predicate,
//! built-in constraints, then user validators in declaration order. Once a path reaches an
//! asynchronous validator, the rest of its chain is deferred, and deferred chains of
//! different paths run concurrently.

mod builtin;

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    sync::PoisonError,
};

use bson::Bson;
use futures::future::join_all;

use crate::{
    cast::display_bson,
    document::{Document, NodeId, NodeRef},
    error::{CastError, DocumentError, DocumentResult, PathError, ValidationError, ValidatorError, ValidatorKind},
    path,
    schema::{Required, SchemaType, ValidatorFn, ValidatorSpec},
};

pub(crate) use builtin::render;

/// Which paths a validation pass covers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidateOptions {
    /// Validate exactly these paths (and the embedded documents below them).
    pub paths: Option<Vec<String>>,
    /// Validate modified paths only. Ignored when `paths` is set.
    pub modified_only: Option<bool>,
}

impl ValidateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.paths = Some(paths.into_iter().map(Into::into).collect());
        self
    }

    pub fn modified_only(mut self, modified_only: bool) -> Self {
        self.modified_only = Some(modified_only);
        self
    }
}

/// Scope of a validation pass in flight on one node.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum InFlight {
    Full,
    Paths(BTreeSet<String>),
}

impl InFlight {
    fn of(options: &ValidateOptions) -> Self {
        match &options.paths {
            Some(paths) => InFlight::Paths(paths.iter().cloned().collect()),
            None => InFlight::Full,
        }
    }

    fn conflicts(&self, other: &InFlight) -> bool {
        match (self, other) {
            (InFlight::Paths(mine), InFlight::Paths(theirs)) => mine
                .iter()
                .any(|a| theirs.iter().any(|b| path::overlaps(a, b))),
            _ => true,
        }
    }
}

/// Registers a pass on a node for as long as it is alive.
struct ValidationGuard<'a> {
    doc: &'a Document,
    node: NodeId,
    scope: InFlight,
}

impl<'a> ValidationGuard<'a> {
    fn acquire(doc: &'a Document, node: NodeId, scope: InFlight) -> DocumentResult<Self> {
        let mut validating = doc.validating.lock().unwrap_or_else(PoisonError::into_inner);
        let active = validating.entry(node).or_default();
        if active.iter().any(|running| running.conflicts(&scope)) {
            tracing::debug!(node = ?node, "rejected overlapping validation");
            return Err(DocumentError::ParallelValidate(display_bson(&doc.id())));
        }
        active.push(scope.clone());
        Ok(Self { doc, node, scope })
    }
}

impl Drop for ValidationGuard<'_> {
    fn drop(&mut self) {
        let mut validating = self.doc.validating.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(active) = validating.get_mut(&self.node) {
            if let Some(index) = active.iter().position(|running| *running == self.scope) {
                active.remove(index);
            }
            if active.is_empty() {
                validating.remove(&self.node);
            }
        }
    }
}

#[derive(Default)]
struct Plan {
    checks: Vec<(NodeId, String)>,
    seen: HashSet<(NodeId, String)>,
}

impl Plan {
    fn push(&mut self, node: NodeId, rel: &str) {
        if self.seen.insert((node, rel.to_string())) {
            self.checks.push((node, rel.to_string()));
        }
    }
}

/// The remainder of a path's validator chain, from its first asynchronous validator.
struct Deferred<'s> {
    node: NodeId,
    path: String,
    value: Bson,
    validators: &'s [ValidatorSpec],
}

enum Checked<'s> {
    Passed,
    Failed(PathError),
    Deferred(Deferred<'s>),
}

fn is_missing(value: &Bson, kind: &SchemaType) -> bool {
    match value {
        Bson::Undefined | Bson::Null => true,
        Bson::String(s) => s.is_empty() && !kind.is_array(),
        _ => false,
    }
}

fn user_failure(
    spec: &ValidatorSpec,
    path: &str,
    value: &Bson,
    result: Result<bool, String>,
) -> Option<ValidatorError> {
    let kind = spec
        .kind
        .clone()
        .map(ValidatorKind::Custom)
        .unwrap_or(ValidatorKind::UserDefined);
    let (message, reason) = match result {
        Ok(true) => return None,
        Ok(false) => (
            render(spec.message.as_deref().unwrap_or(builtin::USER_DEFINED), path, value, &kind, &[]),
            None,
        ),
        Err(reason) => (
            spec.message
                .as_deref()
                .map(|template| render(template, path, value, &kind, &[]))
                .unwrap_or_else(|| reason.clone()),
            Some(reason),
        ),
    };

    Some(ValidatorError {
        path: path.to_string(),
        value: value.clone(),
        kind,
        message,
        reason,
    })
}

/// A copy of a collected error reported under a different path.
fn relocated(error: &PathError, path: &str) -> PathError {
    match error {
        PathError::Cast(err) => PathError::Cast(CastError {
            path: path.to_string(),
            ..err.clone()
        }),
        PathError::Validator(err) => PathError::Validator(ValidatorError {
            path: path.to_string(),
            ..err.clone()
        }),
        PathError::Subdocument(err) => PathError::Subdocument(err.clone()),
    }
}

impl Document {
    /// Validate every declared path, running asynchronous validators concurrently.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::Validation`] listing every failing path,
    /// [`DocumentError::ParallelValidate`] if a pass is already running on this document,
    /// or [`DocumentError::Hook`] if a validate hook fails.
    pub async fn validate(&self) -> DocumentResult<()> {
        self.validate_with(ValidateOptions::default()).await
    }

    /// Validate with an explicit path list or modified-only selection.
    ///
    /// Passes scoped to disjoint path lists may run on the same document at once.
    pub async fn validate_with(&self, options: ValidateOptions) -> DocumentResult<()> {
        let failed = {
            let _guard = ValidationGuard::acquire(self, self.root, InFlight::of(&options))?;
            self.schema.hooks().run_pre_validate(self)?;
            self.run_pass(self.root, &options).await
        };

        match failed {
            Some(err) => Err(err.into()),
            None => self.schema.hooks().run_post_validate(self),
        }
    }

    /// Validate one embedded document on its own. Errors are keyed by paths relative to
    /// it, and the document's validate hooks do not run.
    pub async fn validate_node(&self, node: NodeId, options: ValidateOptions) -> DocumentResult<()> {
        self.check_node(node)?;
        let failed = {
            let _guard = ValidationGuard::acquire(self, node, InFlight::of(&options))?;
            self.run_pass(node, &options).await
        };

        match failed {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Validate synchronously, skipping asynchronous validators.
    pub fn validate_sync(&self) -> Option<ValidationError> {
        self.validate_sync_with(ValidateOptions::default())
    }

    pub fn validate_sync_with(&self, options: ValidateOptions) -> Option<ValidationError> {
        let (errors, _) = self.collect(self.root, &options, false);
        self.finish(self.root, errors)
    }

    async fn run_pass(&self, start: NodeId, options: &ValidateOptions) -> Option<ValidationError> {
        let (mut errors, deferred) = self.collect(start, options, true);
        let finished = join_all(deferred.into_iter().map(|deferred| self.run_deferred(deferred))).await;
        for (path, error) in finished {
            if let Some(error) = error {
                errors.insert(path, PathError::Validator(error));
            }
        }
        self.finish(start, errors)
    }

    /// Plan the pass and run every synchronous check.
    fn collect(
        &self,
        start: NodeId,
        options: &ValidateOptions,
        run_async: bool,
    ) -> (BTreeMap<String, PathError>, Vec<Deferred<'_>>) {
        let checks = self.plan(start, options);
        let prefix = self.full_path(start, "");
        tracing::debug!(paths = checks.len(), prefix = %prefix, "validating");

        let mut errors = BTreeMap::new();
        let mut deferred = Vec::new();
        for (node, rel) in checks {
            let scoped = self.scoped_path(&prefix, node, &rel);
            match self.check_path(node, &rel, &scoped, run_async) {
                Checked::Passed => {}
                Checked::Failed(error) => {
                    errors.insert(scoped, error);
                }
                Checked::Deferred(pending) => deferred.push(pending),
            }
        }
        (errors, deferred)
    }

    /// Attach subdocument aggregates and wrap the result.
    fn finish(&self, start: NodeId, mut errors: BTreeMap<String, PathError>) -> Option<ValidationError> {
        if errors.is_empty() {
            tracing::debug!("validation passed");
            return None;
        }

        let prefix = self.full_path(start, "");
        let mut aggregates = Vec::new();
        for node in self.subtree(start).into_iter().skip(1) {
            if !self.arena[node].schema.options().store_subdoc_validation_error {
                continue;
            }
            let slot = self.scoped_path(&prefix, node, "");
            if errors.contains_key(&slot) {
                continue;
            }

            let mut inner = ValidationError::new(None);
            for (key, error) in &errors {
                if matches!(error, PathError::Subdocument(_)) {
                    continue;
                }
                if let Some(rest) = path::relative_to(&slot, key) {
                    inner.add(rest, relocated(error, rest));
                }
            }
            if !inner.is_empty() {
                aggregates.push((slot, PathError::Subdocument(inner)));
            }
        }
        errors.extend(aggregates);

        tracing::debug!(errors = errors.len(), "validation failed");
        Some(ValidationError {
            model: self.model_name.clone(),
            errors,
        })
    }

    fn run_deferred<'s>(
        &'s self,
        deferred: Deferred<'s>,
    ) -> impl Future<Output = (String, Option<ValidatorError>)> + 's {
        async move {
            for spec in deferred.validators {
                let result = match &spec.func {
                    ValidatorFn::Sync(func) => func(&deferred.value, &NodeRef::new(self, deferred.node)),
                    ValidatorFn::Async(func) => func(deferred.value.clone()).await,
                };
                if let Some(error) = user_failure(spec, &deferred.path, &deferred.value, result) {
                    return (deferred.path, Some(error));
                }
            }
            (deferred.path, None)
        }
    }

    fn check_path(&self, node: NodeId, rel: &str, scoped: &str, run_async: bool) -> Checked<'_> {
        let owner = &self.arena[node];
        if let Some(err) = owner.cast_errors.get(rel) {
            return Checked::Failed(PathError::Cast(CastError {
                path: scoped.to_string(),
                ..err.clone()
            }));
        }
        if let Some(err) = owner.invalidated.get(rel) {
            return Checked::Failed(PathError::Validator(ValidatorError {
                path: scoped.to_string(),
                ..err.clone()
            }));
        }
        let Some(options) = owner.schema.path(rel) else {
            return Checked::Passed;
        };

        let value = self
            .lookup_value(node, rel)
            .map(|value| self.plain_value(value, true))
            .unwrap_or(Bson::Undefined);
        let node_ref = NodeRef::new(self, node);

        let required = match &options.required {
            Required::No => false,
            Required::Yes => true,
            Required::If(predicate) => predicate(&node_ref),
        };
        if required && is_missing(&value, options.kind()) {
            let template = options.required_message.as_deref().unwrap_or(builtin::REQUIRED);
            let kind = ValidatorKind::Required;
            return Checked::Failed(PathError::Validator(ValidatorError {
                path: scoped.to_string(),
                message: render(template, scoped, &value, &kind, &[]),
                value,
                kind,
                reason: None,
            }));
        }
        if matches!(value, Bson::Undefined) {
            return Checked::Passed;
        }

        if let Some(error) = builtin::check(scoped, options, &value) {
            return Checked::Failed(PathError::Validator(error));
        }

        for (index, spec) in options.validators.iter().enumerate() {
            match &spec.func {
                ValidatorFn::Sync(func) => {
                    if let Some(error) = user_failure(spec, scoped, &value, func(&value, &node_ref)) {
                        return Checked::Failed(PathError::Validator(error));
                    }
                }
                ValidatorFn::Async(_) if run_async => {
                    return Checked::Deferred(Deferred {
                        node,
                        path: scoped.to_string(),
                        value,
                        validators: &options.validators[index..],
                    });
                }
                ValidatorFn::Async(_) => {}
            }
        }

        Checked::Passed
    }

    fn plan(&self, start: NodeId, options: &ValidateOptions) -> Vec<(NodeId, String)> {
        let mut plan = Plan::default();
        match &options.paths {
            Some(paths) => {
                for requested in paths {
                    self.plan_path(start, requested, &mut plan);
                }
                self.plan_errors(start, Some(paths), &mut plan);
            }
            None if options.modified_only.unwrap_or(false) => {
                for modified in self.arena[start].tracker.modified_paths() {
                    self.plan_path(start, &modified, &mut plan);
                }
                self.plan_errors(start, None, &mut plan);
            }
            None => {
                self.plan_node(start, &mut plan);
                self.plan_errors(start, None, &mut plan);
            }
        }
        plan.checks
    }

    fn should_check(&self, node: NodeId, rel: &str) -> bool {
        self.is_selected(&self.full_path(node, rel)) && !self.arena[node].tracker.is_ignored(rel)
    }

    /// Every declared path of a node, descending into the documents they hold.
    fn plan_node(&self, node: NodeId, plan: &mut Plan) {
        let schema = self.arena[node].schema.clone();
        for (name, _) in schema.paths() {
            if self.should_check(node, name) {
                plan.push(node, name);
                self.plan_children(node, name, plan);
            }
        }
    }

    fn plan_children(&self, node: NodeId, rel: &str, plan: &mut Plan) {
        if let Some(value) = self.lookup_value(node, rel) {
            let mut held = Vec::new();
            value.embedded_nodes(&mut held);
            for child in held {
                self.plan_node(child, plan);
            }
        }
    }

    fn plan_path(&self, start: NodeId, requested: &str, plan: &mut Plan) {
        let (node, rel) = self.locate(start, requested);
        let schema = self.arena[node].schema.clone();
        let rel = schema.resolve_alias(&rel).map(str::to_string).unwrap_or(rel);

        if schema.path(&rel).is_some() {
            if self.should_check(node, &rel) {
                plan.push(node, &rel);
                self.plan_children(node, &rel, plan);
            }
        } else if schema.is_nested(&rel) {
            for (name, _) in schema.paths().filter(|(name, _)| path::is_ancestor(&rel, name)) {
                if self.should_check(node, name) {
                    plan.push(node, name);
                    self.plan_children(node, name, plan);
                }
            }
        } else if let Some(child) = self.lookup_value(node, &rel).and_then(|value| value.as_embedded()) {
            self.plan_node(child, plan);
        }
    }

    /// Recorded cast errors and invalidations in the subtree, optionally limited to the
    /// requested paths.
    fn plan_errors(&self, start: NodeId, requested: Option<&Vec<String>>, plan: &mut Plan) {
        let prefix = self.full_path(start, "");
        for node in self.subtree(start) {
            let owner = &self.arena[node];
            for rel in owner.cast_errors.keys().chain(owner.invalidated.keys()) {
                if owner.tracker.is_ignored(rel) {
                    continue;
                }
                let scoped = self.scoped_path(&prefix, node, rel);
                let wanted = requested
                    .is_none_or(|paths| paths.iter().any(|requested| path::overlaps(requested, &scoped)));
                if wanted {
                    plan.push(node, rel);
                }
            }
        }
    }

    /// `start` and every node below it, parents first.
    fn subtree(&self, start: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut pending = vec![start];
        while let Some(node) = pending.pop() {
            out.push(node);
            let mut children = self.arena.children(node);
            children.reverse();
            pending.extend(children);
        }
        out
    }

    /// Path of `rel` in `node` as seen from the node at `prefix`.
    fn scoped_path(&self, prefix: &str, node: NodeId, rel: &str) -> String {
        let full = self.full_path(node, rel);
        if prefix.is_empty() {
            return full;
        }
        path::relative_to(prefix, &full)
            .map(str::to_string)
            .unwrap_or(full)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::{Duration, Instant},
    };

    use bson::doc;
    use futures::FutureExt;

    use super::*;
    use crate::schema::{PathOptions, Schema, SchemaOptions};

    fn counted(calls: &Arc<AtomicUsize>) -> ValidatorSpec {
        let calls = calls.clone();
        ValidatorSpec::sync(move |value, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(value.as_str().is_some_and(|s| s != "bad"))
        })
        .message("BAM")
    }

    #[tokio::test]
    async fn required_short_circuits_user_validators() {
        let calls = Arc::new(AtomicUsize::new(0));
        let schema = Schema::builder()
            .path("prop", PathOptions::string().required(true).validate(counted(&calls)))
            .path("nick", PathOptions::string().required(true))
            .build()
            .unwrap();

        let doc = Document::new(schema.clone(), doc! { "prop": "ok", "nick": "n" }).unwrap();
        doc.validate().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let doc = Document::new(schema, doc! { "nick": "n" }).unwrap();
        let err = doc.validate().await.unwrap_err();
        let err = err.as_validation().unwrap();
        assert_eq!(err.len(), 1);
        assert_eq!(err.get("prop").unwrap().validator_kind(), Some(&ValidatorKind::Required));
        assert_eq!(err.get("prop").unwrap().message(), "Path `prop` is required.");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn every_failing_path_is_reported() {
        let calls = Arc::new(AtomicUsize::new(0));
        let schema = Schema::builder()
            .path("a", PathOptions::string().validate(counted(&calls)))
            .path("b", PathOptions::number().min(5))
            .path("c", PathOptions::number())
            .build()
            .unwrap();

        let mut doc = Document::new(schema, doc! { "a": "bad", "b": 1, "c": "x" }).unwrap();
        let err = doc.validate_sync().unwrap();
        assert_eq!(err.paths().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert_eq!(err.get("a").unwrap().message(), "BAM");
        assert!(matches!(err.get("c"), Some(PathError::Cast(_))));

        doc.set("c", 3).unwrap();
        let err = doc.validate_sync().unwrap();
        assert!(err.get("c").is_none());
    }

    #[test]
    fn validator_errors_become_reasons() {
        let schema = Schema::builder()
            .path(
                "name",
                PathOptions::string().validate(ValidatorSpec::sync(|_, _| Err("boom".into())).kind("custom")),
            )
            .build()
            .unwrap();
        let doc = Document::new(schema, doc! { "name": "x" }).unwrap();

        let err = doc.validate_sync().unwrap();
        let PathError::Validator(error) = err.get("name").unwrap() else {
            panic!("expected a validator error");
        };
        assert_eq!(error.reason.as_deref(), Some("boom"));
        assert_eq!(error.message, "boom");
        assert_eq!(error.kind, ValidatorKind::Custom("custom".into()));
    }

    #[tokio::test]
    async fn modified_only_skips_stale_values() {
        let schema = Schema::builder()
            .path("a", PathOptions::number().max(1))
            .path("b", PathOptions::number())
            .build()
            .unwrap();
        let mut doc = Document::init(schema, doc! { "a": 5, "b": 1 }, None).unwrap();
        doc.set("b", 2).unwrap();

        assert!(doc.validate().await.is_err());
        doc.validate_with(ValidateOptions::new().modified_only(true)).await.unwrap();
        doc.validate_with(ValidateOptions::new().paths(["b"])).await.unwrap();
        assert!(doc.validate_with(ValidateOptions::new().paths(["a"])).await.is_err());
    }

    fn with_child(store_aggregate: bool) -> Arc<Schema> {
        let child = Schema::builder()
            .path("title", PathOptions::string().required(true))
            .options(SchemaOptions::default().store_subdoc_validation_error(store_aggregate))
            .build()
            .unwrap();
        Schema::builder()
            .path("child", PathOptions::embedded(child.clone()))
            .path("items", PathOptions::document_array(child))
            .build()
            .unwrap()
    }

    #[test]
    fn subdocument_errors_nest_unless_disabled() {
        let input = doc! { "child": {}, "items": [ { "title": "x" }, {} ] };

        let doc = Document::new(with_child(true), input.clone()).unwrap();
        let err = doc.validate_sync().unwrap();
        assert_eq!(
            err.paths().collect::<Vec<_>>(),
            vec!["child", "child.title", "items.1", "items.1.title"]
        );
        let Some(PathError::Subdocument(inner)) = err.get("items.1") else {
            panic!("expected an aggregate");
        };
        assert_eq!(inner.paths().collect::<Vec<_>>(), vec!["title"]);

        let doc = Document::new(with_child(false), input).unwrap();
        let err = doc.validate_sync().unwrap();
        assert_eq!(err.paths().collect::<Vec<_>>(), vec!["child.title", "items.1.title"]);
    }

    #[tokio::test]
    async fn subdocuments_validate_on_their_own() {
        let doc = Document::new(with_child(true), doc! { "items": [ {}, { "title": "x" } ] }).unwrap();
        let first = doc.subdocument("items.0").unwrap().id();
        let second = doc.subdocument("items.1").unwrap().id();

        let err = doc.validate_node(first, ValidateOptions::new()).await.unwrap_err();
        assert_eq!(err.as_validation().unwrap().paths().collect::<Vec<_>>(), vec!["title"]);
        doc.validate_node(second, ValidateOptions::new()).await.unwrap();
    }

    fn slow_schema(delay: Duration) -> Arc<Schema> {
        let slow = move || {
            ValidatorSpec::asynchronous(move |_| {
                async move {
                    tokio::time::sleep(delay).await;
                    Ok::<_, String>(true)
                }
                .boxed()
            })
        };
        Schema::builder()
            .path("a", PathOptions::string().validate(slow()))
            .path("b", PathOptions::string().validate(slow()))
            .path("c", PathOptions::string().validate(slow()))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn async_validators_run_concurrently() {
        let doc = Document::new(slow_schema(Duration::from_millis(100)), doc! { "a": "1", "b": "2", "c": "3" })
            .unwrap();
        let started = Instant::now();
        doc.validate().await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(250));
    }

    #[tokio::test]
    async fn overlapping_passes_are_rejected() {
        let doc = Document::new(slow_schema(Duration::from_millis(20)), doc! { "a": "1", "b": "2" }).unwrap();

        let (first, second) = tokio::join!(doc.validate(), doc.validate());
        assert!(first.is_ok());
        assert!(matches!(second, Err(DocumentError::ParallelValidate(_))));

        let (a, b) = tokio::join!(
            doc.validate_with(ValidateOptions::new().paths(["a"])),
            doc.validate_with(ValidateOptions::new().paths(["b"])),
        );
        assert!(a.is_ok() && b.is_ok());

        doc.validate().await.unwrap();
    }

    #[tokio::test]
    async fn hooks_wrap_the_pass() {
        let schema = Schema::builder()
            .path("name", PathOptions::string())
            .pre_validate(|doc| match doc.get("name") {
                Bson::String(name) if name == "stop" => Err("stopped".into()),
                _ => Ok(()),
            })
            .build()
            .unwrap();

        Document::new(schema.clone(), doc! { "name": "go" }).unwrap().validate().await.unwrap();
        let err = Document::new(schema, doc! { "name": "stop" })
            .unwrap()
            .validate()
            .await
            .unwrap_err();
        assert!(matches!(err, DocumentError::Hook { .. }));
    }
}
