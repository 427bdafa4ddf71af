//! Built-in constraints and message templates.

use bson::Bson;

use crate::{
    cast::display_bson,
    error::{ValidatorError, ValidatorKind},
    schema::PathOptions,
    value::{bson_as_f64, bson_equal},
};

pub(crate) const REQUIRED: &str = "Path `{PATH}` is required.";
pub(crate) const USER_DEFINED: &str = "Validator failed for path `{PATH}` with value `{VALUE}`";
const ENUM: &str = "`{VALUE}` is not a valid enum value for path `{PATH}`.";
const MIN: &str = "Path `{PATH}` ({VALUE}) is less than minimum allowed value ({MIN}).";
const MAX: &str = "Path `{PATH}` ({VALUE}) is more than maximum allowed value ({MAX}).";
const MIN_LENGTH: &str =
    "Path `{PATH}` (`{VALUE}`) is shorter than the minimum allowed length ({MINLENGTH}).";
const MAX_LENGTH: &str =
    "Path `{PATH}` (`{VALUE}`) is longer than the maximum allowed length ({MAXLENGTH}).";
const REGEXP: &str = "Path `{PATH}` is invalid ({VALUE}).";

/// Substitute `{PATH}`, `{VALUE}`, `{KIND}` and any extra placeholders into a template.
pub(crate) fn render(
    template: &str,
    path: &str,
    value: &Bson,
    kind: &ValidatorKind,
    extra: &[(&str, String)],
) -> String {
    let mut message = template
        .replace("{PATH}", path)
        .replace("{VALUE}", &display_bson(value))
        .replace("{KIND}", &kind.to_string());
    for (name, replacement) in extra {
        message = message.replace(&format!("{{{}}}", name), replacement);
    }
    message
}

fn failure(
    template: &str,
    path: &str,
    value: &Bson,
    kind: ValidatorKind,
    extra: &[(&str, String)],
) -> ValidatorError {
    ValidatorError {
        path: path.to_string(),
        message: render(template, path, value, &kind, extra),
        value: value.clone(),
        kind,
        reason: None,
    }
}

/// Ordering of two comparable values: numbers by value, dates by instant, strings
/// lexically.
fn compare(a: &Bson, b: &Bson) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Bson::DateTime(a), Bson::DateTime(b)) => Some(a.timestamp_millis().cmp(&b.timestamp_millis())),
        (Bson::String(a), Bson::String(b)) => Some(a.cmp(b)),
        _ => bson_as_f64(a)?.partial_cmp(&bson_as_f64(b)?),
    }
}

/// Run the declared constraints against a defined value, returning the first failure.
/// Null passes every constraint.
pub(crate) fn check(path: &str, options: &PathOptions, value: &Bson) -> Option<ValidatorError> {
    if matches!(value, Bson::Null | Bson::Undefined) {
        return None;
    }
    let constraints = &options.constraints;

    if let Some(allowed) = &constraints.enum_values {
        let items = match value {
            Bson::Array(items) => items.iter().collect::<Vec<_>>(),
            other => vec![other],
        };
        if let Some(bad) = items
            .into_iter()
            .find(|item| !matches!(item, Bson::Null) && !allowed.iter().any(|ok| bson_equal(item, ok)))
        {
            return Some(failure(ENUM, path, bad, ValidatorKind::Enum, &[]));
        }
    }

    if let Some(min) = &constraints.min {
        if compare(value, min) == Some(std::cmp::Ordering::Less) {
            return Some(failure(MIN, path, value, ValidatorKind::Min, &[("MIN", display_bson(min))]));
        }
    }
    if let Some(max) = &constraints.max {
        if compare(value, max) == Some(std::cmp::Ordering::Greater) {
            return Some(failure(MAX, path, value, ValidatorKind::Max, &[("MAX", display_bson(max))]));
        }
    }

    if let Bson::String(s) = value {
        let len = s.chars().count();
        if let Some(min) = constraints.min_length.filter(|min| len < *min) {
            return Some(failure(
                MIN_LENGTH,
                path,
                value,
                ValidatorKind::MinLength,
                &[("MINLENGTH", min.to_string())],
            ));
        }
        if let Some(max) = constraints.max_length.filter(|max| len > *max) {
            return Some(failure(
                MAX_LENGTH,
                path,
                value,
                ValidatorKind::MaxLength,
                &[("MAXLENGTH", max.to_string())],
            ));
        }
        if let Some(pattern) = &constraints.pattern {
            if !pattern.is_match(s) {
                return Some(failure(REGEXP, path, value, ValidatorKind::Regexp, &[]));
            }
        }
    }

    None
}
