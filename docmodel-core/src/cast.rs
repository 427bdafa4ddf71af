//! Type coercion for declared paths.
//!
//! `cast_scalar` converts a raw [`Bson`] value to the canonical representation of a scalar
//! [`SchemaType`]. Structural types (arrays, embedded documents, maps) are composed by the
//! document layer on top of these functions, since they allocate document nodes.
//!
//! `Undefined` and `Null` pass through every scalar cast unchanged.

use std::{
    collections::BTreeSet,
    sync::{PoisonError, RwLock},
};

use bson::{Binary, Bson, DateTime, oid::ObjectId};
use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::{
    error::{CastError, CastKind},
    schema::{SchemaType, StringNormalize},
};

const DEFAULT_TRUTHY: [&str; 3] = ["true", "1", "yes"];
const DEFAULT_FALSY: [&str; 3] = ["false", "0", "no"];

/// String tables consulted when casting strings to booleans.
///
/// A config is constructed explicitly and handed to schemas through
/// [`SchemaBuilder::cast_config`](crate::schema::SchemaBuilder::cast_config); schemas that
/// share one `Arc` see each other's additions. [`CastConfig::reset`] restores the defaults.
#[derive(Debug)]
pub struct CastConfig {
    truthy: RwLock<BTreeSet<String>>,
    falsy: RwLock<BTreeSet<String>>,
}

impl Default for CastConfig {
    fn default() -> Self {
        Self {
            truthy: RwLock::new(DEFAULT_TRUTHY.iter().map(|s| s.to_string()).collect()),
            falsy: RwLock::new(DEFAULT_FALSY.iter().map(|s| s.to_string()).collect()),
        }
    }
}

impl CastConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_truthy(&self, value: impl Into<String>) {
        let value = value.into();
        self.falsy
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&value);
        self.truthy
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(value);
    }

    pub fn remove_truthy(&self, value: &str) {
        self.truthy
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(value);
    }

    pub fn add_falsy(&self, value: impl Into<String>) {
        let value = value.into();
        self.truthy
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&value);
        self.falsy
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(value);
    }

    pub fn remove_falsy(&self, value: &str) {
        self.falsy
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(value);
    }

    /// Restore the default tables.
    pub fn reset(&self) {
        *self.truthy.write().unwrap_or_else(PoisonError::into_inner) =
            DEFAULT_TRUTHY.iter().map(|s| s.to_string()).collect();
        *self.falsy.write().unwrap_or_else(PoisonError::into_inner) =
            DEFAULT_FALSY.iter().map(|s| s.to_string()).collect();
    }

    fn boolean(&self, value: &str) -> Option<bool> {
        if self
            .truthy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(value)
        {
            return Some(true);
        }
        if self
            .falsy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(value)
        {
            return Some(false);
        }
        None
    }
}

/// The cast kind reported for failures of a declared type.
pub fn cast_kind(kind: &SchemaType) -> CastKind {
    match kind {
        SchemaType::String => CastKind::String,
        SchemaType::Number => CastKind::Number,
        SchemaType::Boolean => CastKind::Boolean,
        SchemaType::Date => CastKind::Date,
        SchemaType::ObjectId => CastKind::ObjectId,
        SchemaType::Uuid => CastKind::Uuid,
        SchemaType::Array(_) => CastKind::Array,
        SchemaType::Embedded(_) => CastKind::Embedded,
        SchemaType::Map(_) => CastKind::Map,
        SchemaType::Mixed => CastKind::String,
    }
}

/// Cast a raw value to a scalar type. Structural types and `Mixed` return the value as is.
pub(crate) fn cast_scalar(
    kind: &SchemaType,
    value: Bson,
    path: &str,
    config: &CastConfig,
    normalize: StringNormalize,
) -> Result<Bson, CastError> {
    if matches!(value, Bson::Undefined | Bson::Null) {
        return Ok(value);
    }

    let result = match kind {
        SchemaType::String => cast_string(&value).map(|s| Bson::String(normalize_string(s, normalize))),
        SchemaType::Number => cast_number(&value),
        SchemaType::Boolean => cast_boolean(&value, config),
        SchemaType::Date => cast_date(&value),
        SchemaType::ObjectId => cast_object_id(&value),
        SchemaType::Uuid => cast_uuid(&value),
        _ => return Ok(value),
    };

    result.map_err(|reason| {
        tracing::trace!(path, kind = ?kind, "cast failed");
        let err = CastError::new(path, value, cast_kind(kind));
        match reason {
            Some(reason) => err.with_reason(reason),
            None => err,
        }
    })
}

type CastResult = Result<Bson, Option<String>>;

fn cast_string(value: &Bson) -> Result<String, Option<String>> {
    match value {
        Bson::String(s) => Ok(s.clone()),
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Boolean(_) => {
            Ok(display_bson(value))
        }
        Bson::ObjectId(oid) => Ok(oid.to_hex()),
        Bson::DateTime(dt) => dt
            .try_to_rfc3339_string()
            .map_err(|err| Some(err.to_string())),
        Bson::Decimal128(d) => Ok(d.to_string()),
        Bson::Symbol(s) => Ok(s.clone()),
        _ => Err(None),
    }
}

fn normalize_string(mut value: String, normalize: StringNormalize) -> String {
    if normalize.trim {
        value = value.trim().to_string();
    }
    if normalize.lowercase {
        value = value.to_lowercase();
    } else if normalize.uppercase {
        value = value.to_uppercase();
    }
    value
}

fn cast_number(value: &Bson) -> CastResult {
    let number = match value {
        Bson::Double(n) => *n,
        Bson::Int32(n) => f64::from(*n),
        Bson::Int64(n) => *n as f64,
        Bson::Boolean(b) => f64::from(u8::from(*b)),
        Bson::DateTime(dt) => dt.timestamp_millis() as f64,
        Bson::Decimal128(d) => d
            .to_string()
            .parse::<f64>()
            .map_err(|err| Some(err.to_string()))?,
        Bson::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Ok(Bson::Null);
            }
            trimmed
                .parse::<f64>()
                .map_err(|err| Some(err.to_string()))?
        }
        _ => return Err(None),
    };

    if number.is_nan() {
        return Err(Some("value is NaN".to_string()));
    }
    Ok(Bson::Double(number))
}

fn cast_boolean(value: &Bson, config: &CastConfig) -> CastResult {
    match value {
        Bson::Boolean(b) => Ok(Bson::Boolean(*b)),
        Bson::Int32(1) | Bson::Int64(1) => Ok(Bson::Boolean(true)),
        Bson::Int32(0) | Bson::Int64(0) => Ok(Bson::Boolean(false)),
        Bson::Double(n) if *n == 1.0 => Ok(Bson::Boolean(true)),
        Bson::Double(n) if *n == 0.0 => Ok(Bson::Boolean(false)),
        Bson::String(s) => config.boolean(s).map(Bson::Boolean).ok_or(None),
        _ => Err(None),
    }
}

fn cast_date(value: &Bson) -> CastResult {
    match value {
        Bson::DateTime(dt) => Ok(Bson::DateTime(*dt)),
        Bson::Int32(n) => Ok(Bson::DateTime(DateTime::from_millis(i64::from(*n)))),
        Bson::Int64(n) => Ok(Bson::DateTime(DateTime::from_millis(*n))),
        Bson::Double(n) if n.is_finite() => Ok(Bson::DateTime(DateTime::from_millis(*n as i64))),
        Bson::Timestamp(ts) => Ok(Bson::DateTime(DateTime::from_millis(
            i64::from(ts.time) * 1000,
        ))),
        Bson::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Ok(Bson::Null);
            }
            parse_date(trimmed)
                .map(Bson::DateTime)
                .ok_or_else(|| Some(format!("`{}` is not a valid date", trimmed)))
        }
        _ => Err(None),
    }
}

fn parse_date(input: &str) -> Option<DateTime> {
    if let Ok(millis) = input.parse::<i64>() {
        return Some(DateTime::from_millis(millis));
    }
    if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(input) {
        return Some(DateTime::from_chrono(parsed.with_timezone(&Utc)));
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(input, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(DateTime::from_chrono(Utc.from_utc_datetime(&parsed)));
    }
    if let Ok(parsed) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        let midnight = parsed.and_hms_opt(0, 0, 0)?;
        return Some(DateTime::from_chrono(Utc.from_utc_datetime(&midnight)));
    }
    None
}

fn cast_object_id(value: &Bson) -> CastResult {
    match value {
        Bson::ObjectId(oid) => Ok(Bson::ObjectId(*oid)),
        Bson::String(s) if s.len() == 24 => ObjectId::parse_str(s)
            .map(Bson::ObjectId)
            .map_err(|err| Some(err.to_string())),
        Bson::String(s) if s.len() == 12 => {
            let bytes: [u8; 12] = s
                .as_bytes()
                .try_into()
                .map_err(|_| Some("expected 12 bytes".to_string()))?;
            Ok(Bson::ObjectId(ObjectId::from_bytes(bytes)))
        }
        Bson::Document(doc) => match doc.get("_id") {
            Some(id) if !matches!(id, Bson::Document(_)) => cast_object_id(id),
            _ => Err(None),
        },
        _ => Err(None),
    }
}

fn cast_uuid(value: &Bson) -> CastResult {
    match value {
        Bson::Binary(binary) if binary.subtype == bson::spec::BinarySubtype::Uuid => {
            Ok(Bson::Binary(binary.clone()))
        }
        Bson::String(s) => {
            let parsed = uuid::Uuid::parse_str(s).map_err(|err| Some(err.to_string()))?;
            Ok(Bson::Binary(Binary::from_uuid(bson::Uuid::from(parsed))))
        }
        _ => Err(None),
    }
}

/// Wrap a value in arrays until its nesting reaches `depth`.
///
/// An empty array is never wrapped, at any level, since it already satisfies every depth.
pub fn wrap_to_depth(mut value: Bson, depth: usize) -> Bson {
    if matches!(value, Bson::Undefined | Bson::Null) {
        return value;
    }
    while let Some(current) = nesting(&value) {
        if current >= depth {
            break;
        }
        value = Bson::Array(vec![value]);
    }
    value
}

/// Array nesting of a value following first elements; `None` once an empty array is reached.
fn nesting(value: &Bson) -> Option<usize> {
    match value {
        Bson::Array(items) => match items.first() {
            Some(first) => nesting(first).map(|n| n + 1),
            None => None,
        },
        _ => Some(0),
    }
}

/// Human-readable rendering used in messages and string casts. Integral doubles print
/// without a fractional part.
pub fn display_bson(value: &Bson) -> String {
    match value {
        Bson::String(s) => s.clone(),
        Bson::Double(n) if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e21 => {
            format!("{}", *n as i64)
        }
        Bson::Double(n) => n.to_string(),
        Bson::Int32(n) => n.to_string(),
        Bson::Int64(n) => n.to_string(),
        Bson::Boolean(b) => b.to_string(),
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::Null => "null".to_string(),
        Bson::Undefined => "undefined".to_string(),
        Bson::DateTime(dt) => dt
            .try_to_rfc3339_string()
            .unwrap_or_else(|_| dt.timestamp_millis().to_string()),
        other => other.to_string(),
    }
}
