//! In-memory representation of cast document values.
//!
//! Input and output are plain [`Bson`]; once a value has been cast against a schema it is
//! held as a [`Value`], a closed set of shapes resolved once at cast time.

use bson::Bson;

use crate::document::{Document, NodeId};

/// A cast value stored in a document node.
#[derive(Debug, Clone, Default)]
pub enum Value {
    /// No value. Distinct from an explicit null.
    #[default]
    Undefined,
    /// A scalar (including null) or an untyped `Mixed` value held verbatim.
    Primitive(Bson),
    /// A plain keyed object: nested schema paths and map-typed paths.
    Mapping(Mapping),
    /// An embedded document owned by this slot.
    Embedded(NodeId),
    /// An array of cast values; document arrays hold [`Value::Embedded`] items.
    Array(Vec<Value>),
    /// A resolved reference supplied by population.
    Populated(Box<Document>),
}

impl Value {
    pub fn null() -> Self {
        Value::Primitive(Bson::Null)
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Undefined or null.
    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Primitive(Bson::Null))
    }

    pub fn as_mapping(&self) -> Option<&Mapping> {
        match self {
            Value::Mapping(mapping) => Some(mapping),
            _ => None,
        }
    }

    pub fn as_mapping_mut(&mut self) -> Option<&mut Mapping> {
        match self {
            Value::Mapping(mapping) => Some(mapping),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_array_mut(&mut self) -> Option<&mut Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_embedded(&self) -> Option<NodeId> {
        match self {
            Value::Embedded(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_primitive(&self) -> Option<&Bson> {
        match self {
            Value::Primitive(bson) => Some(bson),
            _ => None,
        }
    }

    /// Every embedded node directly held by this value (not recursing into the nodes).
    pub(crate) fn embedded_nodes(&self, out: &mut Vec<NodeId>) {
        match self {
            Value::Embedded(id) => out.push(*id),
            Value::Array(items) => items.iter().for_each(|item| item.embedded_nodes(out)),
            Value::Mapping(mapping) => mapping
                .values()
                .for_each(|value| value.embedded_nodes(out)),
            _ => {}
        }
    }
}

/// Insertion-ordered string-keyed map of values.
///
/// Document objects are small and iterated far more often than they are searched, so
/// entries live in a vector to keep declaration order for output.
#[derive(Debug, Clone, Default)]
pub struct Mapping {
    entries: Vec<(String, Value)>,
}

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries whose value is not undefined.
    pub fn defined_len(&self) -> usize {
        self.entries
            .iter()
            .filter(|(_, value)| !value.is_undefined())
            .count()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, value)| value)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, value)| value)
    }

    /// Insert or replace, keeping the position of an existing key. Returns the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        let key = key.into();
        match self.get_mut(&key) {
            Some(slot) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    /// Get the value under `key`, inserting the result of `make` first if absent.
    pub fn get_or_insert_with(&mut self, key: &str, make: impl FnOnce() -> Value) -> &mut Value {
        let idx = match self.entries.iter().position(|(k, _)| k == key) {
            Some(idx) => idx,
            None => {
                self.entries.push((key.to_string(), make()));
                self.entries.len() - 1
            }
        };

        &mut self.entries[idx].1
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, value)| (k.as_str(), value))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Value)> {
        self.entries.iter_mut().map(|(k, value)| (k.as_str(), value))
    }
}

/// Returns true if a Bson value carries no data: undefined or null.
pub fn bson_is_nullish(value: &Bson) -> bool {
    matches!(value, Bson::Undefined | Bson::Null)
}

/// Numeric value of any BSON number.
pub fn bson_as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Double(n) => Some(*n),
        Bson::Int32(n) => Some(f64::from(*n)),
        Bson::Int64(n) => Some(*n as f64),
        _ => None,
    }
}

/// Deep equality over plain values.
///
/// Numbers compare by value across numeric types, documents compare regardless of key
/// order, and keys holding `Undefined` count as absent.
pub fn bson_equal(a: &Bson, b: &Bson) -> bool {
    match (a, b) {
        (Bson::Document(a), Bson::Document(b)) => {
            let defined = |doc: &bson::Document| {
                doc.iter()
                    .filter(|(_, value)| !matches!(value, Bson::Undefined))
                    .count()
            };
            defined(a) == defined(b)
                && a.iter()
                    .filter(|(_, value)| !matches!(value, Bson::Undefined))
                    .all(|(key, value)| b.get(key).is_some_and(|other| bson_equal(value, other)))
        }
        (Bson::Array(a), Bson::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| bson_equal(x, y))
        }
        _ => match (bson_as_f64(a), bson_as_f64(b)) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
    }
}

/// Read a dotted path out of a plain Bson value, descending into documents and arrays.
pub fn bson_lookup<'a>(value: &'a Bson, path: &str) -> Option<&'a Bson> {
    if path.is_empty() {
        return Some(value);
    }

    let mut current = value;
    for segment in crate::path::segments(path) {
        current = match current {
            Bson::Document(doc) => doc.get(segment)?,
            Bson::Array(items) => items.get(crate::path::as_index(segment)?)?,
            _ => return None,
        };
    }

    Some(current)
}

/// How many `null` slots a positional write may add to extend an array.
pub const MAX_ARRAY_PADDING: usize = 1024;

/// Write a dotted path into a plain Bson document, creating intermediate documents.
///
/// Returns false, leaving the target value unwritten, when a segment under an array is not
/// an index or is more than [`MAX_ARRAY_PADDING`] slots past the end of the array.
pub fn bson_assign(target: &mut bson::Document, path: &str, value: Bson) -> bool {
    let (head, rest) = crate::path::split_first(path);
    match rest {
        None => {
            target.insert(head, value);
            true
        }
        Some(rest) => {
            if !matches!(target.get(head), Some(Bson::Document(_)) | Some(Bson::Array(_))) {
                target.insert(head, bson::Document::new());
            }
            match target.get_mut(head) {
                Some(Bson::Document(inner)) => bson_assign(inner, rest, value),
                Some(Bson::Array(items)) => bson_assign_in_array(items, rest, value),
                _ => false,
            }
        }
    }
}

fn bson_assign_in_array(items: &mut Vec<Bson>, path: &str, value: Bson) -> bool {
    let (head, rest) = crate::path::split_first(path);
    let Some(idx) = crate::path::as_index(head) else {
        return false;
    };
    if idx > items.len() + MAX_ARRAY_PADDING {
        return false;
    }
    if items.len() <= idx {
        items.resize(idx + 1, Bson::Null);
    }

    match rest {
        None => {
            items[idx] = value;
            true
        }
        Some(rest) => {
            if !matches!(items[idx], Bson::Document(_)) {
                items[idx] = Bson::Document(bson::Document::new());
            }
            match &mut items[idx] {
                Bson::Document(inner) => bson_assign(inner, rest, value),
                _ => false,
            }
        }
    }
}

/// Remove a dotted path from a plain Bson document. Returns the removed value.
pub fn bson_remove(target: &mut bson::Document, path: &str) -> Option<Bson> {
    let (head, rest) = crate::path::split_first(path);
    match rest {
        None => target.remove(head),
        Some(rest) => match target.get_mut(head)? {
            Bson::Document(inner) => bson_remove(inner, rest),
            Bson::Array(items) => {
                let (idx, rest) = crate::path::split_first(rest);
                let idx = crate::path::as_index(idx)?;
                match (items.get_mut(idx)?, rest) {
                    (slot, None) => Some(std::mem::replace(slot, Bson::Null)),
                    (Bson::Document(inner), Some(rest)) => bson_remove(inner, rest),
                    _ => None,
                }
            }
            _ => None,
        },
    }
}
