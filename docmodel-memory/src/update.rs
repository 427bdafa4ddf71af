//! Applying update documents to stored records.
//!
//! Supports the operators a document's change set is made of: `$set`, `$unset`, `$push`
//! (with `$each` and `$position`), `$addToSet` (with `$each`), `$pullAll` and `$pop`.

use bson::Bson;

use docmodel_core::{
    error::{DocumentError, DocumentResult},
    path,
    value::{bson_as_f64, bson_assign, bson_equal, bson_lookup, bson_remove},
};

/// Apply `update` to `record` in place, returning whether the record changed.
///
/// # Errors
///
/// Returns [`DocumentError::Backend`] for an unknown operator, a malformed operand, or an
/// array operator aimed at a value that is not an array.
pub(crate) fn apply_update(record: &mut bson::Document, update: &bson::Document) -> DocumentResult<bool> {
    let before = record.clone();

    for (operator, operand) in update {
        let Bson::Document(entries) = operand else {
            return Err(malformed(operator, "operand must be a document"));
        };

        for (target, value) in entries {
            match operator.as_str() {
                "$set" => {
                    if !bson_assign(record, target, value.clone()) {
                        return Err(malformed(operator, "path does not address a writable array slot"));
                    }
                }
                "$unset" => {
                    bson_remove(record, target);
                }
                "$push" => push(record, target, value)?,
                "$addToSet" => add_to_set(record, target, value)?,
                "$pullAll" => pull_all(record, target, value)?,
                "$pop" => pop(record, target, value)?,
                other => return Err(malformed(other, "unsupported update operator")),
            }
        }
    }

    Ok(Bson::Document(before) != Bson::Document(record.clone()))
}

/// Equality filter match: every filter entry equals the value at its path.
pub(crate) fn matches(record: &bson::Document, filter: &bson::Document) -> bool {
    let record = Bson::Document(record.clone());
    filter.iter().all(|(key, expected)| {
        bson_lookup(&record, key).is_some_and(|actual| bson_equal(actual, expected))
    })
}

fn malformed(operator: &str, message: &str) -> DocumentError {
    DocumentError::Backend(format!("{}: {}", operator, message))
}

/// The array at `target`, created empty when the path is missing or null.
fn array_at<'a>(record: &'a mut bson::Document, target: &str, operator: &str) -> DocumentResult<&'a mut Vec<Bson>> {
    let current = bson_lookup(&Bson::Document(record.clone()), target).cloned();
    match current {
        None | Some(Bson::Null) => {
            bson_assign(record, target, Bson::Array(Vec::new()));
        }
        Some(Bson::Array(_)) => {}
        Some(_) => {
            return Err(malformed(
                operator,
                &format!("cannot apply to non-array field `{}`", target),
            ));
        }
    }

    lookup_mut(record, target)
        .and_then(|value| value.as_array_mut())
        .ok_or_else(|| malformed(operator, &format!("no array at `{}`", target)))
}

fn lookup_mut<'a>(record: &'a mut bson::Document, target: &str) -> Option<&'a mut Bson> {
    let (head, rest) = path::split_first(target);
    let value = record.get_mut(head)?;
    match rest {
        None => Some(value),
        Some(rest) => match value {
            Bson::Document(inner) => lookup_mut(inner, rest),
            Bson::Array(items) => {
                let (index, rest) = path::split_first(rest);
                let item = items.get_mut(path::as_index(index)?)?;
                match (item, rest) {
                    (item, None) => Some(item),
                    (Bson::Document(inner), Some(rest)) => lookup_mut(inner, rest),
                    _ => None,
                }
            }
            _ => None,
        },
    }
}

/// Split a `{ $each: [..], .. }` modifier document from a single value.
fn each(value: &Bson) -> (Vec<Bson>, Option<&bson::Document>) {
    match value {
        Bson::Document(modifiers) if modifiers.contains_key("$each") => {
            let items = match modifiers.get("$each") {
                Some(Bson::Array(items)) => items.clone(),
                Some(other) => vec![other.clone()],
                None => Vec::new(),
            };
            (items, Some(modifiers))
        }
        other => (vec![other.clone()], None),
    }
}

fn push(record: &mut bson::Document, target: &str, value: &Bson) -> DocumentResult<()> {
    let (items, modifiers) = each(value);
    let position = modifiers
        .and_then(|modifiers| modifiers.get("$position"))
        .and_then(bson_as_f64)
        .map(|position| position as i64);

    let array = array_at(record, target, "$push")?;
    let len = array.len() as i64;
    let at = match position {
        None => len,
        Some(position) if position >= 0 => position.min(len),
        Some(position) => (len + position).max(0),
    };
    let at = at as usize;
    array.splice(at..at, items);
    Ok(())
}

fn add_to_set(record: &mut bson::Document, target: &str, value: &Bson) -> DocumentResult<()> {
    let (items, _) = each(value);
    let array = array_at(record, target, "$addToSet")?;
    for item in items {
        if !array.iter().any(|existing| bson_equal(existing, &item)) {
            array.push(item);
        }
    }
    Ok(())
}

fn pull_all(record: &mut bson::Document, target: &str, value: &Bson) -> DocumentResult<()> {
    let Bson::Array(values) = value else {
        return Err(malformed("$pullAll", "operand must be an array"));
    };
    let array = array_at(record, target, "$pullAll")?;
    array.retain(|item| !values.iter().any(|value| bson_equal(item, value)));
    Ok(())
}

fn pop(record: &mut bson::Document, target: &str, value: &Bson) -> DocumentResult<()> {
    let direction = bson_as_f64(value).ok_or_else(|| malformed("$pop", "operand must be 1 or -1"))?;
    let array = array_at(record, target, "$pop")?;
    if array.is_empty() {
        return Ok(());
    }
    if direction < 0.0 {
        array.remove(0);
    } else {
        array.pop();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;

    #[test]
    fn set_and_unset_dotted_paths() {
        let mut record = doc! { "name": "a", "nested": { "age": 1, "keep": true } };
        let changed = apply_update(
            &mut record,
            &doc! { "$set": { "nested.age": 2 }, "$unset": { "name": 1 } },
        )
        .unwrap();

        assert!(changed);
        assert_eq!(record, doc! { "nested": { "age": 2, "keep": true } });
    }

    #[test]
    fn array_operators() {
        let mut record = doc! { "tags": ["b", "c"], "nums": [1, 2, 3] };
        apply_update(
            &mut record,
            &doc! {
                "$push": { "tags": { "$each": ["a"], "$position": 0 } },
                "$pullAll": { "nums": [2] },
            },
        )
        .unwrap();
        assert_eq!(record, doc! { "tags": ["a", "b", "c"], "nums": [1, 3] });

        apply_update(
            &mut record,
            &doc! {
                "$addToSet": { "tags": { "$each": ["a", "d"] } },
                "$pop": { "nums": -1 },
            },
        )
        .unwrap();
        assert_eq!(record, doc! { "tags": ["a", "b", "c", "d"], "nums": [3] });

        apply_update(&mut record, &doc! { "$push": { "fresh": 1 } }).unwrap();
        assert_eq!(record.get_array("fresh").unwrap(), &vec![Bson::Int32(1)]);
    }

    #[test]
    fn negative_positions_count_from_the_end() {
        let mut record = doc! { "tags": ["a", "d"] };
        apply_update(
            &mut record,
            &doc! { "$push": { "tags": { "$each": ["b", "c"], "$position": -1 } } },
        )
        .unwrap();
        assert_eq!(record, doc! { "tags": ["a", "b", "c", "d"] });
    }

    #[test]
    fn unchanged_records_report_no_modification() {
        let mut record = doc! { "tags": ["a"] };
        let changed = apply_update(&mut record, &doc! { "$addToSet": { "tags": { "$each": ["a"] } } }).unwrap();
        assert!(!changed);
    }

    #[test]
    fn bad_updates_are_rejected() {
        let mut record = doc! { "name": "a" };
        assert!(matches!(
            apply_update(&mut record, &doc! { "$push": { "name": 1 } }),
            Err(DocumentError::Backend(_))
        ));
        assert!(matches!(
            apply_update(&mut record, &doc! { "$rename": { "name": "n" } }),
            Err(DocumentError::Backend(_))
        ));

        let mut record = doc! { "tags": ["a"] };
        assert!(matches!(
            apply_update(&mut record, &doc! { "$set": { "tags.100000000": "z" } }),
            Err(DocumentError::Backend(_))
        ));
    }

    #[test]
    fn filters_match_by_value() {
        let record = doc! { "_id": 1, "nested": { "age": 2.0 } };
        assert!(matches(&record, &doc! { "_id": 1, "nested.age": 2 }));
        assert!(!matches(&record, &doc! { "_id": 2 }));
    }
}
