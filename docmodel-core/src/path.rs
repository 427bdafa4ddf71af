//! Dotted path helpers.
//!
//! Paths are dot-separated strings such as `nested.age` or `items.0.name`. Numeric
//! segments address array positions; every other segment is an object key.

/// Keys that must never be written through a path.
pub const RESERVED_KEYS: [&str; 3] = ["__proto__", "constructor", "prototype"];

/// Split a path into its segments.
#[inline]
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('.')
}

/// Join a prefix and a key; an empty prefix yields the key itself.
pub fn join(prefix: &str, key: &str) -> String {
    match (prefix.is_empty(), key.is_empty()) {
        (true, _) => key.to_string(),
        (_, true) => prefix.to_string(),
        _ => format!("{}.{}", prefix, key),
    }
}

/// The parent path, or `None` for a single segment.
pub fn parent(path: &str) -> Option<&str> {
    path.rfind('.').map(|idx| &path[..idx])
}

/// Split off the first segment: `a.b.c` -> (`a`, Some(`b.c`)).
pub fn split_first(path: &str) -> (&str, Option<&str>) {
    match path.find('.') {
        Some(idx) => (&path[..idx], Some(&path[idx + 1..])),
        None => (path, None),
    }
}

/// Strict ancestors of a path, shortest first: `a.b.c` -> [`a`, `a.b`].
pub fn ancestors(path: &str) -> Vec<&str> {
    path.match_indices('.')
        .map(|(idx, _)| &path[..idx])
        .collect()
}

/// Returns true if `ancestor` is a strict ancestor of `path`.
pub fn is_ancestor(ancestor: &str, path: &str) -> bool {
    ancestor.is_empty() && !path.is_empty()
        || path.len() > ancestor.len()
            && path.starts_with(ancestor)
            && path.as_bytes()[ancestor.len()] == b'.'
}

/// Returns true if the paths are equal or one contains the other.
pub fn overlaps(a: &str, b: &str) -> bool {
    a == b || is_ancestor(a, b) || is_ancestor(b, a)
}

/// Strip `prefix.` from `path`, returning the relative remainder.
pub fn relative_to<'a>(prefix: &str, path: &'a str) -> Option<&'a str> {
    if prefix.is_empty() {
        return Some(path);
    }
    if is_ancestor(prefix, path) {
        Some(&path[prefix.len() + 1..])
    } else {
        None
    }
}

/// Parse a positional segment.
#[inline]
pub fn as_index(segment: &str) -> Option<usize> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    segment.parse().ok()
}

/// Returns true if any segment of the path is a reserved key.
pub fn is_reserved(path: &str) -> bool {
    segments(path).any(|segment| RESERVED_KEYS.contains(&segment))
}

/// Drop positional segments so a document path maps onto its schema path:
/// `items.0.name` -> `items.name`.
pub fn schema_path(path: &str) -> String {
    segments(path)
        .filter(|segment| as_index(segment).is_none())
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ancestors_are_shortest_first() {
        assert_eq!(ancestors("a.b.c"), vec!["a", "a.b"]);
        assert!(ancestors("a").is_empty());
    }

    #[test]
    fn ancestor_checks_respect_segment_boundaries() {
        assert!(is_ancestor("nested", "nested.age"));
        assert!(!is_ancestor("nest", "nested.age"));
        assert!(!is_ancestor("nested", "nested"));
        assert!(is_ancestor("", "nested"));
        assert!(overlaps("a.b", "a"));
        assert!(!overlaps("a.b", "a.c"));
    }

    #[test]
    fn relative_paths() {
        assert_eq!(relative_to("items.0", "items.0.name"), Some("name"));
        assert_eq!(relative_to("", "name"), Some("name"));
        assert_eq!(relative_to("items.1", "items.0.name"), None);
    }

    #[test]
    fn positional_segments() {
        assert_eq!(as_index("12"), Some(12));
        assert_eq!(as_index("1a"), None);
        assert_eq!(as_index(""), None);
        assert_eq!(schema_path("items.3.tags.0"), "items.tags");
    }

    #[test]
    fn reserved_segments_are_detected() {
        assert!(is_reserved("__proto__.polluted"));
        assert!(is_reserved("a.constructor.prototype"));
        assert!(!is_reserved("proto.name"));
    }

    #[test]
    fn split_and_join() {
        assert_eq!(split_first("a.b.c"), ("a", Some("b.c")));
        assert_eq!(split_first("a"), ("a", None));
        assert_eq!(join("", "a"), "a");
        assert_eq!(join("a", "b"), "a.b");
        assert_eq!(parent("a.b.c"), Some("a.b"));
    }
}
