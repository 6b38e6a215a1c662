//! Producer output flattening
//!
//! Producers may emit nested objects; the boundary works on dotted paths.

use serde_json::{Map, Value};

/// A leaf of a producer map, addressed by its dotted key
#[derive(Debug, Clone, PartialEq)]
pub struct FlatEntry {
    /// Key as the producer wrote it, joined with '.'
    pub raw_key: String,
    /// Normalized attribute path, or None if the key cannot form one
    pub path: Option<String>,
    pub value: Value,
}

/// Flatten nested objects into dotted leaves, in map order
///
/// Arrays and scalars are leaves. An empty object is kept as a leaf so
/// that every input key is accounted for.
pub fn flatten(map: &Map<String, Value>) -> Vec<FlatEntry> {
    let mut out = Vec::new();
    for (key, value) in map {
        walk(key.clone(), normalize_key(key).map(|s| vec![s]), value, &mut out);
    }
    out
}

fn walk(raw_key: String, segments: Option<Vec<String>>, value: &Value, out: &mut Vec<FlatEntry>) {
    match value {
        Value::Object(children) if !children.is_empty() => {
            for (child, child_value) in children {
                let child_segments = match (&segments, normalize_key(child)) {
                    (Some(parent), Some(seg)) => {
                        let mut s = parent.clone();
                        s.push(seg);
                        Some(s)
                    }
                    _ => None,
                };
                walk(format!("{}.{}", raw_key, child), child_segments, child_value, out);
            }
        }
        _ => out.push(FlatEntry {
            raw_key,
            path: segments.map(|s| s.join(".")),
            value: value.clone(),
        }),
    }
}

/// Normalize a key into one or more path segments
///
/// Lowercases, trims and maps spaces/hyphens to underscores. A key that
/// already contains dots is kept as a multi-segment path.
pub fn normalize_key(key: &str) -> Option<String> {
    let segments: Option<Vec<String>> = key.split('.').map(normalize_one).collect();
    segments.map(|s| s.join("."))
}

fn normalize_one(segment: &str) -> Option<String> {
    let normalized: String = segment
        .trim()
        .chars()
        .map(|c| match c {
            ' ' | '-' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect();
    let valid = !normalized.is_empty()
        && normalized
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    valid.then_some(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_flattens_nested_objects() {
        let entries = flatten(&map(json!({
            "age": "adult",
            "hair": { "color": "red", "Length": "short" },
            "accessories": ["hat"]
        })));
        let mut paths: Vec<_> = entries.iter().map(|e| e.path.clone().unwrap()).collect();
        paths.sort();
        assert_eq!(paths, vec!["accessories", "age", "hair.color", "hair.length"]);
        let accessories = entries.iter().find(|e| e.raw_key == "accessories").unwrap();
        assert_eq!(accessories.value, json!(["hat"]));
    }

    #[test]
    fn test_normalizes_keys() {
        assert_eq!(normalize_key("Hair Color").as_deref(), Some("hair_color"));
        assert_eq!(normalize_key("body.Skin-Tone").as_deref(), Some("body.skin_tone"));
        assert_eq!(normalize_key("emoji🙂"), None);
        assert_eq!(normalize_key("a..b"), None);
    }

    #[test]
    fn test_malformed_child_keeps_raw_key() {
        let entries = flatten(&map(json!({ "hair": { "🙂": "x" } })));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].raw_key, "hair.🙂");
        assert!(entries[0].path.is_none());
    }

    #[test]
    fn test_empty_object_is_a_leaf() {
        let entries = flatten(&map(json!({ "clothing": {} })));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path.as_deref(), Some("clothing"));
    }
}
