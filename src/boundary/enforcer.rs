//! Boundary enforcer
//!
//! Splits an incoming attribute map into schema-valid attributes, rejected
//! keys and candidate keys. Decision order per key: deny-list, then schema
//! presence (with type coercion), then candidate. Every key lands in exactly
//! one bucket.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::flatten::{flatten, FlatEntry};
use crate::error::Error;
use crate::schema::types::{
    root_segment, AttributeSchema, AttributeValue, SchemaVersion, TypedAttributeMap,
};
use crate::schema::SchemaRegistry;

/// Identity-bearing keys refused regardless of schema presence
pub const DEFAULT_DENY_LIST: &[&str] = &[
    "name",
    "first_name",
    "last_name",
    "full_name",
    "username",
    "email",
    "*.email",
    "user",
    "user_id",
    "session",
    "session_id",
    "phone",
    "address",
    "ip",
    "ip_address",
    "password",
    "token",
    "api_key",
];

// ─────────────────────────────────────────────────────────────────
// Deny List
// ─────────────────────────────────────────────────────────────────

/// Path patterns that are never research data
///
/// Patterns are dotted; `*` matches any single segment. A pattern matches a
/// path when it matches the path's leading segments, so `user` covers
/// `user.email` as well.
#[derive(Debug, Clone)]
pub struct DenyList {
    patterns: Vec<Vec<String>>,
}

impl DenyList {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| {
                    p.as_ref()
                        .trim()
                        .to_lowercase()
                        .split('.')
                        .map(str::to_string)
                        .collect()
                })
                .filter(|p: &Vec<String>| p.iter().all(|s| !s.is_empty()))
                .collect(),
        }
    }

    pub fn empty() -> Self {
        Self { patterns: Vec::new() }
    }

    /// First pattern matching the path, rendered back to text
    pub fn matching(&self, path: &str) -> Option<String> {
        let segments: Vec<&str> = path.split('.').collect();
        self.patterns
            .iter()
            .find(|pattern| {
                pattern.len() <= segments.len()
                    && pattern
                        .iter()
                        .zip(&segments)
                        .all(|(p, s)| p == "*" || p == s)
            })
            .map(|p| p.join("."))
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl Default for DenyList {
    fn default() -> Self {
        Self::new(DEFAULT_DENY_LIST)
    }
}

// ─────────────────────────────────────────────────────────────────
// Classification
// ─────────────────────────────────────────────────────────────────

/// Why a key was refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RejectionKind {
    DenyListed { pattern: String },
    TypeMismatch,
    MalformedKey,
    Duplicate,
}

/// A refused key with its human-readable reason
#[derive(Debug, Clone, Serialize)]
pub struct RejectedKey {
    pub key: String,
    pub reason: String,
    #[serde(flatten)]
    pub kind: RejectionKind,
}

impl From<&RejectedKey> for Error {
    fn from(r: &RejectedKey) -> Self {
        Error::BoundaryViolation {
            key: r.key.clone(),
            reason: r.reason.clone(),
        }
    }
}

/// An unknown key routed to schema evolution
#[derive(Debug, Clone, Serialize)]
pub struct CandidateKey {
    pub path: String,
    pub value: Value,
}

/// Result of classifying one attribute map
#[derive(Debug, Clone, Serialize)]
pub struct Classification {
    pub schema_version: SchemaVersion,
    pub valid: TypedAttributeMap,
    pub rejected: Vec<RejectedKey>,
    pub candidates: Vec<CandidateKey>,
}

impl Classification {
    fn new(schema_version: SchemaVersion) -> Self {
        Self {
            schema_version,
            valid: TypedAttributeMap::new(),
            rejected: Vec::new(),
            candidates: Vec::new(),
        }
    }

    /// Number of keys classified
    pub fn total(&self) -> usize {
        self.valid.len() + self.rejected.len() + self.candidates.len()
    }

    fn reject(&mut self, key: String, kind: RejectionKind, reason: String) {
        self.rejected.push(RejectedKey { key, reason, kind });
    }
}

// ─────────────────────────────────────────────────────────────────
// Enforcer
// ─────────────────────────────────────────────────────────────────

/// Classifies producer maps against the active schema and the deny-list
#[derive(Debug)]
pub struct BoundaryEnforcer {
    registry: Arc<SchemaRegistry>,
    deny_list: DenyList,
    extra_roots: BTreeSet<String>,
}

impl BoundaryEnforcer {
    pub fn new(registry: Arc<SchemaRegistry>, deny_list: DenyList) -> Self {
        Self {
            registry,
            deny_list,
            extra_roots: BTreeSet::new(),
        }
    }

    /// Treat additional root segments as embodiment namespace
    pub fn with_extra_roots<I: IntoIterator<Item = String>>(mut self, roots: I) -> Self {
        self.extra_roots.extend(roots.into_iter().map(|r| r.to_lowercase()));
        self
    }

    pub fn deny_list(&self) -> &DenyList {
        &self.deny_list
    }

    /// Classify against the registry's active schema
    pub fn classify(&self, attributes: &Map<String, Value>) -> Classification {
        let (_, schema) = self.registry.get_active_schema();
        self.classify_with(&schema, attributes)
    }

    /// Classify any JSON value; a non-object is rejected as a whole
    pub fn classify_json(&self, attributes: &Value) -> Classification {
        match attributes.as_object() {
            Some(map) => self.classify(map),
            None => {
                let mut out = Classification::new(self.registry.active_version());
                out.reject(
                    "$".to_string(),
                    RejectionKind::MalformedKey,
                    "attribute payload is not an object".to_string(),
                );
                log_rejections(&out.rejected);
                out
            }
        }
    }

    /// Classify against a specific schema version
    pub fn classify_with(
        &self,
        schema: &AttributeSchema,
        attributes: &Map<String, Value>,
    ) -> Classification {
        let mut out = Classification::new(schema.version());
        let mut seen = BTreeSet::new();

        for FlatEntry { raw_key, path, value } in flatten(attributes) {
            let Some(path) = path else {
                out.reject(
                    raw_key,
                    RejectionKind::MalformedKey,
                    "key cannot be expressed as an attribute path".to_string(),
                );
                continue;
            };

            if let Some(pattern) = self.deny_list.matching(&path) {
                out.reject(
                    raw_key,
                    RejectionKind::DenyListed { pattern: pattern.clone() },
                    format!("matches deny-list pattern '{}'", pattern),
                );
                continue;
            }

            if !seen.insert(path.clone()) {
                out.reject(
                    raw_key,
                    RejectionKind::Duplicate,
                    format!("duplicates attribute path '{}'", path),
                );
                continue;
            }

            match schema.field(&path) {
                Some(spec) => match AttributeValue::coerce(&value, spec) {
                    Ok(typed) => {
                        out.valid.insert(path, typed);
                    }
                    Err(reason) => out.reject(raw_key, RejectionKind::TypeMismatch, reason),
                },
                None => out.candidates.push(CandidateKey { path, value }),
            }
        }

        log_rejections(&out.rejected);
        debug!(
            schema = %out.schema_version,
            valid = out.valid.len(),
            rejected = out.rejected.len(),
            candidates = out.candidates.len(),
            "Attribute map classified"
        );
        out
    }

    /// Coarse routing check: does any key fall in the embodiment namespace?
    pub fn is_embodiment_data(&self, attributes: &Map<String, Value>) -> bool {
        let (_, schema) = self.registry.get_active_schema();
        flatten(attributes).iter().any(|entry| {
            entry.path.as_deref().map_or(false, |path| {
                self.deny_list.matching(path).is_none()
                    && (schema.in_namespace(path) || self.extra_roots.contains(root_segment(path)))
            })
        })
    }
}

fn log_rejections(rejected: &[RejectedKey]) {
    for r in rejected {
        warn!(key = %r.key, "{}", Error::from(r).format_for_log());
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::source::fallback_schema;
    use serde_json::json;

    fn enforcer() -> BoundaryEnforcer {
        let registry = Arc::new(SchemaRegistry::with_schema(fallback_schema()));
        BoundaryEnforcer::new(registry, DenyList::default())
    }

    fn map(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_deny_list_patterns() {
        let deny = DenyList::default();
        assert_eq!(deny.matching("email").as_deref(), Some("email"));
        assert_eq!(deny.matching("contact.email").as_deref(), Some("*.email"));
        assert_eq!(deny.matching("user.profile.age").as_deref(), Some("user"));
        assert!(deny.matching("age").is_none());
        assert!(deny.matching("username_style").is_none());
    }

    #[test]
    fn test_classify_buckets() {
        let out = enforcer().classify(&map(json!({
            "age": "adult",
            "clothing": { "items": ["coat", "boots"] },
            "hair_color": "red",
            "email": "a@b.c"
        })));
        assert_eq!(out.valid.len(), 2);
        assert_eq!(
            out.valid.get("clothing.items"),
            Some(&AttributeValue::TextList(vec!["coat".into(), "boots".into()]))
        );
        assert_eq!(out.candidates.len(), 1);
        assert_eq!(out.candidates[0].path, "hair_color");
        assert_eq!(out.rejected.len(), 1);
        assert_eq!(out.rejected[0].key, "email");
        assert_eq!(out.total(), 4);
    }

    #[test]
    fn test_deny_list_wins_over_schema() {
        let schema = crate::schema::types::AttributeSchema::from_fields(
            SchemaVersion::new(1, 0),
            vec![crate::schema::types::FieldSpec::new(
                "name",
                crate::schema::types::AttributeType::Text,
            )],
        );
        let registry = Arc::new(SchemaRegistry::with_schema(schema));
        let enforcer = BoundaryEnforcer::new(registry, DenyList::default());
        let out = enforcer.classify(&map(json!({ "name": "Ada" })));
        assert!(out.valid.is_empty());
        assert!(matches!(out.rejected[0].kind, RejectionKind::DenyListed { .. }));
    }

    #[test]
    fn test_type_mismatch_is_rejected_with_reason() {
        let out =
            enforcer().classify(&map(json!({ "body": { "visible_disability": "sometimes" } })));
        assert_eq!(out.rejected.len(), 1);
        assert_eq!(out.rejected[0].kind, RejectionKind::TypeMismatch);
        assert!(out.rejected[0].reason.contains("expected boolean"));
    }

    #[test]
    fn test_duplicate_and_malformed_keys() {
        let out = enforcer().classify(&map(json!({
            "Age": "adult",
            "age": "child",
            "🙂": "x"
        })));
        assert_eq!(out.total(), 3);
        assert_eq!(out.valid.len(), 1);
        let kinds: Vec<_> = out.rejected.iter().map(|r| r.kind.clone()).collect();
        assert!(kinds.contains(&RejectionKind::Duplicate));
        assert!(kinds.contains(&RejectionKind::MalformedKey));
    }

    #[test]
    fn test_non_object_payload() {
        let out = enforcer().classify_json(&json!(["age"]));
        assert_eq!(out.total(), 1);
        assert_eq!(out.rejected[0].key, "$");
    }

    #[test]
    fn test_is_embodiment_data() {
        let e = enforcer();
        assert!(e.is_embodiment_data(&map(json!({ "hair": { "color": "red" } }))));
        assert!(!e.is_embodiment_data(&map(json!({ "email": "x", "theme": "dark" }))));

        let e = enforcer().with_extra_roots(vec!["voice".to_string()]);
        assert!(e.is_embodiment_data(&map(json!({ "voice": "deep" }))));
    }

    #[test]
    fn test_rejection_converts_to_boundary_error() {
        let r = RejectedKey {
            key: "email".into(),
            reason: "matches deny-list pattern 'email'".into(),
            kind: RejectionKind::DenyListed { pattern: "email".into() },
        };
        let err = Error::from(&r);
        assert_eq!(err.code(), crate::error::ErrorCode::BoundaryViolation);
    }
}
