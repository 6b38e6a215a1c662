//! Schema type definitions
//!
//! Versioned attribute schemas, declared field types, and the typed values
//! that flow through the boundary, diff and evolution layers.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

// ─────────────────────────────────────────────────────────────────
// Schema Version
// ─────────────────────────────────────────────────────────────────

/// Schema version: additive changes bump `minor`, breaking changes bump `major`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
}

impl SchemaVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// The next additive version
    pub fn next_minor(&self) -> Self {
        Self::new(self.major, self.minor + 1)
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for SchemaVersion {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('v');
        let (major, minor) = trimmed
            .split_once('.')
            .ok_or_else(|| format!("Invalid schema version '{}', expected MAJOR.MINOR", s))?;
        let major = major
            .parse()
            .map_err(|_| format!("Invalid major version in '{}'", s))?;
        let minor = minor
            .parse()
            .map_err(|_| format!("Invalid minor version in '{}'", s))?;
        Ok(Self { major, minor })
    }
}

impl TryFrom<String> for SchemaVersion {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SchemaVersion> for String {
    fn from(v: SchemaVersion) -> Self {
        v.to_string()
    }
}

// ─────────────────────────────────────────────────────────────────
// Attribute Types & Values
// ─────────────────────────────────────────────────────────────────

/// Declared type of an attribute path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    Text,
    Number,
    Boolean,
    TextList,
}

impl AttributeType {
    pub fn name(&self) -> &'static str {
        match self {
            AttributeType::Text => "text",
            AttributeType::Number => "number",
            AttributeType::Boolean => "boolean",
            AttributeType::TextList => "text_list",
        }
    }

    /// Guess the type a raw producer value would have
    pub fn infer(value: &serde_json::Value) -> Option<Self> {
        use serde_json::Value;
        match value {
            Value::Bool(_) => Some(AttributeType::Boolean),
            Value::Number(_) => Some(AttributeType::Number),
            Value::String(_) => Some(AttributeType::Text),
            Value::Array(items) if items.iter().all(|v| v.is_string()) => {
                Some(AttributeType::TextList)
            }
            _ => None,
        }
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Boolean(bool),
    Number(f64),
    Text(String),
    TextList(Vec<String>),
}

impl AttributeValue {
    pub fn attribute_type(&self) -> AttributeType {
        match self {
            AttributeValue::Boolean(_) => AttributeType::Boolean,
            AttributeValue::Number(_) => AttributeType::Number,
            AttributeValue::Text(_) => AttributeType::Text,
            AttributeValue::TextList(_) => AttributeType::TextList,
        }
    }

    /// Semantic equivalence: case/whitespace-insensitive text, order-insensitive lists
    pub fn equivalent(&self, other: &AttributeValue) -> bool {
        match (self, other) {
            (AttributeValue::Boolean(a), AttributeValue::Boolean(b)) => a == b,
            (AttributeValue::Number(a), AttributeValue::Number(b)) => (a - b).abs() < 1e-9,
            (AttributeValue::Text(a), AttributeValue::Text(b)) => normalize(a) == normalize(b),
            (AttributeValue::TextList(a), AttributeValue::TextList(b)) => {
                let a: BTreeSet<String> = a.iter().map(|s| normalize(s)).collect();
                let b: BTreeSet<String> = b.iter().map(|s| normalize(s)).collect();
                a == b
            }
            _ => false,
        }
    }

    /// Whether this value satisfies a field declaration
    pub fn conforms_to(&self, spec: &FieldSpec) -> bool {
        if self.attribute_type() != spec.attr_type {
            return false;
        }
        match self {
            AttributeValue::Number(n) => n.is_finite(),
            AttributeValue::Text(s) => spec.allows(s),
            AttributeValue::TextList(items) => items.iter().all(|s| spec.allows(s)),
            AttributeValue::Boolean(_) => true,
        }
    }

    /// Coerce a raw producer value into the declared type
    pub fn coerce(raw: &serde_json::Value, spec: &FieldSpec) -> std::result::Result<Self, String> {
        use serde_json::Value;

        let value = match (spec.attr_type, raw) {
            (_, Value::Null) => return Err("null value".to_string()),
            (AttributeType::Text, Value::String(s)) => AttributeValue::Text(s.trim().to_string()),
            (AttributeType::Number, Value::Number(n)) => match n.as_f64() {
                Some(f) => AttributeValue::Number(f),
                None => return Err(format!("number {} out of range", n)),
            },
            (AttributeType::Number, Value::String(s)) => match s.trim().parse::<f64>() {
                Ok(f) if f.is_finite() => AttributeValue::Number(f),
                _ => return Err(format!("type mismatch: expected number, got text '{}'", s)),
            },
            (AttributeType::Boolean, Value::Bool(b)) => AttributeValue::Boolean(*b),
            (AttributeType::Boolean, Value::String(s)) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" => AttributeValue::Boolean(true),
                "false" | "no" => AttributeValue::Boolean(false),
                _ => return Err(format!("type mismatch: expected boolean, got text '{}'", s)),
            },
            (AttributeType::TextList, Value::String(s)) => {
                AttributeValue::TextList(vec![s.trim().to_string()])
            }
            (AttributeType::TextList, Value::Array(items)) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match item.as_str() {
                        Some(s) => out.push(s.trim().to_string()),
                        None => {
                            return Err(
                                "type mismatch: expected text_list, got non-text element".to_string()
                            )
                        }
                    }
                }
                AttributeValue::TextList(out)
            }
            (expected, other) => {
                return Err(format!(
                    "type mismatch: expected {}, got {}",
                    expected,
                    json_kind(other)
                ))
            }
        };

        if value.conforms_to(spec) {
            Ok(value)
        } else {
            Err(format!("value not in allowed set for '{}'", spec.path))
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Boolean(b) => write!(f, "{}", b),
            AttributeValue::Number(n) => write!(f, "{}", n),
            AttributeValue::Text(s) => write!(f, "{}", s),
            AttributeValue::TextList(items) => write!(f, "[{}]", items.join(", ")),
        }
    }
}

/// Schema-validated attribute map: path -> typed value
pub type TypedAttributeMap = BTreeMap<String, AttributeValue>;

fn normalize(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    use serde_json::Value;
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "text",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// Root segment of a dotted attribute path
pub fn root_segment(path: &str) -> &str {
    path.split('.').next().unwrap_or(path)
}

/// Check a dotted path: lowercase `[a-z0-9_]` segments
pub fn is_valid_path(path: &str) -> bool {
    !path.is_empty()
        && path.split('.').all(|seg| {
            !seg.is_empty()
                && seg
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        })
}

// ─────────────────────────────────────────────────────────────────
// Field Specification
// ─────────────────────────────────────────────────────────────────

/// One allowed attribute path with its declared type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub path: String,

    #[serde(rename = "type")]
    pub attr_type: AttributeType,

    /// Allowed values for text fields (case-insensitive); None = free text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FieldSpec {
    pub fn new(path: impl Into<String>, attr_type: AttributeType) -> Self {
        Self {
            path: path.into(),
            attr_type,
            allowed: None,
            description: None,
        }
    }

    fn allows(&self, value: &str) -> bool {
        match &self.allowed {
            None => true,
            Some(allowed) => {
                let v = normalize(value);
                allowed.iter().any(|a| normalize(a) == v)
            }
        }
    }

    /// A field may evolve only by widening its allowed set
    fn is_compatible_successor(&self, next: &FieldSpec) -> bool {
        if self.attr_type != next.attr_type {
            return false;
        }
        match (&self.allowed, &next.allowed) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(old), Some(new)) => old
                .iter()
                .all(|o| new.iter().any(|n| normalize(n) == normalize(o))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Schema Document (wire / file format)
// ─────────────────────────────────────────────────────────────────

/// Raw schema document as read from a source, before validation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaDocument {
    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub namespace_roots: Vec<String>,

    #[serde(default)]
    pub fields: Vec<FieldDocument>,
}

/// Raw field entry; `type` stays optional so a missing declaration is reported, not a parse error
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldDocument {
    #[serde(default)]
    pub path: Option<String>,

    #[serde(rename = "type", default)]
    pub attr_type: Option<AttributeType>,

    #[serde(default)]
    pub allowed: Option<Vec<String>>,

    #[serde(default)]
    pub description: Option<String>,
}

impl SchemaDocument {
    /// Parse TOML content into a document
    pub fn parse(content: &str) -> std::result::Result<Self, String> {
        toml::from_str(content).map_err(|e| format!("invalid TOML: {}", e))
    }

    /// Validate structure and build an immutable schema
    pub fn into_schema(self) -> Result<AttributeSchema> {
        let mut problems = Vec::new();

        let version = match self.version.as_deref() {
            Some(v) => match v.parse::<SchemaVersion>() {
                Ok(v) => Some(v),
                Err(e) => {
                    problems.push(e);
                    None
                }
            },
            None => {
                problems.push("missing schema version".to_string());
                None
            }
        };

        if self.fields.is_empty() {
            problems.push("schema declares no fields".to_string());
        }

        let mut seen = BTreeSet::new();
        let mut fields = Vec::with_capacity(self.fields.len());
        for (idx, field) in self.fields.into_iter().enumerate() {
            let path = match field.path {
                Some(p) if is_valid_path(&p) => p,
                Some(p) => {
                    problems.push(format!("field #{} has invalid path '{}'", idx, p));
                    continue;
                }
                None => {
                    problems.push(format!("field #{} has no path", idx));
                    continue;
                }
            };
            if !seen.insert(path.clone()) {
                problems.push(format!("duplicate path '{}'", path));
                continue;
            }
            let attr_type = match field.attr_type {
                Some(t) => t,
                None => {
                    problems.push(format!("field '{}' has no declared type", path));
                    continue;
                }
            };
            if let Some(allowed) = &field.allowed {
                if allowed.is_empty() {
                    problems.push(format!("field '{}' has an empty allowed set", path));
                }
                if !matches!(attr_type, AttributeType::Text | AttributeType::TextList) {
                    problems.push(format!(
                        "field '{}' restricts values of a {} field",
                        path, attr_type
                    ));
                }
            }
            fields.push(FieldSpec {
                path,
                attr_type,
                allowed: field.allowed,
                description: field.description,
            });
        }

        for root in &self.namespace_roots {
            if !is_valid_path(root) || root.contains('.') {
                problems.push(format!("invalid namespace root '{}'", root));
            }
        }

        match version {
            Some(version) if problems.is_empty() => Ok(AttributeSchema::build(
                version,
                fields,
                self.namespace_roots.into_iter().collect(),
                None,
            )),
            _ => Err(Error::SchemaValidation { problems }),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Attribute Schema
// ─────────────────────────────────────────────────────────────────

/// An immutable, validated schema version
#[derive(Debug, Clone)]
pub struct AttributeSchema {
    version: SchemaVersion,
    fields: Vec<FieldSpec>,
    index: HashMap<String, usize>,
    namespace_roots: BTreeSet<String>,
    checksum: String,
    based_on: Option<SchemaVersion>,
    created_at: DateTime<Utc>,
}

impl AttributeSchema {
    fn build(
        version: SchemaVersion,
        fields: Vec<FieldSpec>,
        mut namespace_roots: BTreeSet<String>,
        based_on: Option<SchemaVersion>,
    ) -> Self {
        let index = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.path.clone(), i))
            .collect();
        for f in &fields {
            namespace_roots.insert(root_segment(&f.path).to_string());
        }
        let checksum = schema_checksum(version, &fields, &namespace_roots);
        Self {
            version,
            fields,
            index,
            namespace_roots,
            checksum,
            based_on,
            created_at: Utc::now(),
        }
    }

    /// Build a schema from already-validated fields
    pub(crate) fn from_fields(version: SchemaVersion, fields: Vec<FieldSpec>) -> Self {
        Self::build(version, fields, BTreeSet::new(), None)
    }

    pub fn version(&self) -> SchemaVersion {
        self.version
    }

    /// Declared fields, in declaration order
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field(&self, path: &str) -> Option<&FieldSpec> {
        self.index.get(path).map(|&i| &self.fields[i])
    }

    pub fn contains(&self, path: &str) -> bool {
        self.index.contains_key(path)
    }

    pub fn namespace_roots(&self) -> &BTreeSet<String> {
        &self.namespace_roots
    }

    /// Whether a key falls inside the embodiment namespace
    pub fn in_namespace(&self, path: &str) -> bool {
        self.namespace_roots.contains(root_segment(path))
    }

    /// SHA-256 over the canonical schema content
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn based_on(&self) -> Option<SchemaVersion> {
        self.based_on
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// New minor version with extra fields appended
    pub fn extended_with(&self, additions: Vec<FieldSpec>) -> Result<AttributeSchema> {
        let mut problems = Vec::new();
        let mut fields = self.fields.clone();
        for spec in additions {
            if !is_valid_path(&spec.path) {
                problems.push(format!("invalid path '{}'", spec.path));
            } else if self.contains(&spec.path) || fields.iter().any(|f| f.path == spec.path) {
                problems.push(format!("duplicate path '{}'", spec.path));
            } else {
                fields.push(spec);
            }
        }
        if !problems.is_empty() {
            return Err(Error::SchemaValidation { problems });
        }
        Ok(Self::build(
            self.version.next_minor(),
            fields,
            self.namespace_roots.clone(),
            Some(self.version),
        ))
    }

    /// Re-stamp this schema as a successor of `base`
    pub(crate) fn rebased_on(mut self, base: SchemaVersion) -> Self {
        self.based_on = Some(base);
        self
    }

    /// Check that every field of `base` survives unchanged (types) in `self`
    pub fn additive_problems(&self, base: &AttributeSchema) -> Vec<String> {
        let mut problems = Vec::new();
        for old in base.fields() {
            match self.field(&old.path) {
                None => problems.push(format!("field '{}' removed", old.path)),
                Some(new) if !old.is_compatible_successor(new) => {
                    problems.push(format!("field '{}' retyped or narrowed", old.path))
                }
                Some(_) => {}
            }
        }
        problems
    }

    /// Whether a typed map is valid under this schema
    pub fn validate_values(
        &self,
        values: &TypedAttributeMap,
    ) -> std::result::Result<(), Vec<String>> {
        let problems: Vec<String> = values
            .iter()
            .filter_map(|(path, value)| match self.field(path) {
                None => Some(format!("'{}' is not declared in schema {}", path, self.version)),
                Some(spec) if !value.conforms_to(spec) => Some(format!(
                    "'{}' does not conform to declared type {}",
                    path, spec.attr_type
                )),
                Some(_) => None,
            })
            .collect();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }

    /// Render back to the document format
    pub fn to_document(&self) -> SchemaDocument {
        SchemaDocument {
            version: Some(self.version.to_string()),
            namespace_roots: self.namespace_roots.iter().cloned().collect(),
            fields: self
                .fields
                .iter()
                .map(|f| FieldDocument {
                    path: Some(f.path.clone()),
                    attr_type: Some(f.attr_type),
                    allowed: f.allowed.clone(),
                    description: f.description.clone(),
                })
                .collect(),
        }
    }
}

/// Journaled form of a registered schema version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaRecord {
    #[serde(flatten)]
    pub document: SchemaDocument,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub based_on: Option<SchemaVersion>,

    pub checksum: String,
}

impl SchemaRecord {
    pub fn version(&self) -> Option<SchemaVersion> {
        self.document.version.as_deref().and_then(|v| v.parse().ok())
    }

    /// Rebuild the schema; fails when the content no longer matches its checksum
    pub fn into_schema(self) -> Result<AttributeSchema> {
        let schema = self.document.into_schema()?;
        if schema.checksum() != self.checksum {
            return Err(Error::SchemaValidation {
                problems: vec![format!(
                    "schema {} does not match its journaled checksum",
                    schema.version()
                )],
            });
        }
        Ok(match self.based_on {
            Some(base) => schema.rebased_on(base),
            None => schema,
        })
    }
}

impl From<&AttributeSchema> for SchemaRecord {
    fn from(schema: &AttributeSchema) -> Self {
        Self {
            document: schema.to_document(),
            based_on: schema.based_on(),
            checksum: schema.checksum().to_string(),
        }
    }
}

/// SHA-256 of raw source content, hex encoded
pub fn content_checksum(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

fn schema_checksum(
    version: SchemaVersion,
    fields: &[FieldSpec],
    roots: &BTreeSet<String>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(version.to_string().as_bytes());
    for f in fields {
        hasher.update(b"\n");
        hasher.update(f.path.as_bytes());
        hasher.update(b":");
        hasher.update(f.attr_type.name().as_bytes());
        if let Some(allowed) = &f.allowed {
            let mut sorted: Vec<String> = allowed.iter().map(|a| normalize(a)).collect();
            sorted.sort();
            hasher.update(sorted.join("|").as_bytes());
        }
    }
    for root in roots {
        hasher.update(b"\nroot:");
        hasher.update(root.as_bytes());
    }
    hex::encode(hasher.finalize())
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(content: &str) -> Result<AttributeSchema> {
        SchemaDocument::parse(content).unwrap().into_schema()
    }

    #[test]
    fn test_version_parse_and_order() {
        let v: SchemaVersion = "1.2".parse().unwrap();
        assert_eq!(v, SchemaVersion::new(1, 2));
        assert_eq!("v2.0".parse::<SchemaVersion>().unwrap(), SchemaVersion::new(2, 0));
        assert!(SchemaVersion::new(1, 10) > SchemaVersion::new(1, 9));
        assert!(SchemaVersion::new(2, 0) > SchemaVersion::new(1, 99));
        assert!("1".parse::<SchemaVersion>().is_err());
        assert_eq!(v.next_minor().to_string(), "1.3");
    }

    #[test]
    fn test_document_validation_reports_all_problems() {
        let err = doc(r#"
version = "1.0"
[[fields]]
path = "age"
type = "text"
[[fields]]
path = "age"
type = "text"
[[fields]]
path = "gender"
"#)
        .unwrap_err();
        match err {
            Error::SchemaValidation { problems } => {
                assert!(problems.iter().any(|p| p.contains("duplicate path 'age'")));
                assert!(problems.iter().any(|p| p.contains("'gender' has no declared type")));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_namespace_includes_field_roots() {
        let schema = doc(r#"
version = "1.0"
namespace_roots = ["hair"]
[[fields]]
path = "clothing.style"
type = "text"
"#)
        .unwrap();
        assert!(schema.in_namespace("clothing.items"));
        assert!(schema.in_namespace("hair.color"));
        assert!(!schema.in_namespace("user.email"));
    }

    #[test]
    fn test_coerce_types() {
        let num = FieldSpec::new("height_cm", AttributeType::Number);
        assert_eq!(
            AttributeValue::coerce(&json!("172"), &num).unwrap(),
            AttributeValue::Number(172.0)
        );
        assert!(AttributeValue::coerce(&json!("tall"), &num).is_err());

        let list = FieldSpec::new("accessories", AttributeType::TextList);
        assert_eq!(
            AttributeValue::coerce(&json!("glasses"), &list).unwrap(),
            AttributeValue::TextList(vec!["glasses".into()])
        );
        assert!(AttributeValue::coerce(&json!([1, 2]), &list).is_err());

        let text = FieldSpec::new("age", AttributeType::Text);
        assert!(AttributeValue::coerce(&json!(null), &text).is_err());
        assert!(AttributeValue::coerce(&json!(true), &text)
            .unwrap_err()
            .contains("expected text"));
    }

    #[test]
    fn test_allowed_values_case_insensitive() {
        let mut spec = FieldSpec::new("age", AttributeType::Text);
        spec.allowed = Some(vec!["adult".into(), "child".into()]);
        assert!(AttributeValue::coerce(&json!("Adult"), &spec).is_ok());
        assert!(AttributeValue::coerce(&json!("ancient"), &spec).is_err());
    }

    #[test]
    fn test_equivalence() {
        let a = AttributeValue::Text("Young  Adult".into());
        let b = AttributeValue::Text("young adult".into());
        assert!(a.equivalent(&b));

        let l1 = AttributeValue::TextList(vec!["Hat".into(), "scarf".into()]);
        let l2 = AttributeValue::TextList(vec!["scarf".into(), "hat".into()]);
        assert!(l1.equivalent(&l2));

        assert!(!AttributeValue::Text("1".into()).equivalent(&AttributeValue::Number(1.0)));
    }

    #[test]
    fn test_extension_is_additive() {
        let base = doc(r#"
version = "1.0"
[[fields]]
path = "age"
type = "text"
"#)
        .unwrap();
        let next = base
            .extended_with(vec![FieldSpec::new("hair_color", AttributeType::Text)])
            .unwrap();
        assert_eq!(next.version(), SchemaVersion::new(1, 1));
        assert_eq!(next.based_on(), Some(SchemaVersion::new(1, 0)));
        assert!(next.additive_problems(&base).is_empty());
        assert!(!base.additive_problems(&next).is_empty());
        assert_ne!(base.checksum(), next.checksum());

        assert!(base
            .extended_with(vec![FieldSpec::new("age", AttributeType::Number)])
            .is_err());
    }

    #[test]
    fn test_retyping_is_not_additive() {
        let base = doc("version = \"1.0\"\n[[fields]]\npath = \"age\"\ntype = \"text\"\n").unwrap();
        let retyped =
            doc("version = \"1.1\"\n[[fields]]\npath = \"age\"\ntype = \"number\"\n").unwrap();
        let problems = retyped.additive_problems(&base);
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("retyped"));
    }

    #[test]
    fn test_document_round_trip_keeps_checksum() {
        let schema = doc(include_str!("../../config/schema/default.toml")).unwrap();
        let rendered = toml::to_string(&schema.to_document()).unwrap();
        let reparsed = doc(&rendered).unwrap();
        assert_eq!(schema.checksum(), reparsed.checksum());
    }

    #[test]
    fn test_record_keeps_lineage_and_rejects_tampering() {
        let base = doc("version = \"1.0\"\n[[fields]]\npath = \"age\"\ntype = \"text\"\n").unwrap();
        let next = base
            .extended_with(vec![FieldSpec::new("tattoo_style", AttributeType::Text)])
            .unwrap();

        let line = serde_json::to_string(&SchemaRecord::from(&next)).unwrap();
        let record: SchemaRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(record.version(), Some(SchemaVersion::new(1, 1)));
        let restored = record.clone().into_schema().unwrap();
        assert_eq!(restored.checksum(), next.checksum());
        assert_eq!(restored.based_on(), Some(SchemaVersion::new(1, 0)));

        let mut tampered = record;
        tampered.document.fields.pop();
        assert!(matches!(tampered.into_schema(), Err(Error::SchemaValidation { .. })));
    }
}
