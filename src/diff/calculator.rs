//! Diff calculator
//!
//! Compares a description attribute set with an artifact attribute set,
//! field by field, over the schema's declared fields.
//!
//! Classification per field present in either set:
//! - equivalent in both: `match`
//! - description only: `missing`
//! - artifact only: `hallucination`
//! - in both with a type or value conflict: `hallucination`
//!
//! A value that does not conform to its declared type (and is not a
//! cross-source type conflict) counts as `missing`, with a warning, so one
//! malformed field never aborts the whole diff.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::schema::types::{AttributeSchema, AttributeValue, SchemaVersion};
use crate::store::{AttributeSet, Pseudonym};
use crate::types::{DiffId, SetId, SourceTag};

// ─────────────────────────────────────────────────────────────────
// Result Types
// ─────────────────────────────────────────────────────────────────

/// Per-field classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldClass {
    Match,
    Hallucination,
    Missing,
}

/// One compared field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub path: String,
    pub class: FieldClass,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<AttributeValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<AttributeValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// One comparison round; immutable once stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffResult {
    pub id: DiffId,
    pub pseudonym: Pseudonym,
    pub round: u32,
    pub description_set: SetId,
    pub artifact_set: SetId,
    pub schema_version: SchemaVersion,
    pub fields: Vec<FieldDiff>,
    /// matches / fields considered; None when no field was present in either set
    pub similarity: Option<f64>,
    pub matches: usize,
    pub hallucinations: usize,
    pub missing: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub computed_at: DateTime<Utc>,
}

impl DiffResult {
    pub fn field(&self, path: &str) -> Option<&FieldDiff> {
        self.fields.iter().find(|f| f.path == path)
    }

    pub fn class_of(&self, path: &str) -> Option<FieldClass> {
        self.field(path).map(|f| f.class)
    }

    pub fn considered(&self) -> usize {
        self.fields.len()
    }
}

// ─────────────────────────────────────────────────────────────────
// Calculator
// ─────────────────────────────────────────────────────────────────

/// Stateless field-by-field comparer
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffCalculator;

impl DiffCalculator {
    pub fn new() -> Self {
        Self
    }

    /// Compare two sets of the same session under `schema`
    pub fn compute_diff(
        &self,
        description: &AttributeSet,
        artifact: &AttributeSet,
        schema: &AttributeSchema,
        round: u32,
    ) -> Result<DiffResult> {
        if description.source != SourceTag::Description {
            return Err(Error::DiffComputation(format!(
                "set {} is tagged {}, expected description",
                description.id, description.source
            )));
        }
        if artifact.source != SourceTag::Artifact {
            return Err(Error::DiffComputation(format!(
                "set {} is tagged {}, expected artifact",
                artifact.id, artifact.source
            )));
        }
        if description.pseudonym != artifact.pseudonym {
            return Err(Error::DiffComputation(
                "attribute sets belong to different sessions".to_string(),
            ));
        }

        let mut warnings = Vec::new();
        for set in [description, artifact] {
            for path in set.values.keys().filter(|p| !schema.contains(p)) {
                warnings.push(format!(
                    "{} value '{}' is not declared in schema {}; ignored",
                    set.source,
                    path,
                    schema.version()
                ));
            }
        }

        let mut fields = Vec::new();
        for spec in schema.fields() {
            let d = description.values.get(&spec.path);
            let a = artifact.values.get(&spec.path);

            let (class, note) = match (d, a) {
                (None, None) => continue,
                (Some(d), Some(a)) => {
                    let (d_ok, a_ok) = (d.conforms_to(spec), a.conforms_to(spec));
                    if d.attribute_type() != a.attribute_type() {
                        (
                            FieldClass::Hallucination,
                            Some(format!(
                                "type conflict: description is {}, artifact is {}",
                                d.attribute_type(),
                                a.attribute_type()
                            )),
                        )
                    } else if d_ok && a_ok {
                        if d.equivalent(a) {
                            (FieldClass::Match, None)
                        } else {
                            (FieldClass::Hallucination, None)
                        }
                    } else {
                        (FieldClass::Missing, Some(malformed(spec.path.as_str(), spec.attr_type)))
                    }
                }
                (Some(d), None) => {
                    if d.conforms_to(spec) {
                        (FieldClass::Missing, None)
                    } else {
                        (FieldClass::Missing, Some(malformed(spec.path.as_str(), spec.attr_type)))
                    }
                }
                (None, Some(a)) => {
                    if a.conforms_to(spec) {
                        (FieldClass::Hallucination, None)
                    } else {
                        (FieldClass::Missing, Some(malformed(spec.path.as_str(), spec.attr_type)))
                    }
                }
            };

            if let Some(n) = note.as_ref().filter(|_| class == FieldClass::Missing) {
                warnings.push(n.clone());
            }

            fields.push(FieldDiff {
                path: spec.path.clone(),
                class,
                description: d.cloned(),
                artifact: a.cloned(),
                note,
            });
        }

        let count = |c: FieldClass| fields.iter().filter(|f| f.class == c).count();
        let (matches, hallucinations, missing) = (
            count(FieldClass::Match),
            count(FieldClass::Hallucination),
            count(FieldClass::Missing),
        );
        let similarity = if fields.is_empty() {
            None
        } else {
            Some(matches as f64 / fields.len() as f64)
        };

        for w in &warnings {
            warn!(pseudonym = %description.pseudonym, round, "{}", w);
        }
        debug!(
            pseudonym = %description.pseudonym,
            round,
            matches,
            hallucinations,
            missing,
            similarity = ?similarity,
            "Diff computed"
        );

        Ok(DiffResult {
            id: DiffId::new(),
            pseudonym: description.pseudonym.clone(),
            round,
            description_set: description.id,
            artifact_set: artifact.id,
            schema_version: schema.version(),
            fields,
            similarity,
            matches,
            hallucinations,
            missing,
            warnings,
            computed_at: Utc::now(),
        })
    }
}

fn malformed(path: &str, declared: crate::schema::types::AttributeType) -> String {
    format!("malformed value for '{}' (declared {}); counted as missing", path, declared)
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::types::{AttributeType, FieldSpec, TypedAttributeMap};

    fn schema() -> AttributeSchema {
        let mut age = FieldSpec::new("age", AttributeType::Text);
        age.allowed = Some(vec!["child".into(), "adult".into(), "senior".into()]);
        AttributeSchema::from_fields(
            SchemaVersion::new(1, 0),
            vec![
                age,
                FieldSpec::new("gender", AttributeType::Text),
                FieldSpec::new("accessories", AttributeType::TextList),
            ],
        )
    }

    fn set(source: SourceTag, values: &[(&str, AttributeValue)]) -> AttributeSet {
        let values: TypedAttributeMap = values
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        AttributeSet::new(
            Pseudonym::new("sess1").unwrap(),
            source,
            SchemaVersion::new(1, 0),
            values,
        )
    }

    fn text(s: &str) -> AttributeValue {
        AttributeValue::Text(s.to_string())
    }

    #[test]
    fn test_match_missing_hallucination() {
        let d = set(
            SourceTag::Description,
            &[
                ("age", text("adult")),
                ("accessories", AttributeValue::TextList(vec!["hat".into()])),
            ],
        );
        let a = set(SourceTag::Artifact, &[("age", text("Adult")), ("gender", text("female"))]);
        let diff = DiffCalculator::new().compute_diff(&d, &a, &schema(), 1).unwrap();

        assert_eq!(diff.class_of("age"), Some(FieldClass::Match));
        assert_eq!(diff.class_of("gender"), Some(FieldClass::Hallucination));
        assert_eq!(diff.class_of("accessories"), Some(FieldClass::Missing));
        assert_eq!(diff.considered(), 3);
        assert!((diff.similarity.unwrap() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_value_conflict_is_hallucination() {
        let d = set(SourceTag::Description, &[("gender", text("male"))]);
        let a = set(SourceTag::Artifact, &[("gender", text("female"))]);
        let diff = DiffCalculator::new().compute_diff(&d, &a, &schema(), 1).unwrap();
        assert_eq!(diff.class_of("gender"), Some(FieldClass::Hallucination));
        assert_eq!(diff.similarity, Some(0.0));
    }

    #[test]
    fn test_type_conflict_is_hallucination() {
        let d = set(SourceTag::Description, &[("gender", text("male"))]);
        let a = set(SourceTag::Artifact, &[("gender", AttributeValue::Number(1.0))]);
        let diff = DiffCalculator::new().compute_diff(&d, &a, &schema(), 1).unwrap();
        let field = diff.field("gender").unwrap();
        assert_eq!(field.class, FieldClass::Hallucination);
        assert!(field.note.as_deref().unwrap().contains("type conflict"));
    }

    #[test]
    fn test_malformed_value_defaults_to_missing() {
        let d = set(SourceTag::Description, &[("age", text("ancient"))]);
        let a = set(SourceTag::Artifact, &[("age", text("ancient"))]);
        let diff = DiffCalculator::new().compute_diff(&d, &a, &schema(), 1).unwrap();
        assert_eq!(diff.class_of("age"), Some(FieldClass::Missing));
        assert_eq!(diff.warnings.len(), 1);
    }

    #[test]
    fn test_empty_sets_have_undefined_similarity() {
        let d = set(SourceTag::Description, &[]);
        let a = set(SourceTag::Artifact, &[]);
        let diff = DiffCalculator::new().compute_diff(&d, &a, &schema(), 1).unwrap();
        assert!(diff.similarity.is_none());
        assert!(diff.fields.is_empty());
    }

    #[test]
    fn test_rejects_wrong_source_tags_and_sessions() {
        let d = set(SourceTag::Description, &[]);
        let a = set(SourceTag::Artifact, &[]);
        let calc = DiffCalculator::new();
        assert!(calc.compute_diff(&a, &d, &schema(), 1).is_err());

        let mut other = set(SourceTag::Artifact, &[]);
        other.pseudonym = Pseudonym::new("sess2").unwrap();
        assert!(matches!(
            calc.compute_diff(&d, &other, &schema(), 1),
            Err(Error::DiffComputation(_))
        ));
    }

    #[test]
    fn test_undeclared_values_are_ignored_with_warning() {
        let d = set(SourceTag::Description, &[("age", text("adult")), ("hair_color", text("red"))]);
        let a = set(SourceTag::Artifact, &[("age", text("adult"))]);
        let diff = DiffCalculator::new().compute_diff(&d, &a, &schema(), 2).unwrap();
        assert_eq!(diff.similarity, Some(1.0));
        assert_eq!(diff.round, 2);
        assert!(diff.warnings[0].contains("hair_color"));
    }
}
