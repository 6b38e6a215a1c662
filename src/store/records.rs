//! Stored research records
//!
//! Everything here is keyed by pseudonym and immutable once appended.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::pseudonym::Pseudonym;
use crate::schema::types::{SchemaVersion, TypedAttributeMap};
use crate::types::{AnalysisType, JobId, ResultId, SetId, SourceTag};

/// Validated attributes from one producer emission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeSet {
    pub id: SetId,
    pub pseudonym: Pseudonym,
    pub source: SourceTag,
    pub schema_version: SchemaVersion,
    pub values: TypedAttributeMap,
    pub created_at: DateTime<Utc>,
}

impl AttributeSet {
    pub fn new(
        pseudonym: Pseudonym,
        source: SourceTag,
        schema_version: SchemaVersion,
        values: TypedAttributeMap,
    ) -> Self {
        Self {
            id: SetId::new(),
            pseudonym,
            source,
            schema_version,
            values,
            created_at: Utc::now(),
        }
    }
}

/// Outcome of one analysis type for one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasResult {
    pub id: ResultId,
    pub job_id: JobId,
    pub pseudonym: Pseudonym,
    pub attribute_set: SetId,
    pub analysis: AnalysisType,
    pub detected: bool,
    pub confidence: f64,
    pub indicators: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Record counts, store-wide or per pseudonym
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecordCounts {
    pub attribute_sets: usize,
    pub diffs: usize,
    pub jobs: usize,
    pub results: usize,
}

impl RecordCounts {
    pub fn total(&self) -> usize {
        self.attribute_sets + self.diffs + self.jobs + self.results
    }
}

/// What an erasure removed
#[derive(Debug, Clone, Serialize)]
pub struct ErasureReport {
    pub pseudonym: Pseudonym,
    pub removed: RecordCounts,
    pub erased_at: DateTime<Utc>,
}
