//! Analyzer trait definitions
//!
//! Every secondary analysis, heuristic or model-backed, sits behind
//! [`BiasAnalyzer`] so the job queue never knows which one it is calling.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::schema::types::{SchemaVersion, TypedAttributeMap};
use crate::types::{AnalysisType, JobId, SetId};

// ─────────────────────────────────────────────────────────────────
// Request / Finding
// ─────────────────────────────────────────────────────────────────

/// Input for one analysis call
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRequest {
    pub job_id: JobId,
    pub attribute_set: SetId,
    pub analysis: AnalysisType,
    pub schema_version: SchemaVersion,
    pub attributes: TypedAttributeMap,
}

/// What an analyzer reports for one analysis type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisFinding {
    pub detected: bool,

    /// In [0, 1]
    pub confidence: f64,

    #[serde(default)]
    pub indicators: Vec<String>,
}

impl AnalysisFinding {
    /// Nothing relevant to look at
    pub fn none() -> Self {
        Self {
            detected: false,
            confidence: 0.0,
            indicators: Vec::new(),
        }
    }

    /// Clamp confidence into range, treating NaN as zero
    pub fn normalized(mut self) -> Self {
        self.confidence = if self.confidence.is_nan() {
            0.0
        } else {
            self.confidence.clamp(0.0, 1.0)
        };
        self
    }
}

// ─────────────────────────────────────────────────────────────────
// Health
// ─────────────────────────────────────────────────────────────────

/// Health status of an analyzer
#[derive(Debug, Clone)]
pub struct AnalyzerHealth {
    /// Whether the analyzer can take calls
    pub operational: bool,

    /// Any error message
    pub error: Option<String>,
}

impl Default for AnalyzerHealth {
    fn default() -> Self {
        Self {
            operational: true,
            error: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Analyzer Trait
// ─────────────────────────────────────────────────────────────────

/// A pluggable secondary analysis
///
/// Errors must come back as [`crate::error::Error::JobExecution`] with
/// `transient` set when a later attempt could succeed, so the queue can tell
/// retries from dead letters.
#[async_trait]
pub trait BiasAnalyzer: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    fn supports(&self, analysis: AnalysisType) -> bool;

    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisFinding>;

    async fn health_check(&self) -> AnalyzerHealth {
        AnalyzerHealth::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finding_normalized() {
        let f = AnalysisFinding {
            detected: true,
            confidence: 1.7,
            indicators: vec![],
        }
        .normalized();
        assert_eq!(f.confidence, 1.0);

        let f = AnalysisFinding {
            detected: false,
            confidence: f64::NAN,
            indicators: vec![],
        }
        .normalized();
        assert_eq!(f.confidence, 0.0);
    }

    #[test]
    fn test_finding_parses_without_indicators() {
        let f: AnalysisFinding =
            serde_json::from_str(r#"{"detected":true,"confidence":0.4}"#).unwrap();
        assert!(f.detected);
        assert!(f.indicators.is_empty());
    }
}
