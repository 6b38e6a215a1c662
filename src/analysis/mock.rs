//! Mock analyzer for testing
//!
//! Per-type failure switches and call counters, so queue tests can open
//! circuits, exhaust retries and check what was actually called.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::AnalysisType;

use super::traits::{AnalysisFinding, AnalysisRequest, AnalyzerHealth, BiasAnalyzer};

// ─────────────────────────────────────────────────────────────────
// Mock Analyzer Configuration
// ─────────────────────────────────────────────────────────────────

/// How the mock answers one analysis type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    Succeed,
    /// Transient error on every call
    FailTransient,
    /// Permanent error on every call
    FailPermanent,
    /// Transient error for the next `n` calls, then succeed
    FailTimes(u32),
    /// Never answer (exercises call timeouts)
    Hang,
}

/// Configuration for mock analyzer behavior
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Simulated latency per call (ms)
    pub latency_ms: u64,

    /// Finding returned on success
    pub finding: AnalysisFinding,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            latency_ms: 0,
            finding: AnalysisFinding {
                detected: true,
                confidence: 0.8,
                indicators: vec!["mock indicator".to_string()],
            },
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Mock Analyzer
// ─────────────────────────────────────────────────────────────────

/// Mock implementation of BiasAnalyzer for testing
#[derive(Debug)]
pub struct MockAnalyzer {
    config: MockConfig,
    behaviors: RwLock<HashMap<AnalysisType, MockBehavior>>,
    call_counts: RwLock<HashMap<AnalysisType, u32>>,
}

impl Default for MockAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAnalyzer {
    pub fn new() -> Self {
        Self::with_config(MockConfig::default())
    }

    pub fn with_config(config: MockConfig) -> Self {
        Self {
            config,
            behaviors: RwLock::new(HashMap::new()),
            call_counts: RwLock::new(HashMap::new()),
        }
    }

    /// Switch behavior for one analysis type at runtime
    pub fn set_behavior(&self, analysis: AnalysisType, behavior: MockBehavior) {
        self.behaviors.write().insert(analysis, behavior);
    }

    pub fn behavior(&self, analysis: AnalysisType) -> MockBehavior {
        self.behaviors
            .read()
            .get(&analysis)
            .copied()
            .unwrap_or(MockBehavior::Succeed)
    }

    /// Number of calls made for an analysis type
    pub fn call_count(&self, analysis: AnalysisType) -> u32 {
        self.call_counts.read().get(&analysis).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.call_counts.read().values().sum()
    }

    /// Reset all call counts
    pub fn reset_counts(&self) {
        self.call_counts.write().clear();
    }

    async fn simulate_latency(&self) {
        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }
    }

    /// Pick this call's behavior, consuming one `FailTimes` charge
    fn next_behavior(&self, analysis: AnalysisType) -> MockBehavior {
        let mut behaviors = self.behaviors.write();
        let current = behaviors.get(&analysis).copied().unwrap_or(MockBehavior::Succeed);
        match current {
            MockBehavior::FailTimes(0) => {
                behaviors.insert(analysis, MockBehavior::Succeed);
                MockBehavior::Succeed
            }
            MockBehavior::FailTimes(n) => {
                behaviors.insert(analysis, MockBehavior::FailTimes(n - 1));
                MockBehavior::FailTransient
            }
            other => other,
        }
    }
}

#[async_trait]
impl BiasAnalyzer for MockAnalyzer {
    fn name(&self) -> &str {
        "mock"
    }

    fn supports(&self, _analysis: AnalysisType) -> bool {
        true
    }

    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisFinding> {
        *self.call_counts.write().entry(request.analysis).or_insert(0) += 1;
        self.simulate_latency().await;

        let analysis = request.analysis.name();
        match self.next_behavior(request.analysis) {
            MockBehavior::Succeed => Ok(self.config.finding.clone()),
            MockBehavior::FailTransient | MockBehavior::FailTimes(_) => {
                Err(Error::transient(analysis, "simulated transient failure"))
            }
            MockBehavior::FailPermanent => {
                Err(Error::permanent(analysis, "simulated permanent failure"))
            }
            MockBehavior::Hang => {
                std::future::pending::<()>().await;
                Err(Error::Internal("unreachable mock state".to_string()))
            }
        }
    }

    async fn health_check(&self) -> AnalyzerHealth {
        let failing = self
            .behaviors
            .read()
            .values()
            .any(|b| matches!(b, MockBehavior::FailTransient | MockBehavior::Hang));
        AnalyzerHealth {
            operational: !failing,
            error: failing.then(|| "simulated outage".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::types::{SchemaVersion, TypedAttributeMap};
    use crate::types::{JobId, SetId};

    fn request(analysis: AnalysisType) -> AnalysisRequest {
        AnalysisRequest {
            job_id: JobId::new(),
            attribute_set: SetId::new(),
            analysis,
            schema_version: SchemaVersion::new(1, 0),
            attributes: TypedAttributeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_mock_success() {
        let mock = MockAnalyzer::new();
        let finding = mock.analyze(&request(AnalysisType::AgeStereotype)).await.unwrap();
        assert!(finding.detected);
        assert_eq!(mock.call_count(AnalysisType::AgeStereotype), 1);
    }

    #[tokio::test]
    async fn test_mock_failure_switches() {
        let mock = MockAnalyzer::new();
        mock.set_behavior(AnalysisType::AgeStereotype, MockBehavior::FailTransient);
        mock.set_behavior(AnalysisType::GenderStereotype, MockBehavior::FailPermanent);

        let err = mock.analyze(&request(AnalysisType::AgeStereotype)).await.unwrap_err();
        assert!(err.is_retryable());
        let err = mock.analyze(&request(AnalysisType::GenderStereotype)).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(mock.analyze(&request(AnalysisType::CulturalStereotype)).await.is_ok());
        assert!(!mock.health_check().await.operational);
    }

    #[tokio::test]
    async fn test_fail_times_then_recover() {
        let mock = MockAnalyzer::new();
        mock.set_behavior(AnalysisType::AgeStereotype, MockBehavior::FailTimes(2));
        let r = request(AnalysisType::AgeStereotype);
        assert!(mock.analyze(&r).await.is_err());
        assert!(mock.analyze(&r).await.is_err());
        assert!(mock.analyze(&r).await.is_ok());
        assert_eq!(mock.behavior(AnalysisType::AgeStereotype), MockBehavior::Succeed);
    }

    #[tokio::test]
    async fn test_call_counting() {
        let mock = MockAnalyzer::new();
        for _ in 0..3 {
            mock.analyze(&request(AnalysisType::GenderStereotype)).await.unwrap();
        }
        assert_eq!(mock.call_count(AnalysisType::GenderStereotype), 3);
        assert_eq!(mock.total_calls(), 3);
        mock.reset_counts();
        assert_eq!(mock.total_calls(), 0);
    }
}
