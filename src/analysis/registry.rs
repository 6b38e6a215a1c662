//! Analyzer registry
//!
//! Maps each analysis type to the analyzer that serves it. The queue asks
//! the registry per call, so analyzers can be swapped without touching it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::types::AnalysisType;

use super::heuristic::HeuristicAnalyzer;
use super::mock::MockAnalyzer;
use super::remote::{RemoteAnalyzer, RemoteConfig};
use super::traits::BiasAnalyzer;

// ─────────────────────────────────────────────────────────────────
// Analyzer Kind
// ─────────────────────────────────────────────────────────────────

/// Built-in analyzer implementations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalyzerKind {
    /// Local indicator rules
    Heuristic,
    /// HTTP analysis service
    Remote,
    /// Mock analyzer (for testing)
    Mock,
}

impl AnalyzerKind {
    pub fn all() -> &'static [AnalyzerKind] {
        &[AnalyzerKind::Heuristic, AnalyzerKind::Remote, AnalyzerKind::Mock]
    }

    pub fn name(&self) -> &'static str {
        match self {
            AnalyzerKind::Heuristic => "heuristic",
            AnalyzerKind::Remote => "remote",
            AnalyzerKind::Mock => "mock",
        }
    }

    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "heuristic" => Some(AnalyzerKind::Heuristic),
            "remote" | "http" => Some(AnalyzerKind::Remote),
            "mock" => Some(AnalyzerKind::Mock),
            _ => None,
        }
    }
}

impl std::fmt::Display for AnalyzerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// `[analysis]` config section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub kind: AnalyzerKind,
    pub remote: RemoteConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            kind: AnalyzerKind::Heuristic,
            remote: RemoteConfig::default(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────

/// Which analyzer serves which analysis type
#[derive(Default)]
pub struct AnalyzerRegistry {
    analyzers: RwLock<HashMap<AnalysisType, Arc<dyn BiasAnalyzer>>>,
}

impl std::fmt::Debug for AnalyzerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<(AnalysisType, String)> = self
            .analyzers
            .read()
            .iter()
            .map(|(t, a)| (*t, a.name().to_string()))
            .collect();
        f.debug_struct("AnalyzerRegistry").field("analyzers", &names).finish()
    }
}

impl AnalyzerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One analyzer for every type it supports
    pub fn single(analyzer: Arc<dyn BiasAnalyzer>) -> Self {
        let registry = Self::new();
        for analysis in AnalysisType::all() {
            if analyzer.supports(*analysis) {
                registry.register(*analysis, analyzer.clone());
            }
        }
        registry
    }

    /// Build the configured analyzer
    pub fn from_config(config: &AnalysisConfig) -> Result<Self> {
        let analyzer: Arc<dyn BiasAnalyzer> = match config.kind {
            AnalyzerKind::Heuristic => Arc::new(HeuristicAnalyzer::default()),
            AnalyzerKind::Remote => Arc::new(RemoteAnalyzer::new(config.remote.clone())?),
            AnalyzerKind::Mock => Arc::new(MockAnalyzer::new()),
        };
        info!(kind = %config.kind, "Analyzer configured");
        Ok(Self::single(analyzer))
    }

    /// Route one analysis type to `analyzer`, replacing any previous one
    pub fn register(&self, analysis: AnalysisType, analyzer: Arc<dyn BiasAnalyzer>) {
        self.analyzers.write().insert(analysis, analyzer);
    }

    pub fn get(&self, analysis: AnalysisType) -> Result<Arc<dyn BiasAnalyzer>> {
        self.analyzers
            .read()
            .get(&analysis)
            .cloned()
            .ok_or_else(|| Error::AnalyzerMissing(analysis.to_string()))
    }

    pub fn supported(&self) -> Vec<AnalysisType> {
        let mut types: Vec<AnalysisType> = self.analyzers.read().keys().copied().collect();
        types.sort();
        types
    }
}
