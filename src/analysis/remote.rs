//! HTTP analysis backend
//!
//! Calls `POST {base_url}/analyze/{analysis}` with the attribute set and
//! expects `{detected, confidence, indicators}` back. Retrying is left to
//! the job queue; this module only classifies failures.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::types::AnalysisType;

use super::traits::{AnalysisFinding, AnalysisRequest, AnalyzerHealth, BiasAnalyzer};

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Configuration for the HTTP analyzer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Service base URL (e.g., "http://localhost:8090")
    pub base_url: String,

    /// Bearer token; empty for none
    pub api_key: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8090".to_string(),
            api_key: String::new(),
            timeout_secs: 30,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Remote Analyzer
// ─────────────────────────────────────────────────────────────────

/// Analyzer backed by an HTTP service
pub struct RemoteAnalyzer {
    config: RemoteConfig,
    client: Client,
}

impl std::fmt::Debug for RemoteAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteAnalyzer")
            .field("base_url", &self.config.base_url)
            .field("timeout_secs", &self.config.timeout_secs)
            .finish()
    }
}

impl RemoteAnalyzer {
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        info!(base_url = %config.base_url, "Remote analyzer created");
        Ok(Self { config, client })
    }

    pub fn endpoint(&self, analysis: AnalysisType) -> String {
        format!("{}/analyze/{}", self.config.base_url.trim_end_matches('/'), analysis.name())
    }

    fn auth_header(&self) -> Option<String> {
        if self.config.api_key.is_empty() {
            None
        } else {
            Some(format!("Bearer {}", self.config.api_key))
        }
    }
}

#[async_trait]
impl BiasAnalyzer for RemoteAnalyzer {
    fn name(&self) -> &str {
        "remote"
    }

    fn supports(&self, _analysis: AnalysisType) -> bool {
        true
    }

    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisFinding> {
        let analysis = request.analysis.name();
        let url = self.endpoint(request.analysis);

        let mut req = self.client.post(&url).json(request);
        if let Some(ref auth) = self.auth_header() {
            req = req.header("Authorization", auth);
        }

        let response = match req.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return Err(Error::AnalysisTimeout {
                    analysis: analysis.to_string(),
                    timeout_ms: self.config.timeout_secs * 1000,
                })
            }
            Err(e) if e.is_connect() => {
                warn!(url = %url, error = %e, "Analysis service unreachable");
                return Err(Error::transient(analysis, format!("connection error: {}", e)));
            }
            Err(e) => return Err(Error::transient(analysis, format!("request error: {}", e))),
        };

        let status = response.status();
        if status.is_success() {
            let finding = response
                .json::<AnalysisFinding>()
                .await
                .map_err(|e| Error::permanent(analysis, format!("malformed response: {}", e)))?;
            debug!(
                job = %request.job_id,
                analysis,
                detected = finding.detected,
                "Remote analysis done"
            );
            Ok(finding.normalized())
        } else if status.as_u16() == 429 || status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, analysis, "Retryable analysis service error: {}", body);
            Err(Error::transient(analysis, format!("service error {}: {}", status, body)))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::permanent(analysis, format!("service error {}: {}", status, body)))
        }
    }

    async fn health_check(&self) -> AnalyzerHealth {
        let url = format!("{}/health", self.config.base_url.trim_end_matches('/'));
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => AnalyzerHealth::default(),
            Ok(resp) => AnalyzerHealth {
                operational: false,
                error: Some(format!("service returned status {}", resp.status())),
            },
            Err(e) => AnalyzerHealth {
                operational: false,
                error: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::types::{SchemaVersion, TypedAttributeMap};
    use crate::types::{JobId, SetId};

    #[test]
    fn test_config_defaults() {
        let config = RemoteConfig::default();
        assert_eq!(config.timeout_secs, 30);
        assert!(config.api_key.is_empty());
    }

    #[test]
    fn test_endpoint_url() {
        let analyzer = RemoteAnalyzer::new(RemoteConfig {
            base_url: "http://analysis.local/".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            analyzer.endpoint(AnalysisType::AgeStereotype),
            "http://analysis.local/analyze/age_stereotype"
        );
    }

    #[tokio::test]
    async fn test_unreachable_service_is_transient() {
        let analyzer = RemoteAnalyzer::new(RemoteConfig {
            base_url: "http://127.0.0.1:1".into(),
            timeout_secs: 2,
            ..Default::default()
        })
        .unwrap();
        let request = AnalysisRequest {
            job_id: JobId::new(),
            attribute_set: SetId::new(),
            analysis: AnalysisType::GenderStereotype,
            schema_version: SchemaVersion::new(1, 0),
            attributes: TypedAttributeMap::new(),
        };
        let err = analyzer.analyze(&request).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!analyzer.health_check().await.operational);
    }
}
