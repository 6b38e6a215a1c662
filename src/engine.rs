//! Engine wiring
//!
//! producer map -> boundary -> (valid) store + diff, (unknown) evolution;
//! stored sets -> job queue -> analyzers -> store.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::analysis::AnalyzerRegistry;
use crate::boundary::{BoundaryEnforcer, Classification, RejectedKey};
use crate::config::EngineConfig;
use crate::diff::{DiffCalculator, DiffResult};
use crate::error::{Error, Result};
use crate::evolution::{
    CandidateId, EvolutionManager, FieldCandidate, ObservationOutcome, ReviewStatus,
};
use crate::queue::{spawn_workers, BiasJob, BreakerSet, EnqueueOutcome, JobPriority, JobQueue};
use crate::schema::{
    AttributeSchema, FileSchemaSource, RefreshOutcome, SchemaRegistry, SchemaVersion,
};
use crate::store::{AttributeSet, AuditStore, ErasureReport, JobStats, Pseudonym};
use crate::types::{AnalysisType, SetId, SourceTag};

// ─────────────────────────────────────────────────────────────────
// Reports
// ─────────────────────────────────────────────────────────────────

/// What happened to one producer emission
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub attribute_set: SetId,
    pub source: SourceTag,
    pub schema_version: SchemaVersion,
    pub accepted: Vec<String>,
    pub rejected: Vec<RejectedKey>,
    pub candidates: Vec<String>,
    /// Schema version created by auto-extension during this ingest
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_extended_to: Option<SchemaVersion>,
    pub warnings: Vec<String>,
}

/// Description + artifact ingested and compared in one go
#[derive(Debug, Clone, Serialize)]
pub struct ComparisonReport {
    pub description: IngestReport,
    pub artifact: IngestReport,
    pub diff: DiffResult,
}

// ─────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────

/// The attribute engine
#[derive(Debug)]
pub struct EmbodimentEngine {
    registry: Arc<SchemaRegistry>,
    enforcer: BoundaryEnforcer,
    evolution: Arc<EvolutionManager>,
    diff: DiffCalculator,
    store: Arc<AuditStore>,
    queue: Arc<JobQueue>,
    analyzers: Arc<AnalyzerRegistry>,
    breakers: BreakerSet,
    workers: usize,
}

impl EmbodimentEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Build everything from configuration
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        EngineBuilder::default().config(config.clone()).build()
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn enforcer(&self) -> &BoundaryEnforcer {
        &self.enforcer
    }

    pub fn evolution(&self) -> &Arc<EvolutionManager> {
        &self.evolution
    }

    pub fn store(&self) -> &Arc<AuditStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn breakers(&self) -> &BreakerSet {
        &self.breakers
    }

    pub fn active_schema(&self) -> (SchemaVersion, Arc<AttributeSchema>) {
        self.registry.get_active_schema()
    }

    // ─────────────────────────────────────────────────────────────
    // Primary path
    // ─────────────────────────────────────────────────────────────

    /// Classify one producer map, store its valid part and route unknown keys
    pub fn ingest(
        &self,
        pseudonym: &Pseudonym,
        source: SourceTag,
        attributes: &Value,
    ) -> Result<IngestReport> {
        if !self.queue.has_consent(pseudonym) {
            return Err(Error::ConsentWithdrawn(pseudonym.to_string()));
        }

        let (version, schema) = self.registry.get_active_schema();
        let classification = match attributes.as_object() {
            Some(map) => self.enforcer.classify_with(&schema, map),
            None => self.enforcer.classify_json(attributes),
        };
        let Classification {
            valid,
            rejected,
            candidates,
            ..
        } = classification;

        let mut warnings: Vec<String> = rejected
            .iter()
            .map(|r| Error::from(r).to_string())
            .collect();
        if self.registry.is_fallback() {
            warnings.push(format!("schema {} is the embedded fallback", version));
        }

        let accepted: Vec<String> = valid.keys().cloned().collect();
        let set = AttributeSet::new(pseudonym.clone(), source, version, valid);
        let set_id = self.store.append_attribute_set(set, &schema)?;

        let mut schema_extended_to = None;
        let context = source.to_string();
        for candidate in &candidates {
            match self
                .evolution
                .observe_unknown_field(&candidate.path, &candidate.value, Some(&context))
            {
                Ok(ObservationOutcome::AutoApproved { version, .. }) => {
                    schema_extended_to = Some(version)
                }
                Ok(outcome) => debug!(path = %candidate.path, ?outcome, "Unknown field observed"),
                Err(e) => {
                    warn!(path = %candidate.path, "{}", e.format_for_log());
                    warnings.push(e.to_string());
                }
            }
        }

        info!(
            set = %set_id,
            %source,
            schema = %version,
            accepted = accepted.len(),
            rejected = rejected.len(),
            candidates = candidates.len(),
            "Attribute set ingested"
        );

        Ok(IngestReport {
            attribute_set: set_id,
            source,
            schema_version: version,
            accepted,
            rejected,
            candidates: candidates.into_iter().map(|c| c.path).collect(),
            schema_extended_to,
            warnings,
        })
    }

    /// Diff two stored sets of a session and append the result as the next round
    pub fn compare(
        &self,
        pseudonym: &Pseudonym,
        description: SetId,
        artifact: SetId,
    ) -> Result<DiffResult> {
        if !self.queue.has_consent(pseudonym) {
            return Err(Error::ConsentWithdrawn(pseudonym.to_string()));
        }

        let desc = self
            .store
            .attribute_set(description)
            .ok_or_else(|| Error::NotFound(format!("attribute set {}", description)))?;
        let art = self
            .store
            .attribute_set(artifact)
            .ok_or_else(|| Error::NotFound(format!("attribute set {}", artifact)))?;
        if desc.pseudonym != *pseudonym || art.pseudonym != *pseudonym {
            return Err(Error::NotFound(format!("attribute sets for session {}", pseudonym)));
        }

        // Later versions are additive, so the newer schema covers both sets
        let version = desc.schema_version.max(art.schema_version);
        let schema = self
            .registry
            .schema_at(version)
            .ok_or_else(|| Error::NotFound(format!("schema version {}", version)))?;

        let round = self.store.next_round(pseudonym);
        let diff = self.diff.compute_diff(&desc, &art, &schema, round)?;
        self.store.append_diff(diff.clone())?;
        info!(
            session = %pseudonym,
            round,
            similarity = ?diff.similarity,
            hallucinations = diff.hallucinations,
            missing = diff.missing,
            "Diff recorded"
        );
        Ok(diff)
    }

    /// Ingest both producer maps and compare them
    pub fn process_round(
        &self,
        pseudonym: &Pseudonym,
        description: &Value,
        artifact: &Value,
    ) -> Result<ComparisonReport> {
        let description = self.ingest(pseudonym, SourceTag::Description, description)?;
        let artifact = self.ingest(pseudonym, SourceTag::Artifact, artifact)?;
        let diff = self.compare(pseudonym, description.attribute_set, artifact.attribute_set)?;
        Ok(ComparisonReport {
            description,
            artifact,
            diff,
        })
    }

    // ─────────────────────────────────────────────────────────────
    // Deferred analysis
    // ─────────────────────────────────────────────────────────────

    pub fn request_analysis(
        &self,
        pseudonym: &Pseudonym,
        attribute_set: SetId,
        analyses: &[AnalysisType],
        priority: JobPriority,
    ) -> Result<EnqueueOutcome> {
        self.queue.enqueue(pseudonym, attribute_set, analyses, priority)
    }

    /// Start the configured number of background workers
    pub fn spawn_workers(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        if !self.queue.is_enabled() {
            info!("Deferred analysis disabled, no workers started");
            return Vec::new();
        }
        spawn_workers(
            self.workers,
            self.queue.clone(),
            self.analyzers.clone(),
            self.breakers.clone(),
            shutdown,
        )
    }

    pub fn reap_expired_leases(&self) -> Result<usize> {
        self.queue.reap_expired()
    }

    pub fn job_stats(&self) -> JobStats {
        self.queue.stats()
    }

    pub fn dead_letters(&self) -> Vec<BiasJob> {
        self.queue.dead_letters()
    }

    // ─────────────────────────────────────────────────────────────
    // Consent & erasure
    // ─────────────────────────────────────────────────────────────

    pub fn withdraw_consent(&self, pseudonym: &Pseudonym) -> Result<usize> {
        self.queue.withdraw_consent(pseudonym)
    }

    pub fn restore_consent(&self, pseudonym: &Pseudonym) -> bool {
        self.queue.restore_consent(pseudonym)
    }

    /// Delete every record of a session
    ///
    /// A worker still running one of the session's jobs loses its lease
    /// with the job, so its results are discarded.
    pub fn erase(&self, pseudonym: &Pseudonym) -> Result<ErasureReport> {
        self.store.erase(pseudonym)
    }

    // ─────────────────────────────────────────────────────────────
    // Governance
    // ─────────────────────────────────────────────────────────────

    pub fn list_candidates(&self, status: Option<ReviewStatus>) -> Vec<FieldCandidate> {
        self.evolution.list_candidates(status)
    }

    pub fn approve_candidate(&self, id: CandidateId) -> Result<Arc<AttributeSchema>> {
        self.evolution.approve(id)
    }

    pub fn reject_candidate(&self, id: CandidateId, reason: &str) -> Result<FieldCandidate> {
        self.evolution.reject(id, reason)
    }

    pub fn refresh_schema(&self) -> RefreshOutcome {
        self.registry.refresh()
    }
}

// ─────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────

/// Engine assembly with optional injected parts
#[derive(Default)]
pub struct EngineBuilder {
    config: Option<EngineConfig>,
    registry: Option<Arc<SchemaRegistry>>,
    store: Option<Arc<AuditStore>>,
    analyzers: Option<Arc<AnalyzerRegistry>>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn registry(mut self, registry: Arc<SchemaRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn store(mut self, store: Arc<AuditStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn analyzers(mut self, analyzers: Arc<AnalyzerRegistry>) -> Self {
        self.analyzers = Some(analyzers);
        self
    }

    pub fn build(self) -> Result<EmbodimentEngine> {
        let config = self.config.unwrap_or_default();

        let registry = match self.registry {
            Some(registry) => registry,
            None => {
                let registry = match config.schema_source() {
                    Some(path) => SchemaRegistry::new(
                        Arc::new(FileSchemaSource::new(path)),
                        config.schema_cache_ttl(),
                    ),
                    None => SchemaRegistry::embedded(config.schema_cache_ttl()),
                };
                registry.init();
                Arc::new(registry)
            }
        };

        let store = match self.store {
            Some(store) => store,
            None if config.storage.journal => Arc::new(AuditStore::open(&config.data_dir())?),
            None => Arc::new(AuditStore::in_memory()),
        };

        // Versions and candidates from earlier runs outlive the process.
        let journaled: Vec<AttributeSchema> = store
            .schema_records()
            .into_iter()
            .filter_map(|record| match record.into_schema() {
                Ok(schema) => Some(schema),
                Err(e) => {
                    warn!("Skipping journaled schema: {}", e.format_for_log());
                    None
                }
            })
            .collect();
        registry.restore_versions(journaled);

        let analyzers = match self.analyzers {
            Some(analyzers) => analyzers,
            None => Arc::new(AnalyzerRegistry::from_config(&config.analysis)?),
        };

        let enforcer = BoundaryEnforcer::new(registry.clone(), config.deny_list())
            .with_extra_roots(config.boundary.extra_roots.iter().cloned());
        let evolution = Arc::new(
            EvolutionManager::new(registry.clone(), config.evolution.clone())
                .with_store(store.clone()),
        );
        evolution.restore(store.candidate_records());
        let queue = Arc::new(JobQueue::new(config.queue.clone(), store.clone()));

        Ok(EmbodimentEngine {
            registry,
            enforcer,
            evolution,
            diff: DiffCalculator::new(),
            store,
            queue,
            analyzers,
            breakers: BreakerSet::new(&config.breaker),
            workers: config.queue.workers,
        })
    }
}
