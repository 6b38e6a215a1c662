//! Evolution manager
//!
//! Accumulates unknown fields into candidates and turns approved candidates
//! into new additive schema versions.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::candidate::{CandidateEntry, CandidateId, CandidateRecord, FieldCandidate, ReviewStatus};
use crate::error::{Error, Result};
use crate::schema::types::{is_valid_path, AttributeSchema, AttributeType, FieldSpec, SchemaVersion};
use crate::schema::SchemaRegistry;
use crate::store::AuditStore;

/// Attempts at registering a version when other writers keep winning
const MAX_REGISTER_ATTEMPTS: usize = 3;

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Candidate accumulation and auto-extension policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionConfig {
    /// Observations needed before auto-approval
    pub min_support: u64,

    /// Approve automatically once `min_support` is reached
    pub auto_extend: bool,

    /// Example values kept per candidate
    pub max_samples: usize,

    /// Detection contexts kept per candidate
    pub max_contexts: usize,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            min_support: 5,
            auto_extend: false,
            max_samples: 10,
            max_contexts: 10,
        }
    }
}

/// What an observation did
#[derive(Debug, Clone, PartialEq)]
pub enum ObservationOutcome {
    /// Counted against a pending candidate
    Counted { id: CandidateId, occurrences: u64 },
    /// Counted, and the candidate was approved automatically
    AutoApproved {
        id: CandidateId,
        occurrences: u64,
        version: SchemaVersion,
    },
    /// Candidate already reviewed; nothing accumulated
    Closed { id: CandidateId, status: ReviewStatus },
    /// Path became part of the active schema in the meantime
    AlreadyInSchema { version: SchemaVersion },
}

#[derive(Default)]
struct CandidateTable {
    by_path: HashMap<String, Arc<CandidateEntry>>,
    by_id: HashMap<CandidateId, Arc<CandidateEntry>>,
}

// ─────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────

/// Schema governance state machine over field candidates
pub struct EvolutionManager {
    registry: Arc<SchemaRegistry>,
    config: EvolutionConfig,
    table: RwLock<CandidateTable>,
    store: Option<Arc<AuditStore>>,
}

impl EvolutionManager {
    pub fn new(registry: Arc<SchemaRegistry>, config: EvolutionConfig) -> Self {
        Self {
            registry,
            config,
            table: RwLock::new(CandidateTable::default()),
            store: None,
        }
    }

    /// Journal candidates and approved versions to `store`
    pub fn with_store(mut self, store: Arc<AuditStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Reload candidates journaled by an earlier run; returns how many were added
    pub fn restore(&self, records: Vec<CandidateRecord>) -> usize {
        let mut table = self.table.write();
        let mut added = 0;
        for record in records {
            if table.by_path.contains_key(&record.path) || table.by_id.contains_key(&record.id) {
                continue;
            }
            let entry = Arc::new(CandidateEntry::from_record(record));
            table.by_path.insert(entry.path().to_string(), entry.clone());
            table.by_id.insert(entry.id(), entry);
            added += 1;
        }
        if added > 0 {
            info!(candidates = added, "Field candidates restored");
        }
        added
    }

    pub fn config(&self) -> &EvolutionConfig {
        &self.config
    }

    /// Record one sighting of a path the active schema does not know
    pub fn observe_unknown_field(
        &self,
        path: &str,
        sample: &serde_json::Value,
        context: Option<&str>,
    ) -> Result<ObservationOutcome> {
        if !is_valid_path(path) {
            return Err(Error::Evolution {
                path: path.to_string(),
                message: "not a valid attribute path".to_string(),
            });
        }

        let (version, schema) = self.registry.get_active_schema();
        if schema.contains(path) {
            return Ok(ObservationOutcome::AlreadyInSchema { version });
        }

        let entry = self.entry_for(path);
        let Some(occurrences) = entry.record() else {
            return Ok(ObservationOutcome::Closed {
                id: entry.id(),
                status: entry.status(),
            });
        };
        entry.remember(sample, context, self.config.max_samples, self.config.max_contexts);
        self.persist(None, &[entry.clone()])?;

        if self.config.auto_extend && occurrences >= self.config.min_support {
            match self.approve_entries(&[entry.clone()]) {
                Ok(schema) => {
                    info!(
                        path = %path,
                        occurrences,
                        version = %schema.version(),
                        "Candidate reached minimum support, schema extended"
                    );
                    return Ok(ObservationOutcome::AutoApproved {
                        id: entry.id(),
                        occurrences,
                        version: schema.version(),
                    });
                }
                // Another observer is already approving it
                Err(Error::CandidateNotPending { .. }) => {}
                Err(e) => {
                    warn!(path = %path, "{}", e.format_for_log());
                }
            }
        }

        Ok(ObservationOutcome::Counted {
            id: entry.id(),
            occurrences,
        })
    }

    /// Approve one candidate: active schema + this field becomes a new version
    pub fn approve(&self, id: CandidateId) -> Result<Arc<AttributeSchema>> {
        self.approve_many(&[id])
    }

    /// Approve with an explicit type instead of the inferred one
    pub fn approve_with_type(
        &self,
        id: CandidateId,
        attr_type: AttributeType,
    ) -> Result<Arc<AttributeSchema>> {
        let entry = self.lookup(id)?;
        entry.set_type_override(Some(attr_type));
        let result = self.approve_entries(&[entry.clone()]);
        if result.is_err() {
            entry.set_type_override(None);
        }
        result
    }

    /// Approve several candidates into a single new version
    pub fn approve_many(&self, ids: &[CandidateId]) -> Result<Arc<AttributeSchema>> {
        let entries = ids
            .iter()
            .map(|id| self.lookup(*id))
            .collect::<Result<Vec<_>>>()?;
        self.approve_entries(&entries)
    }

    /// Terminal rejection; the candidate stops accumulating
    pub fn reject(&self, id: CandidateId, reason: &str) -> Result<FieldCandidate> {
        let entry = self.lookup(id)?;
        entry.reject(reason).map_err(|status| Error::CandidateNotPending {
            path: entry.path().to_string(),
            status: status.to_string(),
        })?;
        info!(path = %entry.path(), reason = %reason, "Candidate rejected");
        self.persist(None, &[entry.clone()])?;
        Ok(entry.snapshot(self.config.min_support))
    }

    /// Candidates, most observed first
    pub fn list_candidates(&self, status: Option<ReviewStatus>) -> Vec<FieldCandidate> {
        let table = self.table.read();
        let mut out: Vec<FieldCandidate> = table
            .by_id
            .values()
            .map(|e| e.snapshot(self.config.min_support))
            .filter(|c| status.map_or(true, |s| c.status == s))
            .collect();
        out.sort_by(|a, b| b.occurrences.cmp(&a.occurrences).then_with(|| a.path.cmp(&b.path)));
        out
    }

    pub fn candidate(&self, id: CandidateId) -> Option<FieldCandidate> {
        self.table
            .read()
            .by_id
            .get(&id)
            .map(|e| e.snapshot(self.config.min_support))
    }

    pub fn candidate_for_path(&self, path: &str) -> Option<FieldCandidate> {
        self.table
            .read()
            .by_path
            .get(path)
            .map(|e| e.snapshot(self.config.min_support))
    }

    // ─────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────

    fn entry_for(&self, path: &str) -> Arc<CandidateEntry> {
        if let Some(entry) = self.table.read().by_path.get(path) {
            return entry.clone();
        }
        let mut table = self.table.write();
        if let Some(entry) = table.by_path.get(path) {
            return entry.clone();
        }
        let entry = Arc::new(CandidateEntry::new(path));
        table.by_path.insert(path.to_string(), entry.clone());
        table.by_id.insert(entry.id(), entry.clone());
        info!(path = %path, id = %entry.id(), "New field candidate");
        entry
    }

    fn lookup(&self, id: CandidateId) -> Result<Arc<CandidateEntry>> {
        self.table
            .read()
            .by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::CandidateNotFound(id.to_string()))
    }

    fn persist(
        &self,
        schema: Option<&AttributeSchema>,
        entries: &[Arc<CandidateEntry>],
    ) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        if let Some(schema) = schema {
            store.record_schema(schema)?;
        }
        entries.iter().try_for_each(|e| store.record_candidate(e))
    }

    /// The approval is already live in memory; a journal failure only loses durability
    fn persist_approval(&self, schema: &AttributeSchema, entries: &[Arc<CandidateEntry>]) {
        if let Err(e) = self.persist(Some(schema), entries) {
            warn!(version = %schema.version(), "Approval not journaled: {}", e.format_for_log());
        }
    }

    fn approve_entries(&self, entries: &[Arc<CandidateEntry>]) -> Result<Arc<AttributeSchema>> {
        let mut claimed: Vec<&Arc<CandidateEntry>> = Vec::with_capacity(entries.len());
        for entry in entries {
            if let Err(status) = entry.begin_approval() {
                claimed.iter().for_each(|e| e.abort_approval());
                return Err(Error::CandidateNotPending {
                    path: entry.path().to_string(),
                    status: status.to_string(),
                });
            }
            claimed.push(entry);
        }

        let paths = entries
            .iter()
            .map(|e| e.path())
            .collect::<Vec<_>>()
            .join(", ");

        let mut last_error = None;
        for attempt in 1..=MAX_REGISTER_ATTEMPTS {
            let (version, active) = self.registry.get_active_schema();
            let additions: Vec<FieldSpec> = entries
                .iter()
                .filter(|e| !active.contains(e.path()))
                .map(|e| {
                    let mut spec = FieldSpec::new(e.path(), e.field_type());
                    spec.description = Some(format!(
                        "Approved after {} observations",
                        e.occurrences()
                    ));
                    spec
                })
                .collect();

            if additions.is_empty() {
                entries.iter().for_each(|e| e.finish_approval(version));
                self.persist_approval(&active, entries);
                return Ok(active);
            }

            let result = active
                .extended_with(additions)
                .and_then(|next| self.registry.register_version(next, Some(version)));

            match result {
                Ok(schema) => {
                    entries.iter().for_each(|e| e.finish_approval(schema.version()));
                    info!(paths = %paths, version = %schema.version(), "Candidates approved");
                    self.persist_approval(&schema, entries);
                    return Ok(schema);
                }
                Err(e @ Error::SchemaVersionConflict { .. }) => {
                    warn!(attempt, paths = %paths, "{}", e.format_for_log());
                    last_error = Some(e);
                }
                Err(e) => {
                    entries.iter().for_each(|e| e.abort_approval());
                    return Err(Error::Evolution {
                        path: paths,
                        message: e.to_string(),
                    });
                }
            }
        }

        entries.iter().for_each(|e| e.abort_approval());
        Err(Error::Evolution {
            path: paths,
            message: last_error
                .map_or_else(|| "schema kept changing".to_string(), |e| e.to_string()),
        })
    }
}

impl std::fmt::Debug for EvolutionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvolutionManager")
            .field("config", &self.config)
            .field("candidates", &self.table.read().by_id.len())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
