//! Audit / persistence store
//!
//! Append-only research records keyed by pseudonym, plus the job table the
//! deferred analysis queue claims from. All mutations happen under one
//! write lock; with a journal configured, a mutation is written to disk
//! before it becomes visible in memory.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::journal::{Journal, JournalEntry, JOURNAL_FILE};
use super::pseudonym::Pseudonym;
use super::records::{AttributeSet, BiasResult, ErasureReport, RecordCounts};
use crate::diff::DiffResult;
use crate::error::{Error, Result};
use crate::evolution::{CandidateEntry, CandidateRecord};
use crate::queue::job::{AttemptOutcome, BiasJob, JobStatus, Lease};
use crate::schema::types::{AttributeSchema, SchemaRecord, SchemaVersion};
use crate::types::{JobId, SetId};

// ─────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
struct SessionRecords {
    sets: Vec<AttributeSet>,
    diffs: Vec<DiffResult>,
    results: Vec<BiasResult>,
    jobs: Vec<JobId>,
}

impl SessionRecords {
    fn counts(&self) -> RecordCounts {
        RecordCounts {
            attribute_sets: self.sets.len(),
            diffs: self.diffs.len(),
            jobs: self.jobs.len(),
            results: self.results.len(),
        }
    }
}

#[derive(Debug, Default)]
struct StoreState {
    sessions: HashMap<Pseudonym, SessionRecords>,
    set_index: HashMap<SetId, Pseudonym>,
    jobs: HashMap<JobId, BiasJob>,
    schemas: BTreeMap<SchemaVersion, SchemaRecord>,
    candidates: BTreeMap<String, CandidateRecord>,
    journal: Option<Journal>,
}

impl StoreState {
    fn persist(&mut self, entries: &[JournalEntry]) -> Result<()> {
        match self.journal.as_mut() {
            Some(journal) => journal.append(entries),
            None => Ok(()),
        }
    }

    fn set(&self, id: SetId) -> Option<&AttributeSet> {
        let pseudonym = self.set_index.get(&id)?;
        self.sessions
            .get(pseudonym)?
            .sets
            .iter()
            .find(|s| s.id == id)
    }

    fn check_diff_order(&self, diff: &DiffResult) -> Result<()> {
        for set_id in [diff.description_set, diff.artifact_set] {
            match self.set_index.get(&set_id) {
                Some(owner) if *owner == diff.pseudonym => {}
                Some(_) => {
                    return Err(Error::StoreOrdering(format!(
                        "attribute set {} belongs to another session",
                        set_id
                    )))
                }
                None => {
                    return Err(Error::StoreOrdering(format!(
                        "diff {} references attribute set {} which is not stored",
                        diff.id, set_id
                    )))
                }
            }
        }
        let last_round = self
            .sessions
            .get(&diff.pseudonym)
            .and_then(|s| s.diffs.last())
            .map(|d| d.round);
        if let Some(last) = last_round {
            if diff.round <= last {
                return Err(Error::StoreOrdering(format!(
                    "diff round {} does not follow stored round {}",
                    diff.round, last
                )));
            }
        }
        Ok(())
    }

    fn insert_set(&mut self, set: AttributeSet) {
        self.set_index.insert(set.id, set.pseudonym.clone());
        self.sessions.entry(set.pseudonym.clone()).or_default().sets.push(set);
    }

    fn insert_job(&mut self, job: BiasJob) {
        let session = self.sessions.entry(job.pseudonym.clone()).or_default();
        if !session.jobs.contains(&job.id) {
            session.jobs.push(job.id);
        }
        self.jobs.insert(job.id, job);
    }

    fn replay(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::AttributeSet(set) => {
                if !self.set_index.contains_key(&set.id) {
                    self.insert_set(set);
                }
            }
            JournalEntry::Diff(diff) => match self.check_diff_order(&diff) {
                Ok(()) => self.sessions.entry(diff.pseudonym.clone()).or_default().diffs.push(diff),
                Err(e) => warn!(diff = %diff.id, "Skipping journal diff: {}", e),
            },
            JournalEntry::Result(result) => self
                .sessions
                .entry(result.pseudonym.clone())
                .or_default()
                .results
                .push(result),
            JournalEntry::Job(job) => self.insert_job(job),
            JournalEntry::Schema(record) => match record.version() {
                Some(version) => {
                    self.schemas.entry(version).or_insert(record);
                }
                None => warn!("Skipping journal schema without a readable version"),
            },
            JournalEntry::Candidate(record) => {
                self.candidates.insert(record.path.clone(), record);
            }
        }
    }

    /// Every live record, in replayable order
    fn snapshot_entries(&self) -> Vec<JournalEntry> {
        let mut entries: Vec<JournalEntry> = self
            .schemas
            .values()
            .cloned()
            .map(JournalEntry::Schema)
            .collect();
        entries.extend(self.candidates.values().cloned().map(JournalEntry::Candidate));
        for session in self.sessions.values() {
            entries.extend(session.sets.iter().cloned().map(JournalEntry::AttributeSet));
            entries.extend(session.diffs.iter().cloned().map(JournalEntry::Diff));
            entries.extend(
                session
                    .jobs
                    .iter()
                    .filter_map(|id| self.jobs.get(id))
                    .cloned()
                    .map(JournalEntry::Job),
            );
            entries.extend(session.results.iter().cloned().map(JournalEntry::Result));
        }
        entries
    }
}

// ─────────────────────────────────────────────────────────────────
// Job Queries
// ─────────────────────────────────────────────────────────────────

/// Job counts per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub dead_letter: usize,
}

impl JobStats {
    pub fn total(&self) -> usize {
        self.pending
            + self.running
            + self.completed
            + self.failed
            + self.cancelled
            + self.dead_letter
    }
}

/// What happened to a worker's attempt at commit time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Results and transition committed
    Applied(JobStatus),
    /// Worker no longer held the lease; nothing was written
    Discarded { status: Option<JobStatus> },
}

// ─────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────

/// Append-only audit store
#[derive(Debug, Default)]
pub struct AuditStore {
    state: RwLock<StoreState>,
}

impl AuditStore {
    /// Memory-only store
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Store journaled to `<data_dir>/audit.jsonl`, replaying what is there
    pub fn open(data_dir: &Path) -> Result<Self> {
        let (journal, entries) = Journal::open(data_dir.join(JOURNAL_FILE))?;
        let mut state = StoreState::default();
        let replayed = entries.len();
        for entry in entries {
            state.replay(entry);
        }
        state.journal = Some(journal);

        let store = Self {
            state: RwLock::new(state),
        };
        info!(
            path = %data_dir.join(JOURNAL_FILE).display(),
            entries = replayed,
            records = store.counts().total(),
            "Audit store opened"
        );
        Ok(store)
    }

    pub fn is_durable(&self) -> bool {
        self.state.read().journal.is_some()
    }

    // ─────────────────────────────────────────────────────────────
    // Research Records
    // ─────────────────────────────────────────────────────────────

    /// Store a set after validating it against the schema it claims
    ///
    /// The schema version is journaled alongside the first set that uses it.
    pub fn append_attribute_set(
        &self,
        set: AttributeSet,
        schema: &AttributeSchema,
    ) -> Result<SetId> {
        if set.schema_version != schema.version() {
            return Err(Error::SchemaValidation {
                problems: vec![format!(
                    "set references schema {} but was validated against {}",
                    set.schema_version,
                    schema.version()
                )],
            });
        }
        schema
            .validate_values(&set.values)
            .map_err(|problems| Error::SchemaValidation { problems })?;

        let mut state = self.state.write();
        if state.set_index.contains_key(&set.id) {
            return Err(Error::StoreOrdering(format!("attribute set {} already stored", set.id)));
        }
        let mut entries = Vec::with_capacity(2);
        let new_schema = !state.schemas.contains_key(&schema.version());
        if new_schema {
            entries.push(JournalEntry::Schema(SchemaRecord::from(schema)));
        }
        entries.push(JournalEntry::AttributeSet(set.clone()));
        state.persist(&entries)?;
        if new_schema {
            state.schemas.insert(schema.version(), SchemaRecord::from(schema));
        }
        let id = set.id;
        debug!(set = %id, pseudonym = %set.pseudonym, source = %set.source, "Attribute set stored");
        state.insert_set(set);
        Ok(id)
    }

    /// Store a diff; both referenced sets must already be stored
    pub fn append_diff(&self, diff: DiffResult) -> Result<()> {
        let mut state = self.state.write();
        state.check_diff_order(&diff)?;
        state.persist(&[JournalEntry::Diff(diff.clone())])?;
        debug!(diff = %diff.id, round = diff.round, "Diff stored");
        state
            .sessions
            .entry(diff.pseudonym.clone())
            .or_default()
            .diffs
            .push(diff);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────
    // Governance State
    // ─────────────────────────────────────────────────────────────

    /// Journal a registered schema version; a version is written once
    pub fn record_schema(&self, schema: &AttributeSchema) -> Result<()> {
        let mut state = self.state.write();
        if state.schemas.contains_key(&schema.version()) {
            return Ok(());
        }
        let record = SchemaRecord::from(schema);
        state.persist(&[JournalEntry::Schema(record.clone())])?;
        debug!(version = %schema.version(), "Schema version stored");
        state.schemas.insert(schema.version(), record);
        Ok(())
    }

    /// Journal the current state of a candidate
    ///
    /// The snapshot is taken under the write lock so later snapshots of the
    /// same candidate never land earlier in the journal.
    pub fn record_candidate(&self, entry: &CandidateEntry) -> Result<()> {
        let mut state = self.state.write();
        let record = entry.to_record();
        state.persist(&[JournalEntry::Candidate(record.clone())])?;
        state.candidates.insert(record.path.clone(), record);
        Ok(())
    }

    /// Stored schema versions, oldest first
    pub fn schema_records(&self) -> Vec<SchemaRecord> {
        self.state.read().schemas.values().cloned().collect()
    }

    pub fn candidate_records(&self) -> Vec<CandidateRecord> {
        self.state.read().candidates.values().cloned().collect()
    }

    pub fn attribute_set(&self, id: SetId) -> Option<AttributeSet> {
        self.state.read().set(id).cloned()
    }

    pub fn attribute_sets_for(&self, pseudonym: &Pseudonym) -> Vec<AttributeSet> {
        self.state
            .read()
            .sessions
            .get(pseudonym)
            .map(|s| s.sets.clone())
            .unwrap_or_default()
    }

    pub fn diffs_for(&self, pseudonym: &Pseudonym) -> Vec<DiffResult> {
        self.state
            .read()
            .sessions
            .get(pseudonym)
            .map(|s| s.diffs.clone())
            .unwrap_or_default()
    }

    pub fn results_for(&self, pseudonym: &Pseudonym) -> Vec<BiasResult> {
        self.state
            .read()
            .sessions
            .get(pseudonym)
            .map(|s| s.results.clone())
            .unwrap_or_default()
    }

    /// Round index the next diff for this session should carry
    pub fn next_round(&self, pseudonym: &Pseudonym) -> u32 {
        self.state
            .read()
            .sessions
            .get(pseudonym)
            .and_then(|s| s.diffs.last())
            .map_or(1, |d| d.round + 1)
    }

    pub fn counts(&self) -> RecordCounts {
        let state = self.state.read();
        state
            .sessions
            .values()
            .map(SessionRecords::counts)
            .fold(RecordCounts::default(), |acc, c| RecordCounts {
                attribute_sets: acc.attribute_sets + c.attribute_sets,
                diffs: acc.diffs + c.diffs,
                jobs: acc.jobs + c.jobs,
                results: acc.results + c.results,
            })
    }

    pub fn counts_for(&self, pseudonym: &Pseudonym) -> RecordCounts {
        self.state
            .read()
            .sessions
            .get(pseudonym)
            .map(SessionRecords::counts)
            .unwrap_or_default()
    }

    /// Cascade-delete everything stored for a pseudonym, in one transaction
    pub fn erase(&self, pseudonym: &Pseudonym) -> Result<ErasureReport> {
        let mut state = self.state.write();
        let Some(session) = state.sessions.remove(pseudonym) else {
            return Ok(ErasureReport {
                pseudonym: pseudonym.clone(),
                removed: RecordCounts::default(),
                erased_at: Utc::now(),
            });
        };

        for set in &session.sets {
            state.set_index.remove(&set.id);
        }
        let removed_jobs: Vec<BiasJob> = session
            .jobs
            .iter()
            .filter_map(|id| state.jobs.remove(id))
            .collect();

        if state.journal.is_some() {
            let entries = state.snapshot_entries();
            let rewritten = match state.journal.as_mut() {
                Some(journal) => journal.rewrite(&entries),
                None => Ok(()),
            };
            if let Err(e) = rewritten {
                // Put everything back; the erasure did not happen.
                for set in &session.sets {
                    state.set_index.insert(set.id, pseudonym.clone());
                }
                for job in removed_jobs {
                    state.jobs.insert(job.id, job);
                }
                state.sessions.insert(pseudonym.clone(), session);
                return Err(e);
            }
        }

        let removed = session.counts();
        info!(
            pseudonym = %pseudonym,
            sets = removed.attribute_sets,
            diffs = removed.diffs,
            jobs = removed.jobs,
            results = removed.results,
            "Session erased"
        );
        Ok(ErasureReport {
            pseudonym: pseudonym.clone(),
            removed,
            erased_at: Utc::now(),
        })
    }

    // ─────────────────────────────────────────────────────────────
    // Jobs
    // ─────────────────────────────────────────────────────────────

    /// Store a new job; its attribute set must exist in the same session
    pub fn insert_job(&self, job: BiasJob) -> Result<JobId> {
        let mut state = self.state.write();
        match state.set_index.get(&job.attribute_set) {
            Some(owner) if *owner == job.pseudonym => {}
            Some(_) => {
                return Err(Error::StoreOrdering(format!(
                    "attribute set {} belongs to another session",
                    job.attribute_set
                )))
            }
            None => return Err(Error::NotFound(format!("attribute set {}", job.attribute_set))),
        }
        state.persist(&[JournalEntry::Job(job.clone())])?;
        let id = job.id;
        state.insert_job(job);
        Ok(id)
    }

    pub fn job(&self, id: JobId) -> Option<BiasJob> {
        self.state.read().jobs.get(&id).cloned()
    }

    pub fn jobs_for(&self, pseudonym: &Pseudonym) -> Vec<BiasJob> {
        let state = self.state.read();
        state
            .sessions
            .get(pseudonym)
            .map(|s| s.jobs.iter().filter_map(|id| state.jobs.get(id)).cloned().collect())
            .unwrap_or_default()
    }

    /// Atomically claim the highest-priority, oldest claimable job
    pub fn claim_next_job(
        &self,
        worker_id: &str,
        lease_for: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<(BiasJob, Lease)>> {
        let mut state = self.state.write();
        let next = state
            .jobs
            .values()
            .filter(|j| j.is_claimable(now))
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.created_at.cmp(&a.created_at))
            })
            .map(|j| j.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(mut job) = state.jobs.get(&id).cloned() else {
            return Ok(None);
        };
        let lease = job.claim(worker_id, lease_for, now)?;
        state.persist(&[JournalEntry::Job(job.clone())])?;
        state.jobs.insert(id, job.clone());
        debug!(job = %id, worker = %worker_id, attempt = job.attempts, "Job claimed");
        Ok(Some((job, lease)))
    }

    /// Commit an attempt if the worker still holds the lease
    pub fn settle_attempt(
        &self,
        job_id: JobId,
        token: Uuid,
        outcome: AttemptOutcome,
        max_retries: u32,
        retry_delay: impl Fn(u32) -> Duration,
        now: DateTime<Utc>,
    ) -> Result<Settlement> {
        let mut state = self.state.write();
        let Some(current) = state.jobs.get(&job_id) else {
            return Ok(Settlement::Discarded { status: None });
        };
        if !current.holds_lease(token) {
            return Ok(Settlement::Discarded {
                status: Some(current.status),
            });
        }

        let mut job = current.clone();
        let results = outcome.results.clone();
        if let Some(stray) = results.iter().find(|r| r.job_id != job_id) {
            return Err(Error::Internal(format!(
                "result {} belongs to job {}, not {}",
                stray.id, stray.job_id, job_id
            )));
        }
        let status = job.apply_attempt(outcome, max_retries, retry_delay, now)?;

        let mut entries: Vec<JournalEntry> =
            results.iter().cloned().map(JournalEntry::Result).collect();
        entries.push(JournalEntry::Job(job.clone()));
        state.persist(&entries)?;

        state
            .sessions
            .entry(job.pseudonym.clone())
            .or_default()
            .results
            .extend(results);
        state.jobs.insert(job_id, job);
        Ok(Settlement::Applied(status))
    }

    /// Cancel every unfinished job of a session
    pub fn cancel_jobs_for(
        &self,
        pseudonym: &Pseudonym,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut state = self.state.write();
        let ids: Vec<JobId> = state
            .sessions
            .get(pseudonym)
            .map(|s| s.jobs.clone())
            .unwrap_or_default();

        let mut changed = Vec::new();
        for id in ids {
            if let Some(job) = state.jobs.get(&id) {
                let mut job = job.clone();
                if job.cancel(reason, now)? {
                    changed.push(job);
                }
            }
        }
        let entries: Vec<JournalEntry> = changed.iter().cloned().map(JournalEntry::Job).collect();
        state.persist(&entries)?;
        let count = changed.len();
        for job in changed {
            state.jobs.insert(job.id, job);
        }
        Ok(count)
    }

    /// Renew a worker's lease; `false` once the worker no longer holds it
    pub fn extend_lease(
        &self,
        job_id: JobId,
        token: Uuid,
        lease_for: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.write();
        let Some(mut job) = state.jobs.get(&job_id).cloned() else {
            return Ok(false);
        };
        if !job.renew_lease(token, lease_for, now) {
            return Ok(false);
        }
        state.persist(&[JournalEntry::Job(job.clone())])?;
        state.jobs.insert(job_id, job);
        Ok(true)
    }

    /// Return jobs whose lease expired to pending
    pub fn reap_expired_leases(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.write();
        let mut changed = Vec::new();
        for job in state.jobs.values() {
            let mut job = job.clone();
            if job.expire_lease(now)? {
                changed.push(job);
            }
        }
        let entries: Vec<JournalEntry> = changed.iter().cloned().map(JournalEntry::Job).collect();
        state.persist(&entries)?;
        let count = changed.len();
        for job in changed {
            warn!(job = %job.id, "Lease expired, job returned to pending");
            state.jobs.insert(job.id, job);
        }
        Ok(count)
    }

    /// Jobs parked for manual inspection
    pub fn dead_letters(&self) -> Vec<BiasJob> {
        let mut jobs: Vec<BiasJob> = self
            .state
            .read()
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::DeadLetter)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.updated_at);
        jobs
    }

    pub fn job_stats(&self) -> JobStats {
        let mut stats = JobStats::default();
        for job in self.state.read().jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
                JobStatus::DeadLetter => stats.dead_letter += 1,
            }
        }
        stats
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::DiffCalculator;
    use crate::queue::job::JobPriority;
    use crate::schema::source::fallback_schema;
    use crate::schema::types::{AttributeValue, TypedAttributeMap};
    use crate::types::{AnalysisType, ResultId, SourceTag};
    use tempfile::TempDir;

    fn pseudonym(s: &str) -> Pseudonym {
        Pseudonym::new(s).unwrap()
    }

    fn set(p: &Pseudonym, source: SourceTag, age: &str) -> AttributeSet {
        let mut values = TypedAttributeMap::new();
        values.insert("age".into(), AttributeValue::Text(age.into()));
        AttributeSet::new(p.clone(), source, fallback_schema().version(), values)
    }

    fn new_job(p: &Pseudonym, set: SetId, analysis: AnalysisType, priority: JobPriority) -> BiasJob {
        BiasJob::new(p.clone(), set, &[analysis], priority)
    }

    fn seed(store: &AuditStore, p: &Pseudonym) -> (SetId, SetId) {
        let schema = fallback_schema();
        let d = set(p, SourceTag::Description, "adult");
        let a = set(p, SourceTag::Artifact, "adult");
        let diff = DiffCalculator::new()
            .compute_diff(&d, &a, &schema, store.next_round(p))
            .unwrap();
        let ids = (
            store.append_attribute_set(d, &schema).unwrap(),
            store.append_attribute_set(a, &schema).unwrap(),
        );
        store.append_diff(diff).unwrap();
        ids
    }

    #[test]
    fn test_diff_requires_stored_sets() {
        let store = AuditStore::in_memory();
        let schema = fallback_schema();
        let p = pseudonym("s1");
        let d = set(&p, SourceTag::Description, "adult");
        let a = set(&p, SourceTag::Artifact, "adult");
        let diff = DiffCalculator::new().compute_diff(&d, &a, &schema, 1).unwrap();

        store.append_attribute_set(d, &schema).unwrap();
        assert!(matches!(store.append_diff(diff.clone()), Err(Error::StoreOrdering(_))));
        store.append_attribute_set(a, &schema).unwrap();
        store.append_diff(diff.clone()).unwrap();

        // Same round again breaks ordering
        assert!(matches!(store.append_diff(diff), Err(Error::StoreOrdering(_))));
        assert_eq!(store.next_round(&p), 2);
    }

    #[test]
    fn test_invalid_set_rejected() {
        let store = AuditStore::in_memory();
        let schema = fallback_schema();
        let mut values = TypedAttributeMap::new();
        values.insert("hair_color".into(), AttributeValue::Text("red".into()));
        let bad =
            AttributeSet::new(pseudonym("s1"), SourceTag::Description, schema.version(), values);
        assert!(matches!(
            store.append_attribute_set(bad, &schema),
            Err(Error::SchemaValidation { .. })
        ));
        assert_eq!(store.counts().total(), 0);
    }

    #[test]
    fn test_erase_removes_only_that_session() {
        let store = AuditStore::in_memory();
        let (p1, p2) = (pseudonym("s1"), pseudonym("s2"));
        let (d1, _) = seed(&store, &p1);
        seed(&store, &p2);
        store
            .insert_job(new_job(&p1, d1, AnalysisType::AgeStereotype, JobPriority::Normal))
            .unwrap();

        let before = store.counts();
        let report = store.erase(&p1).unwrap();
        assert_eq!(report.removed.total(), 4);
        assert_eq!(store.counts().total(), before.total() - report.removed.total());
        assert!(store.attribute_sets_for(&p1).is_empty());
        assert!(store.jobs_for(&p1).is_empty());
        assert!(store.attribute_set(d1).is_none());
        assert_eq!(store.counts_for(&p2).attribute_sets, 2);
    }

    #[test]
    fn test_journal_replay_and_erasure() {
        let dir = TempDir::new().unwrap();
        let (p1, p2) = (pseudonym("s1"), pseudonym("s2"));
        {
            let store = AuditStore::open(dir.path()).unwrap();
            seed(&store, &p1);
            seed(&store, &p2);
            store.erase(&p1).unwrap();
        }
        let store = AuditStore::open(dir.path()).unwrap();
        assert!(store.is_durable());
        assert!(store.attribute_sets_for(&p1).is_empty());
        assert_eq!(store.counts_for(&p2).diffs, 1);

        let content = std::fs::read_to_string(dir.path().join(JOURNAL_FILE)).unwrap();
        assert!(!content.contains("\"s1\""));
    }

    #[test]
    fn test_governance_state_survives_erasure_and_reopen() {
        let dir = TempDir::new().unwrap();
        let p = pseudonym("s1");
        let extended = fallback_schema()
            .extended_with(vec![crate::schema::types::FieldSpec::new(
                "tattoo_style",
                crate::schema::types::AttributeType::Text,
            )])
            .unwrap();
        let candidate = CandidateEntry::new("tattoo_style");
        {
            let store = AuditStore::open(dir.path()).unwrap();
            seed(&store, &p);
            store.record_schema(&extended).unwrap();
            store.record_schema(&extended).unwrap();
            candidate.record();
            store.record_candidate(&candidate).unwrap();
            candidate.record();
            store.record_candidate(&candidate).unwrap();
            store.erase(&p).unwrap();
        }

        let store = AuditStore::open(dir.path()).unwrap();
        let versions: Vec<_> = store.schema_records().iter().filter_map(|r| r.version()).collect();
        assert_eq!(versions, vec![fallback_schema().version(), extended.version()]);
        let candidates = store.candidate_records();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, candidate.id());
        assert_eq!(candidates[0].occurrences, 2);
        assert_eq!(store.counts().total(), 0);
    }

    #[test]
    fn test_claim_priority_then_age() {
        let store = AuditStore::in_memory();
        let p = pseudonym("s1");
        let (d, _) = seed(&store, &p);
        let low = store
            .insert_job(new_job(&p, d, AnalysisType::AgeStereotype, JobPriority::Low))
            .unwrap();
        let high = store
            .insert_job(new_job(&p, d, AnalysisType::AgeStereotype, JobPriority::High))
            .unwrap();

        let now = Utc::now() + chrono::Duration::seconds(1);
        let (first, _) = store.claim_next_job("w1", Duration::from_secs(30), now).unwrap().unwrap();
        assert_eq!(first.id, high);
        let (second, _) = store
            .claim_next_job("w2", Duration::from_secs(30), now)
            .unwrap()
            .unwrap();
        assert_eq!(second.id, low);
        assert!(store.claim_next_job("w3", Duration::from_secs(30), now).unwrap().is_none());
    }

    #[test]
    fn test_stale_lease_settlement_is_discarded() {
        let store = AuditStore::in_memory();
        let p = pseudonym("s1");
        let (d, _) = seed(&store, &p);
        let id = store
            .insert_job(new_job(&p, d, AnalysisType::AgeStereotype, JobPriority::Normal))
            .unwrap();

        let now = Utc::now() + chrono::Duration::seconds(1);
        let (_, stale) = store.claim_next_job("w1", Duration::from_secs(5), now).unwrap().unwrap();
        let later = now + chrono::Duration::seconds(10);
        let (job, fresh) = store
            .claim_next_job("w2", Duration::from_secs(5), later)
            .unwrap()
            .unwrap();

        let result = BiasResult {
            id: ResultId::new(),
            job_id: id,
            pseudonym: p.clone(),
            attribute_set: d,
            analysis: AnalysisType::AgeStereotype,
            detected: false,
            confidence: 0.5,
            indicators: vec![],
            recorded_at: later,
        };
        let outcome = AttemptOutcome {
            results: vec![result],
            ..Default::default()
        };
        let settled = store
            .settle_attempt(id, stale.token, outcome.clone(), 3, |_| Duration::ZERO, later)
            .unwrap();
        assert_eq!(settled, Settlement::Discarded { status: Some(JobStatus::Running) });
        assert!(store.results_for(&p).is_empty());

        let settled = store
            .settle_attempt(job.id, fresh.token, outcome, 3, |_| Duration::ZERO, later)
            .unwrap();
        assert_eq!(settled, Settlement::Applied(JobStatus::Completed));
        assert_eq!(store.results_for(&p).len(), 1);
    }

    #[test]
    fn test_cancel_and_reap() {
        let store = AuditStore::in_memory();
        let p = pseudonym("s1");
        let (d, _) = seed(&store, &p);
        store
            .insert_job(new_job(&p, d, AnalysisType::AgeStereotype, JobPriority::Normal))
            .unwrap();
        store
            .insert_job(new_job(&p, d, AnalysisType::GenderStereotype, JobPriority::Normal))
            .unwrap();

        let now = Utc::now() + chrono::Duration::seconds(1);
        store.claim_next_job("w1", Duration::from_secs(5), now).unwrap();
        let reaped = store
            .reap_expired_leases(now + chrono::Duration::seconds(6))
            .unwrap();
        assert_eq!(reaped, 1);
        assert_eq!(store.job_stats().pending, 2);

        assert_eq!(store.cancel_jobs_for(&p, "consent withdrawn", now).unwrap(), 2);
        let stats = store.job_stats();
        assert_eq!(stats.cancelled, 2);
        assert_eq!(stats.total(), 2);
    }

    #[test]
    fn test_job_needs_stored_set() {
        let store = AuditStore::in_memory();
        let job = new_job(
            &pseudonym("s1"),
            SetId::new(),
            AnalysisType::AgeStereotype,
            JobPriority::Normal,
        );
        assert!(matches!(store.insert_job(job), Err(Error::NotFound(_))));
    }
}
