//! Field candidates
//!
//! A candidate's review status and occurrence count share one `AtomicU64`
//! (status in the top byte, count below), so "increment only while not yet
//! reviewed" is a single compare-and-swap and can never race with approval
//! or rejection.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::types::{AttributeType, SchemaVersion};

const STATUS_SHIFT: u32 = 56;
const COUNT_MASK: u64 = (1 << STATUS_SHIFT) - 1;

const PENDING: u64 = 0;
const APPROVING: u64 = 1;
const APPROVED: u64 = 2;
const REJECTED: u64 = 3;

// ─────────────────────────────────────────────────────────────────
// Identifiers & Status
// ─────────────────────────────────────────────────────────────────

/// Candidate identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateId(Uuid);

impl CandidateId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CandidateId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for CandidateId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Governance review status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
}

impl ReviewStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReviewStatus::Pending)
    }
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReviewStatus::Pending => write!(f, "pending"),
            ReviewStatus::Approved => write!(f, "approved"),
            ReviewStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// Snapshot of a candidate for governance tooling
#[derive(Debug, Clone, Serialize)]
pub struct FieldCandidate {
    pub id: CandidateId,
    pub path: String,
    pub samples: Vec<serde_json::Value>,
    pub contexts: Vec<String>,
    pub occurrences: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub proposed_type: Option<AttributeType>,
    pub confidence: f64,
    pub status: ReviewStatus,
    pub rejection_reason: Option<String>,
    pub approved_in: Option<SchemaVersion>,
}

// ─────────────────────────────────────────────────────────────────
// Candidate Entry
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct CandidateDetail {
    samples: VecDeque<serde_json::Value>,
    contexts: VecDeque<String>,
    type_votes: BTreeMap<AttributeType, u64>,
    rejection_reason: Option<String>,
    approved_in: Option<SchemaVersion>,
    type_override: Option<AttributeType>,
}

/// Live candidate shared between observers and reviewers
#[derive(Debug)]
pub struct CandidateEntry {
    id: CandidateId,
    path: String,
    state: AtomicU64,
    first_seen: DateTime<Utc>,
    last_seen_ms: AtomicI64,
    detail: Mutex<CandidateDetail>,
}

impl CandidateEntry {
    pub fn new(path: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: CandidateId::new(),
            path: path.into(),
            state: AtomicU64::new(pack(PENDING, 0)),
            first_seen: now,
            last_seen_ms: AtomicI64::new(now.timestamp_millis()),
            detail: Mutex::new(CandidateDetail::default()),
        }
    }

    pub fn id(&self) -> CandidateId {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn occurrences(&self) -> u64 {
        self.state.load(Ordering::Acquire) & COUNT_MASK
    }

    pub fn status(&self) -> ReviewStatus {
        public_status(self.state.load(Ordering::Acquire) >> STATUS_SHIFT)
    }

    /// Count one observation unless reviewed; returns the new count
    ///
    /// An approval in flight still counts, so nothing is lost if it aborts.
    pub fn record(&self) -> Option<u64> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let status = current >> STATUS_SHIFT;
            if status != PENDING && status != APPROVING {
                return None;
            }
            let count = (current & COUNT_MASK) + 1;
            match self.state.compare_exchange_weak(
                current,
                pack(status, count),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.last_seen_ms
                        .fetch_max(Utc::now().timestamp_millis(), Ordering::AcqRel);
                    return Some(count);
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Keep a bounded sample of example values and detection contexts
    pub fn remember(
        &self,
        sample: &serde_json::Value,
        context: Option<&str>,
        max_samples: usize,
        max_contexts: usize,
    ) {
        let mut detail = self.detail.lock();
        if let Some(t) = AttributeType::infer(sample) {
            *detail.type_votes.entry(t).or_insert(0) += 1;
        }
        if max_samples > 0 && !detail.samples.contains(sample) {
            if detail.samples.len() >= max_samples {
                detail.samples.pop_front();
            }
            detail.samples.push_back(sample.clone());
        }
        if let Some(ctx) = context {
            if max_contexts > 0 && !detail.contexts.iter().any(|c| c == ctx) {
                if detail.contexts.len() >= max_contexts {
                    detail.contexts.pop_front();
                }
                detail.contexts.push_back(ctx.to_string());
            }
        }
    }

    /// Claim the candidate for approval: pending -> approving
    pub(crate) fn begin_approval(&self) -> Result<(), ReviewStatus> {
        self.transition(PENDING, APPROVING)
    }

    /// Approval committed
    pub(crate) fn finish_approval(&self, version: SchemaVersion) {
        self.detail.lock().approved_in = Some(version);
        let _ = self.transition(APPROVING, APPROVED);
    }

    /// Approval abandoned; accumulation resumes
    pub(crate) fn abort_approval(&self) {
        let _ = self.transition(APPROVING, PENDING);
    }

    /// pending -> rejected
    pub(crate) fn reject(&self, reason: &str) -> Result<(), ReviewStatus> {
        self.transition(PENDING, REJECTED)?;
        self.detail.lock().rejection_reason = Some(reason.to_string());
        Ok(())
    }

    pub(crate) fn set_type_override(&self, attr_type: Option<AttributeType>) {
        self.detail.lock().type_override = attr_type;
    }

    fn transition(&self, from: u64, to: u64) -> Result<(), ReviewStatus> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >> STATUS_SHIFT != from {
                return Err(public_status(current >> STATUS_SHIFT));
            }
            match self.state.compare_exchange_weak(
                current,
                pack(to, current & COUNT_MASK),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Type the field would be added with
    pub fn field_type(&self) -> AttributeType {
        let detail = self.detail.lock();
        detail
            .type_override
            .or_else(|| majority(&detail.type_votes).map(|(t, _)| t))
            .unwrap_or(AttributeType::Text)
    }

    /// Point-in-time view; confidence = type agreement x min(1, occurrences / min_support)
    pub fn snapshot(&self, min_support: u64) -> FieldCandidate {
        let occurrences = self.occurrences();
        let status = self.status();
        let detail = self.detail.lock();

        let total_votes: u64 = detail.type_votes.values().sum();
        let (proposed_type, agreement) = match majority(&detail.type_votes) {
            Some((t, votes)) if total_votes > 0 => (Some(t), votes as f64 / total_votes as f64),
            _ => (None, 0.0),
        };
        let support = if min_support == 0 {
            1.0
        } else {
            (occurrences as f64 / min_support as f64).min(1.0)
        };

        FieldCandidate {
            id: self.id,
            path: self.path.clone(),
            samples: detail.samples.iter().cloned().collect(),
            contexts: detail.contexts.iter().cloned().collect(),
            occurrences,
            first_seen: self.first_seen,
            last_seen: Utc
                .timestamp_millis_opt(self.last_seen_ms.load(Ordering::Acquire))
                .single()
                .unwrap_or(self.first_seen),
            proposed_type: detail.type_override.or(proposed_type),
            confidence: agreement * support,
            status,
            rejection_reason: detail.rejection_reason.clone(),
            approved_in: detail.approved_in,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Persistence
// ─────────────────────────────────────────────────────────────────

/// Journaled form of a candidate
///
/// An approval still in flight is written as pending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub id: CandidateId,
    pub path: String,
    pub occurrences: u64,
    pub status: ReviewStatus,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub samples: Vec<serde_json::Value>,
    #[serde(default)]
    pub contexts: Vec<String>,
    #[serde(default)]
    pub type_votes: Vec<(AttributeType, u64)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_override: Option<AttributeType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_in: Option<SchemaVersion>,
}

impl CandidateEntry {
    pub fn to_record(&self) -> CandidateRecord {
        let state = self.state.load(Ordering::Acquire);
        let last_seen = Utc
            .timestamp_millis_opt(self.last_seen_ms.load(Ordering::Acquire))
            .single()
            .unwrap_or(self.first_seen);
        let detail = self.detail.lock();
        CandidateRecord {
            id: self.id,
            path: self.path.clone(),
            occurrences: state & COUNT_MASK,
            status: public_status(state >> STATUS_SHIFT),
            first_seen: self.first_seen,
            last_seen,
            samples: detail.samples.iter().cloned().collect(),
            contexts: detail.contexts.iter().cloned().collect(),
            type_votes: detail.type_votes.iter().map(|(t, n)| (*t, *n)).collect(),
            type_override: detail.type_override,
            rejection_reason: detail.rejection_reason.clone(),
            approved_in: detail.approved_in,
        }
    }

    pub fn from_record(record: CandidateRecord) -> Self {
        let status = match record.status {
            ReviewStatus::Pending => PENDING,
            ReviewStatus::Approved => APPROVED,
            ReviewStatus::Rejected => REJECTED,
        };
        Self {
            id: record.id,
            path: record.path,
            state: AtomicU64::new(pack(status, record.occurrences)),
            first_seen: record.first_seen,
            last_seen_ms: AtomicI64::new(record.last_seen.timestamp_millis()),
            detail: Mutex::new(CandidateDetail {
                samples: record.samples.into(),
                contexts: record.contexts.into(),
                type_votes: record.type_votes.into_iter().collect(),
                rejection_reason: record.rejection_reason,
                approved_in: record.approved_in,
                type_override: record.type_override,
            }),
        }
    }
}

fn pack(status: u64, count: u64) -> u64 {
    (status << STATUS_SHIFT) | (count & COUNT_MASK)
}

fn public_status(raw: u64) -> ReviewStatus {
    match raw {
        APPROVED => ReviewStatus::Approved,
        REJECTED => ReviewStatus::Rejected,
        _ => ReviewStatus::Pending,
    }
}

/// Most voted type; ties go to the earlier-declared type
fn majority(votes: &BTreeMap<AttributeType, u64>) -> Option<(AttributeType, u64)> {
    votes.iter().fold(None, |best, (&t, &n)| match best {
        Some((_, m)) if m >= n => best,
        _ => Some((t, n)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_record_counts_while_pending() {
        let entry = CandidateEntry::new("hair_color");
        assert_eq!(entry.record(), Some(1));
        assert_eq!(entry.record(), Some(2));
        entry.reject("not an attribute").unwrap();
        assert_eq!(entry.record(), None);
        assert_eq!(entry.occurrences(), 2);
        assert_eq!(entry.status(), ReviewStatus::Rejected);
    }

    #[test]
    fn test_approval_is_claimed_once() {
        let entry = CandidateEntry::new("hair_color");
        entry.record();
        assert!(entry.begin_approval().is_ok());
        assert_eq!(entry.begin_approval(), Err(ReviewStatus::Pending));
        entry.abort_approval();
        entry.begin_approval().unwrap();
        entry.finish_approval(SchemaVersion::new(1, 1));
        assert_eq!(entry.status(), ReviewStatus::Approved);
        assert_eq!(entry.record(), None);
        assert_eq!(entry.reject("late"), Err(ReviewStatus::Approved));
    }

    #[test]
    fn test_sightings_during_aborted_approval_are_kept() {
        let entry = CandidateEntry::new("hair_color");
        entry.record();
        entry.begin_approval().unwrap();
        assert_eq!(entry.record(), Some(2));
        assert_eq!(entry.status(), ReviewStatus::Pending);
        entry.abort_approval();
        assert_eq!(entry.record(), Some(3));
        assert_eq!(entry.occurrences(), 3);
    }

    #[test]
    fn test_concurrent_record_has_no_lost_updates() {
        let entry = Arc::new(CandidateEntry::new("tattoos"));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let entry = entry.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        entry.record();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(entry.occurrences(), 8000);
    }

    #[test]
    fn test_samples_are_bounded_and_distinct() {
        let entry = CandidateEntry::new("hair_color");
        for v in ["red", "red", "blue", "green", "black"] {
            entry.remember(&json!(v), Some("description"), 3, 2);
        }
        let snap = entry.snapshot(5);
        assert_eq!(snap.samples, vec![json!("blue"), json!("green"), json!("black")]);
        assert_eq!(snap.contexts, vec!["description".to_string()]);
    }

    #[test]
    fn test_confidence_and_proposed_type() {
        let entry = CandidateEntry::new("height_cm");
        for v in [json!(170), json!(182), json!(165), json!("tall")] {
            entry.record();
            entry.remember(&v, None, 10, 10);
        }
        let snap = entry.snapshot(8);
        assert_eq!(snap.proposed_type, Some(AttributeType::Number));
        // 3 of 4 agree, 4 of 8 support
        assert!((snap.confidence - 0.375).abs() < 1e-9);
        assert_eq!(entry.field_type(), AttributeType::Number);
    }

    #[test]
    fn test_candidate_id_parse() {
        let id = CandidateId::new();
        assert_eq!(id.to_string().parse::<CandidateId>().unwrap(), id);
        assert!("nope".parse::<CandidateId>().is_err());
    }

    #[test]
    fn test_record_restores_review_state() {
        let entry = CandidateEntry::new("scar_location");
        entry.record();
        entry.remember(&json!(true), Some("artifact"), 5, 5);
        entry.record();
        entry.begin_approval().unwrap();

        let record = entry.to_record();
        assert_eq!(record.status, ReviewStatus::Pending);
        assert_eq!(record.occurrences, 2);

        let restored = CandidateEntry::from_record(record);
        assert_eq!(restored.id(), entry.id());
        assert_eq!(restored.occurrences(), 2);
        assert_eq!(restored.field_type(), AttributeType::Boolean);
        assert_eq!(restored.record(), Some(3));

        restored.reject("noise").unwrap();
        let closed = CandidateEntry::from_record(restored.to_record());
        assert_eq!(closed.status(), ReviewStatus::Rejected);
        assert_eq!(closed.record(), None);
        assert_eq!(closed.snapshot(5).rejection_reason.as_deref(), Some("noise"));
    }
}
