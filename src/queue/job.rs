//! Bias analysis jobs
//!
//! Job state machine:
//!
//! ```text
//! pending -> running -> completed
//!               |  \--> cancelled
//!               v
//!             failed -> pending (retry) | dead_letter
//! ```
//!
//! A running job may also return to pending without consuming retry budget:
//! when its lease expires, when it made partial progress, or when every
//! remaining analysis was deferred by an open circuit.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::{BiasResult, Pseudonym};
use crate::types::{AnalysisType, JobId, SetId};

// ─────────────────────────────────────────────────────────────────
// Priority & Status
// ─────────────────────────────────────────────────────────────────

/// Claim order: higher first, then oldest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl std::str::FromStr for JobPriority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(JobPriority::Low),
            "normal" => Ok(JobPriority::Normal),
            "high" => Ok(JobPriority::High),
            "critical" => Ok(JobPriority::Critical),
            _ => Err(format!("Unknown priority '{}'", s)),
        }
    }
}

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    DeadLetter,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled | JobStatus::DeadLetter)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Pending)
                | (Failed, Pending)
                | (Failed, DeadLetter)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::DeadLetter => "dead_letter",
        };
        f.write_str(s)
    }
}

// ─────────────────────────────────────────────────────────────────
// Job Records
// ─────────────────────────────────────────────────────────────────

/// Visibility lease held by the worker running a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub worker_id: String,
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Status change with context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub at: DateTime<Utc>,
    pub from: JobStatus,
    pub to: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// A failed analysis call within one attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptError {
    pub attempt: u32,
    pub analysis: AnalysisType,
    pub message: String,
    pub transient: bool,
    pub at: DateTime<Utc>,
}

/// Everything one worker attempt produced
#[derive(Debug, Clone, Default)]
pub struct AttemptOutcome {
    pub results: Vec<BiasResult>,
    pub failures: Vec<AttemptError>,
    /// Analyses skipped by an open circuit, with the time it may close
    pub deferred: Vec<(AnalysisType, DateTime<Utc>)>,
}

/// Deferred analysis request for one attribute set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasJob {
    pub id: JobId,
    pub pseudonym: Pseudonym,
    pub attribute_set: SetId,
    pub analyses: Vec<AnalysisType>,
    pub priority: JobPriority,
    pub status: JobStatus,
    /// Retries consumed; bounded by `max_retries`
    pub retry_count: u32,
    /// Claims made, including ones that ended by lease expiry
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_attempt_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub lease: Option<Lease>,
    pub completed: BTreeSet<AnalysisType>,
    pub permanently_failed: BTreeSet<AnalysisType>,
    pub errors: Vec<AttemptError>,
    pub history: Vec<JobEvent>,
}

impl BiasJob {
    pub fn new(
        pseudonym: Pseudonym,
        attribute_set: SetId,
        analyses: &[AnalysisType],
        priority: JobPriority,
    ) -> Self {
        let now = Utc::now();
        let mut unique: Vec<AnalysisType> = Vec::with_capacity(analyses.len());
        for a in analyses {
            if !unique.contains(a) {
                unique.push(*a);
            }
        }
        Self {
            id: JobId::new(),
            pseudonym,
            attribute_set,
            analyses: unique,
            priority,
            status: JobStatus::Pending,
            retry_count: 0,
            attempts: 0,
            created_at: now,
            updated_at: now,
            next_attempt_at: now,
            finished_at: None,
            lease: None,
            completed: BTreeSet::new(),
            permanently_failed: BTreeSet::new(),
            errors: Vec::new(),
            history: Vec::new(),
        }
    }

    /// Analyses that still need a result
    pub fn remaining(&self) -> Vec<AnalysisType> {
        self.analyses
            .iter()
            .copied()
            .filter(|a| !self.completed.contains(a) && !self.permanently_failed.contains(a))
            .collect()
    }

    /// Claimable now: pending and due, or running under an expired lease
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending => self.next_attempt_at <= now,
            JobStatus::Running => self.lease.as_ref().map_or(true, |l| l.is_expired(now)),
            _ => false,
        }
    }

    pub fn holds_lease(&self, token: Uuid) -> bool {
        self.status == JobStatus::Running && self.lease.as_ref().map_or(false, |l| l.token == token)
    }

    /// Validated status change, recorded in history
    pub fn transition(
        &mut self,
        to: JobStatus,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(Error::Internal(format!(
                "invalid job transition {} -> {} for {}",
                self.status, to, self.id
            )));
        }
        self.history.push(JobEvent {
            at: now,
            from: self.status,
            to,
            note,
        });
        self.status = to;
        self.updated_at = now;
        if to != JobStatus::Running {
            self.lease = None;
        }
        if to.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(())
    }

    /// Take the job under a fresh lease
    pub fn claim(
        &mut self,
        worker_id: &str,
        lease_for: Duration,
        now: DateTime<Utc>,
    ) -> Result<Lease> {
        if !self.is_claimable(now) {
            return Err(Error::Internal(format!(
                "job {} is {} and not claimable",
                self.id, self.status
            )));
        }
        if self.status == JobStatus::Running {
            let holder = self.lease.as_ref().map(|l| l.worker_id.clone()).unwrap_or_default();
            self.transition(
                JobStatus::Pending,
                Some(format!("lease held by '{}' expired", holder)),
                now,
            )?;
        }
        self.transition(JobStatus::Running, Some(format!("claimed by '{}'", worker_id)), now)?;
        let lease = Lease {
            worker_id: worker_id.to_string(),
            token: Uuid::new_v4(),
            expires_at: lease_deadline(now, lease_for),
        };
        self.lease = Some(lease.clone());
        self.attempts += 1;
        Ok(lease)
    }

    /// Push the lease deadline out; refused once the lease has lapsed or moved
    pub fn renew_lease(&mut self, token: Uuid, lease_for: Duration, now: DateTime<Utc>) -> bool {
        if !self.holds_lease(token) {
            return false;
        }
        match self.lease.as_mut() {
            Some(lease) if !lease.is_expired(now) => {
                lease.expires_at = lease_deadline(now, lease_for);
                true
            }
            _ => false,
        }
    }

    /// Release an expired lease without consuming retry budget
    pub fn expire_lease(&mut self, now: DateTime<Utc>) -> Result<bool> {
        match &self.lease {
            Some(lease) if self.status == JobStatus::Running && lease.is_expired(now) => {
                let holder = lease.worker_id.clone();
                self.transition(
                    JobStatus::Pending,
                    Some(format!("lease held by '{}' expired", holder)),
                    now,
                )?;
                self.next_attempt_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn cancel(&mut self, reason: &str, now: DateTime<Utc>) -> Result<bool> {
        if self.status.is_terminal() || self.status == JobStatus::Failed {
            return Ok(false);
        }
        self.transition(JobStatus::Cancelled, Some(reason.to_string()), now)?;
        Ok(true)
    }

    /// Fold one attempt's outcome into the job and pick the next status
    ///
    /// - nothing left to run: `completed` if any analysis ever succeeded,
    ///   otherwise `failed` then `dead_letter`
    /// - some analysis succeeded this attempt: back to `pending`, no budget used
    /// - transient failures and no success: `failed`, then a budgeted retry
    ///   or `dead_letter` once `max_retries` is spent
    /// - only circuit deferrals: back to `pending` at the earliest reopen time
    pub fn apply_attempt(
        &mut self,
        outcome: AttemptOutcome,
        max_retries: u32,
        retry_delay: impl Fn(u32) -> Duration,
        now: DateTime<Utc>,
    ) -> Result<JobStatus> {
        let progressed = !outcome.results.is_empty();
        let transient_failures = outcome.failures.iter().filter(|f| f.transient).count();

        for result in &outcome.results {
            self.completed.insert(result.analysis);
        }
        for failure in &outcome.failures {
            if !failure.transient {
                self.permanently_failed.insert(failure.analysis);
            }
        }
        let failure_summary = summarize(&outcome.failures);
        self.errors.extend(outcome.failures);

        let earliest_reopen = outcome.deferred.iter().map(|(_, at)| *at).min();
        let after_delay = |count: u32| now + to_chrono(retry_delay(count));

        if self.remaining().is_empty() {
            if !self.completed.is_empty() {
                self.transition(JobStatus::Completed, None, now)?;
            } else {
                self.transition(JobStatus::Failed, failure_summary, now)?;
                self.transition(
                    JobStatus::DeadLetter,
                    Some("every analysis failed permanently".to_string()),
                    now,
                )?;
            }
        } else if progressed {
            self.next_attempt_at = match (transient_failures > 0, earliest_reopen) {
                (true, _) => after_delay(self.retry_count),
                (false, Some(at)) => at,
                (false, None) => now,
            };
            self.transition(
                JobStatus::Pending,
                Some(format!("partial progress, {} analyses remaining", self.remaining().len())),
                now,
            )?;
        } else if transient_failures > 0 {
            self.transition(JobStatus::Failed, failure_summary, now)?;
            if self.retry_count >= max_retries {
                self.transition(
                    JobStatus::DeadLetter,
                    Some(format!("retry budget of {} exhausted", max_retries)),
                    now,
                )?;
            } else {
                self.retry_count += 1;
                self.next_attempt_at = after_delay(self.retry_count);
                self.transition(
                    JobStatus::Pending,
                    Some(format!("retry {}/{}", self.retry_count, max_retries)),
                    now,
                )?;
            }
        } else {
            self.next_attempt_at = earliest_reopen.unwrap_or(now);
            self.transition(
                JobStatus::Pending,
                Some("deferred by open circuit".to_string()),
                now,
            )?;
        }

        Ok(self.status)
    }
}

fn lease_deadline(now: DateTime<Utc>, lease_for: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(lease_for).unwrap_or(chrono::Duration::zero())
}

fn summarize(failures: &[AttemptError]) -> Option<String> {
    if failures.is_empty() {
        return None;
    }
    Some(
        failures
            .iter()
            .map(|f| format!("{}: {}", f.analysis, f.message))
            .collect::<Vec<_>>()
            .join("; "),
    )
}

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
