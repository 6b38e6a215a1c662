//! Job queue front door
//!
//! Enqueue, consent gating and claims. Job state lives in the
//! [`AuditStore`]; this type adds the feature switch, the consent registry
//! and a wakeup signal for idle workers.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::{AuditStore, JobStats, Pseudonym};
use crate::types::{AnalysisType, JobId, SetId};

use super::job::{BiasJob, JobPriority, Lease};
use super::retry::RetryPolicy;

// ─────────────────────────────────────────────────────────────────
// Queue Configuration
// ─────────────────────────────────────────────────────────────────

/// `[queue]` config section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Deferred analysis on/off; when off, enqueue is a successful no-op
    pub enabled: bool,

    /// Background workers
    pub workers: usize,

    /// Retries before a job is dead-lettered
    pub max_retries: u32,

    /// Visibility lease held while a worker runs a job
    pub lease_secs: u64,

    /// Idle poll interval
    pub poll_interval_ms: u64,

    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,

    /// Backoff randomization factor in [0, 1]
    pub jitter: f64,

    /// Timeout for one analysis call
    pub call_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: 2,
            max_retries: 3,
            lease_secs: 60,
            poll_interval_ms: 500,
            backoff_base_ms: 2_000,
            backoff_max_ms: 300_000,
            jitter: 0.5,
            call_timeout_ms: 10_000,
        }
    }
}

impl QueueConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms.max(self.backoff_base_ms)),
            jitter: self.jitter,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Job Queue
// ─────────────────────────────────────────────────────────────────

/// Result of an enqueue call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued(JobId),
    /// Deferred analysis is switched off; nothing was stored
    Disabled,
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            EnqueueOutcome::Queued(id) => Some(*id),
            EnqueueOutcome::Disabled => None,
        }
    }
}

/// Deferred analysis queue
#[derive(Debug)]
pub struct JobQueue {
    config: QueueConfig,
    store: Arc<AuditStore>,
    withdrawn: RwLock<HashSet<Pseudonym>>,
    work: Notify,
}

impl JobQueue {
    pub fn new(config: QueueConfig, store: Arc<AuditStore>) -> Self {
        Self {
            config,
            store,
            withdrawn: RwLock::new(HashSet::new()),
            work: Notify::new(),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<AuditStore> {
        &self.store
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Queue analyses for a stored attribute set
    pub fn enqueue(
        &self,
        pseudonym: &Pseudonym,
        attribute_set: SetId,
        analyses: &[AnalysisType],
        priority: JobPriority,
    ) -> Result<EnqueueOutcome> {
        if !self.config.enabled {
            debug!(session = %pseudonym, "Deferred analysis disabled, enqueue skipped");
            return Ok(EnqueueOutcome::Disabled);
        }
        if analyses.is_empty() {
            return Err(Error::NotSupported("a job needs at least one analysis type".to_string()));
        }

        // Held across the insert so a concurrent withdrawal either sees
        // this job when it cancels or blocks it here.
        let withdrawn = self.withdrawn.read();
        if withdrawn.contains(pseudonym) {
            return Err(Error::ConsentWithdrawn(pseudonym.to_string()));
        }
        let job = BiasJob::new(pseudonym.clone(), attribute_set, analyses, priority);
        let id = self.store.insert_job(job)?;
        drop(withdrawn);

        debug!(
            job = %id,
            session = %pseudonym,
            analyses = analyses.len(),
            ?priority,
            "Job enqueued"
        );
        self.work.notify_one();
        Ok(EnqueueOutcome::Queued(id))
    }

    /// Block future enqueues and cancel outstanding jobs
    pub fn withdraw_consent(&self, pseudonym: &Pseudonym) -> Result<usize> {
        self.withdrawn.write().insert(pseudonym.clone());
        let cancelled = self
            .store
            .cancel_jobs_for(pseudonym, "consent withdrawn", Utc::now())?;
        info!(session = %pseudonym, cancelled, "Consent withdrawn");
        Ok(cancelled)
    }

    /// Allow enqueues again; cancelled jobs stay cancelled
    pub fn restore_consent(&self, pseudonym: &Pseudonym) -> bool {
        let restored = self.withdrawn.write().remove(pseudonym);
        if restored {
            info!(session = %pseudonym, "Consent restored");
        }
        restored
    }

    pub fn has_consent(&self, pseudonym: &Pseudonym) -> bool {
        !self.withdrawn.read().contains(pseudonym)
    }

    /// Claim the next eligible job under a fresh lease
    pub fn claim(&self, worker_id: &str) -> Result<Option<(BiasJob, Lease)>> {
        self.store.claim_next_job(worker_id, self.config.lease(), Utc::now())
    }

    /// Renew a held lease for another full lease period
    pub fn extend_lease(&self, job_id: JobId, token: Uuid) -> Result<bool> {
        self.store.extend_lease(job_id, token, self.config.lease(), Utc::now())
    }

    /// Return expired leases to pending and wake a worker if any were
    pub fn reap_expired(&self) -> Result<usize> {
        let reaped = self.store.reap_expired_leases(Utc::now())?;
        if reaped > 0 {
            self.work.notify_one();
        }
        Ok(reaped)
    }

    /// Wait until work is signalled or the poll interval passes
    pub async fn wait_for_work(&self) {
        let _ = tokio::time::timeout(self.config.poll_interval(), self.work.notified()).await;
    }

    pub fn stats(&self) -> JobStats {
        self.store.job_stats()
    }

    pub fn dead_letters(&self) -> Vec<BiasJob> {
        self.store.dead_letters()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::job::JobStatus;
    use crate::schema::source::fallback_schema;
    use crate::schema::types::{AttributeValue, TypedAttributeMap};
    use crate::store::AttributeSet;
    use crate::types::SourceTag;

    fn setup(config: QueueConfig) -> (JobQueue, Pseudonym, SetId) {
        let store = Arc::new(AuditStore::in_memory());
        let schema = fallback_schema();
        let p = Pseudonym::new("queue-test").unwrap();
        let mut values = TypedAttributeMap::new();
        values.insert("age".into(), AttributeValue::Text("adult".into()));
        let set = AttributeSet::new(p.clone(), SourceTag::Artifact, schema.version(), values);
        let id = store.append_attribute_set(set, &schema).unwrap();
        (JobQueue::new(config, store), p, id)
    }

    #[test]
    fn test_disabled_enqueue_is_noop() {
        let (queue, p, set) = setup(QueueConfig {
            enabled: false,
            ..Default::default()
        });
        let outcome = queue
            .enqueue(&p, set, &[AnalysisType::AgeStereotype], JobPriority::Normal)
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Disabled);
        assert_eq!(queue.stats().total(), 0);
    }

    #[test]
    fn test_enqueue_and_claim() {
        let (queue, p, set) = setup(QueueConfig::default());
        let id = queue
            .enqueue(&p, set, &[AnalysisType::AgeStereotype], JobPriority::High)
            .unwrap()
            .job_id()
            .unwrap();
        let (job, lease) = queue.claim("w1").unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(lease.worker_id, "w1");
        assert!(queue.claim("w2").unwrap().is_none());
    }

    #[test]
    fn test_withdrawn_consent_blocks_and_cancels() {
        let (queue, p, set) = setup(QueueConfig::default());
        queue
            .enqueue(&p, set, &[AnalysisType::AgeStereotype], JobPriority::Normal)
            .unwrap();
        assert_eq!(queue.withdraw_consent(&p).unwrap(), 1);
        assert_eq!(queue.stats().cancelled, 1);

        let err = queue
            .enqueue(&p, set, &[AnalysisType::AgeStereotype], JobPriority::Normal)
            .unwrap_err();
        assert!(matches!(err, Error::ConsentWithdrawn(_)));

        assert!(queue.restore_consent(&p));
        assert!(queue.has_consent(&p));
        assert!(queue
            .enqueue(&p, set, &[AnalysisType::AgeStereotype], JobPriority::Normal)
            .is_ok());
    }

    #[test]
    fn test_unknown_set_is_rejected() {
        let (queue, p, _) = setup(QueueConfig::default());
        let err = queue
            .enqueue(&p, SetId::new(), &[AnalysisType::AgeStereotype], JobPriority::Normal)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_retry_policy_from_config() {
        let config = QueueConfig {
            backoff_base_ms: 100,
            backoff_max_ms: 50,
            ..Default::default()
        };
        let policy = config.retry_policy();
        assert_eq!(policy.base_delay, Duration::from_millis(100));
        assert_eq!(policy.max_delay, Duration::from_millis(100));
    }
}
