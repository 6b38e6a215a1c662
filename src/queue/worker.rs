//! Background analysis workers
//!
//! A worker claims one job at a time under a lease and runs every remaining
//! analysis through its circuit breaker with a per-call timeout, renewing
//! the lease before every call. Settlement only lands while the lease is
//! still held, so a job reclaimed after expiry is never written twice.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::analysis::{AnalysisRequest, AnalyzerRegistry};
use crate::error::{Error, Result};
use crate::store::{BiasResult, Settlement};
use crate::types::{JobId, ResultId};

use super::breaker::BreakerSet;
use super::job::{to_chrono, AttemptError, AttemptOutcome, JobStatus};
use super::queue::JobQueue;
use super::retry::RetryPolicy;

/// What one processed job ended as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub job_id: JobId,
    pub settlement: Settlement,
    pub succeeded: usize,
    pub failed: usize,
    pub deferred: usize,
}

/// One background worker
#[derive(Debug, Clone)]
pub struct JobWorker {
    id: String,
    queue: Arc<JobQueue>,
    analyzers: Arc<AnalyzerRegistry>,
    breakers: BreakerSet,
    policy: RetryPolicy,
}

impl JobWorker {
    pub fn new(
        id: impl Into<String>,
        queue: Arc<JobQueue>,
        analyzers: Arc<AnalyzerRegistry>,
        breakers: BreakerSet,
    ) -> Self {
        let policy = queue.config().retry_policy();
        Self {
            id: id.into(),
            queue,
            analyzers,
            breakers,
            policy,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Claim and run one job; `None` when nothing is eligible
    pub async fn process_one(&self) -> Result<Option<JobReport>> {
        let Some((job, lease)) = self.queue.claim(&self.id)? else {
            return Ok(None);
        };
        debug!(worker = %self.id, job = %job.id, attempt = job.attempts, "Processing job");

        let mut outcome = AttemptOutcome::default();
        let store = self.queue.store();
        let remaining = job.remaining();

        let Some(set) = store.attribute_set(job.attribute_set) else {
            for analysis in remaining {
                outcome.failures.push(AttemptError {
                    attempt: job.attempts,
                    analysis,
                    message: format!("attribute set {} no longer exists", job.attribute_set),
                    transient: false,
                    at: Utc::now(),
                });
            }
            return self.settle(job.id, lease.token, outcome).map(Some);
        };

        let call_timeout = self.queue.config().call_timeout();
        for analysis in remaining {
            let analyzer = match self.analyzers.get(analysis) {
                Ok(a) => a,
                Err(e) => {
                    outcome.failures.push(AttemptError {
                        attempt: job.attempts,
                        analysis,
                        message: e.to_string(),
                        transient: false,
                        at: Utc::now(),
                    });
                    continue;
                }
            };

            let breaker = self.breakers.get(analysis);
            if let Some(breaker) = breaker {
                let now = Instant::now();
                if let Err(until) = breaker.check(now) {
                    let wait = until.saturating_duration_since(now);
                    let err = Error::CircuitOpen {
                        analysis: analysis.to_string(),
                        retry_after_ms: wait.as_millis() as u64,
                    };
                    warn!(job = %job.id, "{}", err.format_for_log());
                    outcome.deferred.push((analysis, Utc::now() + to_chrono(wait)));
                    continue;
                }
            }

            // Each call gets a fresh lease so a long job is never reclaimed mid-flight
            if !self.queue.extend_lease(job.id, lease.token)? {
                let status = store.job(job.id).map(|j| j.status);
                let err = Error::LeaseLost(job.id.to_string());
                warn!(worker = %self.id, ?status, "{}", err.format_for_log());
                return Ok(Some(JobReport {
                    job_id: job.id,
                    settlement: Settlement::Discarded { status },
                    succeeded: outcome.results.len(),
                    failed: outcome.failures.len(),
                    deferred: outcome.deferred.len(),
                }));
            }

            let request = AnalysisRequest {
                job_id: job.id,
                attribute_set: set.id,
                analysis,
                schema_version: set.schema_version,
                attributes: set.values.clone(),
            };
            let call = tokio::time::timeout(call_timeout, analyzer.analyze(&request));
            let result = match call.await {
                Ok(result) => result,
                Err(_) => Err(Error::AnalysisTimeout {
                    analysis: analysis.to_string(),
                    timeout_ms: call_timeout.as_millis() as u64,
                }),
            };

            match result {
                Ok(finding) => {
                    if let Some(b) = breaker {
                        b.record_success();
                    }
                    let finding = finding.normalized();
                    outcome.results.push(BiasResult {
                        id: ResultId::new(),
                        job_id: job.id,
                        pseudonym: job.pseudonym.clone(),
                        attribute_set: job.attribute_set,
                        analysis,
                        detected: finding.detected,
                        confidence: finding.confidence,
                        indicators: finding.indicators,
                        recorded_at: Utc::now(),
                    });
                }
                Err(e) => {
                    let transient = e.is_retryable();
                    if let Some(b) = breaker {
                        // A permanent error means the dependency answered
                        if transient {
                            b.record_failure(Instant::now());
                        } else {
                            b.record_success();
                        }
                    }
                    warn!(
                        job = %job.id,
                        %analysis,
                        transient,
                        attempt = job.attempts,
                        "{}",
                        e.format_for_log()
                    );
                    outcome.failures.push(AttemptError {
                        attempt: job.attempts,
                        analysis,
                        message: e.to_string(),
                        transient,
                        at: Utc::now(),
                    });
                }
            }
        }

        self.settle(job.id, lease.token, outcome).map(Some)
    }

    fn settle(
        &self,
        job_id: JobId,
        token: uuid::Uuid,
        outcome: AttemptOutcome,
    ) -> Result<JobReport> {
        let succeeded = outcome.results.len();
        let failed = outcome.failures.len();
        let deferred = outcome.deferred.len();
        let policy = &self.policy;

        let settlement = self.queue.store().settle_attempt(
            job_id,
            token,
            outcome,
            policy.max_retries,
            |retry| policy.delay_for(retry),
            Utc::now(),
        )?;

        match &settlement {
            Settlement::Applied(JobStatus::DeadLetter) => {
                let job = self.queue.store().job(job_id);
                error!(
                    job = %job_id,
                    retries = job.as_ref().map(|j| j.retry_count),
                    errors = job.as_ref().map(|j| j.errors.len()),
                    "Job moved to dead letter"
                );
            }
            Settlement::Applied(status) => {
                debug!(job = %job_id, %status, succeeded, failed, deferred, "Attempt settled");
            }
            Settlement::Discarded { status } => {
                let err = Error::LeaseLost(job_id.to_string());
                warn!(worker = %self.id, ?status, "{}", err.format_for_log());
            }
        }

        Ok(JobReport {
            job_id,
            settlement,
            succeeded,
            failed,
            deferred,
        })
    }

    /// Work until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.id, "Worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.process_one().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => error!(worker = %self.id, "{}", e.format_for_log()),
            }
            tokio::select! {
                _ = self.queue.wait_for_work() => {}
                _ = shutdown.changed() => {}
            }
        }
        info!(worker = %self.id, "Worker stopped");
    }
}

/// Start `count` workers sharing one queue, registry and breaker set
pub fn spawn_workers(
    count: usize,
    queue: Arc<JobQueue>,
    analyzers: Arc<AnalyzerRegistry>,
    breakers: BreakerSet,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|n| {
            let worker = JobWorker::new(
                format!("worker-{}", n + 1),
                queue.clone(),
                analyzers.clone(),
                breakers.clone(),
            );
            tokio::spawn(worker.run(shutdown.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{MockAnalyzer, MockBehavior};
    use crate::queue::breaker::BreakerConfig;
    use crate::queue::job::JobPriority;
    use crate::queue::queue::QueueConfig;
    use crate::schema::source::fallback_schema;
    use crate::schema::types::{AttributeValue, TypedAttributeMap};
    use crate::store::{AttributeSet, AuditStore, Pseudonym};
    use crate::types::{AnalysisType, SetId, SourceTag};
    use std::time::Duration;

    struct Harness {
        queue: Arc<JobQueue>,
        mock: Arc<MockAnalyzer>,
        worker: JobWorker,
        pseudonym: Pseudonym,
        set: SetId,
    }

    fn harness(config: QueueConfig) -> Harness {
        let store = Arc::new(AuditStore::in_memory());
        let schema = fallback_schema();
        let pseudonym = Pseudonym::new("worker-test").unwrap();
        let mut values = TypedAttributeMap::new();
        values.insert("gender".into(), AttributeValue::Text("female".into()));
        let set = store
            .append_attribute_set(
                AttributeSet::new(pseudonym.clone(), SourceTag::Artifact, schema.version(), values),
                &schema,
            )
            .unwrap();

        let queue = Arc::new(JobQueue::new(config, store));
        let mock = Arc::new(MockAnalyzer::new());
        let analyzers = Arc::new(AnalyzerRegistry::single(mock.clone()));
        let breakers = BreakerSet::new(&BreakerConfig {
            failure_threshold: 2,
            window_secs: 60,
            cooldown_secs: 60,
        });
        let worker = JobWorker::new("test-worker", queue.clone(), analyzers, breakers);
        Harness {
            queue,
            mock,
            worker,
            pseudonym,
            set,
        }
    }

    fn immediate() -> QueueConfig {
        QueueConfig {
            backoff_base_ms: 0,
            backoff_max_ms: 0,
            jitter: 0.0,
            call_timeout_ms: 200,
            ..Default::default()
        }
    }

    fn enqueue(h: &Harness, analyses: &[AnalysisType]) -> JobId {
        h.queue
            .enqueue(&h.pseudonym, h.set, analyses, JobPriority::Normal)
            .unwrap()
            .job_id()
            .unwrap()
    }

    #[tokio::test]
    async fn test_job_completes() {
        let h = harness(immediate());
        let id = enqueue(&h, &[AnalysisType::GenderStereotype, AnalysisType::AgeStereotype]);

        let report = h.worker.process_one().await.unwrap().unwrap();
        assert_eq!(report.job_id, id);
        assert_eq!(report.settlement, Settlement::Applied(JobStatus::Completed));
        assert_eq!(h.queue.store().results_for(&h.pseudonym).len(), 2);
        assert!(h.worker.process_one().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_successes() {
        let h = harness(immediate());
        h.mock.set_behavior(AnalysisType::AgeStereotype, MockBehavior::FailTimes(1));
        let id = enqueue(&h, &[AnalysisType::GenderStereotype, AnalysisType::AgeStereotype]);

        let report = h.worker.process_one().await.unwrap().unwrap();
        assert_eq!(report.settlement, Settlement::Applied(JobStatus::Pending));
        assert_eq!(report.succeeded, 1);

        let report = h.worker.process_one().await.unwrap().unwrap();
        assert_eq!(report.settlement, Settlement::Applied(JobStatus::Completed));
        assert_eq!(h.mock.call_count(AnalysisType::GenderStereotype), 1);
        assert_eq!(h.queue.store().job(id).unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let h = harness(QueueConfig {
            max_retries: 0,
            ..immediate()
        });
        h.mock.set_behavior(AnalysisType::AgeStereotype, MockBehavior::Hang);
        let id = enqueue(&h, &[AnalysisType::AgeStereotype]);

        let report = h.worker.process_one().await.unwrap().unwrap();
        assert_eq!(report.settlement, Settlement::Applied(JobStatus::DeadLetter));
        let job = h.queue.store().job(id).unwrap();
        assert!(job.errors[0].transient);
        assert!(job.errors[0].message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_permanent_failure_dead_letters_without_retry() {
        let h = harness(immediate());
        h.mock.set_behavior(AnalysisType::AgeStereotype, MockBehavior::FailPermanent);
        let id = enqueue(&h, &[AnalysisType::AgeStereotype]);

        let report = h.worker.process_one().await.unwrap().unwrap();
        assert_eq!(report.settlement, Settlement::Applied(JobStatus::DeadLetter));
        assert_eq!(h.queue.store().job(id).unwrap().retry_count, 0);
        assert_eq!(h.queue.dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn test_open_circuit_defers_without_calling() {
        let h = harness(immediate());
        h.mock.set_behavior(AnalysisType::AgeStereotype, MockBehavior::FailTransient);

        // Two failing jobs open the age breaker (threshold 2)
        for _ in 0..2 {
            enqueue(&h, &[AnalysisType::AgeStereotype]);
            h.worker.process_one().await.unwrap().unwrap();
        }
        h.mock.reset_counts();

        let id = enqueue(&h, &[AnalysisType::AgeStereotype, AnalysisType::GenderStereotype]);
        let mut report = None;
        while let Some(r) = h.worker.process_one().await.unwrap() {
            if r.job_id == id {
                report = Some(r);
                break;
            }
        }
        let report = report.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(h.mock.call_count(AnalysisType::AgeStereotype), 0);

        let job = h.queue.store().job(id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert!(job.next_attempt_at > Utc::now() + chrono::Duration::seconds(30));
    }

    #[tokio::test]
    async fn test_cancelled_mid_flight_is_discarded() {
        let h = harness(QueueConfig {
            call_timeout_ms: 5_000,
            ..immediate()
        });
        let slow = Arc::new(MockAnalyzer::with_config(crate::analysis::MockConfig {
            latency_ms: 200,
            ..Default::default()
        }));
        let worker = JobWorker::new(
            "slow",
            h.queue.clone(),
            Arc::new(AnalyzerRegistry::single(slow)),
            BreakerSet::new(&BreakerConfig::default()),
        );
        let id = enqueue(&h, &[AnalysisType::AgeStereotype]);

        let queue = h.queue.clone();
        let p = h.pseudonym.clone();
        let cancel = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            queue.withdraw_consent(&p).unwrap();
        });
        let report = worker.process_one().await.unwrap().unwrap();
        cancel.await.unwrap();

        assert!(matches!(report.settlement, Settlement::Discarded { .. }));
        assert_eq!(h.queue.store().job(id).unwrap().status, JobStatus::Cancelled);
        assert!(h.queue.store().results_for(&h.pseudonym).is_empty());
    }

    #[tokio::test]
    async fn test_lease_renewed_between_calls() {
        let h = harness(QueueConfig {
            lease_secs: 1,
            call_timeout_ms: 900,
            ..immediate()
        });
        let slow = Arc::new(MockAnalyzer::with_config(crate::analysis::MockConfig {
            latency_ms: 700,
            ..Default::default()
        }));
        let worker = JobWorker::new(
            "w1",
            h.queue.clone(),
            Arc::new(AnalyzerRegistry::single(slow.clone())),
            BreakerSet::new(&BreakerConfig::default()),
        );
        let id = enqueue(&h, &[AnalysisType::AgeStereotype, AnalysisType::GenderStereotype]);
        let running = tokio::spawn(async move { worker.process_one().await });

        // Past the original lease, inside the renewed one
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(h.queue.reap_expired().unwrap(), 0);
        assert!(h.queue.claim("w2").unwrap().is_none());

        let report = running.await.unwrap().unwrap().unwrap();
        assert_eq!(report.job_id, id);
        assert_eq!(report.settlement, Settlement::Applied(JobStatus::Completed));
        assert_eq!(slow.call_count(AnalysisType::AgeStereotype), 1);
        assert_eq!(slow.total_calls(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_job_lease_cannot_be_renewed() {
        let h = harness(immediate());
        let id = enqueue(&h, &[AnalysisType::AgeStereotype]);
        let (job, lease) = h.queue.claim("w1").unwrap().unwrap();
        assert_eq!(job.id, id);

        h.queue.withdraw_consent(&h.pseudonym).unwrap();
        assert!(!h.queue.extend_lease(id, lease.token).unwrap());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = harness(immediate());
        enqueue(&h, &[AnalysisType::GenderStereotype]);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(h.worker.clone().run(rx));

        for _ in 0..50 {
            if h.queue.stats().completed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(h.queue.stats().completed, 1);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }
}
