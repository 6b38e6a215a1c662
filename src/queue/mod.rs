//! Deferred analysis job queue
//!
//! Jobs are persisted in the audit store, claimed under leases by
//! background workers, and retried with exponential backoff behind one
//! circuit breaker per analysis type.

pub mod breaker;
pub mod job;
pub mod queue;
pub mod retry;
pub mod worker;

pub use breaker::{BreakerConfig, BreakerSet, BreakerStatus, CircuitBreaker};
pub use job::{AttemptError, AttemptOutcome, BiasJob, JobEvent, JobPriority, JobStatus, Lease};
pub use queue::{EnqueueOutcome, JobQueue, QueueConfig};
pub use retry::RetryPolicy;
pub use worker::{spawn_workers, JobReport, JobWorker};
