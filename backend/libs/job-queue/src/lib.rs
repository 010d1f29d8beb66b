//! # Durable job queue
//!
//! Deferred work with retries, leases and a dead-letter set.
//!
//! A job is enqueued Pending with a typed, validated payload. Workers lease
//! the earliest due job per queue (`next_run_at`, then FIFO), run it, and
//! settle the attempt:
//!
//! - success: Completed
//! - transient failure: back to Pending after `min(base * 2^attempts, cap)`
//! - budget spent or fatal failure: DeadLettered, reported on the outcome stream
//!
//! Attempts are counted when the lease is granted. A lease that expires
//! without settlement is recovered by the reaper, and the stale holder's
//! writes fail with [`JobError::LeaseLost`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use job_queue::{
//!     EnqueueOptions, InMemoryJobStore, JobContext, JobFailure, JobHandler, JobPayload,
//!     JobQueue, QueueConfig, WorkerConfig, WorkerPool,
//! };
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! #[serde(tag = "kind", content = "payload")]
//! enum MailJob {
//!     #[serde(rename = "welcome")]
//!     Welcome { address: String },
//! }
//!
//! impl JobPayload for MailJob {
//!     fn kind(&self) -> &'static str {
//!         "welcome"
//!     }
//! }
//!
//! struct Mailer;
//!
//! #[async_trait::async_trait]
//! impl JobHandler<MailJob> for Mailer {
//!     async fn handle(&self, _ctx: &JobContext, _job: MailJob) -> Result<(), JobFailure> {
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> Result<(), job_queue::JobError> {
//! let queue = JobQueue::new(Arc::new(InMemoryJobStore::new()), QueueConfig::default());
//! let (_tx, shutdown) = tokio::sync::watch::channel(false);
//! WorkerPool::new(queue.clone(), Arc::new(Mailer), WorkerConfig::new("mail")).spawn(shutdown);
//!
//! queue
//!     .enqueue(
//!         "mail",
//!         &MailJob::Welcome { address: "a@example.com".into() },
//!         EnqueueOptions::default(),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod clock;
pub mod error;
pub mod job;
pub mod metrics;
pub mod queue;
pub mod store;
pub mod worker;

pub use backoff::BackoffPolicy;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{JobError, JobResult};
pub use job::{
    validate_queue_name, EnqueueOptions, JobOutcome, JobPayload, JobRecord, JobState, LeasedJob,
    OutcomeStatus, QueueStats,
};
pub use metrics::{register_collector, QueueMetrics};
pub use queue::{JobQueue, QueueConfig};
pub use store::{InMemoryJobStore, JobStore, RedisJobStore, SharedConnectionManager};
pub use worker::{JobContext, JobFailure, JobHandler, WorkerConfig, WorkerPool, WorkerPoolHandle};
