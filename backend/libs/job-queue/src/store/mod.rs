//! Job persistence.
//!
//! Every mutation a lease holder makes carries the lease token; stores reject a
//! stale token with [`JobError::LeaseLost`](crate::JobError::LeaseLost).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::JobResult;
use crate::job::{JobRecord, LeasedJob, QueueStats};

mod memory;
mod redis;

pub use memory::InMemoryJobStore;
pub use self::redis::{RedisJobStore, SharedConnectionManager};

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new Pending job and assign its enqueue sequence.
    async fn insert(&self, record: JobRecord) -> JobResult<JobRecord>;

    async fn get(&self, job_id: Uuid) -> JobResult<Option<JobRecord>>;

    /// Lease the earliest due Pending job of `queue_name`, ordered by
    /// `next_run_at` then enqueue sequence. Counts the attempt.
    async fn lease_next(
        &self,
        queue_name: &str,
        now: DateTime<Utc>,
        lease_expiry: DateTime<Utc>,
    ) -> JobResult<Option<LeasedJob>>;

    async fn complete(&self, job_id: Uuid, token: Uuid, now: DateTime<Utc>) -> JobResult<JobRecord>;

    /// Record a failed attempt and put the job back to Pending at `next_run_at`.
    async fn retry(
        &self,
        job_id: Uuid,
        token: Uuid,
        error: &str,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> JobResult<JobRecord>;

    /// Record a failed attempt and move the job to the dead-letter set.
    async fn dead_letter(
        &self,
        job_id: Uuid,
        token: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> JobResult<JobRecord>;

    /// Give the job back without counting the attempt.
    async fn release(&self, job_id: Uuid, token: Uuid, now: DateTime<Utc>) -> JobResult<JobRecord>;

    /// Requeue or dead-letter every job whose lease expired before `now`.
    async fn recover_expired(&self, now: DateTime<Utc>) -> JobResult<Vec<JobRecord>>;

    /// Dead-lettered jobs of a queue, oldest first.
    async fn dead_letters(&self, queue_name: &str, limit: usize) -> JobResult<Vec<JobRecord>>;

    /// Reset a dead-lettered job to Pending with a fresh attempt budget.
    async fn replay(&self, job_id: Uuid, now: DateTime<Utc>) -> JobResult<JobRecord>;

    /// Delete Completed/DeadLettered jobs last updated before `older_than`.
    async fn purge_finished(&self, older_than: DateTime<Utc>) -> JobResult<usize>;

    async fn stats(&self, queue_name: &str) -> JobResult<QueueStats>;
}
