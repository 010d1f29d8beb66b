use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backoff::BackoffPolicy;
use crate::clock::{Clock, SystemClock};
use crate::error::{JobError, JobResult};
use crate::job::{
    decode_payload, encode_payload, validate_queue_name, EnqueueOptions, JobOutcome, JobPayload,
    JobRecord, JobState, LeasedJob, OutcomeStatus, QueueStats,
};
use crate::metrics::QueueMetrics;
use crate::store::JobStore;
use crate::worker::{JobContext, JobFailure, JobHandler};

const OUTCOME_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub backoff: BackoffPolicy,
    /// Applied when [`EnqueueOptions::max_attempts`] is unset
    pub default_max_attempts: u32,
    /// How long a worker may hold a job before it is recovered
    pub lease_duration: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            default_max_attempts: 5,
            lease_duration: Duration::from_secs(60),
        }
    }
}

pub(crate) fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Typed facade over a [`JobStore`] for payloads of type `P`.
///
/// One `JobQueue` serves any number of named queues; the payload type fixes
/// which job kinds they accept.
pub struct JobQueue<P: JobPayload> {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    metrics: Option<QueueMetrics>,
    outcomes: broadcast::Sender<JobOutcome>,
    wakeup: Arc<Notify>,
    _payload: PhantomData<fn() -> P>,
}

impl<P: JobPayload> Clone for JobQueue<P> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            outcomes: self.outcomes.clone(),
            wakeup: Arc::clone(&self.wakeup),
            _payload: PhantomData,
        }
    }
}

impl<P: JobPayload> JobQueue<P> {
    pub fn new(store: Arc<dyn JobStore>, config: QueueConfig) -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        Self {
            store,
            clock: Arc::new(SystemClock),
            config,
            metrics: None,
            outcomes,
            wakeup: Arc::new(Notify::new()),
            _payload: PhantomData,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: QueueMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Validate and enqueue a typed payload.
    pub async fn enqueue(
        &self,
        queue_name: &str,
        payload: &P,
        opts: EnqueueOptions,
    ) -> JobResult<Uuid> {
        let (kind, content) = encode_payload(payload)?;
        self.insert(queue_name, &kind, content, opts).await
    }

    /// Enqueue loosely typed input. The payload must decode as `kind` and
    /// pass validation; it is stored in its canonical encoding.
    pub async fn enqueue_raw(
        &self,
        queue_name: &str,
        kind: &str,
        payload: Value,
        opts: EnqueueOptions,
    ) -> JobResult<Uuid> {
        let decoded: P = decode_payload(kind, &payload)?;
        self.enqueue(queue_name, &decoded, opts).await
    }

    async fn insert(
        &self,
        queue_name: &str,
        kind: &str,
        payload: Value,
        opts: EnqueueOptions,
    ) -> JobResult<Uuid> {
        validate_queue_name(queue_name)?;
        let max_attempts = opts
            .max_attempts
            .unwrap_or(self.config.default_max_attempts);
        if max_attempts == 0 {
            return Err(JobError::InvalidOptions(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        let now = self.clock.now();
        let record = JobRecord::new(
            queue_name,
            kind,
            payload,
            max_attempts,
            after(now, opts.delay),
            now,
        );
        let record = self.store.insert(record).await?;

        if let Some(metrics) = &self.metrics {
            metrics.enqueued.with_label_values(&[queue_name]).inc();
        }
        info!(
            job_id = %record.id,
            queue = %queue_name,
            kind = %kind,
            max_attempts,
            next_run_at = %record.next_run_at,
            "Job enqueued"
        );

        self.wakeup.notify_waiters();
        Ok(record.id)
    }

    /// Lease the next due job of `queue_name`, if any.
    pub async fn lease(&self, queue_name: &str) -> JobResult<Option<LeasedJob>> {
        let now = self.clock.now();
        let expiry = after(now, self.config.lease_duration);
        let leased = self.store.lease_next(queue_name, now, expiry).await?;

        if let Some(job) = &leased {
            if let Some(metrics) = &self.metrics {
                metrics.leased.with_label_values(&[queue_name]).inc();
            }
            debug!(
                job_id = %job.id(),
                queue = %queue_name,
                attempt = job.attempt(),
                "Job leased"
            );
        }
        Ok(leased)
    }

    /// Run `handler` on a leased job. A payload that no longer decodes is fatal.
    pub async fn execute<H>(&self, handler: &H, job: &LeasedJob) -> Result<(), JobFailure>
    where
        H: JobHandler<P> + ?Sized,
    {
        let payload: P = decode_payload(&job.record.kind, &job.record.payload)
            .map_err(|e| JobFailure::Fatal(e.to_string()))?;
        let ctx = JobContext::from(job);
        handler.handle(&ctx, payload).await
    }

    /// Record the result of one attempt and broadcast the outcome.
    pub async fn settle(
        &self,
        job: &LeasedJob,
        result: Result<(), JobFailure>,
    ) -> JobResult<JobOutcome> {
        let now = self.clock.now();
        let record = &job.record;

        let settled = match result {
            Ok(()) => self
                .store
                .complete(record.id, job.token, now)
                .await
                .map(|r| (r, OutcomeStatus::Completed)),
            Err(JobFailure::Transient(error)) if !record.attempts_exhausted() => {
                let next_run_at = after(now, self.config.backoff.next_delay(record.attempts));
                self.store
                    .retry(record.id, job.token, &error, next_run_at, now)
                    .await
                    .map(|r| (r, OutcomeStatus::Retrying { next_run_at, error }))
            }
            Err(JobFailure::Transient(error)) => self
                .store
                .dead_letter(record.id, job.token, &error, now)
                .await
                .map(|r| {
                    (
                        r,
                        OutcomeStatus::DeadLettered {
                            last_error: error,
                            exhausted: true,
                        },
                    )
                }),
            Err(JobFailure::Fatal(error)) => self
                .store
                .dead_letter(record.id, job.token, &error, now)
                .await
                .map(|r| {
                    (
                        r,
                        OutcomeStatus::DeadLettered {
                            last_error: error,
                            exhausted: false,
                        },
                    )
                }),
        };

        self.lease_ended(&record.queue_name, &settled);
        let (stored, status) = settled.map_err(|e| {
            if let JobError::LeaseLost(id) = &e {
                warn!(job_id = %id, "Lease lost before settling; result discarded");
            }
            e
        })?;

        let outcome = JobOutcome::from_record(&stored, status);
        self.record_outcome(&outcome);
        self.publish(outcome.clone());
        Ok(outcome)
    }

    /// Give the job back without counting the attempt, e.g. on shutdown.
    pub async fn release(&self, job: &LeasedJob) -> JobResult<JobOutcome> {
        let now = self.clock.now();
        let released = self
            .store
            .release(job.id(), job.token, now)
            .await
            .map(|r| (r, OutcomeStatus::Released));
        self.lease_ended(&job.record.queue_name, &released);
        let (stored, status) = released?;

        info!(job_id = %stored.id, queue = %stored.queue_name, "Job lease released");
        let outcome = JobOutcome::from_record(&stored, status);
        self.publish(outcome.clone());
        self.wakeup.notify_waiters();
        Ok(outcome)
    }

    /// Lease, run and settle one job. `Ok(None)` when nothing is due.
    pub async fn process_next<H>(
        &self,
        queue_name: &str,
        handler: &H,
    ) -> JobResult<Option<JobOutcome>>
    where
        H: JobHandler<P> + ?Sized,
    {
        let Some(job) = self.lease(queue_name).await? else {
            return Ok(None);
        };
        let result = self.execute(handler, &job).await;
        self.settle(&job, result).await.map(Some)
    }

    /// Requeue or dead-letter jobs whose lease expired. Returns how many.
    pub async fn recover_expired_leases(&self) -> JobResult<usize> {
        let recovered = self.store.recover_expired(self.clock.now()).await?;
        let mut requeued = false;

        for record in &recovered {
            let last_error = record.last_error.clone().unwrap_or_default();
            let status = if record.state == JobState::DeadLettered {
                OutcomeStatus::DeadLettered {
                    last_error,
                    exhausted: true,
                }
            } else {
                requeued = true;
                OutcomeStatus::Retrying {
                    next_run_at: record.next_run_at,
                    error: last_error,
                }
            };
            warn!(
                job_id = %record.id,
                queue = %record.queue_name,
                attempts = record.attempts,
                state = ?record.state,
                "Recovered job with expired lease"
            );
            let outcome = JobOutcome::from_record(record, status);
            self.record_outcome(&outcome);
            self.publish(outcome);
        }

        if requeued {
            self.wakeup.notify_waiters();
        }
        Ok(recovered.len())
    }

    /// Delete finished jobs older than `retention`.
    pub async fn purge_finished(&self, retention: Duration) -> JobResult<usize> {
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|r| self.clock.now().checked_sub_signed(r))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let purged = self.store.purge_finished(cutoff).await?;
        if purged > 0 {
            info!(purged, cutoff = %cutoff, "Purged finished jobs");
        }
        Ok(purged)
    }

    pub async fn get(&self, job_id: Uuid) -> JobResult<JobRecord> {
        self.store
            .get(job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))
    }

    pub async fn dead_letters(&self, queue_name: &str, limit: usize) -> JobResult<Vec<JobRecord>> {
        validate_queue_name(queue_name)?;
        self.store.dead_letters(queue_name, limit).await
    }

    /// Return a dead-lettered job to Pending with a fresh attempt budget.
    pub async fn replay(&self, job_id: Uuid) -> JobResult<JobRecord> {
        let record = self.store.replay(job_id, self.clock.now()).await?;
        info!(job_id = %job_id, queue = %record.queue_name, "Dead-lettered job replayed");
        self.wakeup.notify_waiters();
        Ok(record)
    }

    pub async fn stats(&self, queue_name: &str) -> JobResult<QueueStats> {
        self.store.stats(queue_name).await
    }

    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<JobOutcome> {
        self.outcomes.subscribe()
    }

    pub(crate) fn wakeup(&self) -> Arc<Notify> {
        Arc::clone(&self.wakeup)
    }

    fn lease_ended<T>(&self, queue_name: &str, result: &JobResult<T>) {
        if matches!(result, Ok(_) | Err(JobError::LeaseLost(_))) {
            if let Some(metrics) = &self.metrics {
                metrics.leased.with_label_values(&[queue_name]).dec();
            }
        }
    }

    fn record_outcome(&self, outcome: &JobOutcome) {
        let queue = outcome.queue_name.as_str();
        match &outcome.status {
            OutcomeStatus::Completed => {
                if let Some(metrics) = &self.metrics {
                    metrics.completed.with_label_values(&[queue]).inc();
                }
                info!(
                    job_id = %outcome.job_id,
                    queue = %queue,
                    attempts = outcome.attempts,
                    "Job completed"
                );
            }
            OutcomeStatus::Retrying { next_run_at, error } => {
                if let Some(metrics) = &self.metrics {
                    metrics.retried.with_label_values(&[queue]).inc();
                }
                warn!(
                    job_id = %outcome.job_id,
                    queue = %queue,
                    attempts = outcome.attempts,
                    next_run_at = %next_run_at,
                    error = %error,
                    "Job attempt failed, rescheduled"
                );
            }
            OutcomeStatus::DeadLettered { last_error, .. } => {
                if let Some(metrics) = &self.metrics {
                    metrics.dead_lettered.with_label_values(&[queue]).inc();
                }
                match outcome.attempts_exceeded() {
                    Some(exceeded) => error!(
                        job_id = %outcome.job_id,
                        queue = %queue,
                        error = %exceeded,
                        "Job dead-lettered"
                    ),
                    None => error!(
                        job_id = %outcome.job_id,
                        queue = %queue,
                        attempts = outcome.attempts,
                        last_error = %last_error,
                        "Job failed fatally, dead-lettered"
                    ),
                }
            }
            OutcomeStatus::Released => {}
        }
    }

    fn publish(&self, outcome: JobOutcome) {
        // No receivers is fine; outcomes are advisory.
        let _ = self.outcomes.send(outcome);
    }
}
