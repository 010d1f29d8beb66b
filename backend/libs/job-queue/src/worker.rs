//! Bounded worker pool and the handler contract.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::job::{JobPayload, LeasedJob};
use crate::queue::JobQueue;

/// Why a handler run failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobFailure {
    /// Retried with backoff until the attempt budget is spent
    #[error("transient failure: {0}")]
    Transient(String),

    /// Dead-lettered without further attempts
    #[error("fatal failure: {0}")]
    Fatal(String),
}

impl JobFailure {
    pub fn transient(err: impl Display) -> Self {
        JobFailure::Transient(err.to_string())
    }

    pub fn fatal(err: impl Display) -> Self {
        JobFailure::Fatal(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub queue_name: String,
    /// 1-based, counted when the lease was granted
    pub attempt: u32,
    pub max_attempts: u32,
}

impl From<&LeasedJob> for JobContext {
    fn from(job: &LeasedJob) -> Self {
        Self {
            job_id: job.record.id,
            queue_name: job.record.queue_name.clone(),
            attempt: job.record.attempts,
            max_attempts: job.record.max_attempts,
        }
    }
}

/// Executes jobs of payload type `P`. Handlers must be idempotent: a job whose
/// lease expired mid-run is executed again.
#[async_trait]
pub trait JobHandler<P: JobPayload>: Send + Sync {
    async fn handle(&self, ctx: &JobContext, payload: P) -> Result<(), JobFailure>;
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queue_name: String,
    pub concurrency: usize,
    /// Idle wait between lease attempts when nothing is due
    pub poll_interval: Duration,
    /// Period of the expired-lease scan and retention purge
    pub recovery_interval: Duration,
    /// Finished jobs older than this are deleted
    pub retention: Duration,
}

impl WorkerConfig {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            concurrency: 4,
            poll_interval: Duration::from_millis(500),
            recovery_interval: Duration::from_secs(5),
            retention: Duration::from_secs(86_400),
        }
    }
}

pub struct WorkerPool<P: JobPayload, H: JobHandler<P>> {
    queue: JobQueue<P>,
    handler: Arc<H>,
    config: WorkerConfig,
}

impl<P, H> WorkerPool<P, H>
where
    P: JobPayload,
    H: JobHandler<P> + 'static,
{
    pub fn new(queue: JobQueue<P>, handler: Arc<H>, config: WorkerConfig) -> Self {
        Self {
            queue,
            handler,
            config,
        }
    }

    /// Start `concurrency` workers and one reaper. All stop when `shutdown`
    /// flips to true or its sender is dropped.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> WorkerPoolHandle {
        let concurrency = self.config.concurrency.max(1);
        info!(
            queue = %self.config.queue_name,
            concurrency,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Job worker pool starting"
        );

        let mut tasks = Vec::with_capacity(concurrency + 1);
        for worker_id in 0..concurrency {
            tasks.push(tokio::spawn(run_worker(
                worker_id,
                self.queue.clone(),
                Arc::clone(&self.handler),
                self.config.clone(),
                shutdown.clone(),
            )));
        }
        tasks.push(tokio::spawn(run_reaper(
            self.queue.clone(),
            self.config.clone(),
            shutdown,
        )));

        WorkerPoolHandle { tasks }
    }
}

pub struct WorkerPoolHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerPoolHandle {
    /// Wait for every worker to finish its current job and exit.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Job worker task panicked");
            }
        }
    }
}

/// Resolves once shutdown is requested.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn run_worker<P, H>(
    worker_id: usize,
    queue: JobQueue<P>,
    handler: Arc<H>,
    config: WorkerConfig,
    mut shutdown: watch::Receiver<bool>,
) where
    P: JobPayload,
    H: JobHandler<P>,
{
    let wakeup = queue.wakeup();
    debug!(worker_id, queue = %config.queue_name, "Job worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        // Register for wakeups before looking, so an enqueue in between is not missed.
        let notified = wakeup.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        match queue.lease(&config.queue_name).await {
            Ok(Some(job)) => {
                run_leased(&queue, handler.as_ref(), &job, &mut shutdown).await;
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                error!(worker_id, queue = %config.queue_name, error = %e, "Failed to lease job");
            }
        }

        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            _ = &mut notified => {}
            _ = tokio::time::sleep(config.poll_interval) => {}
        }
    }

    debug!(worker_id, queue = %config.queue_name, "Job worker stopped");
}

async fn run_leased<P, H>(
    queue: &JobQueue<P>,
    handler: &H,
    job: &LeasedJob,
    shutdown: &mut watch::Receiver<bool>,
) where
    P: JobPayload,
    H: JobHandler<P>,
{
    let settled = tokio::select! {
        result = queue.execute(handler, job) => queue.settle(job, result).await,
        _ = shutdown_requested(shutdown) => {
            warn!(job_id = %job.id(), "Shutdown interrupted job, releasing lease");
            queue.release(job).await
        }
    };

    if let Err(e) = settled {
        error!(job_id = %job.id(), error = %e, "Failed to settle job");
    }
}

async fn run_reaper<P: JobPayload>(
    queue: JobQueue<P>,
    config: WorkerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(config.recovery_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            _ = interval.tick() => {
                if let Err(e) = queue.recover_expired_leases().await {
                    error!(error = %e, "Expired lease recovery failed");
                }
                if let Err(e) = queue.purge_finished(config.retention).await {
                    error!(error = %e, "Finished job purge failed");
                }
            }
        }
    }
}
