use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::JobStore;
use crate::error::{JobError, JobResult};
use crate::job::{JobRecord, JobState, LeasedJob, QueueStats};

type ReadyKey = (DateTime<Utc>, u64, Uuid);

#[derive(Default)]
struct State {
    jobs: HashMap<Uuid, JobRecord>,
    /// Pending jobs per queue in lease order.
    ready: HashMap<String, BTreeSet<ReadyKey>>,
    /// Leased jobs by lease expiry.
    leased: BTreeSet<(DateTime<Utc>, Uuid)>,
    next_seq: u64,
}

impl State {
    fn enqueue_ready(&mut self, record: &JobRecord) {
        self.ready
            .entry(record.queue_name.clone())
            .or_default()
            .insert((record.next_run_at, record.seq, record.id));
    }

    /// Removes the lease entry after checking the holder's token.
    fn take_lease(&mut self, job_id: Uuid, token: Uuid) -> JobResult<&mut JobRecord> {
        let record = self.jobs.get_mut(&job_id).ok_or(JobError::NotFound(job_id))?;
        record.check_lease(token)?;
        if let Some(expiry) = record.lease_expiry {
            self.leased.remove(&(expiry, job_id));
        }
        Ok(record)
    }
}

/// Single-process store. Jobs do not survive a restart.
#[derive(Default)]
pub struct InMemoryJobStore {
    state: Mutex<State>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, mut record: JobRecord) -> JobResult<JobRecord> {
        let mut state = self.state.lock();
        state.next_seq += 1;
        record.seq = state.next_seq;
        state.enqueue_ready(&record);
        state.jobs.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, job_id: Uuid) -> JobResult<Option<JobRecord>> {
        Ok(self.state.lock().jobs.get(&job_id).cloned())
    }

    async fn lease_next(
        &self,
        queue_name: &str,
        now: DateTime<Utc>,
        lease_expiry: DateTime<Utc>,
    ) -> JobResult<Option<LeasedJob>> {
        let mut state = self.state.lock();
        let Some(ready) = state.ready.get_mut(queue_name) else {
            return Ok(None);
        };
        let due = match ready.first() {
            Some(first) if first.0 <= now => *first,
            _ => return Ok(None),
        };
        ready.remove(&due);

        let (_, _, job_id) = due;
        let record = state
            .jobs
            .get_mut(&job_id)
            .ok_or(JobError::NotFound(job_id))?;
        let token = record.grant_lease(now, lease_expiry);
        let leased = LeasedJob {
            record: record.clone(),
            token,
        };
        state.leased.insert((lease_expiry, job_id));
        Ok(Some(leased))
    }

    async fn complete(&self, job_id: Uuid, token: Uuid, now: DateTime<Utc>) -> JobResult<JobRecord> {
        let mut state = self.state.lock();
        let record = state.take_lease(job_id, token)?;
        record.complete(now);
        Ok(record.clone())
    }

    async fn retry(
        &self,
        job_id: Uuid,
        token: Uuid,
        error: &str,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> JobResult<JobRecord> {
        let mut state = self.state.lock();
        let record = state.take_lease(job_id, token)?;
        record.fail_attempt(error, now);
        record.reschedule(next_run_at, now);
        let record = record.clone();
        state.enqueue_ready(&record);
        Ok(record)
    }

    async fn dead_letter(
        &self,
        job_id: Uuid,
        token: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> JobResult<JobRecord> {
        let mut state = self.state.lock();
        let record = state.take_lease(job_id, token)?;
        record.fail_attempt(error, now);
        record.dead_letter(now);
        Ok(record.clone())
    }

    async fn release(&self, job_id: Uuid, token: Uuid, now: DateTime<Utc>) -> JobResult<JobRecord> {
        let mut state = self.state.lock();
        let record = state.take_lease(job_id, token)?;
        record.release(now);
        let record = record.clone();
        state.enqueue_ready(&record);
        Ok(record)
    }

    async fn recover_expired(&self, now: DateTime<Utc>) -> JobResult<Vec<JobRecord>> {
        let mut state = self.state.lock();
        let mut recovered = Vec::new();

        while let Some(&(expiry, job_id)) = state.leased.first() {
            if expiry > now {
                break;
            }
            state.leased.pop_first();
            let Some(record) = state.jobs.get_mut(&job_id) else {
                continue;
            };
            let dead = record.recover_expired(now);
            let record = record.clone();
            if !dead {
                state.enqueue_ready(&record);
            }
            debug!(job_id = %job_id, dead_lettered = dead, "Recovered expired lease");
            recovered.push(record);
        }

        Ok(recovered)
    }

    async fn dead_letters(&self, queue_name: &str, limit: usize) -> JobResult<Vec<JobRecord>> {
        let state = self.state.lock();
        let mut dead: Vec<JobRecord> = state
            .jobs
            .values()
            .filter(|r| r.queue_name == queue_name && r.state == JobState::DeadLettered)
            .cloned()
            .collect();
        dead.sort_by_key(|r| (r.updated_at, r.seq));
        dead.truncate(limit);
        Ok(dead)
    }

    async fn replay(&self, job_id: Uuid, now: DateTime<Utc>) -> JobResult<JobRecord> {
        let mut state = self.state.lock();
        let record = state
            .jobs
            .get_mut(&job_id)
            .ok_or(JobError::NotFound(job_id))?;
        record.reset_for_replay(now)?;
        let record = record.clone();
        state.enqueue_ready(&record);
        Ok(record)
    }

    async fn purge_finished(&self, older_than: DateTime<Utc>) -> JobResult<usize> {
        let mut state = self.state.lock();
        let before = state.jobs.len();
        state
            .jobs
            .retain(|_, r| !(r.state.is_finished() && r.updated_at < older_than));
        Ok(before - state.jobs.len())
    }

    async fn stats(&self, queue_name: &str) -> JobResult<QueueStats> {
        let state = self.state.lock();
        let mut stats = QueueStats::default();
        for record in state.jobs.values().filter(|r| r.queue_name == queue_name) {
            match record.state {
                JobState::Pending | JobState::Failed => stats.pending += 1,
                JobState::Leased => stats.leased += 1,
                JobState::Completed => stats.completed += 1,
                JobState::DeadLettered => stats.dead_lettered += 1,
            }
        }
        Ok(stats)
    }
}
