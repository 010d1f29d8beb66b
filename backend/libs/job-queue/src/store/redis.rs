//! Redis-backed [`JobStore`].
//!
//! Key layout under a configurable prefix:
//!
//! | Key | Type | Content |
//! |---|---|---|
//! | `{prefix}:job:{id}` | string | JSON record with lease token and sequence |
//! | `{prefix}:ready:{queue}` | zset | `{seq:016x}:{id}` scored by `next_run_at` ms |
//! | `{prefix}:leased:{queue}` | zset | `{id}:{token}` scored by lease expiry ms |
//! | `{prefix}:dead:{queue}` | zset | `{id}` scored by dead-letter time ms |
//! | `{prefix}:done:{queue}` | zset | `{id}` scored by completion time ms |
//! | `{prefix}:queues` | set | every queue name seen |
//! | `{prefix}:seq` | counter | enqueue sequence |
//!
//! The lease member embeds the token, so removing it is the holder's proof of
//! ownership: a recovered and re-leased job no longer carries the old member.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::JobStore;
use crate::error::{JobError, JobResult};
use crate::job::{JobRecord, JobState, LeasedJob, QueueStats};

/// Shared Redis connection manager guarded by a Tokio mutex.
pub type SharedConnectionManager = Arc<Mutex<ConnectionManager>>;

pub const DEFAULT_KEY_PREFIX: &str = "jobq";

/// Claims one ready member as a compare-and-swap on the stored record.
///
/// KEYS: ready set, lease set, job key.
/// ARGV: ready member, record JSON as read, leased record JSON, lease expiry
/// ms, lease member.
///
/// The record write, the ready removal and the lease entry land together, so
/// no reader sees a job in the lease set whose record still says Pending.
/// Returns 0 when the record or the ready member changed since it was read.
const LEASE_SCRIPT: &str = r#"
    if redis.call('GET', KEYS[3]) ~= ARGV[2] then
        return 0
    end
    if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
        return 0
    end
    redis.call('SET', KEYS[3], ARGV[3])
    redis.call('ZADD', KEYS[2], ARGV[4], ARGV[5])
    return 1
"#;

/// Contended claims retried before reporting an empty queue.
const LEASE_CLAIM_ATTEMPTS: usize = 3;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredJob {
    #[serde(flatten)]
    record: JobRecord,
    #[serde(default)]
    lease_token: Option<Uuid>,
    seq: u64,
}

impl StoredJob {
    fn encode(record: &JobRecord) -> JobResult<String> {
        Ok(serde_json::to_string(&StoredJob {
            record: record.clone(),
            lease_token: record.lease_token,
            seq: record.seq,
        })?)
    }

    fn decode(raw: &str) -> JobResult<JobRecord> {
        let stored: StoredJob = serde_json::from_str(raw)?;
        let mut record = stored.record;
        record.lease_token = stored.lease_token;
        record.seq = stored.seq;
        Ok(record)
    }
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn lease_member(job_id: Uuid, token: Uuid) -> String {
    format!("{job_id}:{token}")
}

fn ready_member(record: &JobRecord) -> String {
    format!("{:016x}:{}", record.seq, record.id)
}

pub struct RedisJobStore {
    conn: SharedConnectionManager,
    prefix: String,
}

impl RedisJobStore {
    pub fn new(conn: SharedConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }

    /// Connect to `redis_url` with the default key prefix.
    pub async fn connect(redis_url: &str) -> JobResult<Self> {
        let client = redis::Client::open(redis_url)
            .context("failed to parse queue backend connection string")?;
        let manager = ConnectionManager::new(client)
            .await
            .context("failed to connect to queue backend")?;
        info!("Job store connected to Redis");
        Ok(Self::new(Arc::new(Mutex::new(manager)), DEFAULT_KEY_PREFIX))
    }

    async fn connection(&self) -> ConnectionManager {
        self.conn.lock().await.clone()
    }

    fn job_key(&self, job_id: Uuid) -> String {
        format!("{}:job:{}", self.prefix, job_id)
    }

    fn ready_key(&self, queue: &str) -> String {
        format!("{}:ready:{}", self.prefix, queue)
    }

    fn leased_key(&self, queue: &str) -> String {
        format!("{}:leased:{}", self.prefix, queue)
    }

    fn dead_key(&self, queue: &str) -> String {
        format!("{}:dead:{}", self.prefix, queue)
    }

    fn done_key(&self, queue: &str) -> String {
        format!("{}:done:{}", self.prefix, queue)
    }

    fn queues_key(&self) -> String {
        format!("{}:queues", self.prefix)
    }

    fn seq_key(&self) -> String {
        format!("{}:seq", self.prefix)
    }

    async fn load(&self, conn: &mut ConnectionManager, job_id: Uuid) -> JobResult<JobRecord> {
        let raw: Option<String> = conn.get(self.job_key(job_id)).await?;
        match raw {
            Some(raw) => StoredJob::decode(&raw),
            None => Err(JobError::NotFound(job_id)),
        }
    }

    async fn queue_names(&self, conn: &mut ConnectionManager) -> JobResult<Vec<String>> {
        Ok(conn.smembers(self.queues_key()).await?)
    }

    /// Claims the holder's lease entry and returns the record it guards.
    async fn take_lease(
        &self,
        conn: &mut ConnectionManager,
        job_id: Uuid,
        token: Uuid,
    ) -> JobResult<JobRecord> {
        let record = self.load(conn, job_id).await?;
        let removed: i64 = conn
            .zrem(self.leased_key(&record.queue_name), lease_member(job_id, token))
            .await?;
        if removed == 0 {
            return Err(JobError::LeaseLost(job_id));
        }
        record.check_lease(token)?;
        Ok(record)
    }

    /// Writes the record and files it under the set matching its state.
    async fn file(&self, conn: &mut ConnectionManager, record: &JobRecord) -> JobResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(self.job_key(record.id), StoredJob::encode(record)?)
            .ignore();
        match record.state {
            JobState::Pending => {
                pipe.zadd(
                    self.ready_key(&record.queue_name),
                    ready_member(record),
                    millis(record.next_run_at),
                )
                .ignore();
            }
            JobState::DeadLettered => {
                pipe.zadd(
                    self.dead_key(&record.queue_name),
                    record.id.to_string(),
                    millis(record.updated_at),
                )
                .ignore();
            }
            JobState::Completed => {
                pipe.zadd(
                    self.done_key(&record.queue_name),
                    record.id.to_string(),
                    millis(record.updated_at),
                )
                .ignore();
            }
            JobState::Leased | JobState::Failed => {}
        }
        pipe.query_async::<_, ()>(conn).await?;
        Ok(())
    }

    async fn purge_set(
        &self,
        conn: &mut ConnectionManager,
        set_key: &str,
        older_than: DateTime<Utc>,
    ) -> JobResult<usize> {
        let max = format!("({}", millis(older_than));
        let ids: Vec<String> = conn.zrangebyscore(set_key, "-inf", max).await?;
        if ids.is_empty() {
            return Ok(0);
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for id in &ids {
            pipe.zrem(set_key, id).ignore();
            pipe.del(format!("{}:job:{}", self.prefix, id)).ignore();
        }
        pipe.query_async::<_, ()>(conn).await?;
        Ok(ids.len())
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn insert(&self, mut record: JobRecord) -> JobResult<JobRecord> {
        let mut conn = self.connection().await;
        let seq: u64 = conn.incr(self.seq_key(), 1).await?;
        record.seq = seq;

        let _: i64 = conn.sadd(self.queues_key(), &record.queue_name).await?;
        self.file(&mut conn, &record).await?;
        Ok(record)
    }

    async fn get(&self, job_id: Uuid) -> JobResult<Option<JobRecord>> {
        let mut conn = self.connection().await;
        match self.load(&mut conn, job_id).await {
            Ok(record) => Ok(Some(record)),
            Err(JobError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn lease_next(
        &self,
        queue_name: &str,
        now: DateTime<Utc>,
        lease_expiry: DateTime<Utc>,
    ) -> JobResult<Option<LeasedJob>> {
        let mut conn = self.connection().await;
        let ready_key = self.ready_key(queue_name);
        let token = Uuid::new_v4();

        for _ in 0..LEASE_CLAIM_ATTEMPTS {
            let due: Vec<String> = conn
                .zrangebyscore_limit(&ready_key, "-inf", millis(now), 0, 1)
                .await?;
            let Some(member) = due.into_iter().next() else {
                return Ok(None);
            };
            let job_id = member
                .split_once(':')
                .and_then(|(_, id)| Uuid::parse_str(id).ok())
                .ok_or_else(|| JobError::Backend(format!("corrupt ready member '{member}'")))?;

            let job_key = self.job_key(job_id);
            let raw: Option<String> = conn.get(&job_key).await?;
            let Some(raw) = raw else {
                // Record purged underneath its ready entry.
                let _: i64 = conn.zrem(&ready_key, &member).await?;
                continue;
            };

            let mut record = StoredJob::decode(&raw)?;
            record.grant_lease_with_token(token, now, lease_expiry);
            let leased = StoredJob::encode(&record)?;

            let claimed: i64 = redis::Script::new(LEASE_SCRIPT)
                .key(&ready_key)
                .key(self.leased_key(queue_name))
                .key(&job_key)
                .arg(&member)
                .arg(&raw)
                .arg(&leased)
                .arg(millis(lease_expiry))
                .arg(lease_member(job_id, token))
                .invoke_async(&mut conn)
                .await?;
            if claimed == 1 {
                return Ok(Some(LeasedJob { record, token }));
            }
            debug!(job_id = %job_id, queue = %queue_name, "Lease claim lost a race; retrying");
        }
        Ok(None)
    }

    async fn complete(&self, job_id: Uuid, token: Uuid, now: DateTime<Utc>) -> JobResult<JobRecord> {
        let mut conn = self.connection().await;
        let mut record = self.take_lease(&mut conn, job_id, token).await?;
        record.complete(now);
        self.file(&mut conn, &record).await?;
        Ok(record)
    }

    async fn retry(
        &self,
        job_id: Uuid,
        token: Uuid,
        error: &str,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> JobResult<JobRecord> {
        let mut conn = self.connection().await;
        let mut record = self.take_lease(&mut conn, job_id, token).await?;
        record.fail_attempt(error, now);
        record.reschedule(next_run_at, now);
        self.file(&mut conn, &record).await?;
        Ok(record)
    }

    async fn dead_letter(
        &self,
        job_id: Uuid,
        token: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> JobResult<JobRecord> {
        let mut conn = self.connection().await;
        let mut record = self.take_lease(&mut conn, job_id, token).await?;
        record.fail_attempt(error, now);
        record.dead_letter(now);
        self.file(&mut conn, &record).await?;
        Ok(record)
    }

    async fn release(&self, job_id: Uuid, token: Uuid, now: DateTime<Utc>) -> JobResult<JobRecord> {
        let mut conn = self.connection().await;
        let mut record = self.take_lease(&mut conn, job_id, token).await?;
        record.release(now);
        self.file(&mut conn, &record).await?;
        Ok(record)
    }

    async fn recover_expired(&self, now: DateTime<Utc>) -> JobResult<Vec<JobRecord>> {
        let mut conn = self.connection().await;
        let mut recovered = Vec::new();

        for queue in self.queue_names(&mut conn).await? {
            let leased_key = self.leased_key(&queue);
            let expired: Vec<String> = conn
                .zrangebyscore(&leased_key, "-inf", millis(now))
                .await?;

            for member in expired {
                let removed: i64 = conn.zrem(&leased_key, &member).await?;
                if removed == 0 {
                    // Settled by its holder in the meantime.
                    continue;
                }
                let Some(job_id) = member
                    .split_once(':')
                    .and_then(|(id, _)| Uuid::parse_str(id).ok())
                else {
                    continue;
                };

                let mut record = self.load(&mut conn, job_id).await?;
                let dead = record.recover_expired(now);
                self.file(&mut conn, &record).await?;
                debug!(job_id = %job_id, dead_lettered = dead, "Recovered expired lease");
                recovered.push(record);
            }
        }

        Ok(recovered)
    }

    async fn dead_letters(&self, queue_name: &str, limit: usize) -> JobResult<Vec<JobRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await;
        let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
        let ids: Vec<String> = conn.zrange(self.dead_key(queue_name), 0, stop).await?;

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let Ok(job_id) = Uuid::parse_str(&id) else {
                continue;
            };
            match self.load(&mut conn, job_id).await {
                Ok(record) => records.push(record),
                Err(JobError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    async fn replay(&self, job_id: Uuid, now: DateTime<Utc>) -> JobResult<JobRecord> {
        let mut conn = self.connection().await;
        let mut record = self.load(&mut conn, job_id).await?;
        record.reset_for_replay(now)?;

        let _: i64 = conn
            .zrem(self.dead_key(&record.queue_name), job_id.to_string())
            .await?;
        self.file(&mut conn, &record).await?;
        Ok(record)
    }

    async fn purge_finished(&self, older_than: DateTime<Utc>) -> JobResult<usize> {
        let mut conn = self.connection().await;
        let mut purged = 0;
        for queue in self.queue_names(&mut conn).await? {
            purged += self
                .purge_set(&mut conn, &self.done_key(&queue), older_than)
                .await?;
            purged += self
                .purge_set(&mut conn, &self.dead_key(&queue), older_than)
                .await?;
        }
        Ok(purged)
    }

    async fn stats(&self, queue_name: &str) -> JobResult<QueueStats> {
        let mut conn = self.connection().await;
        let (pending, leased, completed, dead_lettered): (u64, u64, u64, u64) = redis::pipe()
            .zcard(self.ready_key(queue_name))
            .zcard(self.leased_key(queue_name))
            .zcard(self.done_key(queue_name))
            .zcard(self.dead_key(queue_name))
            .query_async(&mut conn)
            .await?;
        Ok(QueueStats {
            pending,
            leased,
            completed,
            dead_lettered,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_member_embeds_id_after_sequence() {
        let now = Utc::now();
        let mut record = JobRecord::new("q", "k", serde_json::Value::Null, 1, now, now);
        record.seq = 42;
        let member = ready_member(&record);

        // Lua strings are 1-indexed; the id starts at byte 18.
        assert_eq!(&member[17..], record.id.to_string());
        assert!(member.starts_with("000000000000002a:"));
    }

    #[test]
    fn test_stored_job_keeps_token_and_sequence() {
        let now = Utc::now();
        let mut record = JobRecord::new("q", "k", serde_json::json!({"a": 1}), 3, now, now);
        record.seq = 7;
        record.grant_lease(now, now);

        let decoded = StoredJob::decode(&StoredJob::encode(&record).unwrap()).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.lease_token, record.lease_token);
        assert_eq!(decoded.seq, 7);
    }
}
