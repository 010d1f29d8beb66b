//! Job records, payload contract and outcomes.
//!
//! A job moves through `Pending -> Leased -> {Completed | Pending (retry) |
//! DeadLettered}`. `Failed` marks a failed attempt while the store decides
//! between rescheduling and dead-lettering; no record rests in it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{JobError, JobResult};

/// Longest accepted queue name.
pub const MAX_QUEUE_NAME_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Leased,
    Completed,
    Failed,
    DeadLettered,
}

impl JobState {
    /// Completed and dead-lettered jobs are only kept for the retention window.
    pub fn is_finished(self) -> bool {
        matches!(self, JobState::Completed | JobState::DeadLettered)
    }
}

/// A persisted job. The lease token stays out of the wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: Uuid,
    pub queue_name: String,
    pub kind: String,
    pub payload: Value,
    pub attempts: u32,
    pub max_attempts: u32,
    pub state: JobState,
    pub next_run_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expiry: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub(crate) lease_token: Option<Uuid>,
    #[serde(skip)]
    pub(crate) seq: u64,
}

impl JobRecord {
    pub(crate) fn new(
        queue_name: &str,
        kind: &str,
        payload: Value,
        max_attempts: u32,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue_name: queue_name.to_string(),
            kind: kind.to_string(),
            payload,
            attempts: 0,
            max_attempts,
            state: JobState::Pending,
            next_run_at,
            lease_expiry: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            lease_token: None,
            seq: 0,
        }
    }

    /// Enqueue order within a queue, assigned by the store.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Grants a lease and counts the attempt.
    pub(crate) fn grant_lease(&mut self, now: DateTime<Utc>, expiry: DateTime<Utc>) -> Uuid {
        self.grant_lease_with_token(Uuid::new_v4(), now, expiry)
    }

    pub(crate) fn grant_lease_with_token(
        &mut self,
        token: Uuid,
        now: DateTime<Utc>,
        expiry: DateTime<Utc>,
    ) -> Uuid {
        self.state = JobState::Leased;
        self.attempts += 1;
        self.lease_expiry = Some(expiry);
        self.lease_token = Some(token);
        self.updated_at = now;
        token
    }

    pub(crate) fn check_lease(&self, token: Uuid) -> JobResult<()> {
        if self.state == JobState::Leased && self.lease_token == Some(token) {
            Ok(())
        } else {
            Err(JobError::LeaseLost(self.id))
        }
    }

    fn clear_lease(&mut self) {
        self.lease_expiry = None;
        self.lease_token = None;
    }

    pub(crate) fn complete(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Completed;
        self.clear_lease();
        self.updated_at = now;
    }

    pub(crate) fn fail_attempt(&mut self, error: &str, now: DateTime<Utc>) {
        self.state = JobState::Failed;
        self.last_error = Some(error.to_string());
        self.clear_lease();
        self.updated_at = now;
    }

    pub(crate) fn reschedule(&mut self, next_run_at: DateTime<Utc>, now: DateTime<Utc>) {
        debug_assert_eq!(self.state, JobState::Failed);
        self.state = JobState::Pending;
        self.next_run_at = next_run_at;
        self.updated_at = now;
    }

    pub(crate) fn dead_letter(&mut self, now: DateTime<Utc>) {
        self.state = JobState::DeadLettered;
        self.clear_lease();
        self.updated_at = now;
    }

    /// Hands the job back without counting the interrupted attempt.
    pub(crate) fn release(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Pending;
        self.attempts = self.attempts.saturating_sub(1);
        self.next_run_at = now;
        self.clear_lease();
        self.updated_at = now;
    }

    /// Returns true when the expired lease spent the last attempt.
    pub(crate) fn recover_expired(&mut self, now: DateTime<Utc>) -> bool {
        self.fail_attempt("lease expired before completion", now);
        if self.attempts_exhausted() {
            self.dead_letter(now);
            true
        } else {
            self.reschedule(now, now);
            false
        }
    }

    pub(crate) fn reset_for_replay(&mut self, now: DateTime<Utc>) -> JobResult<()> {
        if self.state != JobState::DeadLettered {
            return Err(JobError::InvalidState {
                job_id: self.id,
                state: self.state,
                required: "dead_lettered",
            });
        }
        self.state = JobState::Pending;
        self.attempts = 0;
        self.next_run_at = now;
        self.clear_lease();
        self.updated_at = now;
        Ok(())
    }
}

/// Typed job payloads.
///
/// Implementors are enums serialized adjacently tagged as
/// `#[serde(tag = "kind", content = "payload")]`; the tag becomes
/// [`JobRecord::kind`] and the content becomes [`JobRecord::payload`].
pub trait JobPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn kind(&self) -> &'static str;

    /// Semantic checks beyond the schema.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

pub(crate) fn encode_payload<P: JobPayload>(payload: &P) -> JobResult<(String, Value)> {
    let kind = payload.kind().to_string();
    payload.validate().map_err(|reason| JobError::InvalidPayload {
        kind: kind.clone(),
        reason,
    })?;
    let mut tagged = serde_json::to_value(payload)?;
    let content = tagged
        .get_mut("payload")
        .map(Value::take)
        .unwrap_or(Value::Null);
    Ok((kind, content))
}

pub(crate) fn decode_payload<P: JobPayload>(kind: &str, payload: &Value) -> JobResult<P> {
    let tagged = serde_json::json!({ "kind": kind, "payload": payload });
    let decoded: P = serde_json::from_value(tagged).map_err(|e| JobError::InvalidPayload {
        kind: kind.to_string(),
        reason: e.to_string(),
    })?;
    if decoded.kind() != kind {
        return Err(JobError::InvalidPayload {
            kind: kind.to_string(),
            reason: format!("payload decodes as kind '{}'", decoded.kind()),
        });
    }
    decoded
        .validate()
        .map_err(|reason| JobError::InvalidPayload {
            kind: kind.to_string(),
            reason,
        })?;
    Ok(decoded)
}

pub fn validate_queue_name(name: &str) -> JobResult<()> {
    if name.is_empty() || name.len() > MAX_QUEUE_NAME_LEN {
        return Err(JobError::InvalidOptions(format!(
            "queue name must be 1..={MAX_QUEUE_NAME_LEN} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(JobError::InvalidOptions(format!(
            "queue name '{name}' contains characters outside [A-Za-z0-9_.-]"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub delay: Duration,
    /// Falls back to the queue default when unset.
    pub max_attempts: Option<u32>,
}

impl EnqueueOptions {
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// A job currently held by one worker.
#[derive(Debug, Clone)]
pub struct LeasedJob {
    pub record: JobRecord,
    pub token: Uuid,
}

impl LeasedJob {
    pub fn id(&self) -> Uuid {
        self.record.id
    }

    pub fn attempt(&self) -> u32 {
        self.record.attempts
    }
}

/// Result of settling one attempt, broadcast to outcome subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutcome {
    pub job_id: Uuid,
    pub queue_name: String,
    pub kind: String,
    pub attempts: u32,
    #[serde(flatten)]
    pub status: OutcomeStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OutcomeStatus {
    Completed,
    Retrying {
        #[serde(rename = "nextRunAt")]
        next_run_at: DateTime<Utc>,
        error: String,
    },
    DeadLettered {
        #[serde(rename = "lastError")]
        last_error: String,
        /// False when a fatal failure skipped the remaining attempts.
        exhausted: bool,
    },
    Released,
}

impl JobOutcome {
    pub(crate) fn from_record(record: &JobRecord, status: OutcomeStatus) -> Self {
        Self {
            job_id: record.id,
            queue_name: record.queue_name.clone(),
            kind: record.kind.clone(),
            attempts: record.attempts,
            status,
        }
    }

    pub fn is_dead_lettered(&self) -> bool {
        matches!(self.status, OutcomeStatus::DeadLettered { .. })
    }

    /// The exhaustion error for a job whose retry budget ran out.
    pub fn attempts_exceeded(&self) -> Option<JobError> {
        match &self.status {
            OutcomeStatus::DeadLettered {
                last_error,
                exhausted: true,
            } => Some(JobError::AttemptsExceeded {
                job_id: self.job_id,
                attempts: self.attempts,
                last_error: last_error.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: u64,
    pub leased: u64,
    pub completed: u64,
    pub dead_lettered: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "kind", content = "payload")]
    enum TestJob {
        #[serde(rename = "echo")]
        Echo { text: String },
        #[serde(rename = "ping")]
        Ping,
    }

    impl JobPayload for TestJob {
        fn kind(&self) -> &'static str {
            match self {
                TestJob::Echo { .. } => "echo",
                TestJob::Ping => "ping",
            }
        }

        fn validate(&self) -> Result<(), String> {
            match self {
                TestJob::Echo { text } if text.is_empty() => Err("text is empty".into()),
                _ => Ok(()),
            }
        }
    }

    fn record() -> JobRecord {
        let now = Utc::now();
        JobRecord::new("default", "echo", Value::Null, 2, now, now)
    }

    #[test]
    fn test_payload_encoding_splits_kind_and_content() {
        let (kind, payload) = encode_payload(&TestJob::Echo { text: "hi".into() }).unwrap();
        assert_eq!(kind, "echo");
        assert_eq!(payload, serde_json::json!({ "text": "hi" }));

        let decoded: TestJob = decode_payload(&kind, &payload).unwrap();
        assert_eq!(decoded, TestJob::Echo { text: "hi".into() });
    }

    #[test]
    fn test_unit_variant_has_null_payload() {
        let (kind, payload) = encode_payload(&TestJob::Ping).unwrap();
        assert_eq!(kind, "ping");
        assert!(payload.is_null());
        assert_eq!(decode_payload::<TestJob>("ping", &payload).unwrap(), TestJob::Ping);
    }

    #[test]
    fn test_invalid_payload_is_rejected() {
        let err = encode_payload(&TestJob::Echo { text: String::new() }).unwrap_err();
        assert!(matches!(err, JobError::InvalidPayload { ref kind, .. } if kind == "echo"));

        let err = decode_payload::<TestJob>("echo", &serde_json::json!({ "txt": 1 })).unwrap_err();
        assert!(matches!(err, JobError::InvalidPayload { .. }));

        let err = decode_payload::<TestJob>("unknown", &Value::Null).unwrap_err();
        assert!(matches!(err, JobError::InvalidPayload { .. }));
    }

    #[test]
    fn test_queue_name_validation() {
        assert!(validate_queue_name("notifications").is_ok());
        assert!(validate_queue_name("mail.digest-v2_eu").is_ok());
        assert!(validate_queue_name("").is_err());
        assert!(validate_queue_name("has space").is_err());
        assert!(validate_queue_name(&"q".repeat(MAX_QUEUE_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_lease_counts_attempt_and_token_guards_mutation() {
        let mut job = record();
        let now = Utc::now();
        let token = job.grant_lease(now, now + chrono::Duration::seconds(30));

        assert_eq!(job.state, JobState::Leased);
        assert_eq!(job.attempts, 1);
        assert!(job.check_lease(token).is_ok());
        assert!(matches!(job.check_lease(Uuid::new_v4()), Err(JobError::LeaseLost(_))));
    }

    #[test]
    fn test_release_does_not_count_attempt() {
        let mut job = record();
        let now = Utc::now();
        let token = job.grant_lease(now, now);
        job.release(now);

        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.check_lease(token).is_err());
    }

    #[test]
    fn test_expired_lease_recovery_respects_budget() {
        let mut job = record();
        let now = Utc::now();

        job.grant_lease(now, now);
        assert!(!job.recover_expired(now));
        assert_eq!(job.state, JobState::Pending);

        job.grant_lease(now, now);
        assert!(job.recover_expired(now));
        assert_eq!(job.state, JobState::DeadLettered);
        assert!(job.last_error.is_some());
    }

    #[test]
    fn test_replay_requires_dead_letter() {
        let mut job = record();
        let now = Utc::now();
        assert!(matches!(
            job.reset_for_replay(now),
            Err(JobError::InvalidState { .. })
        ));

        job.grant_lease(now, now);
        job.dead_letter(now);
        job.reset_for_replay(now).unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
    }

    #[test]
    fn test_record_wire_shape_hides_lease_token() {
        let mut job = record();
        let now = Utc::now();
        job.grant_lease(now, now);

        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["queueName"], "default");
        assert_eq!(json["state"], "leased");
        assert!(json.get("leaseExpiry").is_some());
        assert!(json.get("leaseToken").is_none());
        assert!(json.get("lease_token").is_none());
    }

    #[test]
    fn test_outcome_reports_exhaustion() {
        let job = record();
        let exhausted = JobOutcome::from_record(
            &job,
            OutcomeStatus::DeadLettered {
                last_error: "boom".into(),
                exhausted: true,
            },
        );
        assert!(matches!(
            exhausted.attempts_exceeded(),
            Some(JobError::AttemptsExceeded { .. })
        ));

        let json = serde_json::to_value(&exhausted).unwrap();
        assert_eq!(json["outcome"], "dead_lettered");
        assert_eq!(json["lastError"], "boom");

        let fatal = JobOutcome::from_record(
            &job,
            OutcomeStatus::DeadLettered {
                last_error: "bad".into(),
                exhausted: false,
            },
        );
        assert!(fatal.attempts_exceeded().is_none());
    }
}
