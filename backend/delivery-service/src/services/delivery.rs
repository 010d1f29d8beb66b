//! Routing of sealed messages and system events.
//!
//! A direct message goes out over the recipient's inbox stream when they are
//! connected and is queued as a `notify_offline` job otherwise. The service
//! never sees plaintext except for messages its own system principal seals.

use std::sync::Arc;

use crypto_core::{Cipher, CryptoError, Envelope, KeyRecord, KeyStore, KeyStoreError, Keyring};
use job_queue::{EnqueueOptions, JobError, JobQueue};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::EventBroker;
use crate::jobs::{validate_envelope, DeliveryJob};

pub const NOTIFICATIONS_QUEUE: &str = "notifications";
pub const SYSTEM_JOBS_TOPIC: &str = "system:jobs";
pub const DIRECT_MESSAGE_EVENT: &str = "direct_message";
pub const JOB_DEAD_LETTERED_EVENT: &str = "job_dead_lettered";

const INBOX_PREFIX: &str = "inbox:";
const MAX_TOPIC_LEN: usize = 128;
const MAX_EVENT_TYPE_LEN: usize = 64;

pub fn inbox_topic(principal_id: Uuid) -> String {
    format!("{INBOX_PREFIX}{principal_id}")
}

/// Topics are `[A-Za-z0-9:_.-]`, at most 128 bytes.
pub fn validate_topic(topic: &str) -> Result<(), DeliveryError> {
    let valid = !topic.is_empty()
        && topic.len() <= MAX_TOPIC_LEN
        && topic
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(DeliveryError::InvalidTopic(topic.to_string()))
    }
}

/// Event types end up on an SSE `event:` line, so no separators or newlines.
pub fn validate_event_type(event_type: &str) -> Result<(), DeliveryError> {
    let valid = !event_type.is_empty()
        && event_type.len() <= MAX_EVENT_TYPE_LEN
        && event_type
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(DeliveryError::InvalidEventType(event_type.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    #[error("invalid event type: {0}")]
    InvalidEventType(String),

    #[error("topic {0} is reserved for direct messages")]
    ReservedTopic(String),
}

/// Where a direct message went.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "route", rename_all = "snake_case")]
pub enum DeliveryRoute {
    /// Pushed to the recipient's live streams.
    Delivered { subscribers: usize },
    /// Recipient offline; a notification job was queued.
    Queued {
        #[serde(rename = "jobId")]
        job_id: Uuid,
    },
}

#[derive(Clone)]
pub struct DeliveryService {
    broker: EventBroker,
    keys: Arc<dyn KeyStore>,
    queue: JobQueue<DeliveryJob>,
    cipher: Cipher,
    system: Arc<Keyring>,
}

impl DeliveryService {
    pub fn new(
        broker: EventBroker,
        keys: Arc<dyn KeyStore>,
        queue: JobQueue<DeliveryJob>,
        cipher: Cipher,
        system: Arc<Keyring>,
    ) -> Self {
        Self {
            broker,
            keys,
            queue,
            cipher,
            system,
        }
    }

    pub fn system_principal(&self) -> Uuid {
        self.system.principal_id()
    }

    /// Publish the system principal's public key so its messages can be
    /// verified by recipients. Called once at startup.
    pub async fn register_system_key(&self) -> Result<KeyRecord, DeliveryError> {
        let record = self
            .keys
            .publish(self.system.principal_id(), self.system.public_key())
            .await?;
        info!(
            principal_id = %record.principal_id,
            fingerprint = %record.public_key.fingerprint(),
            version = record.version,
            "System principal key published"
        );
        Ok(record)
    }

    /// Route a sealed envelope. Both principals must have a published key.
    pub async fn send_envelope(&self, envelope: Envelope) -> Result<DeliveryRoute, DeliveryError> {
        validate_envelope(&envelope).map_err(DeliveryError::InvalidEnvelope)?;
        self.keys.lookup(envelope.sender_id()).await?;
        self.keys.lookup(envelope.recipient_id()).await?;

        let recipient_id = envelope.recipient_id();
        let topic = inbox_topic(recipient_id);
        if self.broker.has_subscribers(&topic) {
            let data = serde_json::to_value(&envelope)
                .map_err(|e| DeliveryError::InvalidEnvelope(e.to_string()))?;
            let subscribers = self.broker.publish(&topic, DIRECT_MESSAGE_EVENT, data);
            // Zero when the last subscriber left between the check and the publish.
            if subscribers > 0 {
                debug!(
                    sender_id = %envelope.sender_id(),
                    recipient_id = %recipient_id,
                    subscribers,
                    "Direct message delivered live"
                );
                return Ok(DeliveryRoute::Delivered { subscribers });
            }
        }

        let sender_id = envelope.sender_id();
        let job_id = self
            .queue
            .enqueue(
                NOTIFICATIONS_QUEUE,
                &DeliveryJob::NotifyOffline { envelope },
                EnqueueOptions::default(),
            )
            .await?;
        debug!(
            sender_id = %sender_id,
            recipient_id = %recipient_id,
            job_id = %job_id,
            "Recipient offline; notification queued"
        );
        Ok(DeliveryRoute::Queued { job_id })
    }

    /// Seal `plaintext` from the system principal to `recipient_id` and route
    /// it like any other direct message.
    pub async fn send_system_message(
        &self,
        recipient_id: Uuid,
        plaintext: &[u8],
    ) -> Result<(Envelope, DeliveryRoute), DeliveryError> {
        let recipient_public = self.keys.lookup(recipient_id).await?;
        let envelope = self
            .system
            .seal(&self.cipher, recipient_id, &recipient_public, plaintext)?;
        let route = self.send_envelope(envelope.clone()).await?;
        Ok((envelope, route))
    }

    /// Fan a moderation or system event out to `topic`. Not retained.
    pub fn publish_moderation_event(
        &self,
        topic: &str,
        event_type: &str,
        data: Value,
    ) -> Result<usize, DeliveryError> {
        validate_topic(topic)?;
        validate_event_type(event_type)?;
        if topic.starts_with(INBOX_PREFIX) {
            return Err(DeliveryError::ReservedTopic(topic.to_string()));
        }

        let delivered = self.broker.publish(topic, event_type, data);
        info!(topic = %topic, event_type = %event_type, delivered, "Moderation event published");
        Ok(delivered)
    }

    pub async fn enqueue_summary(
        &self,
        recipient_id: Uuid,
        window_hours: u32,
        opts: EnqueueOptions,
    ) -> Result<Uuid, DeliveryError> {
        let job = DeliveryJob::Summary {
            recipient_id,
            window_hours,
        };
        Ok(self.queue.enqueue(NOTIFICATIONS_QUEUE, &job, opts).await?)
    }

    /// Republish dead-letter outcomes on [`SYSTEM_JOBS_TOPIC`] until shutdown.
    pub fn spawn_dead_letter_relay(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let mut outcomes = self.queue.subscribe_outcomes();
        let broker = self.broker.clone();

        tokio::spawn(async move {
            loop {
                let outcome = tokio::select! {
                    _ = shutdown.changed() => break,
                    received = outcomes.recv() => match received {
                        Ok(outcome) => outcome,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Dead-letter relay lagged behind job outcomes");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };
                if !outcome.is_dead_lettered() {
                    continue;
                }

                let reason = outcome
                    .attempts_exceeded()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "fatal failure".to_string());
                error!(
                    job_id = %outcome.job_id,
                    queue = %outcome.queue_name,
                    kind = %outcome.kind,
                    attempts = outcome.attempts,
                    reason = %reason,
                    "Job dead-lettered"
                );

                let mut data = serde_json::to_value(&outcome).unwrap_or_else(|_| json!({}));
                data["reason"] = Value::String(reason);
                broker.publish(SYSTEM_JOBS_TOPIC, JOB_DEAD_LETTERED_EVENT, data);
            }
            debug!("Dead-letter relay stopped");
        })
    }
}
