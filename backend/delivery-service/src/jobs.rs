//! Background job kinds of the delivery service and their handler.

use std::sync::Arc;

use async_trait::async_trait;
use crypto_core::{Envelope, TAG_LEN};
use job_queue::{JobContext, JobFailure, JobHandler, JobPayload};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::broker::EventBroker;
use crate::services::{inbox_topic, DIRECT_MESSAGE_EVENT};

/// Longest window a summary may cover: one week.
pub const MAX_SUMMARY_WINDOW_HOURS: u32 = 168;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum DeliveryJob {
    /// Tell an offline recipient a direct message is waiting.
    #[serde(rename = "notify_offline")]
    NotifyOffline { envelope: Envelope },

    /// Digest of activity over the last `window_hours`.
    #[serde(rename = "summary", rename_all = "camelCase")]
    Summary {
        recipient_id: Uuid,
        window_hours: u32,
    },
}

/// Structural checks on an envelope that crosses the service boundary. The
/// service cannot decrypt, so this is all it can verify.
pub fn validate_envelope(envelope: &Envelope) -> Result<(), String> {
    if envelope.sender_id() == envelope.recipient_id() {
        return Err("sender and recipient must differ".to_string());
    }
    if envelope.ciphertext().len() < TAG_LEN {
        return Err(format!(
            "ciphertext shorter than the {TAG_LEN}-byte authentication tag"
        ));
    }
    Ok(())
}

impl JobPayload for DeliveryJob {
    fn kind(&self) -> &'static str {
        match self {
            DeliveryJob::NotifyOffline { .. } => "notify_offline",
            DeliveryJob::Summary { .. } => "summary",
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            DeliveryJob::NotifyOffline { envelope } => validate_envelope(envelope),
            DeliveryJob::Summary {
                recipient_id,
                window_hours,
            } => {
                if recipient_id.is_nil() {
                    return Err("recipientId must not be nil".to_string());
                }
                if !(1..=MAX_SUMMARY_WINDOW_HOURS).contains(window_hours) {
                    return Err(format!(
                        "windowHours must be between 1 and {MAX_SUMMARY_WINDOW_HOURS}"
                    ));
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifyError {
    #[error("notification backend unavailable: {0}")]
    Unavailable(String),

    /// Permanent refusal (unknown device, opted out). Not retried.
    #[error("notification rejected: {0}")]
    Rejected(String),
}

impl From<NotifyError> for JobFailure {
    fn from(err: NotifyError) -> Self {
        match err {
            NotifyError::Unavailable(_) => JobFailure::transient(err),
            NotifyError::Rejected(_) => JobFailure::fatal(err),
        }
    }
}

/// Outbound notification channel (push, email). Implementations should be
/// idempotent per job: a retried job calls them again.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Only the envelope's metadata may be used; the body is ciphertext.
    async fn notify_offline(&self, envelope: &Envelope) -> Result<(), NotifyError>;

    async fn send_summary(&self, recipient_id: Uuid, window_hours: u32)
        -> Result<(), NotifyError>;
}

/// Notifier that only logs. Used when no push backend is configured.
#[derive(Debug, Default, Clone)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify_offline(&self, envelope: &Envelope) -> Result<(), NotifyError> {
        info!(
            sender_id = %envelope.sender_id(),
            recipient_id = %envelope.recipient_id(),
            "Offline message notification"
        );
        Ok(())
    }

    async fn send_summary(
        &self,
        recipient_id: Uuid,
        window_hours: u32,
    ) -> Result<(), NotifyError> {
        info!(recipient_id = %recipient_id, window_hours, "Activity summary notification");
        Ok(())
    }
}

pub struct DeliveryJobHandler {
    broker: EventBroker,
    notifier: Arc<dyn Notifier>,
}

impl DeliveryJobHandler {
    pub fn new(broker: EventBroker, notifier: Arc<dyn Notifier>) -> Self {
        Self { broker, notifier }
    }
}

#[async_trait]
impl JobHandler<DeliveryJob> for DeliveryJobHandler {
    async fn handle(&self, ctx: &JobContext, job: DeliveryJob) -> Result<(), JobFailure> {
        match job {
            DeliveryJob::NotifyOffline { envelope } => {
                // The recipient may have come online since the job was queued.
                let topic = inbox_topic(envelope.recipient_id());
                if self.broker.has_subscribers(&topic) {
                    let data = serde_json::to_value(&envelope).map_err(JobFailure::fatal)?;
                    if self.broker.publish(&topic, DIRECT_MESSAGE_EVENT, data) > 0 {
                        info!(
                            job_id = %ctx.job_id,
                            recipient_id = %envelope.recipient_id(),
                            "Recipient came online; delivered over event stream"
                        );
                        return Ok(());
                    }
                }

                debug!(job_id = %ctx.job_id, attempt = ctx.attempt, "Notifying offline recipient");
                self.notifier
                    .notify_offline(&envelope)
                    .await
                    .map_err(JobFailure::from)
            }
            DeliveryJob::Summary {
                recipient_id,
                window_hours,
            } => self
                .notifier
                .send_summary(recipient_id, window_hours)
                .await
                .map_err(JobFailure::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crypto_core::{Cipher, Keyring};

    fn envelope() -> Envelope {
        let sender = Keyring::generate(Uuid::new_v4());
        let recipient = Keyring::generate(Uuid::new_v4());
        sender
            .seal(
                &Cipher::default(),
                recipient.principal_id(),
                &recipient.public_key(),
                b"hello",
            )
            .unwrap()
    }

    #[test]
    fn test_wire_shape_is_adjacently_tagged() {
        let job = DeliveryJob::Summary {
            recipient_id: Uuid::nil(),
            window_hours: 24,
        };
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["kind"], "summary");
        assert_eq!(value["payload"]["windowHours"], 24);
        assert!(value["payload"]["recipientId"].is_string());
    }

    #[test]
    fn test_summary_window_bounds() {
        let job = |window_hours| DeliveryJob::Summary {
            recipient_id: Uuid::new_v4(),
            window_hours,
        };
        assert!(job(0).validate().is_err());
        assert!(job(1).validate().is_ok());
        assert!(job(168).validate().is_ok());
        assert!(job(169).validate().is_err());
    }

    #[test]
    fn test_notify_offline_validates_envelope() {
        let job = DeliveryJob::NotifyOffline {
            envelope: envelope(),
        };
        assert_eq!(job.kind(), "notify_offline");
        assert!(job.validate().is_ok());
    }

    #[test]
    fn test_notify_errors_classified() {
        assert!(matches!(
            JobFailure::from(NotifyError::Unavailable("smtp down".into())),
            JobFailure::Transient(_)
        ));
        assert!(matches!(
            JobFailure::from(NotifyError::Rejected("device unregistered".into())),
            JobFailure::Fatal(_)
        ));
    }

    #[test]
    fn test_envelope_to_self_rejected() {
        let keyring = Keyring::generate(Uuid::new_v4());
        let envelope = keyring
            .seal(
                &Cipher::default(),
                keyring.principal_id(),
                &keyring.public_key(),
                b"note to self",
            )
            .unwrap();
        assert!(validate_envelope(&envelope).is_err());
    }
}
