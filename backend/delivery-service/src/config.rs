use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crypto_core::{KeyPair, Keyring, SecretKey, DEFAULT_KDF_CONTEXT};
use dotenvy::dotenv;
use job_queue::{BackoffPolicy, QueueConfig, WorkerConfig};
use uuid::Uuid;

use crate::error::AppError;
use crate::services::NOTIFICATIONS_QUEUE;

/// Base64 secret of the system principal. Redacted in `Debug`.
#[derive(Clone)]
pub struct SystemSecret(String);

impl fmt::Debug for SystemSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SystemSecret(<redacted>)")
    }
}

#[derive(Debug, Clone)]
pub struct JobSettings {
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub max_attempts: u32,
    pub worker_concurrency: usize,
    pub lease_duration: Duration,
    pub poll_interval: Duration,
    pub retention: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// `memory://` or a `redis://` URL
    pub queue_backend_url: String,
    pub event_stream_path: String,
    pub kdf_context: String,
    pub system_secret_key: Option<SystemSecret>,
    pub system_principal_id: Uuid,
    pub jobs: JobSettings,
    pub subscriber_buffer_size: usize,
    pub stream_heartbeat: Duration,
    pub signaling_ttl: Duration,
}

fn parse_var<T>(name: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| AppError::Config(format!("{name}: {e}"))),
        Err(_) => Ok(default),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8085,
            queue_backend_url: "memory://".to_string(),
            event_stream_path: "/events/stream".to_string(),
            kdf_context: DEFAULT_KDF_CONTEXT.to_string(),
            system_secret_key: None,
            system_principal_id: Uuid::nil(),
            jobs: JobSettings {
                backoff_base: Duration::from_millis(1000),
                backoff_cap: Duration::from_millis(300_000),
                max_attempts: 5,
                worker_concurrency: 4,
                lease_duration: Duration::from_secs(60),
                poll_interval: Duration::from_millis(500),
                retention: Duration::from_secs(86_400),
            },
            subscriber_buffer_size: 256,
            stream_heartbeat: Duration::from_secs(15),
            signaling_ttl: Duration::from_secs(30),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();
        let defaults = Config::default();

        let jobs = JobSettings {
            backoff_base: Duration::from_millis(parse_var("JOB_BACKOFF_BASE_MS", 1000u64)?),
            backoff_cap: Duration::from_millis(parse_var("JOB_BACKOFF_CAP_MS", 300_000u64)?),
            max_attempts: parse_var("JOB_MAX_ATTEMPTS", defaults.jobs.max_attempts)?,
            worker_concurrency: parse_var(
                "JOB_WORKER_CONCURRENCY",
                defaults.jobs.worker_concurrency,
            )?,
            lease_duration: Duration::from_secs(parse_var("JOB_LEASE_SECS", 60u64)?),
            poll_interval: Duration::from_millis(parse_var("JOB_POLL_INTERVAL_MS", 500u64)?),
            retention: Duration::from_secs(parse_var("JOB_RETENTION_SECS", 86_400u64)?),
        };

        let config = Self {
            port: parse_var("PORT", defaults.port)?,
            queue_backend_url: env::var("QUEUE_BACKEND_URL")
                .unwrap_or(defaults.queue_backend_url),
            event_stream_path: env::var("EVENT_STREAM_PATH")
                .unwrap_or(defaults.event_stream_path),
            kdf_context: env::var("KDF_CONTEXT").unwrap_or(defaults.kdf_context),
            system_secret_key: env::var("SYSTEM_SECRET_KEY")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(SystemSecret),
            system_principal_id: parse_var("SYSTEM_PRINCIPAL_ID", defaults.system_principal_id)?,
            jobs,
            subscriber_buffer_size: parse_var(
                "SUBSCRIBER_BUFFER_SIZE",
                defaults.subscriber_buffer_size,
            )?,
            stream_heartbeat: Duration::from_secs(parse_var("STREAM_HEARTBEAT_SECS", 15u64)?),
            signaling_ttl: Duration::from_secs(parse_var("SIGNALING_TTL_SECS", 30u64)?),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.subscriber_buffer_size == 0 {
            return Err(AppError::Config(
                "SUBSCRIBER_BUFFER_SIZE must be at least 1".into(),
            ));
        }
        if self.jobs.worker_concurrency == 0 {
            return Err(AppError::Config(
                "JOB_WORKER_CONCURRENCY must be at least 1".into(),
            ));
        }
        if self.jobs.max_attempts == 0 {
            return Err(AppError::Config("JOB_MAX_ATTEMPTS must be at least 1".into()));
        }
        if self.jobs.backoff_cap < self.jobs.backoff_base {
            return Err(AppError::Config(
                "JOB_BACKOFF_CAP_MS must not be below JOB_BACKOFF_BASE_MS".into(),
            ));
        }
        if self.jobs.lease_duration.is_zero() || self.jobs.poll_interval.is_zero() {
            return Err(AppError::Config(
                "JOB_LEASE_SECS and JOB_POLL_INTERVAL_MS must be positive".into(),
            ));
        }
        if self.stream_heartbeat.is_zero() || self.signaling_ttl.is_zero() {
            return Err(AppError::Config(
                "STREAM_HEARTBEAT_SECS and SIGNALING_TTL_SECS must be positive".into(),
            ));
        }
        if !self.event_stream_path.starts_with('/') {
            return Err(AppError::Config("EVENT_STREAM_PATH must start with '/'".into()));
        }
        if self.kdf_context.is_empty() {
            return Err(AppError::Config("KDF_CONTEXT must not be empty".into()));
        }
        if !(self.queue_backend_url.starts_with("memory://")
            || self.queue_backend_url.starts_with("redis://")
            || self.queue_backend_url.starts_with("rediss://"))
        {
            return Err(AppError::Config(format!(
                "QUEUE_BACKEND_URL scheme not supported: {}",
                self.queue_backend_url
            )));
        }
        if let Some(secret) = &self.system_secret_key {
            SecretKey::from_base64(&secret.0)
                .map_err(|e| AppError::Config(format!("SYSTEM_SECRET_KEY: {e}")))?;
        }
        Ok(())
    }

    pub fn uses_redis(&self) -> bool {
        !self.queue_backend_url.starts_with("memory://")
    }

    /// Keyring of the system principal. Without a configured secret a fresh
    /// key is generated, so system messages do not survive a restart.
    pub fn system_keyring(&self) -> Result<Keyring, AppError> {
        let pair = match &self.system_secret_key {
            Some(secret) => KeyPair::from_secret(
                SecretKey::from_base64(&secret.0)
                    .map_err(|e| AppError::Config(format!("SYSTEM_SECRET_KEY: {e}")))?,
            ),
            None => {
                tracing::warn!(
                    "SYSTEM_SECRET_KEY not set; generated an ephemeral system key for this process"
                );
                KeyPair::generate()
            }
        };
        Ok(Keyring::from_keypair(self.system_principal_id, pair))
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            backoff: BackoffPolicy::new(self.jobs.backoff_base, self.jobs.backoff_cap),
            default_max_attempts: self.jobs.max_attempts,
            lease_duration: self.jobs.lease_duration,
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        let mut worker = WorkerConfig::new(NOTIFICATIONS_QUEUE);
        worker.concurrency = self.jobs.worker_concurrency;
        worker.poll_interval = self.jobs.poll_interval;
        worker.retention = self.jobs.retention;
        worker
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(!config.uses_redis());
        assert_eq!(config.port, 8085);
        assert_eq!(config.event_stream_path, "/events/stream");
    }

    #[test]
    fn test_rejects_zero_buffer() {
        let config = Config {
            subscriber_buffer_size: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_rejects_cap_below_base() {
        let mut config = Config::default();
        config.jobs.backoff_base = Duration::from_secs(10);
        config.jobs.backoff_cap = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_malformed_system_key() {
        let config = Config {
            system_secret_key: Some(SystemSecret("not-base64!".into())),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_configured_system_key_is_stable() {
        let config = Config {
            system_secret_key: Some(SystemSecret(
                "AQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQE=".into(),
            )),
            system_principal_id: Uuid::new_v4(),
            ..Config::default()
        };
        let first = config.system_keyring().unwrap();
        let second = config.system_keyring().unwrap();
        assert_eq!(first.public_key(), second.public_key());
        assert_eq!(first.principal_id(), config.system_principal_id);
    }
}
