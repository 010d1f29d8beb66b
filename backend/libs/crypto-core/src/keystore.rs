//! Principal directory: resolves a principal to its current public key.
//!
//! Only public keys pass through here. Secret keys stay in the owner's
//! [`crate::Keyring`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::cipher::PublicKey;
use crate::error::KeyStoreError;

/// Published key for a principal. `version` increases on every rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRecord {
    pub principal_id: Uuid,
    pub public_key: PublicKey,
    pub version: u32,
    pub published_at: DateTime<Utc>,
}

#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Current key record for `principal_id`.
    async fn record(&self, principal_id: Uuid) -> Result<KeyRecord, KeyStoreError>;

    /// Publish (or rotate) a principal's public key. Republishing the current
    /// key is a no-op that returns the existing record.
    async fn publish(
        &self,
        principal_id: Uuid,
        public_key: PublicKey,
    ) -> Result<KeyRecord, KeyStoreError>;

    async fn remove(&self, principal_id: Uuid) -> Result<(), KeyStoreError>;

    async fn lookup(&self, principal_id: Uuid) -> Result<PublicKey, KeyStoreError> {
        self.record(principal_id).await.map(|r| r.public_key)
    }
}

/// Process-local key directory.
#[derive(Debug, Default)]
pub struct InMemoryKeyStore {
    records: DashMap<Uuid, KeyRecord>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl KeyStore for InMemoryKeyStore {
    async fn record(&self, principal_id: Uuid) -> Result<KeyRecord, KeyStoreError> {
        self.records
            .get(&principal_id)
            .map(|r| r.value().clone())
            .ok_or(KeyStoreError::KeyMissing(principal_id))
    }

    async fn publish(
        &self,
        principal_id: Uuid,
        public_key: PublicKey,
    ) -> Result<KeyRecord, KeyStoreError> {
        let mut entry = self
            .records
            .entry(principal_id)
            .or_insert_with(|| KeyRecord {
                principal_id,
                public_key,
                version: 0,
                published_at: Utc::now(),
            });

        let record = entry.value_mut();
        if record.version == 0 || record.public_key != public_key {
            record.public_key = public_key;
            record.version += 1;
            record.published_at = Utc::now();
            info!(
                principal_id = %principal_id,
                version = record.version,
                fingerprint = %public_key.fingerprint(),
                "Published principal public key"
            );
        }

        Ok(record.clone())
    }

    async fn remove(&self, principal_id: Uuid) -> Result<(), KeyStoreError> {
        self.records
            .remove(&principal_id)
            .map(|_| ())
            .ok_or(KeyStoreError::KeyMissing(principal_id))
    }
}
