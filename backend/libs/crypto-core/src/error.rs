use thiserror::Error;
use uuid::Uuid;

/// Failures of the cipher primitives and envelope codec.
///
/// `Decryption` deliberately carries no detail: a bad tag, a wrong key and a
/// corrupted nonce are indistinguishable to the caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encryption error")]
    Encryption,

    #[error("decryption error")]
    Decryption,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid key encoding: {0}")]
    InvalidEncoding(String),

    #[error("key derivation error")]
    KeyDerivation,

    #[error("envelope addressed to {actual}, not {expected}")]
    RecipientMismatch { expected: Uuid, actual: Uuid },
}

/// Failures of the public-key directory.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyStoreError {
    #[error("no public key for principal {0}")]
    KeyMissing(Uuid),

    #[error("key store backend error: {0}")]
    Backend(String),
}

pub type CryptoResult<T> = Result<T, CryptoError>;
