//! End-to-end encryption primitives for direct messages.
//!
//! - [`Cipher`]: X25519 + HKDF-SHA256 + XChaCha20-Poly1305 box construction
//! - [`Keyring`]: principal-owned secret keys, with rotation
//! - [`Envelope`]: the sealed message and its wire shape
//! - [`KeyStore`]: public-key directory consulted before sealing

pub mod cipher;
pub mod envelope;
mod error;
pub mod keyring;
pub mod keystore;

pub use cipher::{
    generate_nonce, Cipher, KeyPair, Nonce, PublicKey, SecretKey, DEFAULT_KDF_CONTEXT, KEY_LEN,
    NONCE_LEN, TAG_LEN,
};
pub use envelope::Envelope;
pub use error::{CryptoError, CryptoResult, KeyStoreError};
pub use keyring::Keyring;
pub use keystore::{InMemoryKeyStore, KeyRecord, KeyStore};

pub fn generate_keypair() -> KeyPair {
    KeyPair::generate()
}

/// Encrypt with the default KDF context. See [`Cipher::encrypt`].
pub fn encrypt(
    plaintext: &[u8],
    recipient_public_key: &PublicKey,
    sender_secret_key: &SecretKey,
) -> CryptoResult<(Nonce, Vec<u8>)> {
    Cipher::default().encrypt(plaintext, recipient_public_key, sender_secret_key)
}

/// Decrypt with the default KDF context. See [`Cipher::decrypt`].
pub fn decrypt(
    ciphertext: &[u8],
    nonce: &[u8],
    sender_public_key: &PublicKey,
    recipient_secret_key: &SecretKey,
) -> CryptoResult<Vec<u8>> {
    Cipher::default().decrypt(ciphertext, nonce, sender_public_key, recipient_secret_key)
}
