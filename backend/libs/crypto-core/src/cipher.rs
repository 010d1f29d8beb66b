//! Public-key authenticated encryption.
//!
//! The construction is X25519 key agreement, HKDF-SHA256 over the shared
//! point, and XChaCha20-Poly1305 with a fresh random 192-bit nonce per call.
//! Both public keys are bound as associated data (sender first), so a
//! ciphertext cannot be replayed as if it came from someone else.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{CryptoError, CryptoResult};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;
pub const DEFAULT_KDF_CONTEXT: &str = "nova-delivery/box/v1";

pub type Nonce = [u8; NONCE_LEN];

/// Fresh nonce from OS entropy. 192 bits makes a random collision negligible
/// for the lifetime of any keypair.
pub fn generate_nonce() -> Nonce {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// X25519 public key. Safe to publish, serialize and log.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let arr = <[u8; KEY_LEN]>::try_from(bytes).map_err(|_| {
            CryptoError::InvalidEncoding(format!(
                "public key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    pub fn from_base64(encoded: &str) -> CryptoResult<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// First 8 bytes of the key's SHA-256, hex encoded. Safe to log.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        hex::encode(&digest[..8])
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.fingerprint())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        PublicKey::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

/// X25519 secret key.
///
/// Not `Clone`, not `Serialize`, redacted in `Debug`, zeroized on drop. It
/// only ever lives inside the owning principal's [`KeyPair`] or keyring.
pub struct SecretKey(x25519_dalek::StaticSecret);

impl SecretKey {
    pub fn generate() -> Self {
        Self(x25519_dalek::StaticSecret::random_from_rng(OsRng))
    }

    /// Load raw key material, e.g. a service principal's key from configuration.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(x25519_dalek::StaticSecret::from(bytes))
    }

    pub fn from_base64(encoded: &str) -> CryptoResult<Self> {
        let bytes = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?,
        );
        let arr = <[u8; KEY_LEN]>::try_from(bytes.as_slice()).map_err(|_| {
            CryptoError::InvalidEncoding(format!(
                "secret key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self::from_bytes(arr))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(*x25519_dalek::PublicKey::from(&self.0).as_bytes())
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

/// A principal's keypair. The public half is cached alongside the secret.
#[derive(Debug)]
pub struct KeyPair {
    public: PublicKey,
    secret: SecretKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_secret(SecretKey::generate())
    }

    pub fn from_secret(secret: SecretKey) -> Self {
        Self {
            public: secret.public_key(),
            secret,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }
}

/// Stateless box cipher. The only state is the immutable HKDF info string,
/// so a `Cipher` can be shared freely across threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cipher {
    kdf_context: Vec<u8>,
}

impl Default for Cipher {
    fn default() -> Self {
        Self::new(DEFAULT_KDF_CONTEXT)
    }
}

impl Cipher {
    pub fn new(kdf_context: impl Into<Vec<u8>>) -> Self {
        Self {
            kdf_context: kdf_context.into(),
        }
    }

    pub fn kdf_context(&self) -> &[u8] {
        &self.kdf_context
    }

    fn shared_key(
        &self,
        our_secret: &SecretKey,
        their_public: &PublicKey,
    ) -> CryptoResult<Zeroizing<[u8; KEY_LEN]>> {
        let shared = our_secret
            .0
            .diffie_hellman(&x25519_dalek::PublicKey::from(their_public.0));
        // Low-order points give an all-zero shared secret.
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidPublicKey);
        }

        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        hk.expand(&self.kdf_context, &mut key[..])
            .map_err(|_| CryptoError::KeyDerivation)?;
        Ok(key)
    }

    /// Encrypt `plaintext` from the holder of `sender_secret` to `recipient_public`.
    ///
    /// Returns the freshly generated nonce and the ciphertext (tag appended).
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        recipient_public: &PublicKey,
        sender_secret: &SecretKey,
    ) -> CryptoResult<(Nonce, Vec<u8>)> {
        let key = self.shared_key(sender_secret, recipient_public)?;
        let nonce = generate_nonce();
        let aad = associated_data(&sender_secret.public_key(), recipient_public);

        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key[..]));
        let ciphertext = cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::Encryption)?;

        Ok((nonce, ciphertext))
    }

    /// Decrypt a ciphertext produced by [`Cipher::encrypt`].
    ///
    /// Every failure mode (tag mismatch, wrong keys, bad nonce length,
    /// truncated input) collapses to [`CryptoError::Decryption`].
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        nonce: &[u8],
        sender_public: &PublicKey,
        recipient_secret: &SecretKey,
    ) -> CryptoResult<Vec<u8>> {
        if nonce.len() != NONCE_LEN || ciphertext.len() < TAG_LEN {
            return Err(CryptoError::Decryption);
        }

        let key = self
            .shared_key(recipient_secret, sender_public)
            .map_err(|_| CryptoError::Decryption)?;
        let aad = associated_data(sender_public, &recipient_secret.public_key());

        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key[..]));
        cipher
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::Decryption)
    }
}

fn associated_data(sender: &PublicKey, recipient: &PublicKey) -> [u8; 2 * KEY_LEN] {
    let mut aad = [0u8; 2 * KEY_LEN];
    aad[..KEY_LEN].copy_from_slice(sender.as_bytes());
    aad[KEY_LEN..].copy_from_slice(recipient.as_bytes());
    aad
}
