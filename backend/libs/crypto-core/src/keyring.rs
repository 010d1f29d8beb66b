//! Principal-side key custody.
//!
//! A `Keyring` is held by the principal that owns it (a client, or the
//! service's own system principal). It is the only place a secret key is
//! resolved; nothing in here is ever sent to a shared store.

use tracing::debug;
use uuid::Uuid;

use crate::cipher::{Cipher, KeyPair, PublicKey};
use crate::envelope::Envelope;
use crate::error::{CryptoError, CryptoResult};

/// Retired keys kept for opening messages sent before a rotation.
pub const DEFAULT_RETIRED_KEYS: usize = 8;

#[derive(Debug)]
pub struct Keyring {
    principal_id: Uuid,
    current: KeyPair,
    retired: Vec<KeyPair>,
    max_retired: usize,
}

impl Keyring {
    pub fn generate(principal_id: Uuid) -> Self {
        Self::from_keypair(principal_id, KeyPair::generate())
    }

    pub fn from_keypair(principal_id: Uuid, current: KeyPair) -> Self {
        Self {
            principal_id,
            current,
            retired: Vec::new(),
            max_retired: DEFAULT_RETIRED_KEYS,
        }
    }

    pub fn with_max_retired(mut self, max_retired: usize) -> Self {
        self.max_retired = max_retired;
        self.retired.truncate(max_retired);
        self
    }

    pub fn principal_id(&self) -> Uuid {
        self.principal_id
    }

    pub fn public_key(&self) -> PublicKey {
        self.current.public_key()
    }

    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    /// Reissue the keypair. The returned public key must be published to the
    /// key store; the old secret is kept so earlier envelopes still open.
    pub fn rotate(&mut self) -> PublicKey {
        let previous = std::mem::replace(&mut self.current, KeyPair::generate());
        debug!(
            principal_id = %self.principal_id,
            retired = %previous.public_key().fingerprint(),
            current = %self.current.public_key().fingerprint(),
            "Rotated principal keypair"
        );
        self.retired.insert(0, previous);
        self.retired.truncate(self.max_retired);
        self.current.public_key()
    }

    /// Seal `plaintext` to `recipient_id` with the current key.
    pub fn seal(
        &self,
        cipher: &Cipher,
        recipient_id: Uuid,
        recipient_public: &PublicKey,
        plaintext: &[u8],
    ) -> CryptoResult<Envelope> {
        Envelope::seal(
            cipher,
            self.principal_id,
            self.current.secret_key(),
            recipient_id,
            recipient_public,
            plaintext,
        )
    }

    /// Open an envelope addressed to this principal, trying the current key
    /// first and then retired keys, newest first.
    pub fn open(
        &self,
        cipher: &Cipher,
        envelope: &Envelope,
        sender_public: &PublicKey,
    ) -> CryptoResult<Vec<u8>> {
        if envelope.recipient_id() != self.principal_id {
            return Err(CryptoError::RecipientMismatch {
                expected: self.principal_id,
                actual: envelope.recipient_id(),
            });
        }

        std::iter::once(&self.current)
            .chain(self.retired.iter())
            .find_map(|pair| envelope.open(cipher, sender_public, pair.secret_key()).ok())
            .ok_or(CryptoError::Decryption)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_after_rotation() {
        let cipher = Cipher::default();
        let alice = Keyring::generate(Uuid::new_v4());
        let mut bob = Keyring::generate(Uuid::new_v4());

        let before = alice
            .seal(&cipher, bob.principal_id(), &bob.public_key(), b"old")
            .unwrap();
        let new_public = bob.rotate();
        assert_ne!(new_public, before_key(&bob));

        let after = alice
            .seal(&cipher, bob.principal_id(), &new_public, b"new")
            .unwrap();

        assert_eq!(bob.open(&cipher, &before, &alice.public_key()).unwrap(), b"old");
        assert_eq!(bob.open(&cipher, &after, &alice.public_key()).unwrap(), b"new");
    }

    fn before_key(ring: &Keyring) -> PublicKey {
        ring.retired[0].public_key()
    }

    #[test]
    fn test_retired_keys_are_bounded() {
        let mut ring = Keyring::generate(Uuid::new_v4()).with_max_retired(2);
        for _ in 0..5 {
            ring.rotate();
        }
        assert_eq!(ring.retired_count(), 2);
    }

    #[test]
    fn test_open_rejects_misaddressed_envelope() {
        let cipher = Cipher::default();
        let alice = Keyring::generate(Uuid::new_v4());
        let bob = Keyring::generate(Uuid::new_v4());
        let carol = Keyring::generate(Uuid::new_v4());

        let env = alice
            .seal(&cipher, bob.principal_id(), &bob.public_key(), b"hi")
            .unwrap();
        assert!(matches!(
            carol.open(&cipher, &env, &alice.public_key()),
            Err(CryptoError::RecipientMismatch { .. })
        ));
    }
}
