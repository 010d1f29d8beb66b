//! Encrypted direct-message envelope and its wire shape.
//!
//! ```json
//! {
//!   "senderId": "…uuid…",
//!   "recipientId": "…uuid…",
//!   "nonce": "<base64, 24 bytes>",
//!   "ciphertext": "<base64>",
//!   "createdAt": "2026-01-01T00:00:00Z"
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cipher::{Cipher, Nonce, PublicKey, SecretKey};
use crate::error::CryptoResult;

/// An encrypted message unit between two principals. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    sender_id: Uuid,
    recipient_id: Uuid,
    #[serde(with = "b64_nonce")]
    nonce: Nonce,
    #[serde(with = "b64_bytes")]
    ciphertext: Vec<u8>,
    created_at: DateTime<Utc>,
}

impl Envelope {
    /// Encrypt `plaintext` for `recipient_id` and wrap it.
    pub fn seal(
        cipher: &Cipher,
        sender_id: Uuid,
        sender_secret: &SecretKey,
        recipient_id: Uuid,
        recipient_public: &PublicKey,
        plaintext: &[u8],
    ) -> CryptoResult<Self> {
        let (nonce, ciphertext) = cipher.encrypt(plaintext, recipient_public, sender_secret)?;
        Ok(Self {
            sender_id,
            recipient_id,
            nonce,
            ciphertext,
            created_at: Utc::now(),
        })
    }

    pub fn open(
        &self,
        cipher: &Cipher,
        sender_public: &PublicKey,
        recipient_secret: &SecretKey,
    ) -> CryptoResult<Vec<u8>> {
        cipher.decrypt(&self.ciphertext, &self.nonce, sender_public, recipient_secret)
    }

    pub fn sender_id(&self) -> Uuid {
        self.sender_id
    }

    pub fn recipient_id(&self) -> Uuid {
        self.recipient_id
    }

    pub fn nonce(&self) -> &Nonce {
        &self.nonce
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

mod b64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

mod b64_nonce {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::cipher::{Nonce, NONCE_LEN};

    pub fn serialize<S: Serializer>(nonce: &Nonce, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(nonce))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Nonce, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)?;
        <[u8; NONCE_LEN]>::try_from(bytes.as_slice()).map_err(|_| {
            serde::de::Error::custom(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                bytes.len()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::KeyPair;

    fn sealed() -> (Envelope, KeyPair, KeyPair) {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let envelope = Envelope::seal(
            &Cipher::default(),
            Uuid::new_v4(),
            alice.secret_key(),
            Uuid::new_v4(),
            &bob.public_key(),
            b"see you at 8",
        )
        .unwrap();
        (envelope, alice, bob)
    }

    #[test]
    fn test_seal_and_open() {
        let (envelope, alice, bob) = sealed();
        let pt = envelope
            .open(&Cipher::default(), &alice.public_key(), bob.secret_key())
            .unwrap();
        assert_eq!(pt, b"see you at 8");
    }

    #[test]
    fn test_wire_shape_is_camel_case_base64() {
        let (envelope, _, _) = sealed();
        let json = serde_json::to_value(&envelope).unwrap();
        let obj = json.as_object().unwrap();
        for key in ["senderId", "recipientId", "nonce", "ciphertext", "createdAt"] {
            assert!(obj.contains_key(key), "missing {key}");
        }
        assert!(json["nonce"].as_str().unwrap().len() == 32); // 24 bytes base64

        let back: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn test_wrong_nonce_length_rejected_on_decode() {
        let (envelope, _, _) = sealed();
        let mut json = serde_json::to_value(&envelope).unwrap();
        json["nonce"] = serde_json::Value::String("AAAAAAAAAAAAAAAA".into()); // 12 bytes
        assert!(serde_json::from_value::<Envelope>(json).is_err());
    }
}
