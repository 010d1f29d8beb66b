use std::collections::HashSet;

use crypto_core::{decrypt, encrypt, generate_keypair, generate_nonce, CryptoError, NONCE_LEN};

#[test]
fn roundtrip_box() {
    let sender = generate_keypair();
    let recipient = generate_keypair();
    let msg = b"hello";

    let (nonce, ct) = encrypt(msg, &recipient.public_key(), sender.secret_key()).expect("encrypt");
    assert_ne!(ct.as_slice(), msg.as_slice(), "ciphertext must not echo plaintext");

    let pt = decrypt(&ct, &nonce, &sender.public_key(), recipient.secret_key()).expect("decrypt");
    assert_eq!(pt, msg);
}

#[test]
fn nonce_randomness_length() {
    let n1 = generate_nonce();
    let n2 = generate_nonce();
    assert_eq!(n1.len(), NONCE_LEN);
    assert_ne!(n1, n2, "nonce should be random");
}

#[test]
fn encrypt_never_repeats_nonce_for_same_pair() {
    let sender = generate_keypair();
    let recipient = generate_keypair();
    let mut seen = HashSet::with_capacity(10_000);

    for _ in 0..10_000 {
        let (nonce, _) =
            encrypt(b"same plaintext", &recipient.public_key(), sender.secret_key()).unwrap();
        assert!(seen.insert(nonce), "nonce reused");
    }
}

#[test]
fn every_single_byte_flip_fails() {
    let sender = generate_keypair();
    let recipient = generate_keypair();
    let (nonce, ct) = encrypt(
        b"attack at dawn, bring snacks",
        &recipient.public_key(),
        sender.secret_key(),
    )
    .unwrap();

    for i in 0..ct.len() {
        let mut tampered = ct.clone();
        tampered[i] ^= 0x01;
        assert_eq!(
            decrypt(&tampered, &nonce, &sender.public_key(), recipient.secret_key()),
            Err(CryptoError::Decryption),
            "ciphertext byte {i}"
        );
    }

    for i in 0..nonce.len() {
        let mut tampered = nonce;
        tampered[i] ^= 0x80;
        assert_eq!(
            decrypt(&ct, &tampered, &sender.public_key(), recipient.secret_key()),
            Err(CryptoError::Decryption),
            "nonce byte {i}"
        );
    }
}
