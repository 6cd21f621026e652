//! Per-record authenticated encryption with password-derived keys (§4.4).
//!
//! Blob layout: 16-byte salt ‖ 12-byte nonce ‖ ciphertext ‖ 16-byte tag.
//! Key derivation: Argon2id(time_cost=3, memory_cost=64MiB, parallelism=4,
//! output=32 bytes) over the configured key string, salted per record.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::Argon2;
use rand::RngCore;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// Derives per-record AES-256-GCM keys from a configured password string.
pub struct Encryptor {
    key_material: String,
}

impl Encryptor {
    pub fn new(key_material: impl Into<String>) -> Self {
        Self {
            key_material: key_material.into(),
        }
    }

    fn derive_key(&self, salt: &[u8]) -> [u8; 32] {
        let params = argon2::Params::new(65536, 3, 4, Some(32))
            .expect("static argon2 params are valid");
        let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);
        let mut key = [0u8; 32];
        argon2
            .hash_password_into(self.key_material.as_bytes(), salt, &mut key)
            .expect("argon2id key derivation does not fail for fixed-size output");
        key
    }

    /// Encrypt plaintext, returning `salt ‖ nonce ‖ ciphertext+tag`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let key_bytes = self.derive_key(&salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .expect("AES-256-GCM encryption does not fail for in-memory buffers");

        let mut blob = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        blob
    }

    /// Decrypt a blob produced by [`Self::encrypt`]. Returns `None` on any
    /// failure (short blob, wrong key, tampered ciphertext) rather than
    /// panicking, matching the read-time policy in §4.4.
    pub fn decrypt(&self, blob: &[u8]) -> Option<Vec<u8>> {
        if blob.len() < SALT_LEN + NONCE_LEN {
            return None;
        }
        let (salt, rest) = blob.split_at(SALT_LEN);
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

        let key_bytes = self.derive_key(salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        let nonce = Nonce::from_slice(nonce_bytes);
        cipher.decrypt(nonce, ciphertext).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let enc = Encryptor::new("correct horse battery staple");
        let blob = enc.encrypt(b"hello world");
        assert_eq!(enc.decrypt(&blob), Some(b"hello world".to_vec()));
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let enc = Encryptor::new("key-a");
        let other = Encryptor::new("key-b");
        let blob = enc.encrypt(b"secret");
        assert_eq!(other.decrypt(&blob), None);
    }

    #[test]
    fn truncated_blob_fails_gracefully() {
        let enc = Encryptor::new("key");
        assert_eq!(enc.decrypt(&[1, 2, 3]), None);
    }

    #[test]
    fn distinct_calls_use_distinct_salts_and_nonces() {
        let enc = Encryptor::new("key");
        let a = enc.encrypt(b"same plaintext");
        let b = enc.encrypt(b"same plaintext");
        assert_ne!(a, b);
    }
}
