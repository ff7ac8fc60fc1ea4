//! AES-256-GCM wrapper matching §6's wire format: `nonce(12) ‖ ciphertext ‖
//! tag(16)`, with the nonce drawn fresh from the OS RNG for every call.
//!
//! Mirrors the shape of the teacher's `chacha20poly1305`-based `aead` module
//! (`encrypt_data`/`decrypt_data` over a `Payload { msg, aad }`) but switches
//! cipher to AES-256-GCM, as pinned by §6, and folds the random nonce into
//! the output rather than threading it separately.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};

use crate::error::{MoltdmError, Result};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Encrypts `plaintext` under `key` with a fresh random 12-byte nonce.
/// Returns `nonce ‖ ciphertext ‖ tag`.
pub fn seal(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(MoltdmError::from)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(nonce.as_slice());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Splits `sealed` into `nonce ‖ ciphertext ‖ tag` and decrypts it under
/// `key`. Tag authentication failure is reported as `CryptoIntegrity`, per
/// §7: it is never distinguished further and never recovers the ratchet.
pub fn open(key: &[u8; 32], sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(MoltdmError::Validation(
            "ciphertext shorter than nonce + tag".to_string(),
        ));
    }
    let (nonce_bytes, rest) = sealed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, Payload { msg: rest, aad })
        .map_err(MoltdmError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let key = [9u8; 32];
        let sealed = seal(&key, b"hello world", b"aad").unwrap();
        let opened = open(&key, &sealed, b"aad").unwrap();
        assert_eq!(opened, b"hello world");
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = [9u8; 32];
        let mut sealed = seal(&key, b"hello world", b"aad").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(open(&key, &sealed, b"aad").is_err());
    }

    #[test]
    fn wrong_aad_fails() {
        let key = [9u8; 32];
        let sealed = seal(&key, b"hello world", b"aad-a").unwrap();
        assert!(open(&key, &sealed, b"aad-b").is_err());
    }

    #[test]
    fn nonces_are_not_reused_across_calls() {
        let key = [1u8; 32];
        let a = seal(&key, b"same plaintext", b"").unwrap();
        let b = seal(&key, b"same plaintext", b"").unwrap();
        assert_ne!(&a[..12], &b[..12]);
    }
}
