//! C4 — Sender Key Distributor. §4.4.
//!
//! Wraps a conversation's `initialChainKey` to every current recipient via
//! an ephemeral-static X25519 ECDH against the recipient's published SPK,
//! HKDF-SHA256, and AES-256-GCM — and unwraps the reverse on receipt.
//!
//! The HKDF salt, info string, and output length below are load-bearing for
//! interop with any other implementation of this wire format (§4.4
//! "Invariants").

use hkdf::Hkdf;
use rand_core::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

use crate::aead;
use crate::error::{MoltdmError, Result};

const WRAP_SALT: [u8; 32] = [0u8; 32];
const WRAP_INFO: &[u8] = b"moltdm-sender-key";
const EPHEMERAL_PUB_LEN: usize = 32;
const NONCE_LEN: usize = 12;

fn derive_wrap_key(shared_secret: &x25519_dalek::SharedSecret) -> Result<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(&WRAP_SALT), shared_secret.as_bytes());
    let mut wrap_key = [0u8; 32];
    hk.expand(WRAP_INFO, &mut wrap_key)?;
    Ok(wrap_key)
}

/// Wraps `initial_chain_key` to a single recipient's published SPK public
/// key. Returns `ephemeralPub(32) ‖ nonce(12) ‖ aead(initialChainKey)`, not
/// yet base64-encoded. The ephemeral key is freshly generated per call and
/// never reused (§4.4 invariant).
pub fn wrap(recipient_spk_public: &[u8; 32], initial_chain_key: &[u8; 32]) -> Result<Vec<u8>> {
    let ephemeral_secret = X25519StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = X25519PublicKey::from(&ephemeral_secret);
    let recipient_public = X25519PublicKey::from(*recipient_spk_public);
    let shared = ephemeral_secret.diffie_hellman(&recipient_public);
    let wrap_key = derive_wrap_key(&shared)?;

    let blob = aead::seal(&wrap_key, initial_chain_key, b"")?;

    let mut out = Vec::with_capacity(EPHEMERAL_PUB_LEN + blob.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&blob);
    Ok(out)
}

/// Unwraps a blob produced by [`wrap`] using this client's own SPK secret.
/// A single recipient's unwrap failure (wrong recipient, corrupted blob,
/// stale ephemeral) is reported as `Keying` and never corrupts other state
/// (§4.4 "Failure semantics").
pub fn unwrap(own_spk_secret: &X25519StaticSecret, wrapped: &[u8]) -> Result<[u8; 32]> {
    if wrapped.len() < EPHEMERAL_PUB_LEN + NONCE_LEN {
        return Err(MoltdmError::Validation(
            "sender key wrap shorter than ephemeral key + nonce".to_string(),
        ));
    }
    let (ephemeral_pub_bytes, rest) = wrapped.split_at(EPHEMERAL_PUB_LEN);
    let ephemeral_public_arr: [u8; 32] = ephemeral_pub_bytes
        .try_into()
        .expect("split_at guarantees 32 bytes");
    let ephemeral_public = X25519PublicKey::from(ephemeral_public_arr);

    let shared = own_spk_secret.diffie_hellman(&ephemeral_public);
    let wrap_key = derive_wrap_key(&shared)?;

    let plaintext = aead::open(&wrap_key, rest, b"").map_err(|_| {
        MoltdmError::Keying("failed to unwrap sender key: wrong recipient or corrupted blob".to_string())
    })?;

    plaintext
        .try_into()
        .map_err(|_| MoltdmError::Keying("unwrapped sender key is not 32 bytes".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_unwrap_round_trips() {
        let recipient_secret = X25519StaticSecret::random_from_rng(OsRng);
        let recipient_public = X25519PublicKey::from(&recipient_secret);
        let chain_key = [42u8; 32];

        let wrapped = wrap(recipient_public.as_bytes(), &chain_key).unwrap();
        let unwrapped = unwrap(&recipient_secret, &wrapped).unwrap();
        assert_eq!(unwrapped, chain_key);
    }

    #[test]
    fn wrapped_blob_has_expected_length() {
        let recipient_secret = X25519StaticSecret::random_from_rng(OsRng);
        let recipient_public = X25519PublicKey::from(&recipient_secret);
        let wrapped = wrap(recipient_public.as_bytes(), &[0u8; 32]).unwrap();
        // ephemeralPub(32) + nonce(12) + chain key(32) + tag(16) = 92.
        assert_eq!(wrapped.len(), 92);
    }

    #[test]
    fn wrong_recipient_cannot_unwrap() {
        let recipient_secret = X25519StaticSecret::random_from_rng(OsRng);
        let recipient_public = X25519PublicKey::from(&recipient_secret);
        let attacker_secret = X25519StaticSecret::random_from_rng(OsRng);

        let wrapped = wrap(recipient_public.as_bytes(), &[7u8; 32]).unwrap();
        assert!(unwrap(&attacker_secret, &wrapped).is_err());
    }

    #[test]
    fn ephemeral_keys_are_not_reused_across_wraps() {
        let recipient_secret = X25519StaticSecret::random_from_rng(OsRng);
        let recipient_public = X25519PublicKey::from(&recipient_secret);
        let a = wrap(recipient_public.as_bytes(), &[1u8; 32]).unwrap();
        let b = wrap(recipient_public.as_bytes(), &[1u8; 32]).unwrap();
        assert_ne!(&a[..32], &b[..32]);
    }
}
