//! C5 — Request Authenticator. §4.5.
//!
//! Pure, transport-agnostic canonicalization and Ed25519 signing/verifying
//! of relay requests. Deliberately takes already-extracted method/path/body
//! rather than any particular HTTP framework's request type, so the same
//! logic drives a `reqwest`-based client signer and an `axum`-based server
//! verifier without either depending on the other's types — the split the
//! pack's `darklock-guard` `connected::verifier` module makes between a
//! pure `canonical_*_message` function and a thin wrapper around it.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::error::{MoltdmError, Result};

/// Signature freshness window, per §4.5/§5: requests outside `now ± 5min`
/// are rejected.
pub const FRESHNESS_WINDOW_MILLIS: i64 = 5 * 60 * 1000;

pub struct SignedRequest {
    pub moltbot_id: String,
    pub timestamp_millis: i64,
    /// Base64-encoded Ed25519 signature.
    pub signature: String,
}

/// Builds the canonical string `"{timestamp}:{method}:{path}:{bodyHash}"`.
/// `body` must be the raw request body bytes; an empty body yields the
/// literal empty string for `bodyHash`, not the hash of zero bytes (§8
/// "Boundary behaviors").
pub fn canonical_message(timestamp_millis: i64, method: &str, path: &str, body: &[u8]) -> String {
    let body_hash = if body.is_empty() {
        String::new()
    } else {
        hex_sha256(body)
    };
    format!("{timestamp_millis}:{}:{path}:{body_hash}", method.to_uppercase())
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Signs a request as the client, per §4.5. Returns the three header values
/// the relay expects (`X-Moltbot-Id`, `X-Timestamp`, `X-Signature`).
pub fn sign_request(
    moltbot_id: &str,
    identity_key: &SigningKey,
    timestamp_millis: i64,
    method: &str,
    path: &str,
    body: &[u8],
) -> SignedRequest {
    let message = canonical_message(timestamp_millis, method, path, body);
    let signature: Signature = identity_key.sign(message.as_bytes());
    SignedRequest {
        moltbot_id: moltbot_id.to_string(),
        timestamp_millis,
        signature: STANDARD.encode(signature.to_bytes()),
    }
}

/// Verifies a request as the relay, per §4.5's five steps (the caller is
/// responsible for step 1, checking that all three headers were present,
/// and step 3, resolving `moltbot_id` to `verifying_key` from its own
/// identity store before calling this).
pub fn verify_request(
    verifying_key: &VerifyingKey,
    timestamp_millis: i64,
    now_millis: i64,
    method: &str,
    path: &str,
    body: &[u8],
    signature_b64: &str,
) -> Result<()> {
    if (now_millis - timestamp_millis).abs() > FRESHNESS_WINDOW_MILLIS {
        return Err(MoltdmError::Authentication("timestamp outside freshness window".to_string()));
    }

    let signature_bytes = STANDARD.decode(signature_b64)?;
    let signature_arr: [u8; 64] = signature_bytes
        .as_slice()
        .try_into()
        .map_err(|_| MoltdmError::Authentication("malformed signature".to_string()))?;
    let signature = Signature::from_bytes(&signature_arr);

    let message = canonical_message(timestamp_millis, method, path, body);
    verifying_key
        .verify(message.as_bytes(), &signature)
        .map_err(|_| MoltdmError::Authentication("signature verification failed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn empty_body_yields_empty_body_hash() {
        let msg = canonical_message(1_000, "POST", "/api/x", b"");
        assert_eq!(msg, "1000:POST:/api/x:");
    }

    #[test]
    fn nonempty_body_is_hex_sha256() {
        let msg = canonical_message(1_000, "post", "/api/x", b"hi");
        // sha256("hi") = 8f434346648f6b96df89dda901c5176b10a6d83961dd3c1ac88b59b2dc327aa
        assert_eq!(
            msg,
            "1000:POST:/api/x:8f434346648f6b96df89dda901c5176b10a6d83961dd3c1ac88b59b2dc327aa"
        );
    }

    #[test]
    fn percent_encoded_path_is_preserved_verbatim() {
        let msg = canonical_message(1, "GET", "/api/conversations/1/reactions/%F0%9F%98%80", b"");
        assert!(msg.ends_with("/api/conversations/1/reactions/%F0%9F%98%80:"));
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let key = SigningKey::generate(&mut OsRng);
        let signed = sign_request("moltbot_a", &key, 1_000_000, "POST", "/api/x", b"body");
        verify_request(
            &key.verifying_key(),
            signed.timestamp_millis,
            1_000_000,
            "POST",
            "/api/x",
            b"body",
            &signed.signature,
        )
        .unwrap();
    }

    #[test]
    fn bit_flip_in_body_is_rejected() {
        let key = SigningKey::generate(&mut OsRng);
        let signed = sign_request("moltbot_a", &key, 1_000_000, "POST", "/api/x", b"body");
        let err = verify_request(
            &key.verifying_key(),
            signed.timestamp_millis,
            1_000_000,
            "POST",
            "/api/x",
            b"bodz",
            &signed.signature,
        );
        assert!(err.is_err());
    }

    #[test]
    fn bit_flip_in_signature_is_rejected() {
        let key = SigningKey::generate(&mut OsRng);
        let signed = sign_request("moltbot_a", &key, 1_000_000, "POST", "/api/x", b"body");
        let mut raw = STANDARD.decode(&signed.signature).unwrap();
        raw[0] ^= 0xFF;
        let flipped = STANDARD.encode(raw);
        assert!(verify_request(
            &key.verifying_key(),
            signed.timestamp_millis,
            1_000_000,
            "POST",
            "/api/x",
            b"body",
            &flipped,
        )
        .is_err());
    }

    #[test]
    fn bit_flip_in_public_key_is_rejected() {
        let key = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let signed = sign_request("moltbot_a", &key, 1_000_000, "POST", "/api/x", b"body");
        assert!(verify_request(
            &other.verifying_key(),
            signed.timestamp_millis,
            1_000_000,
            "POST",
            "/api/x",
            b"body",
            &signed.signature,
        )
        .is_err());
    }

    #[test]
    fn within_window_accepted_outside_window_rejected() {
        let key = SigningKey::generate(&mut OsRng);
        let now = 10_000_000i64;
        let fresh = sign_request("a", &key, now - FRESHNESS_WINDOW_MILLIS + 1000, "GET", "/p", b"");
        assert!(verify_request(&key.verifying_key(), fresh.timestamp_millis, now, "GET", "/p", b"", &fresh.signature).is_ok());

        let stale = sign_request("a", &key, now - FRESHNESS_WINDOW_MILLIS - 1000, "GET", "/p", b"");
        assert!(verify_request(&key.verifying_key(), stale.timestamp_millis, now, "GET", "/p", b"", &stale.signature).is_err());
    }
}
