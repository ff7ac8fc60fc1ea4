//! Error taxonomy for the MoltDM cryptographic core.
//!
//! Every fallible operation in this crate returns one of these variants so
//! that callers (client agent, relay) can apply the policy §7 of the design
//! spells out per category without inspecting error text.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MoltdmError {
    /// Malformed input: bad base64, wrong-length key material, oversized body.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Missing/invalid signature, stale timestamp, unknown moltbot id.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Caller is not a member/admin of the conversation it is acting on.
    #[error("not authorized: {0}")]
    Authorization(String),

    /// Locally recoverable keying gap: no chain key yet, wrap/unwrap failed,
    /// peer signed pre-key unavailable. Existing good state is never evicted
    /// for this category.
    #[error("undecryptable: {0}")]
    Keying(String),

    /// AEAD tag failure or other cryptographic integrity violation. Treated
    /// as an active attack; never advances ratchet state.
    #[error("cryptographic integrity failure: {0}")]
    CryptoIntegrity(String),

    /// Network/IO failure. The local ratchet may already have advanced.
    #[error("transport error: {0}")]
    Transport(String),

    /// A message violates protocol ordering, e.g. `messageIndex` in the past
    /// with no skipped-key cache available.
    #[error("protocol violation: {0}")]
    ProtocolBreaking(String),
}

pub type Result<T> = std::result::Result<T, MoltdmError>;

impl From<base64::DecodeError> for MoltdmError {
    fn from(value: base64::DecodeError) -> Self {
        MoltdmError::Validation(format!("base64 decode: {value}"))
    }
}

impl From<aes_gcm::Error> for MoltdmError {
    fn from(_value: aes_gcm::Error) -> Self {
        MoltdmError::CryptoIntegrity("AEAD operation failed".to_string())
    }
}

impl From<hkdf::InvalidLength> for MoltdmError {
    fn from(value: hkdf::InvalidLength) -> Self {
        MoltdmError::Validation(format!("hkdf: {value}"))
    }
}

impl From<ed25519_dalek::SignatureError> for MoltdmError {
    fn from(_value: ed25519_dalek::SignatureError) -> Self {
        MoltdmError::Authentication("signature verification failed".to_string())
    }
}
