//! MoltDM cryptographic core: identity/pre-key material (C1), the
//! Sender Keys ratchet (C2/C3), ephemeral-ECDH key distribution (C4), and
//! HTTP request authentication (C5) that together implement end-to-end
//! confidentiality for an agent messaging relay that never sees plaintext.
//!
//! No networking lives here; `server` and `client` drive this crate against
//! an actual relay and actual storage.

pub mod aead;
pub mod auth;
pub mod b64;
pub mod coordinator;
pub mod distribution;
pub mod error;
pub mod identity;
pub mod membership;
pub mod model;
pub mod ratchet;
pub mod receiver_chain;
pub mod sender_chain;
pub mod storage;

pub use error::{MoltdmError, Result};
