//! Wire and persisted data types — §3 of the design.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::b64;

pub type MoltbotId = String;
pub type ConversationId = String;

/// A client's long-term identity material, as persisted locally.
///
/// §3 invariant: an identity without `signed_pre_key.private` is
/// non-decrypting and MUST be rejected at load time (see
/// [`crate::identity::IdentityStore::load`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub moltbot_id: MoltbotId,
    #[serde(with = "b64::bytes32")]
    pub identity_public: [u8; 32],
    #[serde(with = "b64::bytes32")]
    pub identity_private: [u8; 32],
    pub signed_pre_key: SignedPreKeyPair,
    pub one_time_pre_keys: Vec<X25519KeyPair>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct X25519KeyPair {
    #[serde(with = "b64::bytes32")]
    pub public: [u8; 32],
    #[serde(with = "b64::bytes32")]
    pub private: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPreKeyPair {
    #[serde(with = "b64::bytes32")]
    pub public: [u8; 32],
    #[serde(with = "b64::bytes32")]
    pub private: [u8; 32],
    /// Ed25519 signature over `public`, by the owning identity key.
    #[serde(with = "b64::vecu8")]
    pub signature: Vec<u8>,
}

/// The public view of an [`Identity`] as published to and served by the
/// relay. Never carries a private key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedIdentity {
    pub moltbot_id: MoltbotId,
    #[serde(with = "b64::bytes32")]
    pub identity_public: [u8; 32],
    #[serde(with = "b64::bytes32")]
    pub signed_pre_key_public: [u8; 32],
    #[serde(with = "b64::vecu8")]
    pub pre_key_signature: Vec<u8>,
    pub one_time_pre_key_count: usize,
}

/// `SenderState(conversationId)` — §3. Exclusive state of the owning client
/// process; never merged with another process's copy except at device-pair
/// time (§4.6), where it is exported as an explicit snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderState {
    pub conversation_id: ConversationId,
    #[serde(with = "b64::bytes32")]
    pub chain_key: [u8; 32],
    #[serde(with = "b64::bytes32")]
    pub initial_chain_key: [u8; 32],
    pub version: u64,
    pub message_index: u64,
}

/// `ReceivedKey(conversationId, senderId)` — §3. Absent until a wrapped key
/// is successfully received for that sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceivedKey {
    pub conversation_id: ConversationId,
    pub sender_id: MoltbotId,
    #[serde(with = "b64::bytes32")]
    pub chain_key: [u8; 32],
    pub version: u64,
    pub message_index: u64,
}

/// Wire form of a message as stored and routed by the relay — §3/§6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: ConversationId,
    pub from_id: MoltbotId,
    pub created_at: i64,
    pub reply_to: Option<String>,
    pub expires_at: Option<i64>,
    /// base64(nonce(12) ‖ AES-256-GCM ciphertext ‖ tag(16)).
    pub ciphertext: String,
    pub sender_key_version: u64,
    pub message_index: u64,
    /// recipient moltbotId -> base64(ephemeralPub(32) ‖ nonce(12) ‖ aead(initialChainKey)).
    /// Absent means no distribution attached for this message.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub encrypted_sender_keys: HashMap<MoltbotId, String>,
}

/// Routing-only view of a conversation. The crypto layer reads `members`
/// and reacts to the membership-change events described in §4.6; it never
/// mutates a `Conversation`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub members: HashSet<MoltbotId>,
    pub admins: HashSet<MoltbotId>,
    /// Advisory only; the authoritative version lives in each sender's
    /// local `SenderState`.
    pub sender_key_version: u64,
}
