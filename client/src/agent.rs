//! The agent-facing library surface: one process, one identity, driving
//! C1-C5 against a relay over HTTP. Mirrors the shape of the teacher's
//! `MemoryClient` + free functions (`register`/`message`/`listen`), but
//! built on `protocol`'s coordinator/chain managers instead of X3DH.

use std::collections::HashMap;

use protocol::coordinator;
use protocol::identity::{DEFAULT_ONE_TIME_PREKEYS, IdentityStore};
use protocol::membership::{self, ConversationLocks, DevicePairingSnapshot, MembershipEvent};
use protocol::model::Message;
use protocol::receiver_chain::ReceiverChainCache;
use protocol::sender_chain::SenderChainManager;
use protocol::storage::BlobStore;
use protocol::{MoltdmError, Result};

use crate::http::RelayClient;

/// Owns one moltbot's identity and ratchet state for the lifetime of the
/// process, and the relay connection it drives them against.
pub struct Agent {
    identity: IdentityStore,
    store: Box<dyn BlobStore>,
    locks: ConversationLocks,
    relay: RelayClient,
}

impl Agent {
    /// Loads a previously persisted identity from `store`, or generates and
    /// registers a fresh one against `relay_base_url` if none is found.
    pub async fn load_or_register(store: Box<dyn BlobStore>, relay_base_url: impl Into<String>) -> Result<Self> {
        let relay = RelayClient::new(relay_base_url);
        let identity = match IdentityStore::load(store.as_ref())? {
            Some(identity) => identity,
            None => {
                let mut identity = IdentityStore::generate(DEFAULT_ONE_TIME_PREKEYS);
                let request = identity.registration_request();
                let published = relay
                    .register_identity(
                        request.identity_public,
                        request.signed_pre_key_public,
                        &request.pre_key_signature,
                        &request.one_time_pre_keys,
                    )
                    .await?;
                identity.assign_id(published.moltbot_id);
                identity.save(store.as_ref())?;
                identity
            }
        };
        Ok(Self {
            identity,
            store,
            locks: ConversationLocks::new(),
            relay,
        })
    }

    pub fn moltbot_id(&self) -> &str {
        self.identity.moltbot_id()
    }

    pub async fn create_conversation(&self, conversation_id: &str, members: &[String]) -> Result<()> {
        self.relay
            .create_conversation(self.moltbot_id(), &self.identity.signing_key(), conversation_id, members)
            .await
    }

    pub async fn add_member(&self, conversation_id: &str, new_member: &str) -> Result<()> {
        self.relay
            .add_member(self.moltbot_id(), &self.identity.signing_key(), conversation_id, new_member)
            .await?;
        let mut sender = SenderChainManager::new(self.store.as_ref());
        membership::apply_membership_event(
            &mut sender,
            &MembershipEvent::PeerAdded {
                conversation_id: conversation_id.to_string(),
                peer: new_member.to_string(),
            },
        )
    }

    pub async fn remove_member(&self, conversation_id: &str, member: &str) -> Result<()> {
        self.relay
            .remove_member(self.moltbot_id(), &self.identity.signing_key(), conversation_id, member)
            .await?;
        let mut sender = SenderChainManager::new(self.store.as_ref());
        membership::apply_membership_event(
            &mut sender,
            &MembershipEvent::PeerRemoved {
                conversation_id: conversation_id.to_string(),
                peer: member.to_string(),
            },
        )
    }

    pub async fn leave_conversation(&self, conversation_id: &str) -> Result<()> {
        self.relay
            .leave_conversation(self.moltbot_id(), &self.identity.signing_key(), conversation_id)
            .await?;
        let mut sender = SenderChainManager::new(self.store.as_ref());
        membership::apply_membership_event(&mut sender, &MembershipEvent::SelfLeft { conversation_id: conversation_id.to_string() })
    }

    /// Encrypts `plaintext`, attaches a fresh sender-key distribution for
    /// every current member this client doesn't already share a version
    /// with, and posts the result — §4.4/§4.2 under the conversation's lock
    /// (§5).
    pub async fn send_message(&self, conversation_id: &str, plaintext: &[u8]) -> Result<Message> {
        let lock = self.locks.lock_for(conversation_id);
        let _guard = lock.lock().await;

        let conversation = self
            .relay
            .get_conversation(self.moltbot_id(), &self.identity.signing_key(), conversation_id)
            .await?;

        let mut sender = SenderChainManager::new(self.store.as_ref());
        let out = sender.send(conversation_id, plaintext)?;

        let mut recipient_spks = HashMap::new();
        for member in conversation.members.iter().filter(|m| m.as_str() != self.moltbot_id()) {
            match self.relay.fetch_identity(member).await {
                Ok(published) => {
                    recipient_spks.insert(member.clone(), published.signed_pre_key_public);
                }
                Err(e) => {
                    tracing::debug!(recipient = %member, "failed to fetch SPK for sender-key wrap: {e}");
                }
            }
        }
        let wraps = coordinator::distribute_sender_key(&recipient_spks, &out.initial_chain_key);

        self.relay
            .post_message(
                self.moltbot_id(),
                &self.identity.signing_key(),
                conversation_id,
                &protocol::b64::encode(&out.ciphertext),
                out.sender_key_version,
                out.message_index,
                &wraps,
            )
            .await
    }

    /// Polls for new messages since `since_millis`, decrypting each one
    /// in arrival order. Messages this client cannot yet decrypt (§7
    /// `Keying`) are skipped rather than aborting the whole batch, since a
    /// transient keying gap for one sender must not block delivery of
    /// others.
    pub async fn poll_and_decrypt(&self, conversation_id: &str, since_millis: i64) -> Result<Vec<(Message, Vec<u8>)>> {
        let messages = self
            .relay
            .poll_messages(self.moltbot_id(), &self.identity.signing_key(), conversation_id, since_millis)
            .await?;

        let mut receiver = ReceiverChainCache::new(self.store.as_ref());
        let spk_secret = self.identity.spk_secret();
        let self_id = self.moltbot_id().to_string();

        let mut out = Vec::with_capacity(messages.len());
        for message in messages {
            if message.from_id == self_id {
                continue;
            }
            match coordinator::receive_message(&mut receiver, &spk_secret, &self_id, &message) {
                Ok(plaintext) => out.push((message, plaintext)),
                Err(e) => {
                    tracing::debug!(from = %message.from_id, "could not decrypt message: {e}");
                }
            }
        }
        Ok(out)
    }

    /// Requests a pairing token from the relay for linking a new device to
    /// this identity (§4.6 "Device paired for self").
    pub async fn initiate_pairing(&self) -> Result<String> {
        self.relay.initiate_pairing(self.moltbot_id(), &self.identity.signing_key()).await
    }

    /// Exports this client's identity plus its current sender state for
    /// every conversation in `conversation_ids`, and submits it to the
    /// relay under `token` for the paired device to retrieve. Per §9 Open
    /// Question 5 this hands the paired device full signing authority as
    /// this moltbot; that is intentional.
    pub async fn submit_pairing_snapshot(&self, token: &str, conversation_ids: &[String]) -> Result<()> {
        let mut sender = SenderChainManager::new(self.store.as_ref());
        let snapshot = membership::export_device_snapshot(&self.identity, &mut sender, conversation_ids)?;
        let blob = encode_snapshot(&snapshot)?;
        self.relay.submit_pairing_blob(token, blob).await
    }

    /// Polls a pairing token until the owning device submits its snapshot,
    /// then builds a fresh `Agent` for `owner_moltbot_id` from it (the
    /// moltbotId travels alongside the token out-of-band; the snapshot
    /// itself carries no public identifier). Intended for a brand-new
    /// device that has no identity of its own yet.
    pub async fn complete_pairing(
        store: Box<dyn BlobStore>,
        relay_base_url: impl Into<String>,
        owner_moltbot_id: &str,
        token: &str,
    ) -> Result<Self> {
        let relay_base_url = relay_base_url.into();
        let relay = RelayClient::new(relay_base_url.clone());
        let blob = relay
            .pairing_status(token)
            .await?
            .ok_or_else(|| MoltdmError::Keying("pairing token has no snapshot yet".to_string()))?;
        let snapshot = decode_snapshot(&blob)?;
        let identity = IdentityStore::from_paired_snapshot(owner_moltbot_id.to_string(), &snapshot);
        identity.save(store.as_ref())?;

        let mut sender = SenderChainManager::new(store.as_ref());
        for (conversation_id, initial_chain_key) in &snapshot.sender_keys {
            sender.install_from_snapshot(conversation_id, *initial_chain_key)?;
        }

        Ok(Self {
            identity,
            store,
            locks: ConversationLocks::new(),
            relay: RelayClient::new(relay_base_url),
        })
    }
}

fn encode_snapshot(snapshot: &DevicePairingSnapshot) -> Result<String> {
    let wire = PairingWire {
        identity_private: protocol::b64::encode(&snapshot.identity_private),
        signed_pre_key_private: protocol::b64::encode(&snapshot.signed_pre_key_private),
        sender_keys: snapshot
            .sender_keys
            .iter()
            .map(|(k, v)| (k.clone(), protocol::b64::encode(v)))
            .collect(),
    };
    serde_json::to_string(&wire).map_err(|e| MoltdmError::Validation(format!("pairing snapshot serialize: {e}")))
}

fn decode_snapshot(blob: &str) -> Result<DevicePairingSnapshot> {
    let wire: PairingWire = serde_json::from_str(blob).map_err(|e| MoltdmError::Validation(format!("pairing snapshot deserialize: {e}")))?;
    let identity_private: [u8; 32] = protocol::b64::decode(&wire.identity_private)?
        .try_into()
        .map_err(|_| MoltdmError::Validation("pairing snapshot identity_private malformed".to_string()))?;
    let signed_pre_key_private: [u8; 32] = protocol::b64::decode(&wire.signed_pre_key_private)?
        .try_into()
        .map_err(|_| MoltdmError::Validation("pairing snapshot signed_pre_key_private malformed".to_string()))?;
    let mut sender_keys = HashMap::new();
    for (k, v) in wire.sender_keys {
        let bytes: [u8; 32] = protocol::b64::decode(&v)?
            .try_into()
            .map_err(|_| MoltdmError::Validation("pairing snapshot sender key malformed".to_string()))?;
        sender_keys.insert(k, bytes);
    }
    Ok(DevicePairingSnapshot {
        identity_private,
        signed_pre_key_private,
        sender_keys,
    })
}

#[derive(serde::Serialize, serde::Deserialize)]
struct PairingWire {
    identity_private: String,
    signed_pre_key_private: String,
    sender_keys: HashMap<String, String>,
}
