//! C2 — Sender Chain Manager. §4.2.
//!
//! Owns the sending ratchet for every conversation this client sends into.
//! Send and rotate are the only mutating operations; both persist to the
//! [`BlobStore`] before the caller is allowed to release anything on the
//! wire (§4.2 step 5, §5 "Suspension points").

use rand_core::{OsRng, RngCore};
use std::collections::HashMap;

use crate::aead;
use crate::error::{MoltdmError, Result};
use crate::model::{ConversationId, SenderState};
use crate::ratchet::{message_key, next_chain_key};
use crate::storage::{sender_state_key, BlobStore};

/// A successfully encrypted outbound message, ready to be wrapped for
/// recipients (C4) and posted to the relay.
pub struct SendOutput {
    /// `nonce(12) ‖ ciphertext ‖ tag(16)`, not yet base64-encoded.
    pub ciphertext: Vec<u8>,
    pub sender_key_version: u64,
    pub message_index: u64,
    /// The chain key at `message_index == 0` for `sender_key_version`. The
    /// caller (C4) wraps this for every current recipient whenever a
    /// distribution needs attaching; it is not meaningful to send in the
    /// clear.
    pub initial_chain_key: [u8; 32],
}

pub struct SenderChainManager<'a> {
    store: &'a dyn BlobStore,
    states: HashMap<ConversationId, SenderState>,
}

impl<'a> SenderChainManager<'a> {
    pub fn new(store: &'a dyn BlobStore) -> Self {
        Self {
            store,
            states: HashMap::new(),
        }
    }

    /// Returns the current state for `conversation_id`, loading it from
    /// storage on first access within this process.
    fn state_mut(&mut self, conversation_id: &str) -> Result<&mut SenderState> {
        if !self.states.contains_key(conversation_id) {
            let loaded = self.load(conversation_id)?;
            let state = loaded.unwrap_or_else(|| fresh_state(conversation_id));
            self.states.insert(conversation_id.to_string(), state);
        }
        Ok(self.states.get_mut(conversation_id).unwrap())
    }

    fn load(&self, conversation_id: &str) -> Result<Option<SenderState>> {
        let Some(bytes) = self.store.get(&sender_state_key(conversation_id))? else {
            return Ok(None);
        };
        let state: SenderState = serde_json::from_slice(&bytes)
            .map_err(|e| MoltdmError::Validation(format!("sender state deserialize: {e}")))?;
        Ok(Some(state))
    }

    fn persist(&self, state: &SenderState) -> Result<()> {
        let bytes = serde_json::to_vec(state)
            .map_err(|e| MoltdmError::Validation(format!("sender state serialize: {e}")))?;
        self.store.set(&sender_state_key(&state.conversation_id), &bytes)
    }

    /// Encrypts `plaintext` for `conversation_id`, creating sender state
    /// lazily if none exists. Persists the post-ratchet state *before*
    /// returning, per §4.2 step 5.
    pub fn send(&mut self, conversation_id: &str, plaintext: &[u8]) -> Result<SendOutput> {
        let state = self.state_mut(conversation_id)?;

        let k = message_key(&state.chain_key);
        let used_index = state.message_index;
        let version = state.version;
        let initial_chain_key = state.initial_chain_key;

        let new_chain_key = next_chain_key(&state.chain_key);
        let new_index = state
            .message_index
            .checked_add(1)
            .ok_or_else(|| MoltdmError::Validation("message index overflow".to_string()))?;

        let ciphertext = aead::seal(&k, plaintext, b"")?;

        // Persist before mutating in-memory state and before the caller can
        // release anything on the wire: a crash between these two lines
        // must never leave the wire-releasable message unaccompanied by
        // durable state, or a retry would reuse (version, messageIndex).
        let mut next_state = state.clone();
        next_state.chain_key = new_chain_key;
        next_state.message_index = new_index;
        self.persist(&next_state)?;
        *state = next_state;

        Ok(SendOutput {
            ciphertext,
            sender_key_version: version,
            message_index: used_index,
            initial_chain_key,
        })
    }

    /// Rotates the chain for `conversation_id`: bumps `version`, draws a
    /// fresh `initial_chain_key`/`chain_key`, and resets `message_index` to
    /// zero. Triggered by membership changes per §4.6, not called directly
    /// by send.
    pub fn rotate(&mut self, conversation_id: &str) -> Result<()> {
        let state = self.state_mut(conversation_id)?;
        let new_version = state
            .version
            .checked_add(1)
            .ok_or_else(|| MoltdmError::Validation("sender key version overflow".to_string()))?;
        let fresh_key = random_chain_key();

        let mut next_state = state.clone();
        next_state.version = new_version;
        next_state.chain_key = fresh_key;
        next_state.initial_chain_key = fresh_key;
        next_state.message_index = 0;
        self.persist(&next_state)?;
        *state = next_state;
        Ok(())
    }

    /// Destroys local sender state for a conversation this client has left,
    /// per §4.6 "Self leaves".
    pub fn destroy(&mut self, conversation_id: &str) -> Result<()> {
        self.states.remove(conversation_id);
        self.store.delete(&sender_state_key(conversation_id))
    }

    /// Snapshot of the current `initial_chain_key` for a conversation, used
    /// only to seed a newly paired device (§4.6 "Device paired for self").
    pub fn initial_chain_key_snapshot(&mut self, conversation_id: &str) -> Result<[u8; 32]> {
        Ok(self.state_mut(conversation_id)?.initial_chain_key)
    }

    /// Seeds sender state for `conversation_id` from a device-pairing
    /// snapshot's `initial_chain_key`, starting at `messageIndex == 0`.
    /// `DevicePairingSnapshot` does not carry the originating device's
    /// `version` counter, so the paired device starts at version 1; if the
    /// original device had already rotated, the two devices will diverge on
    /// `sender_key_version` until the next rotation reconciles them.
    pub fn install_from_snapshot(&mut self, conversation_id: &str, initial_chain_key: [u8; 32]) -> Result<()> {
        let state = SenderState {
            conversation_id: conversation_id.to_string(),
            chain_key: initial_chain_key,
            initial_chain_key,
            version: 1,
            message_index: 0,
        };
        self.persist(&state)?;
        self.states.insert(conversation_id.to_string(), state);
        Ok(())
    }
}

fn fresh_state(conversation_id: &str) -> SenderState {
    let key = random_chain_key();
    SenderState {
        conversation_id: conversation_id.to_string(),
        chain_key: key,
        initial_chain_key: key,
        version: 1,
        message_index: 0,
    }
}

fn random_chain_key() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBlobStore;

    #[test]
    fn first_send_creates_state_at_version_one_index_zero() {
        let store = MemoryBlobStore::new();
        let mut mgr = SenderChainManager::new(&store);
        let out = mgr.send("convo-1", b"hello").unwrap();
        assert_eq!(out.sender_key_version, 1);
        assert_eq!(out.message_index, 0);
    }

    #[test]
    fn message_index_strictly_increases_across_sends() {
        let store = MemoryBlobStore::new();
        let mut mgr = SenderChainManager::new(&store);
        let a = mgr.send("convo-1", b"1").unwrap();
        let b = mgr.send("convo-1", b"2").unwrap();
        let c = mgr.send("convo-1", b"3").unwrap();
        assert_eq!([a.message_index, b.message_index, c.message_index], [0, 1, 2]);
        assert_eq!([a.sender_key_version, b.sender_key_version, c.sender_key_version], [1, 1, 1]);
    }

    #[test]
    fn rotate_bumps_version_and_resets_index() {
        let store = MemoryBlobStore::new();
        let mut mgr = SenderChainManager::new(&store);
        mgr.send("convo-1", b"before").unwrap();
        mgr.rotate("convo-1").unwrap();
        let out = mgr.send("convo-1", b"after").unwrap();
        assert_eq!(out.sender_key_version, 2);
        assert_eq!(out.message_index, 0);
    }

    #[test]
    fn state_survives_across_manager_instances_via_store() {
        let store = MemoryBlobStore::new();
        {
            let mut mgr = SenderChainManager::new(&store);
            mgr.send("convo-1", b"one").unwrap();
        }
        let mut mgr2 = SenderChainManager::new(&store);
        let out = mgr2.send("convo-1", b"two").unwrap();
        assert_eq!(out.message_index, 1);
    }

    #[test]
    fn destroy_removes_persisted_state() {
        let store = MemoryBlobStore::new();
        let mut mgr = SenderChainManager::new(&store);
        mgr.send("convo-1", b"one").unwrap();
        mgr.destroy("convo-1").unwrap();
        let mut mgr2 = SenderChainManager::new(&store);
        let out = mgr2.send("convo-1", b"two").unwrap();
        assert_eq!(out.message_index, 0);
        assert_eq!(out.sender_key_version, 1);
    }
}
