//! C3 — Receiver Chain Cache. §4.3.
//!
//! Tracks, per `(conversationId, senderId)`, the receiving side of that
//! sender's ratchet. Installing a freshly unwrapped key (C4's job) and
//! decrypting a message (this module's job) are split so this module never
//! needs to know how a chain key was unwrapped.

use std::collections::{HashMap, VecDeque};

use crate::aead;
use crate::error::{MoltdmError, Result};
use crate::model::{ConversationId, Message, MoltbotId, ReceivedKey};
use crate::ratchet::{derive_at_offset, derive_range};
use crate::storage::{received_key_key, BlobStore};

type Key = (ConversationId, MoltbotId);
type SkippedId = (ConversationId, MoltbotId, u64, u64);

/// Bounded, in-memory-only cache of message keys skipped over by a
/// reordered delivery (§4.3 step 4, §9 Open Question 1). Not persisted:
/// losing it across a restart only means a delayed message that was
/// already skippable becomes unrecoverable again, which is exactly the
/// minimal implementation's existing behavior.
struct SkippedKeyCache {
    capacity: usize,
    order: VecDeque<SkippedId>,
    keys: HashMap<SkippedId, [u8; 32]>,
}

impl SkippedKeyCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            keys: HashMap::new(),
        }
    }

    fn insert(&mut self, id: SkippedId, key: [u8; 32]) {
        if !self.keys.contains_key(&id) && self.keys.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
        self.order.push_back(id.clone());
        self.keys.insert(id, key);
    }

    fn take(&mut self, id: &SkippedId) -> Option<[u8; 32]> {
        let key = self.keys.remove(id);
        if key.is_some() {
            self.order.retain(|x| x != id);
        }
        key
    }
}

pub struct ReceiverChainCache<'a> {
    store: &'a dyn BlobStore,
    states: HashMap<Key, Option<ReceivedKey>>,
    skipped: Option<SkippedKeyCache>,
}

impl<'a> ReceiverChainCache<'a> {
    pub fn new(store: &'a dyn BlobStore) -> Self {
        Self {
            store,
            states: HashMap::new(),
            skipped: None,
        }
    }

    /// Opts into caching message keys skipped over by reordered delivery
    /// (bounded to `capacity` entries), so a delayed earlier message can
    /// still be decrypted after a later one arrived first. Off by default,
    /// per the decision recorded in DESIGN.md for Open Question 1.
    pub fn with_skipped_key_cache(store: &'a dyn BlobStore, capacity: usize) -> Self {
        Self {
            store,
            states: HashMap::new(),
            skipped: Some(SkippedKeyCache::new(capacity)),
        }
    }

    fn load(&self, conversation_id: &str, sender_id: &str) -> Result<Option<ReceivedKey>> {
        let Some(bytes) = self
            .store
            .get(&received_key_key(conversation_id, sender_id))?
        else {
            return Ok(None);
        };
        let rk: ReceivedKey = serde_json::from_slice(&bytes)
            .map_err(|e| MoltdmError::Validation(format!("received key deserialize: {e}")))?;
        Ok(Some(rk))
    }

    fn get(&mut self, conversation_id: &str, sender_id: &str) -> Result<Option<ReceivedKey>> {
        let key = (conversation_id.to_string(), sender_id.to_string());
        if !self.states.contains_key(&key) {
            let loaded = self.load(conversation_id, sender_id)?;
            self.states.insert(key.clone(), loaded);
        }
        Ok(self.states.get(&key).unwrap().clone())
    }

    fn persist(&mut self, rk: ReceivedKey) -> Result<()> {
        let key = (rk.conversation_id.clone(), rk.sender_id.clone());
        let bytes = serde_json::to_vec(&rk)
            .map_err(|e| MoltdmError::Validation(format!("received key serialize: {e}")))?;
        self.store
            .set(&received_key_key(&rk.conversation_id, &rk.sender_id), &bytes)?;
        self.states.insert(key, Some(rk));
        Ok(())
    }

    /// The `version` currently held for `(conversation_id, sender_id)`, if
    /// any. Callers use this to decide whether a message's attached
    /// distribution needs unwrapping (§4.3 step 2's staleness check) before
    /// calling [`Self::install`].
    pub fn current_version(&mut self, conversation_id: &str, sender_id: &str) -> Result<Option<u64>> {
        Ok(self.get(conversation_id, sender_id)?.map(|rk| rk.version))
    }

    /// Installs a freshly unwrapped `initial_chain_key` as the receiving
    /// state for `(conversation_id, sender_id)` at `version`, starting at
    /// `messageIndex = 0`. Replaces (does not merge with) any prior state
    /// for that sender, per §3.
    pub fn install(
        &mut self,
        conversation_id: &str,
        sender_id: &str,
        initial_chain_key: [u8; 32],
        version: u64,
    ) -> Result<()> {
        self.persist(ReceivedKey {
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            chain_key: initial_chain_key,
            version,
            message_index: 0,
        })
    }

    /// Decrypts `message`, advancing the receiving ratchet as needed. The
    /// caller must have already called [`Self::install`] if the message
    /// carried a distribution this client needed (§4.3 step 2); this method
    /// only implements steps 3-6.
    pub fn decrypt(&mut self, message: &Message) -> Result<Vec<u8>> {
        let Some(rk) = self.get(&message.conversation_id, &message.from_id)? else {
            return Err(MoltdmError::Keying(format!(
                "no chain key for sender {} in conversation {}",
                message.from_id, message.conversation_id
            )));
        };

        if rk.version != message.sender_key_version {
            return Err(MoltdmError::Keying(format!(
                "have chain key for version {}, message is version {}",
                rk.version, message.sender_key_version
            )));
        }

        let target = message.message_index;
        let sealed = crate::b64::decode(&message.ciphertext)?;

        if target < rk.message_index {
            let id = (
                message.conversation_id.clone(),
                message.from_id.clone(),
                rk.version,
                target,
            );
            let cached_key = self.skipped.as_mut().and_then(|c| c.take(&id));
            return match cached_key {
                Some(k) => Ok(aead::open(&k, &sealed, b"")?),
                None => Err(MoltdmError::ProtocolBreaking(format!(
                    "message index {target} is before the next expected index {}",
                    rk.message_index
                ))),
            };
        }

        let skip = target - rk.message_index;

        let (k, chain_key_after) = if self.skipped.is_some() {
            let (derived, chain_after) = derive_range(rk.chain_key, rk.message_index, skip);
            let (skipped_keys, target_key) = derived.split_at(derived.len() - 1);
            let target_key = target_key[0].1;
            if let Some(cache) = self.skipped.as_mut() {
                for (idx, key) in skipped_keys {
                    cache.insert(
                        (
                            message.conversation_id.clone(),
                            message.from_id.clone(),
                            rk.version,
                            *idx,
                        ),
                        *key,
                    );
                }
            }
            (target_key, chain_after)
        } else {
            derive_at_offset(rk.chain_key, skip)
        };

        // A tag failure here is an active-attack signal (§7): we must not
        // persist any ratchet advance past it.
        let plaintext = aead::open(&k, &sealed, b"")?;

        self.persist(ReceivedKey {
            conversation_id: message.conversation_id.clone(),
            sender_id: message.from_id.clone(),
            chain_key: chain_key_after,
            version: rk.version,
            message_index: target + 1,
        })?;

        Ok(plaintext)
    }

    /// Destroys receiving state for a sender within a conversation (used
    /// when a conversation is destroyed; §3 "Lifecycles").
    pub fn destroy(&mut self, conversation_id: &str, sender_id: &str) -> Result<()> {
        let key = (conversation_id.to_string(), sender_id.to_string());
        self.states.remove(&key);
        self.store
            .delete(&received_key_key(conversation_id, sender_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Message;
    use crate::sender_chain::SenderChainManager;
    use crate::storage::MemoryBlobStore;
    use std::collections::HashMap as StdHashMap;

    fn msg(conversation_id: &str, from_id: &str, version: u64, index: u64, ciphertext: Vec<u8>) -> Message {
        Message {
            id: format!("m{index}"),
            conversation_id: conversation_id.to_string(),
            from_id: from_id.to_string(),
            created_at: 0,
            reply_to: None,
            expires_at: None,
            ciphertext: crate::b64::encode(&ciphertext),
            sender_key_version: version,
            message_index: index,
            encrypted_sender_keys: StdHashMap::new(),
        }
    }

    #[test]
    fn round_trip_in_order() {
        let sender_store = MemoryBlobStore::new();
        let mut sender = SenderChainManager::new(&sender_store);

        let receiver_store = MemoryBlobStore::new();
        let mut receiver = ReceiverChainCache::new(&receiver_store);

        let o1 = sender.send("convo", b"Hello").unwrap();
        receiver
            .install("convo", "alice", o1.initial_chain_key, o1.sender_key_version)
            .unwrap();
        let m1 = msg("convo", "alice", o1.sender_key_version, o1.message_index, o1.ciphertext);
        assert_eq!(receiver.decrypt(&m1).unwrap(), b"Hello");

        let o2 = sender.send("convo", b"World").unwrap();
        let m2 = msg("convo", "alice", o2.sender_key_version, o2.message_index, o2.ciphertext);
        assert_eq!(receiver.decrypt(&m2).unwrap(), b"World");

        assert_eq!(
            receiver.current_version("convo", "alice").unwrap(),
            Some(1)
        );
    }

    #[test]
    fn reordered_delivery_skips_ahead() {
        let sender_store = MemoryBlobStore::new();
        let mut sender = SenderChainManager::new(&sender_store);
        let receiver_store = MemoryBlobStore::new();
        let mut receiver = ReceiverChainCache::new(&receiver_store);

        let o0 = sender.send("convo", b"0").unwrap();
        let o1 = sender.send("convo", b"1").unwrap();
        let o2 = sender.send("convo", b"2").unwrap();

        receiver
            .install("convo", "alice", o0.initial_chain_key, o0.sender_key_version)
            .unwrap();

        // index 2 arrives before index 0 and 1.
        let m2 = msg("convo", "alice", o2.sender_key_version, o2.message_index, o2.ciphertext);
        assert_eq!(receiver.decrypt(&m2).unwrap(), b"2");

        // index 0 and 1 are now in the past and cannot be decrypted by the
        // minimal implementation.
        let m0 = msg("convo", "alice", o0.sender_key_version, o0.message_index, o0.ciphertext);
        assert!(matches!(receiver.decrypt(&m0), Err(MoltdmError::ProtocolBreaking(_))));
        let m1 = msg("convo", "alice", o1.sender_key_version, o1.message_index, o1.ciphertext);
        assert!(matches!(receiver.decrypt(&m1), Err(MoltdmError::ProtocolBreaking(_))));
    }

    #[test]
    fn missing_chain_key_is_keying_error() {
        let receiver_store = MemoryBlobStore::new();
        let mut receiver = ReceiverChainCache::new(&receiver_store);
        let m = msg("convo", "alice", 1, 0, vec![0u8; 28]);
        assert!(matches!(receiver.decrypt(&m), Err(MoltdmError::Keying(_))));
    }

    #[test]
    fn tampered_ciphertext_does_not_advance_ratchet() {
        let sender_store = MemoryBlobStore::new();
        let mut sender = SenderChainManager::new(&sender_store);
        let receiver_store = MemoryBlobStore::new();
        let mut receiver = ReceiverChainCache::new(&receiver_store);

        let o1 = sender.send("convo", b"Hello").unwrap();
        receiver
            .install("convo", "alice", o1.initial_chain_key, o1.sender_key_version)
            .unwrap();

        let mut tampered = o1.ciphertext.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0xFF;
        let bad = msg("convo", "alice", o1.sender_key_version, o1.message_index, tampered);
        assert!(matches!(receiver.decrypt(&bad), Err(MoltdmError::CryptoIntegrity(_))));

        // The real message at the same index must still decrypt: the
        // failed attempt must not have advanced state.
        let good = msg("convo", "alice", o1.sender_key_version, o1.message_index, o1.ciphertext);
        assert_eq!(receiver.decrypt(&good).unwrap(), b"Hello");
    }

    #[test]
    fn skipped_key_cache_recovers_a_delayed_earlier_message() {
        let sender_store = MemoryBlobStore::new();
        let mut sender = SenderChainManager::new(&sender_store);
        let receiver_store = MemoryBlobStore::new();
        let mut receiver = ReceiverChainCache::with_skipped_key_cache(&receiver_store, 16);

        let o0 = sender.send("convo", b"0").unwrap();
        let o1 = sender.send("convo", b"1").unwrap();
        let o2 = sender.send("convo", b"2").unwrap();

        receiver
            .install("convo", "alice", o0.initial_chain_key, o0.sender_key_version)
            .unwrap();

        let m2 = msg("convo", "alice", o2.sender_key_version, o2.message_index, o2.ciphertext);
        assert_eq!(receiver.decrypt(&m2).unwrap(), b"2");

        // 0 and 1 were skipped over, but the cache kept their message keys.
        let m0 = msg("convo", "alice", o0.sender_key_version, o0.message_index, o0.ciphertext);
        assert_eq!(receiver.decrypt(&m0).unwrap(), b"0");
        let m1 = msg("convo", "alice", o1.sender_key_version, o1.message_index, o1.ciphertext);
        assert_eq!(receiver.decrypt(&m1).unwrap(), b"1");

        // A skipped key is consumed at most once.
        assert!(matches!(receiver.decrypt(&m0), Err(MoltdmError::ProtocolBreaking(_))));
    }
}
