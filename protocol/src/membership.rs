//! §4.6 Membership triggers, and the per-conversation locking §5 requires.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex as AsyncMutex;

use crate::error::Result;
use crate::identity::IdentityStore;
use crate::model::{ConversationId, MoltbotId};
use crate::sender_chain::SenderChainManager;

/// The membership-change events the crypto core reacts to, per §4.6. Every
/// other conversation event (renames, admin changes, reactions, ...) is the
/// relay's concern and never reaches this enum.
#[derive(Debug, Clone)]
pub enum MembershipEvent {
    /// This client created, was added to, or joined-via-invite a
    /// conversation it did not previously participate in.
    SelfJoined { conversation_id: ConversationId },
    /// Another member was added. Decryptable to them from the next send
    /// onward; historical messages remain undecryptable to them by design.
    PeerAdded {
        conversation_id: ConversationId,
        peer: MoltbotId,
    },
    /// Another member was removed or left.
    PeerRemoved {
        conversation_id: ConversationId,
        peer: MoltbotId,
    },
    /// This client left the conversation.
    SelfLeft { conversation_id: ConversationId },
}

/// Applies a membership event to local crypto state. The only mutating
/// reaction defined by §4.6 is rotation on peer departure and destruction of
/// sender state on self-departure; everything else is a deliberate no-op
/// (documented inline) so the next `send` picks up the new member set.
pub fn apply_membership_event<'a>(
    sender_chain: &mut SenderChainManager<'a>,
    event: &MembershipEvent,
) -> Result<()> {
    match event {
        MembershipEvent::SelfJoined { .. } => {
            // Create or retain no sender state; wait for others' wraps.
        }
        MembershipEvent::PeerAdded { .. } => {
            // No immediate action. The next send includes a wrap for the
            // new peer (§4.6); ratchet-on-add is intentionally not done
            // (§9 Open Question 2).
        }
        MembershipEvent::PeerRemoved { conversation_id, .. } => {
            sender_chain.rotate(conversation_id)?;
        }
        MembershipEvent::SelfLeft { conversation_id } => {
            sender_chain.destroy(conversation_id)?;
        }
    }
    Ok(())
}

/// A device-pairing export: the minimum a newly linked device needs to
/// decrypt incoming wraps and take over sending with the correct version
/// (§4.6 "Device paired for self", scenario S6).
///
/// Sharing `identity_private` lets the paired device sign requests as the
/// owner. That is intentional (§9 Open Question 5) and is a trust boundary
/// worth calling out to anyone wiring up pairing UX: a compromised paired
/// device is indistinguishable from the original to the relay.
pub struct DevicePairingSnapshot {
    pub identity_private: [u8; 32],
    pub signed_pre_key_private: [u8; 32],
    /// conversationId -> this client's current `initialChainKey` for that
    /// conversation's current version.
    pub sender_keys: HashMap<ConversationId, [u8; 32]>,
}

/// Builds the snapshot handed to a newly paired device.
pub fn export_device_snapshot<'a>(
    identity: &IdentityStore,
    sender_chain: &mut SenderChainManager<'a>,
    conversation_ids: &[ConversationId],
) -> Result<DevicePairingSnapshot> {
    let signing_key = identity.signing_key();
    let spk_secret = identity.spk_secret();

    let mut sender_keys = HashMap::new();
    for conversation_id in conversation_ids {
        let key = sender_chain.initial_chain_key_snapshot(conversation_id)?;
        sender_keys.insert(conversation_id.clone(), key);
    }

    Ok(DevicePairingSnapshot {
        identity_private: signing_key.to_bytes(),
        signed_pre_key_private: spk_secret.to_bytes(),
        sender_keys,
    })
}

/// Per-conversation mutual exclusion for the operations that mutate ratchet
/// state (send, receive, rotate) — §5: "two concurrent sends on the same
/// conversation would burn the same `(version, messageIndex)` pair, causing
/// a catastrophic AES-GCM nonce+key collision". A single process-wide lock
/// would also satisfy §5 ("acceptable but unnecessary"); this gives
/// independent conversations independent concurrency instead.
#[derive(Default)]
pub struct ConversationLocks {
    locks: StdMutex<HashMap<ConversationId, Arc<AsyncMutex<()>>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, conversation_id: &str) -> Arc<AsyncMutex<()>> {
        let mut guard = self.locks.lock().expect("conversation lock map poisoned");
        guard
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBlobStore;

    #[test]
    fn peer_removed_rotates_excluding_nobody_explicitly() {
        let store = MemoryBlobStore::new();
        let mut sender = SenderChainManager::new(&store);
        sender.send("g", b"m1").unwrap();

        apply_membership_event(
            &mut sender,
            &MembershipEvent::PeerRemoved {
                conversation_id: "g".to_string(),
                peer: "carol".to_string(),
            },
        )
        .unwrap();

        let out = sender.send("g", b"m2").unwrap();
        assert_eq!(out.sender_key_version, 2);
        assert_eq!(out.message_index, 0);
    }

    #[test]
    fn peer_added_does_not_rotate() {
        let store = MemoryBlobStore::new();
        let mut sender = SenderChainManager::new(&store);
        sender.send("g", b"m1").unwrap();

        apply_membership_event(
            &mut sender,
            &MembershipEvent::PeerAdded {
                conversation_id: "g".to_string(),
                peer: "carol".to_string(),
            },
        )
        .unwrap();

        let out = sender.send("g", b"m2").unwrap();
        assert_eq!(out.sender_key_version, 1);
        assert_eq!(out.message_index, 1);
    }

    #[test]
    fn self_left_destroys_sender_state() {
        let store = MemoryBlobStore::new();
        let mut sender = SenderChainManager::new(&store);
        sender.send("g", b"m1").unwrap();

        apply_membership_event(&mut sender, &MembershipEvent::SelfLeft { conversation_id: "g".to_string() }).unwrap();

        let out = sender.send("g", b"m2").unwrap();
        assert_eq!(out.sender_key_version, 1);
        assert_eq!(out.message_index, 0);
    }

    #[tokio::test]
    async fn lock_for_returns_same_mutex_for_same_conversation() {
        let locks = ConversationLocks::new();
        let a = locks.lock_for("g");
        let b = locks.lock_for("g");
        assert!(Arc::ptr_eq(&a, &b));
        let _guard = a.lock().await;
    }
}
