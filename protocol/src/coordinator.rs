//! Ties C3 (Receiver Chain Cache) and C4 (Sender Key Distributor) together
//! into the single entry point a client calls on message receipt, so
//! neither component needs to know about the other's job — §4.3 step 2
//! describes exactly this hand-off.

use std::collections::HashMap;

use crate::distribution;
use crate::error::{MoltdmError, Result};
use crate::model::Message;
use crate::receiver_chain::ReceiverChainCache;
use x25519_dalek::StaticSecret as X25519StaticSecret;

/// Decrypts an inbound message, unwrapping and installing its attached
/// sender-key distribution first if one is present and needed (§4.3 step 2)
/// before decrypting the ciphertext (§4.3 steps 3-6).
///
/// `own_spk_secret` is this client's signed pre-key private half, used only
/// if a distribution addressed to `self_id` is attached.
pub fn receive_message(
    receiver_chain: &mut ReceiverChainCache<'_>,
    own_spk_secret: &X25519StaticSecret,
    self_id: &str,
    message: &Message,
) -> Result<Vec<u8>> {
    if let Some(wrapped_b64) = message.encrypted_sender_keys.get(self_id) {
        let current_version = receiver_chain.current_version(&message.conversation_id, &message.from_id)?;
        let needs_unwrap = current_version != Some(message.sender_key_version);
        if needs_unwrap {
            match unwrap_for_self(own_spk_secret, wrapped_b64) {
                Ok(initial_chain_key) => {
                    receiver_chain.install(
                        &message.conversation_id,
                        &message.from_id,
                        initial_chain_key,
                        message.sender_key_version,
                    )?;
                }
                Err(e) => {
                    tracing::debug!(
                        conversation_id = %message.conversation_id,
                        from_id = %message.from_id,
                        "failed to unwrap attached sender key: {e}"
                    );
                    // Per §4.3 step 2b: abort with a keying error, do not
                    // delete any existing receiver state.
                    return Err(MoltdmError::Keying(format!(
                        "could not unwrap distributed sender key: {e}"
                    )));
                }
            }
        }
    }

    receiver_chain.decrypt(message)
}

fn unwrap_for_self(own_spk_secret: &X25519StaticSecret, wrapped_b64: &str) -> Result<[u8; 32]> {
    let wrapped = crate::b64::decode(wrapped_b64)?;
    distribution::unwrap(own_spk_secret, &wrapped)
}

/// Wraps a conversation's `initial_chain_key` for every member currently
/// resolvable in `recipient_spks` (moltbotId -> SPK public bytes), skipping
/// (at debug level) any recipient whose SPK could not be fetched — §4.4
/// step 1, "recoverable on next send". Returns the base64-encoded map ready
/// to go on a [`Message::encrypted_sender_keys`].
pub fn distribute_sender_key(
    recipient_spks: &HashMap<String, [u8; 32]>,
    initial_chain_key: &[u8; 32],
) -> HashMap<String, String> {
    let mut out = HashMap::with_capacity(recipient_spks.len());
    for (recipient_id, spk_public) in recipient_spks {
        match distribution::wrap(spk_public, initial_chain_key) {
            Ok(blob) => {
                out.insert(recipient_id.clone(), crate::b64::encode(&blob));
            }
            Err(e) => {
                tracing::debug!(recipient = %recipient_id, "failed to wrap sender key: {e}");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender_chain::SenderChainManager;
    use crate::storage::MemoryBlobStore;
    use rand_core::OsRng;
    use std::collections::HashMap as StdHashMap;
    use x25519_dalek::PublicKey as X25519PublicKey;

    #[test]
    fn end_to_end_distribute_then_receive() {
        let sender_store = MemoryBlobStore::new();
        let mut sender = SenderChainManager::new(&sender_store);
        let out = sender.send("g", b"hello group").unwrap();

        let bob_spk_secret = X25519StaticSecret::random_from_rng(OsRng);
        let bob_spk_public = X25519PublicKey::from(&bob_spk_secret);

        let mut recipient_spks = StdHashMap::new();
        recipient_spks.insert("bob".to_string(), bob_spk_public.to_bytes());
        let wraps = distribute_sender_key(&recipient_spks, &out.initial_chain_key);
        assert!(wraps.contains_key("bob"));

        let message = Message {
            id: "m1".to_string(),
            conversation_id: "g".to_string(),
            from_id: "alice".to_string(),
            created_at: 0,
            reply_to: None,
            expires_at: None,
            ciphertext: crate::b64::encode(&out.ciphertext),
            sender_key_version: out.sender_key_version,
            message_index: out.message_index,
            encrypted_sender_keys: wraps,
        };

        let bob_store = MemoryBlobStore::new();
        let mut bob_receiver = ReceiverChainCache::new(&bob_store);
        let plaintext = receive_message(&mut bob_receiver, &bob_spk_secret, "bob", &message).unwrap();
        assert_eq!(plaintext, b"hello group");
    }

    #[test]
    fn recipient_without_fetchable_spk_is_skipped_not_fatal() {
        let recipient_spks: StdHashMap<String, [u8; 32]> = StdHashMap::new();
        let wraps = distribute_sender_key(&recipient_spks, &[1u8; 32]);
        assert!(wraps.is_empty());
    }
}
