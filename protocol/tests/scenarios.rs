//! End-to-end scenarios S1-S6 from §8 of the design, each exercising the
//! public API the way a client agent would: generate identities, drive
//! sends/receives/rotations, and check the literal values the spec pins.

use ed25519_dalek::SigningKey;
use protocol::coordinator::{distribute_sender_key, receive_message};
use protocol::membership::{apply_membership_event, export_device_snapshot, MembershipEvent};
use protocol::model::Message;
use protocol::receiver_chain::ReceiverChainCache;
use protocol::sender_chain::SenderChainManager;
use protocol::storage::MemoryBlobStore;
use rand_core::OsRng;
use std::collections::HashMap;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

/// A toy "agent" used only by these scenario tests: an identity, a sender
/// chain store, and a receiver chain store, enough to send/receive within a
/// conversation without standing up a relay.
struct Agent {
    id: String,
    spk_secret: X25519StaticSecret,
    spk_public: [u8; 32],
    sender_store: MemoryBlobStore,
    receiver_store: MemoryBlobStore,
}

impl Agent {
    fn new(id: &str) -> Self {
        let spk_secret = X25519StaticSecret::random_from_rng(OsRng);
        let spk_public = X25519PublicKey::from(&spk_secret).to_bytes();
        Agent {
            id: id.to_string(),
            spk_secret,
            spk_public,
            sender_store: MemoryBlobStore::new(),
            receiver_store: MemoryBlobStore::new(),
        }
    }

    fn sender(&self) -> SenderChainManager<'_> {
        SenderChainManager::new(&self.sender_store)
    }

    fn receiver(&self) -> ReceiverChainCache<'_> {
        ReceiverChainCache::new(&self.receiver_store)
    }
}

fn wrap_for(recipients: &[&Agent], initial_chain_key: &[u8; 32]) -> HashMap<String, String> {
    let spks: HashMap<String, [u8; 32]> = recipients
        .iter()
        .map(|a| (a.id.clone(), a.spk_public))
        .collect();
    distribute_sender_key(&spks, initial_chain_key)
}

fn build_message(
    conversation_id: &str,
    from: &Agent,
    out: &protocol::sender_chain::SendOutput,
    wraps: HashMap<String, String>,
) -> Message {
    Message {
        id: format!("{}-{}", conversation_id, out.message_index),
        conversation_id: conversation_id.to_string(),
        from_id: from.id.clone(),
        created_at: 0,
        reply_to: None,
        expires_at: None,
        ciphertext: protocol::b64::encode(&out.ciphertext),
        sender_key_version: out.sender_key_version,
        message_index: out.message_index,
        encrypted_sender_keys: wraps,
    }
}

#[test]
fn s1_dm_round_trip() {
    let a = Agent::new("moltbot_a");
    let b = Agent::new("moltbot_b");
    let convo = "dm-ab";

    let mut a_sender = a.sender();
    let mut b_receiver = b.receiver();

    let out1 = a_sender.send(convo, b"Hello").unwrap();
    let wraps1 = wrap_for(&[&b], &out1.initial_chain_key);
    let m1 = build_message(convo, &a, &out1, wraps1);
    let plaintext1 = receive_message(&mut b_receiver, &b.spk_secret, &b.id, &m1).unwrap();
    assert_eq!(plaintext1, b"Hello");

    let out2 = a_sender.send(convo, b"World").unwrap();
    let wraps2 = wrap_for(&[&b], &out2.initial_chain_key);
    let m2 = build_message(convo, &a, &out2, wraps2);
    let plaintext2 = receive_message(&mut b_receiver, &b.spk_secret, &b.id, &m2).unwrap();
    assert_eq!(plaintext2, b"World");

    assert_eq!(
        b_receiver.current_version(convo, &a.id).unwrap(),
        Some(1)
    );
    // B's receiver is now positioned to expect index 2 next.
    let bad_replay = build_message(convo, &a, &out2, HashMap::new());
    assert!(receive_message(&mut b_receiver, &b.spk_secret, &b.id, &bad_replay).is_err());
}

#[test]
fn s2_ratchet_over_three_messages() {
    let a = Agent::new("moltbot_a");
    let b = Agent::new("moltbot_b");
    let convo = "dm-ab";

    let mut a_sender = a.sender();
    let mut b_receiver = b.receiver();

    let plaintexts = ["1", "2", "3"];
    let mut indices = Vec::new();
    for (i, pt) in plaintexts.iter().enumerate() {
        let out = a_sender.send(convo, pt.as_bytes()).unwrap();
        indices.push(out.message_index);
        let wraps = if i == 0 { wrap_for(&[&b], &out.initial_chain_key) } else { HashMap::new() };
        let m = build_message(convo, &a, &out, wraps);
        let decrypted = receive_message(&mut b_receiver, &b.spk_secret, &b.id, &m).unwrap();
        assert_eq!(decrypted, pt.as_bytes());
    }
    assert_eq!(indices, vec![0, 1, 2]);
}

#[test]
fn s3_late_joiner_cannot_decrypt_history() {
    let a = Agent::new("moltbot_a");
    let b = Agent::new("moltbot_b");
    let c = Agent::new("moltbot_c");
    let group = "group-abc";

    let mut a_sender = a.sender();
    let mut b_receiver = b.receiver();
    let mut c_receiver = c.receiver();

    // A sends "before" while the group is just {A, B}.
    let before = a_sender.send(group, b"before").unwrap();
    let before_wraps = wrap_for(&[&b], &before.initial_chain_key);
    let before_msg = build_message(group, &a, &before, before_wraps);
    assert_eq!(
        receive_message(&mut b_receiver, &b.spk_secret, &b.id, &before_msg).unwrap(),
        b"before"
    );

    // C joins - no immediate crypto action (§4.6 PeerAdded is a no-op).
    apply_membership_event(
        &mut a_sender,
        &protocol::membership::MembershipEvent::PeerAdded {
            conversation_id: group.to_string(),
            peer: c.id.clone(),
        },
    )
    .unwrap();

    // A sends "after"; now the member set includes C, so C gets a wrap too.
    let after = a_sender.send(group, b"after").unwrap();
    let after_wraps = wrap_for(&[&b, &c], &after.initial_chain_key);
    let after_msg = build_message(group, &a, &after, after_wraps);

    assert_eq!(
        receive_message(&mut b_receiver, &b.spk_secret, &b.id, &after_msg).unwrap(),
        b"after"
    );
    assert_eq!(
        receive_message(&mut c_receiver, &c.spk_secret, &c.id, &after_msg).unwrap(),
        b"after"
    );

    // C cannot decrypt "before": no receiver state, no distribution attached.
    let err = receive_message(&mut c_receiver, &c.spk_secret, &c.id, &before_msg);
    assert!(matches!(err, Err(protocol::MoltdmError::Keying(_))));
}

#[test]
fn s4_removal_triggers_rotation_excluding_departed_member() {
    let a = Agent::new("moltbot_a");
    let b = Agent::new("moltbot_b");
    let c = Agent::new("moltbot_c");
    let group = "group-abc";

    let mut a_sender = a.sender();

    let m1 = a_sender.send(group, b"m1").unwrap();
    assert_eq!(m1.sender_key_version, 1);
    assert_eq!(m1.message_index, 0);

    apply_membership_event(
        &mut a_sender,
        &MembershipEvent::PeerRemoved {
            conversation_id: group.to_string(),
            peer: c.id.clone(),
        },
    )
    .unwrap();

    let m2 = a_sender.send(group, b"m2").unwrap();
    assert_eq!(m2.sender_key_version, 2);
    assert_eq!(m2.message_index, 0);

    let m2_wraps = wrap_for(&[&b], &m2.initial_chain_key);
    assert!(m2_wraps.contains_key(&b.id));
    assert!(!m2_wraps.contains_key(&c.id));

    // C, still holding the version-1 key, cannot derive version-2 keys: its
    // receiver state (if any) would be stuck at version 1 and reject this
    // message at the version check before ever touching ciphertext.
    let mut c_receiver = c.receiver();
    c_receiver.install(group, &a.id, [0u8; 32], 1).unwrap();
    let m2_msg = build_message(group, &a, &m2, m2_wraps);
    assert!(receive_message(&mut c_receiver, &c.spk_secret, &c.id, &m2_msg).is_err());
}

#[test]
fn s5_signature_rejection_stale_timestamp_and_tampered_body() {
    use protocol::auth::{sign_request, verify_request};

    let key = SigningKey::generate(&mut OsRng);
    let now: i64 = 10_000_000;

    let stale = sign_request("moltbot_a", &key, now - 6 * 60 * 1000, "POST", "/api/conversations/c/messages", b"{}");
    let result = verify_request(
        &key.verifying_key(),
        stale.timestamp_millis,
        now,
        "POST",
        "/api/conversations/c/messages",
        b"{}",
        &stale.signature,
    );
    assert!(result.is_err(), "timestamp 6 minutes stale must be rejected");

    let signed = sign_request("moltbot_a", &key, now, "POST", "/api/conversations/c/messages", b"{\"a\":1}");
    let tampered_result = verify_request(
        &key.verifying_key(),
        signed.timestamp_millis,
        now,
        "POST",
        "/api/conversations/c/messages",
        b"{\"a\":2}",
        &signed.signature,
    );
    assert!(tampered_result.is_err(), "a flipped body byte must invalidate the signature");
}

#[test]
fn s6_device_pair_decrypts_and_signs_as_owner() {
    use protocol::identity::IdentityStore;

    let mut a_identity = IdentityStore::generate(0);
    a_identity.assign_id("moltbot_a".to_string());
    let b = Agent::new("moltbot_b");
    let group = "group-ab";

    let a_sender_store = MemoryBlobStore::new();
    let mut a_sender = SenderChainManager::new(&a_sender_store);
    a_sender.send(group, b"seed").unwrap();

    let snapshot = export_device_snapshot(&a_identity, &mut a_sender, &[group.to_string()]).unwrap();
    let paired_initial_key = *snapshot.sender_keys.get(group).expect("group key in snapshot");

    // B sends a message addressed to A, wrapped under A's real SPK.
    let mut b_sender = b.sender();
    let from_b = b_sender.send(group, b"hi A").unwrap();
    let mut a_spk_map = HashMap::new();
    a_spk_map.insert(a_identity.moltbot_id().to_string(), a_identity.published().signed_pre_key_public);
    let wraps_for_a = distribute_sender_key(&a_spk_map, &from_b.initial_chain_key);
    let msg_to_a = build_message(group, &b, &from_b, wraps_for_a);

    // D is a second device for A: it has A's identity/SPK privates (via the
    // pairing snapshot) and a fresh receiver store of its own.
    let d_receiver_store = MemoryBlobStore::new();
    let mut d_receiver = ReceiverChainCache::new(&d_receiver_store);
    let plaintext = receive_message(
        &mut d_receiver,
        &a_identity.spk_secret(),
        a_identity.moltbot_id(),
        &msg_to_a,
    )
    .unwrap();
    assert_eq!(plaintext, b"hi A");

    // D signs a request as A; it verifies under A's identity public key,
    // which is exactly what the pairing snapshot's `identity_private` lets a
    // paired device do (§9 Open Question 5).
    let a_signing_key = a_identity.signing_key();
    let signed = protocol::auth::sign_request(
        a_identity.moltbot_id(),
        &a_signing_key,
        1_000,
        "POST",
        "/api/conversations/group-ab/messages",
        b"{}",
    );
    protocol::auth::verify_request(
        &a_signing_key.verifying_key(),
        signed.timestamp_millis,
        1_000,
        "POST",
        "/api/conversations/group-ab/messages",
        b"{}",
        &signed.signature,
    )
    .unwrap();

    // The exported snapshot's sender key is the real conversation state, not
    // a placeholder: it matches what A's own sender chain holds.
    let mut a_sender_again = SenderChainManager::new(&a_sender_store);
    assert_eq!(
        paired_initial_key,
        a_sender_again.initial_chain_key_snapshot(group).unwrap()
    );
}
