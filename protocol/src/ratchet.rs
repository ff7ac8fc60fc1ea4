//! The sender-key ratchet: two one-way HMAC-SHA256 derivations over a 32-byte
//! chain key. Shared by the Sender Chain Manager (C2) and Receiver Chain
//! Cache (C3) so both sides of a conversation agree on the same function.
//!
//! The single-byte labels are fixed by §4.2 and MUST NOT change: any
//! deviation breaks interop with every other implementation of this wire
//! format.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const MESSAGE_KEY_LABEL: [u8; 1] = [0x01];
const CHAIN_KEY_LABEL: [u8; 1] = [0x02];

/// `messageKey(chainKey) = HMAC(chainKey, 0x01)`.
pub fn message_key(chain_key: &[u8; 32]) -> [u8; 32] {
    hmac_once(chain_key, &MESSAGE_KEY_LABEL)
}

/// `nextChainKey(chainKey) = HMAC(chainKey, 0x02)`.
pub fn next_chain_key(chain_key: &[u8; 32]) -> [u8; 32] {
    hmac_once(chain_key, &CHAIN_KEY_LABEL)
}

fn hmac_once(key: &[u8; 32], label: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(label);
    let out = mac.finalize().into_bytes();
    out.into()
}

/// Advances `chain_key` past `skip` intermediate indices (discarding their
/// message keys, per the minimal §4.3 receiver), derives the message key for
/// the index that chain key now sits at, and returns that message key
/// alongside the chain key for the *next* index.
///
/// `skip = 0` reproduces the single-step §4.3 "target == messageIndex" case;
/// `skip > 0` reproduces the "target > messageIndex" reordered-delivery case.
pub fn derive_at_offset(chain_key: [u8; 32], skip: u64) -> ([u8; 32], [u8; 32]) {
    let mut ck = chain_key;
    for _ in 0..skip {
        ck = next_chain_key(&ck);
    }
    let k = message_key(&ck);
    let next = next_chain_key(&ck);
    (k, next)
}

/// Like [`derive_at_offset`], but also returns the message key for every
/// index skipped over along the way (as `(index, key)` pairs, in order),
/// for callers that want to cache them instead of discarding them — the
/// "conforming advanced implementation" §4.3 allows for.
pub fn derive_range(chain_key: [u8; 32], start_index: u64, skip: u64) -> (Vec<(u64, [u8; 32])>, [u8; 32]) {
    let mut ck = chain_key;
    let mut out = Vec::with_capacity((skip + 1) as usize);
    for i in 0..=skip {
        let k = message_key(&ck);
        out.push((start_index + i, k));
        ck = next_chain_key(&ck);
    }
    (out, ck)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivations_are_deterministic_and_distinct() {
        let k = [7u8; 32];
        let mk1 = message_key(&k);
        let mk2 = message_key(&k);
        let nk = next_chain_key(&k);
        assert_eq!(mk1, mk2);
        assert_ne!(mk1, nk);
        assert_ne!(mk1, k);
        assert_ne!(nk, k);
    }

    #[test]
    fn different_chain_keys_diverge() {
        let a = message_key(&[1u8; 32]);
        let b = message_key(&[2u8; 32]);
        assert_ne!(a, b);
    }
}
