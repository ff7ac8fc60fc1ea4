//! C1 — Identity Store. §4.1.
//!
//! Generates and persists the long-term Ed25519 identity key, the X25519
//! signed pre-key (SPK), and a pool of one-time pre-keys; produces the
//! public bundle a client registers with the relay.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

use crate::error::{MoltdmError, Result};
use crate::model::{Identity, MoltbotId, PublishedIdentity, SignedPreKeyPair, X25519KeyPair};
use crate::storage::{BlobStore, IDENTITY_KEY};

/// Default size of the one-time pre-key pool generated at registration.
pub const DEFAULT_ONE_TIME_PREKEYS: usize = 10;

/// Registration payload submitted to `POST /api/identity/register`.
pub struct RegistrationRequest {
    pub identity_public: [u8; 32],
    pub signed_pre_key_public: [u8; 32],
    pub pre_key_signature: Vec<u8>,
    pub one_time_pre_keys: Vec<[u8; 32]>,
}

/// Owns one client's identity material for the lifetime of the process.
pub struct IdentityStore {
    identity: Identity,
}

impl IdentityStore {
    /// Generates a fresh identity: an Ed25519 identity pair, an X25519 SPK
    /// pair signed by the identity key, and `one_time_pre_key_count`
    /// one-time pre-key pairs. `moltbot_id` is not yet assigned (the relay
    /// assigns it at registration); callers set it via [`Self::assign_id`]
    /// once the relay responds.
    pub fn generate(one_time_pre_key_count: usize) -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let spk_secret = X25519StaticSecret::random_from_rng(OsRng);
        let spk_public = X25519PublicKey::from(&spk_secret);
        let signature = signing_key.sign(spk_public.as_bytes());

        let one_time_pre_keys = (0..one_time_pre_key_count)
            .map(|_| {
                let secret = X25519StaticSecret::random_from_rng(OsRng);
                let public = X25519PublicKey::from(&secret);
                X25519KeyPair {
                    public: public.to_bytes(),
                    private: secret.to_bytes(),
                }
            })
            .collect();

        let identity = Identity {
            moltbot_id: String::new(),
            identity_public: signing_key.verifying_key().to_bytes(),
            identity_private: signing_key.to_bytes(),
            signed_pre_key: SignedPreKeyPair {
                public: spk_public.to_bytes(),
                private: spk_secret.to_bytes(),
                signature: signature.to_bytes().to_vec(),
            },
            one_time_pre_keys,
        };

        IdentityStore { identity }
    }

    pub fn assign_id(&mut self, moltbot_id: MoltbotId) {
        self.identity.moltbot_id = moltbot_id;
    }

    /// Reconstructs an identity from a device-pairing snapshot (§4.6
    /// "Device paired for self"): the owning `moltbot_id` travels alongside
    /// the snapshot out-of-band (the pairing handshake, not the snapshot
    /// itself), since the snapshot is deliberately blind to public
    /// identifiers. The paired device gets no one-time pre-keys of its own;
    /// it relies on the original device's published pool until it
    /// replenishes one itself.
    pub fn from_paired_snapshot(moltbot_id: MoltbotId, snapshot: &crate::membership::DevicePairingSnapshot) -> Self {
        let signing_key = SigningKey::from_bytes(&snapshot.identity_private);
        let spk_secret = X25519StaticSecret::from(snapshot.signed_pre_key_private);
        let spk_public = X25519PublicKey::from(&spk_secret);
        let signature = signing_key.sign(spk_public.as_bytes());

        let identity = Identity {
            moltbot_id,
            identity_public: signing_key.verifying_key().to_bytes(),
            identity_private: snapshot.identity_private,
            signed_pre_key: SignedPreKeyPair {
                public: spk_public.to_bytes(),
                private: snapshot.signed_pre_key_private,
                signature: signature.to_bytes().to_vec(),
            },
            one_time_pre_keys: Vec::new(),
        };
        IdentityStore { identity }
    }

    pub fn moltbot_id(&self) -> &str {
        &self.identity.moltbot_id
    }

    pub fn registration_request(&self) -> RegistrationRequest {
        RegistrationRequest {
            identity_public: self.identity.identity_public,
            signed_pre_key_public: self.identity.signed_pre_key.public,
            pre_key_signature: self.identity.signed_pre_key.signature.clone(),
            one_time_pre_keys: self
                .identity
                .one_time_pre_keys
                .iter()
                .map(|k| k.public)
                .collect(),
        }
    }

    pub fn published(&self) -> PublishedIdentity {
        PublishedIdentity {
            moltbot_id: self.identity.moltbot_id.clone(),
            identity_public: self.identity.identity_public,
            signed_pre_key_public: self.identity.signed_pre_key.public,
            pre_key_signature: self.identity.signed_pre_key.signature.clone(),
            one_time_pre_key_count: self.identity.one_time_pre_keys.len(),
        }
    }

    pub fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.identity.identity_private)
    }

    pub fn spk_secret(&self) -> X25519StaticSecret {
        X25519StaticSecret::from(self.identity.signed_pre_key.private)
    }

    /// Appends additional one-time pre-keys, for local bookkeeping that
    /// mirrors what a client uploads to the relay via replenishment.
    pub fn replenish_one_time_pre_keys(&mut self, count: usize) -> Vec<[u8; 32]> {
        let mut new_publics = Vec::with_capacity(count);
        for _ in 0..count {
            let secret = X25519StaticSecret::random_from_rng(OsRng);
            let public = X25519PublicKey::from(&secret);
            new_publics.push(public.to_bytes());
            self.identity.one_time_pre_keys.push(X25519KeyPair {
                public: public.to_bytes(),
                private: secret.to_bytes(),
            });
        }
        new_publics
    }

    /// Pops and returns one local one-time pre-key, if any remain. The
    /// returned key is removed atomically with respect to this store.
    pub fn consume_one_time_pre_key(&mut self) -> Option<X25519KeyPair> {
        self.identity.one_time_pre_keys.pop()
    }

    /// Persists the current identity to `store` under the well-known
    /// identity key.
    pub fn save(&self, store: &dyn BlobStore) -> Result<()> {
        let bytes = serde_json::to_vec(&self.identity)
            .map_err(|e| MoltdmError::Validation(format!("identity serialize: {e}")))?;
        store.set(IDENTITY_KEY, &bytes)
    }

    /// Loads a previously persisted identity. Rejects an identity lacking
    /// `signed_pre_key.private` (an identity created before SPK privates
    /// were stored, per §4.1) as loadable-but-useless: it cannot decrypt
    /// anything addressed to it.
    pub fn load(store: &dyn BlobStore) -> Result<Option<Self>> {
        let Some(bytes) = store.get(IDENTITY_KEY)? else {
            return Ok(None);
        };
        let identity: Identity = serde_json::from_slice(&bytes)
            .map_err(|e| MoltdmError::Validation(format!("identity deserialize: {e}")))?;
        if identity.signed_pre_key.private == [0u8; 32] {
            return Err(MoltdmError::Validation(
                "identity has no signed pre-key private half; non-decrypting".to_string(),
            ));
        }
        Ok(Some(IdentityStore { identity }))
    }
}

/// Verifies that a published identity's SPK signature was produced by its
/// own identity key, per §4.1/§6's "SPK signature: Ed25519 over the raw
/// 32-byte X25519 public bytes".
pub fn verify_published_identity(identity: &PublishedIdentity) -> Result<()> {
    let verifying_key = VerifyingKey::from_bytes(&identity.identity_public)
        .map_err(|_| MoltdmError::Validation("malformed identity public key".to_string()))?;
    let sig_bytes: [u8; 64] = identity
        .pre_key_signature
        .as_slice()
        .try_into()
        .map_err(|_| MoltdmError::Validation("malformed pre-key signature".to_string()))?;
    let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);
    verifying_key
        .verify(&identity.signed_pre_key_public, &signature)
        .map_err(|_| MoltdmError::Authentication("signed pre-key signature invalid".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBlobStore;

    #[test]
    fn generated_identity_has_default_pool_and_valid_spk_signature() {
        let mut store = IdentityStore::generate(DEFAULT_ONE_TIME_PREKEYS);
        store.assign_id("moltbot_abc123".to_string());
        assert_eq!(
            store.registration_request().one_time_pre_keys.len(),
            DEFAULT_ONE_TIME_PREKEYS
        );
        verify_published_identity(&store.published()).unwrap();
    }

    #[test]
    fn save_then_load_round_trips() {
        let mut store = IdentityStore::generate(2);
        store.assign_id("moltbot_xyz".to_string());
        let blobs = MemoryBlobStore::new();
        store.save(&blobs).unwrap();
        let loaded = IdentityStore::load(&blobs).unwrap().unwrap();
        assert_eq!(loaded.moltbot_id(), "moltbot_xyz");
    }

    #[test]
    fn identity_without_spk_private_is_rejected_at_load() {
        let mut store = IdentityStore::generate(0);
        store.assign_id("moltbot_broken".to_string());
        store.identity.signed_pre_key.private = [0u8; 32];
        let blobs = MemoryBlobStore::new();
        store.save(&blobs).unwrap();
        assert!(IdentityStore::load(&blobs).is_err());
    }

    #[test]
    fn consuming_one_time_prekey_removes_it() {
        let mut store = IdentityStore::generate(1);
        assert!(store.consume_one_time_pre_key().is_some());
        assert!(store.consume_one_time_pre_key().is_none());
    }
}
