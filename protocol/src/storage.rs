//! Storage seam for the crypto core — §9 "Dynamic dispatch replacement".
//!
//! The source abstracted storage behind an interface with in-memory,
//! filesystem, and browser-local backends chosen at runtime. The crypto core
//! only ever needs `get`/`set`/`delete` over a string-keyed opaque byte blob,
//! so that is the whole trait; callers pick a concrete backend (an
//! in-memory map for tests, a file or sqlite table in `client`/`server`) at
//! construction time instead of behind a trait object chosen at runtime.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{MoltdmError, Result};

/// A string-keyed opaque blob store. Implementors need not be transactional
/// across keys; the crypto core only ever mutates one key per operation
/// (identity, one `SenderState`, or one `ReceivedKey`) and relies on its own
/// per-conversation locking (§5) for atomicity, not on the store.
pub trait BlobStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// A simple in-process store, used by tests and by short-lived agents that
/// do not need cross-restart persistence.
#[derive(Default)]
pub struct MemoryBlobStore {
    inner: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let guard = self
            .inner
            .lock()
            .map_err(|_| MoltdmError::Transport("blob store lock poisoned".to_string()))?;
        Ok(guard.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| MoltdmError::Transport("blob store lock poisoned".to_string()))?;
        guard.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| MoltdmError::Transport("blob store lock poisoned".to_string()))?;
        guard.remove(key);
        Ok(())
    }
}

/// Key under which a conversation's sender state is stored.
pub fn sender_state_key(conversation_id: &str) -> String {
    format!("sender_state:{conversation_id}")
}

/// Key under which a received sender chain is stored, keyed
/// `conversationId:fromId` as §6 specifies for client-side persistence.
pub fn received_key_key(conversation_id: &str, from_id: &str) -> String {
    format!("received_key:{conversation_id}:{from_id}")
}

pub const IDENTITY_KEY: &str = "identity";
