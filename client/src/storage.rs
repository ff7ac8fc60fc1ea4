//! A file-backed [`protocol::storage::BlobStore`], the client-side
//! counterpart to the relay's sqlite persistence: one JSON file holding
//! every key this agent process owns (identity, sender states, received
//! keys), located via `directories` the same way the server locates its
//! sqlite file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use protocol::storage::BlobStore;
use protocol::{MoltdmError, Result};

pub struct FileBlobStore {
    path: PathBuf,
    inner: Mutex<HashMap<String, Vec<u8>>>,
}

impl FileBlobStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        let inner = if path.exists() {
            let bytes = std::fs::read(&path).map_err(|e| MoltdmError::Transport(format!("reading {}: {e}", path.display())))?;
            let encoded: HashMap<String, String> = serde_json::from_slice(&bytes)
                .map_err(|e| MoltdmError::Validation(format!("blob store deserialize: {e}")))?;
            encoded
                .into_iter()
                .map(|(k, v)| Ok((k, protocol::b64::decode(&v)?)))
                .collect::<Result<HashMap<_, _>>>()?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            inner: Mutex::new(inner),
        })
    }

    /// Default location: `<data dir>/moltdm/<name>.json`, following the
    /// server's `directories::BaseDirs` convention (§6 config ambient
    /// section), or `$MOLTDM_HOME/<name>.json` if set.
    pub fn default_path(name: &str) -> Result<PathBuf> {
        let mut dir = if let Ok(home) = std::env::var("MOLTDM_HOME") {
            PathBuf::from(home)
        } else {
            let dirs = directories::BaseDirs::new()
                .ok_or_else(|| MoltdmError::Transport("could not resolve home directory".to_string()))?;
            let mut buf = PathBuf::from(dirs.data_dir());
            buf.push("moltdm");
            buf
        };
        std::fs::create_dir_all(&dir).map_err(|e| MoltdmError::Transport(format!("creating {}: {e}", dir.display())))?;
        dir.push(format!("{name}.json"));
        Ok(dir)
    }

    fn flush(&self, guard: &HashMap<String, Vec<u8>>) -> Result<()> {
        let encoded: HashMap<String, String> = guard.iter().map(|(k, v)| (k.clone(), protocol::b64::encode(v))).collect();
        let bytes = serde_json::to_vec(&encoded).map_err(|e| MoltdmError::Validation(format!("blob store serialize: {e}")))?;
        write_atomic(&self.path, &bytes)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes).map_err(|e| MoltdmError::Transport(format!("writing {}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path).map_err(|e| MoltdmError::Transport(format!("renaming into {}: {e}", path.display())))?;
    Ok(())
}

impl BlobStore for FileBlobStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let guard = self.inner.lock().map_err(|_| MoltdmError::Transport("blob store lock poisoned".to_string()))?;
        Ok(guard.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut guard = self.inner.lock().map_err(|_| MoltdmError::Transport("blob store lock poisoned".to_string()))?;
        guard.insert(key.to_string(), value.to_vec());
        self.flush(&guard)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut guard = self.inner.lock().map_err(|_| MoltdmError::Transport("blob store lock poisoned".to_string()))?;
        guard.remove(key);
        self.flush(&guard)
    }
}
