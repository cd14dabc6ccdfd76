//! Credential store: the flat JSON file holding long-lived tokens and channel identifiers.
//!
//! Every save merges the patch into the file's current contents, so keys written by
//! other code paths (or other processes) survive. Writes are serialized by an async
//! mutex in-process and by an exclusive lock on `<file>.lock` across processes, and
//! replace the file atomically via a temp file + rename.

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("credential store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("credential store is not a JSON object: {0}")]
    Json(#[from] serde_json::Error),
    #[error("credential store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Typed view of the stored record. `None` fields are left untouched when used as a patch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Access token expiry, unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    /// Kommo account amojo id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    /// Chats API scope id returned by channel connect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,
}

impl Credentials {
    fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    fn from_map(map: &Map<String, Value>) -> Self {
        serde_json::from_value(Value::Object(map.clone())).unwrap_or_else(|e| {
            log::warn!("credential store: ignoring malformed fields: {}", e);
            Self::default()
        })
    }
}

/// File-backed credential store with an in-memory mirror.
pub struct CredentialStore {
    path: PathBuf,
    current: Mutex<Map<String, Value>>,
}

impl CredentialStore {
    /// Load the store from `path`. A missing file starts empty; an unparsable one is an error
    /// so that a later save never clobbers tokens we failed to read.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let map = match tokio::fs::read_to_string(&path).await {
            Ok(s) if s.trim().is_empty() => Map::new(),
            Ok(s) => serde_json::from_str(&s)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(e.into()),
        };
        log::debug!("credential store loaded from {} ({} keys)", path.display(), map.len());
        Ok(Self {
            path,
            current: Mutex::new(map),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the stored credentials.
    pub async fn get(&self) -> Credentials {
        Credentials::from_map(&*self.current.lock().await)
    }

    /// Raw value for a key (including keys the typed view does not know).
    pub async fn get_raw(&self, key: &str) -> Option<Value> {
        self.current.lock().await.get(key).cloned()
    }

    /// Merge `patch` into the file and the in-memory record. Returns the merged credentials.
    pub async fn save(&self, patch: &Credentials) -> Result<Credentials, StoreError> {
        self.merge(patch.to_map(), true).await
    }

    /// Merge only the keys of `defaults` that the store does not have yet.
    pub async fn seed(&self, defaults: &Credentials) -> Result<(), StoreError> {
        self.merge(defaults.to_map(), false).await.map(|_| ())
    }

    async fn merge(
        &self,
        patch: Map<String, Value>,
        overwrite: bool,
    ) -> Result<Credentials, StoreError> {
        let mut current = self.current.lock().await;
        let missing = patch.keys().any(|k| !current.contains_key(k));
        if patch.is_empty() || (!overwrite && !missing) {
            return Ok(Credentials::from_map(&current));
        }
        let path = self.path.clone();
        let merged =
            tokio::task::spawn_blocking(move || write_merged(&path, patch, overwrite)).await??;
        *current = merged;
        Ok(Credentials::from_map(&current))
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

/// Read-merge-write under an exclusive file lock. Re-reads the file so concurrent writers' keys are kept.
fn write_merged(
    path: &Path,
    patch: Map<String, Value>,
    overwrite: bool,
) -> Result<Map<String, Value>, StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path(path))?;
    lock_file.lock_exclusive()?;

    let result = (|| -> Result<Map<String, Value>, StoreError> {
        let mut map: Map<String, Value> = match std::fs::read_to_string(path) {
            Ok(s) if !s.trim().is_empty() => serde_json::from_str(&s)?,
            Ok(_) => Map::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(StoreError::from(e)),
        };
        for (k, v) in patch {
            if overwrite || !map.contains_key(&k) {
                map.insert(k, v);
            }
        }
        let data = serde_json::to_string_pretty(&map)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(map)
    })();

    if let Err(e) = FileExt::unlock(&lock_file) {
        log::debug!("credential store: unlock failed: {}", e);
    }
    result
}
