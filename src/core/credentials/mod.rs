// src/core/credentials/mod.rs

//! The Credential Store (spec §4.A): persists named cluster credentials and
//! recalls them. Durability follows the teacher's persistence layer pattern
//! (temp file -> fsync -> rename); concurrency follows its writer-lock +
//! copy-on-write-reads split (spec §5a).

use crate::core::errors::{ClusterMuxError, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

pub type CredentialId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    File,
    Bearer,
    Certificate,
}

/// A cluster described inside a credential's parsed payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterDescriptor {
    pub name: String,
    pub api_server_url: String,
    pub default_namespace: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: CredentialId,
    pub display_name: String,
    pub kind: CredentialKind,
    #[serde(with = "serde_bytes_as_base64")]
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub clusters: Vec<ClusterDescriptor>,
}

/// Lightweight view returned by `list()`, deliberately excluding `payload`.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialSummary {
    pub id: CredentialId,
    pub display_name: String,
    pub kind: CredentialKind,
    pub created_at: DateTime<Utc>,
    pub cluster_names: Vec<String>,
}

impl From<&Credential> for CredentialSummary {
    fn from(c: &Credential) -> Self {
        Self {
            id: c.id.clone(),
            display_name: c.display_name.clone(),
            kind: c.kind,
            created_at: c.created_at,
            cluster_names: c.clusters.iter().map(|cl| cl.name.clone()).collect(),
        }
    }
}

/// A callback invoked when a credential is deleted, so collaborators
/// (Client Factory, Informer Registry) can cascade the cancellation spec §5
/// requires ("deletion of a credential causes factory eviction").
pub type DeletionHook = Box<dyn Fn(&CredentialId) + Send + Sync>;

pub struct CredentialStore {
    dir: PathBuf,
    inner: RwLock<HashMap<CredentialId, Arc<Credential>>>,
    on_disk: bool,
    hooks: RwLock<Vec<DeletionHook>>,
}

impl CredentialStore {
    /// Opens (creating if necessary) the credential store rooted at
    /// `data_dir/kubeconfigs`. If the directory can't be created, the store
    /// degrades to in-memory-only mode with a logged warning, per spec §4.A.
    pub fn open(data_dir: &str) -> Self {
        let dir = Path::new(data_dir).join("kubeconfigs");
        let on_disk = match std::fs::create_dir_all(&dir) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, dir = %dir.display(), "credential store falling back to in-memory-only mode");
                false
            }
        };
        let mut store = Self {
            dir,
            inner: RwLock::new(HashMap::new()),
            on_disk,
            hooks: RwLock::new(Vec::new()),
        };
        if on_disk {
            store.load_existing();
        }
        store
    }

    fn load_existing(&mut self) {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };
        let mut map = HashMap::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read(&path).and_then(|bytes| {
                serde_json::from_slice::<Credential>(&bytes)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            }) {
                Ok(cred) => {
                    map.insert(cred.id.clone(), Arc::new(cred));
                }
                Err(e) => warn!(file = %path.display(), error = %e, "skipping unreadable credential file"),
            }
        }
        *self.inner.write() = map;
    }

    pub fn on_delete(&self, hook: DeletionHook) {
        self.hooks.write().push(hook);
    }

    /// Atomic add: write temp file in the same directory, fsync, rename.
    pub fn add(
        &self,
        display_name: String,
        kind: CredentialKind,
        payload: Vec<u8>,
        clusters: Vec<ClusterDescriptor>,
    ) -> Result<CredentialId> {
        let id = Uuid::new_v4().to_string();
        let cred = Credential {
            id: id.clone(),
            display_name,
            kind,
            payload,
            created_at: Utc::now(),
            clusters,
        };

        if self.on_disk {
            if let Err(e) = self.persist(&cred) {
                warn!(error = %e, "credential persisted to memory only; disk write failed");
            }
        }

        self.inner.write().insert(id.clone(), Arc::new(cred));
        Ok(id)
    }

    fn persist(&self, cred: &Credential) -> Result<()> {
        let final_path = self.dir.join(format!("{}.json", cred.id));
        let tmp_path = self.dir.join(format!(".{}.json.tmp", cred.id));
        let bytes = serde_json::to_vec_pretty(cred)?;

        {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode_0600_if_unix()
                .open(&tmp_path)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    pub fn list(&self) -> Vec<CredentialSummary> {
        // Copy-on-write snapshot: clone the small summaries out from under a
        // short read lock, never holding the lock during serialization or I/O.
        self.inner
            .read()
            .values()
            .map(|c| CredentialSummary::from(c.as_ref()))
            .collect()
    }

    pub fn get(&self, id: &str) -> Result<Arc<Credential>> {
        self.inner
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| ClusterMuxError::NotFound(format!("credential {id}")))
    }

    /// Removes both the in-memory and on-disk representation and invokes
    /// every registered deletion hook so dependents cascade-close.
    pub fn delete(&self, id: &str) -> Result<()> {
        let removed = self.inner.write().remove(id);
        if removed.is_none() {
            return Err(ClusterMuxError::NotFound(format!("credential {id}")));
        }
        if self.on_disk {
            let path = self.dir.join(format!("{id}.json"));
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(error = %e, file = %path.display(), "failed to remove credential file");
                }
            }
        }
        for hook in self.hooks.read().iter() {
            hook(&id.to_string());
        }
        Ok(())
    }
}

/// Unix-only 0600 permission helper; a no-op builder method on the
/// `OpenOptions` chain above so the call reads fluently.
trait Mode0600 {
    fn mode_0600_if_unix(self) -> Self;
}

impl Mode0600 for std::fs::OpenOptions {
    #[cfg(unix)]
    fn mode_0600_if_unix(mut self) -> Self {
        use std::os::unix::fs::OpenOptionsExt;
        self.mode(0o600);
        self
    }
    #[cfg(not(unix))]
    fn mode_0600_if_unix(self) -> Self {
        self
    }
}

mod serde_bytes_as_base64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_list_get_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::open(dir.path().to_str().unwrap());
        let id = store
            .add(
                "prod".into(),
                CredentialKind::File,
                b"kubeconfig-bytes".to_vec(),
                vec![ClusterDescriptor {
                    name: "prod-cluster".into(),
                    api_server_url: "https://prod.example.com".into(),
                    default_namespace: Some("default".into()),
                }],
            )
            .unwrap();

        let listed = store.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);

        let got = store.get(&id).unwrap();
        assert_eq!(got.payload, b"kubeconfig-bytes");

        store.delete(&id).unwrap();
        assert!(store.get(&id).is_err());
        assert!(store.list().is_empty());
    }

    #[test]
    fn delete_unknown_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::open(dir.path().to_str().unwrap());
        assert!(matches!(
            store.delete("missing"),
            Err(ClusterMuxError::NotFound(_))
        ));
    }

    #[test]
    fn delete_hook_is_invoked() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::open(dir.path().to_str().unwrap());
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let seen2 = seen.clone();
        store.on_delete(Box::new(move |id| *seen2.lock() = Some(id.clone())));
        let id = store
            .add("x".into(), CredentialKind::Bearer, vec![], vec![])
            .unwrap();
        store.delete(&id).unwrap();
        assert_eq!(*seen.lock(), Some(id));
    }

    #[test]
    fn survives_reopen_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap().to_string();
        let id = {
            let store = CredentialStore::open(&path);
            store
                .add("x".into(), CredentialKind::Certificate, vec![1, 2, 3], vec![])
                .unwrap()
        };
        let store2 = CredentialStore::open(&path);
        assert!(store2.get(&id).is_ok());
    }
}
