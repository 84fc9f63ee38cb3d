//! Filesystem storage for credential namespaces
//!
//! Each pairing session owns one directory under the store root:
//!
//! ```text
//! <root>/<session_id>/meta.json    creation and completion timestamps
//! <root>/<session_id>/creds.json   working credentials, rewritten on every update
//! <root>/<session_id>/bundle.json  persisted bundle, written once
//! ```
//!
//! Default root is `~/.local/share/sessiongen/sessions` (platform data dir).

use crate::session::SessionId;
use chrono::{DateTime, Utc};
use rand::distributions::{Alphanumeric, DistString};
use serde::{Deserialize, Serialize};
use sessiongen_core::CredentialBundle;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const META_FILE: &str = "meta.json";
const WORKING_FILE: &str = "creds.json";
const BUNDLE_FILE: &str = "bundle.json";

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Session not found")]
    NotFound,
    #[error("Session namespace already exists")]
    AlreadyExists,
    #[error("Credential bundle already persisted")]
    AlreadyPersisted,
    #[error("Data directory not found")]
    NoDataDir,
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Timestamps kept next to the credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionMeta {
    created_at: DateTime<Utc>,
    #[serde(default)]
    completed_at: Option<DateTime<Utc>>,
}

/// Summary of a namespace found on disk
#[derive(Debug, Clone)]
pub struct StoredSession {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    /// Set once a bundle was persisted
    pub completed_at: Option<DateTime<Utc>>,
}

/// Credential store for pairing sessions
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    /// Open the store at the default location
    pub async fn new() -> StorageResult<Self> {
        let root = Self::default_root()?;
        Self::with_root(root).await
    }

    /// Open the store at a specific root directory
    pub async fn with_root(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        info!("Session store at {:?}", root);
        Ok(Self { root })
    }

    /// Get the default root (`<data dir>/sessiongen/sessions`)
    pub fn default_root() -> StorageResult<PathBuf> {
        let data_dir = dirs::data_dir().ok_or(StorageError::NoDataDir)?;
        Ok(data_dir.join("sessiongen").join("sessions"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, id: &SessionId) -> PathBuf {
        self.root.join(id.as_str())
    }

    /// Allocate a fresh, empty namespace
    ///
    /// Never reuses an existing directory.
    pub async fn create(&self, id: &SessionId) -> StorageResult<CredentialNamespace> {
        let dir = self.dir(id);
        fs::create_dir(&dir).await.map_err(|e| match e.kind() {
            ErrorKind::AlreadyExists => StorageError::AlreadyExists,
            _ => StorageError::Io(e),
        })?;

        let meta = SessionMeta {
            created_at: Utc::now(),
            completed_at: None,
        };
        fs::write(dir.join(META_FILE), serde_json::to_vec_pretty(&meta)?).await?;

        debug!("Created namespace for session {}", id.fingerprint());
        Ok(CredentialNamespace { path: dir })
    }

    /// Read the persisted bundle
    pub async fn read(&self, id: &SessionId) -> StorageResult<CredentialBundle> {
        match fs::read(self.dir(id).join(BUNDLE_FILE)).await {
            Ok(bytes) => Ok(CredentialBundle::from_bytes(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Read the persisted bundle and remove its namespace
    ///
    /// The namespace is renamed away before it is read, so of several
    /// concurrent callers exactly one receives the bundle.
    pub async fn take(&self, id: &SessionId) -> StorageResult<CredentialBundle> {
        let dir = self.dir(id);
        if !fs::try_exists(dir.join(BUNDLE_FILE)).await? {
            return Err(StorageError::NotFound);
        }

        let claim = Alphanumeric.sample_string(&mut rand::thread_rng(), 8);
        let claimed = self.root.join(format!(".{}.{}", id.as_str(), claim));
        fs::rename(&dir, &claimed).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => StorageError::NotFound,
            _ => StorageError::Io(e),
        })?;

        let contents = fs::read(claimed.join(BUNDLE_FILE)).await;
        if let Err(e) = fs::remove_dir_all(&claimed).await {
            warn!("Failed to remove taken session {}: {}", id.fingerprint(), e);
        }

        debug!("Took credentials for session {}", id.fingerprint());
        Ok(CredentialBundle::from_bytes(contents?))
    }

    /// Persist the final bundle for a session; fails if one already exists
    pub async fn persist(&self, id: &SessionId, bundle: &CredentialBundle) -> StorageResult<()> {
        let dir = self.dir(id);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dir.join(BUNDLE_FILE))
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => StorageError::AlreadyPersisted,
                ErrorKind::NotFound => StorageError::NotFound,
                _ => StorageError::Io(e),
            })?;
        file.write_all(bundle.as_bytes()).await?;
        file.sync_all().await?;

        let mut meta = self.meta(&dir).await?;
        meta.completed_at = Some(Utc::now());
        fs::write(dir.join(META_FILE), serde_json::to_vec_pretty(&meta)?).await?;

        info!("Persisted credentials for session {}", id.fingerprint());
        Ok(())
    }

    /// Remove a namespace; unknown ids are ignored
    pub async fn delete(&self, id: &SessionId) -> StorageResult<()> {
        match fs::remove_dir_all(self.dir(id)).await {
            Ok(()) => {
                debug!("Removed namespace for session {}", id.fingerprint());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    pub async fn exists(&self, id: &SessionId) -> bool {
        fs::try_exists(self.dir(id)).await.unwrap_or(false)
    }

    /// Summary of one stored namespace
    pub async fn stored(&self, id: &SessionId) -> StorageResult<StoredSession> {
        let dir = self.dir(id);
        let meta = match self.meta(&dir).await {
            Ok(meta) => meta,
            Err(StorageError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound)
            }
            Err(e) => return Err(e),
        };
        Ok(StoredSession {
            id: id.clone(),
            created_at: meta.created_at,
            completed_at: meta.completed_at,
        })
    }

    /// List every namespace on disk
    pub async fn list(&self) -> StorageResult<Vec<StoredSession>> {
        let mut sessions = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(SessionId::parse) else {
                continue;
            };
            match self.stored(&id).await {
                Ok(session) => sessions.push(session),
                Err(e) => warn!("Skipping unreadable namespace {}: {}", id.fingerprint(), e),
            }
        }

        Ok(sessions)
    }

    async fn meta(&self, dir: &Path) -> StorageResult<SessionMeta> {
        let contents = fs::read(dir.join(META_FILE)).await?;
        Ok(serde_json::from_slice(&contents)?)
    }
}

/// Working credential area of one session
#[derive(Debug, Clone)]
pub struct CredentialNamespace {
    path: PathBuf,
}

impl CredentialNamespace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the working credentials
    pub async fn save_working(&self, bundle: &CredentialBundle) -> StorageResult<()> {
        let tmp = self.path.join(format!("{}.tmp", WORKING_FILE));
        fs::write(&tmp, bundle.as_bytes()).await?;
        fs::rename(&tmp, self.path.join(WORKING_FILE)).await?;
        Ok(())
    }

    /// Load the working credentials, if any were saved yet
    pub async fn load_working(&self) -> StorageResult<Option<CredentialBundle>> {
        match fs::read(self.path.join(WORKING_FILE)).await {
            Ok(bytes) => Ok(Some(CredentialBundle::from_bytes(bytes))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn bundle(text: &str) -> CredentialBundle {
        CredentialBundle::from_bytes(text.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_store_crud() {
        let dir = tempdir().unwrap();
        let store = SessionStore::with_root(dir.path().join("sessions")).await.unwrap();
        let id = SessionId::generate();

        // Create
        let namespace = store.create(&id).await.unwrap();
        assert!(store.exists(&id).await);
        assert!(matches!(store.read(&id).await, Err(StorageError::NotFound)));

        // Working credentials
        assert!(namespace.load_working().await.unwrap().is_none());
        namespace.save_working(&bundle("{\"v\":1}")).await.unwrap();
        namespace.save_working(&bundle("{\"v\":2}")).await.unwrap();
        let working = namespace.load_working().await.unwrap().unwrap();
        assert_eq!(working.as_bytes(), b"{\"v\":2}");

        // Persist and read
        store.persist(&id, &working).await.unwrap();
        assert_eq!(store.read(&id).await.unwrap(), working);
        assert!(store.stored(&id).await.unwrap().completed_at.is_some());

        // Delete
        store.delete(&id).await.unwrap();
        assert!(!store.exists(&id).await);
        assert!(matches!(store.read(&id).await, Err(StorageError::NotFound)));
    }

    #[tokio::test]
    async fn test_create_never_reuses_namespace() {
        let dir = tempdir().unwrap();
        let store = SessionStore::with_root(dir.path()).await.unwrap();
        let id = SessionId::generate();

        store.create(&id).await.unwrap();
        assert!(matches!(
            store.create(&id).await,
            Err(StorageError::AlreadyExists)
        ));
    }

    #[tokio::test]
    async fn test_persist_never_overwrites() {
        let dir = tempdir().unwrap();
        let store = SessionStore::with_root(dir.path()).await.unwrap();
        let id = SessionId::generate();
        store.create(&id).await.unwrap();

        store.persist(&id, &bundle("first")).await.unwrap();
        assert!(matches!(
            store.persist(&id, &bundle("second")).await,
            Err(StorageError::AlreadyPersisted)
        ));
        assert_eq!(store.read(&id).await.unwrap().as_bytes(), b"first");
    }

    #[tokio::test]
    async fn test_persist_without_namespace() {
        let dir = tempdir().unwrap();
        let store = SessionStore::with_root(dir.path()).await.unwrap();
        let result = store.persist(&SessionId::generate(), &bundle("x")).await;
        assert!(matches!(result, Err(StorageError::NotFound)));
    }

    #[tokio::test]
    async fn test_take_removes_namespace() {
        let dir = tempdir().unwrap();
        let store = SessionStore::with_root(dir.path()).await.unwrap();
        let id = SessionId::generate();
        store.create(&id).await.unwrap();

        // Nothing persisted yet: the namespace is left alone
        assert!(matches!(store.take(&id).await, Err(StorageError::NotFound)));
        assert!(store.exists(&id).await);

        store.persist(&id, &bundle("secret")).await.unwrap();
        assert_eq!(store.take(&id).await.unwrap().as_bytes(), b"secret");
        assert!(!store.exists(&id).await);
        assert!(matches!(store.take(&id).await, Err(StorageError::NotFound)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_take_serves_once() {
        let dir = tempdir().unwrap();
        let store = SessionStore::with_root(dir.path()).await.unwrap();

        for _ in 0..50 {
            let id = SessionId::generate();
            store.create(&id).await.unwrap();
            store.persist(&id, &bundle("secret")).await.unwrap();

            let (a, b) = tokio::join!(store.take(&id), store.take(&id));
            assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        }
    }

    #[tokio::test]
    async fn test_delete_unknown_is_noop() {
        let dir = tempdir().unwrap();
        let store = SessionStore::with_root(dir.path()).await.unwrap();
        store.delete(&SessionId::generate()).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_skips_foreign_entries() {
        let dir = tempdir().unwrap();
        let store = SessionStore::with_root(dir.path()).await.unwrap();
        let id = SessionId::generate();
        store.create(&id).await.unwrap();
        std::fs::create_dir(dir.path().join("not-a-session")).unwrap();
        std::fs::write(dir.path().join("README"), "x").unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert!(listed[0].completed_at.is_none());
    }
}
