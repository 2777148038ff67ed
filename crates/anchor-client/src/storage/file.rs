//! Filesystem storage backing
//!
//! One JSON file per identity under the config directory, named by UUID.
//! Writes go to a temp file first and are moved into place with an atomic
//! rename. The per-identity critical section is an in-process mutex from
//! a lazily populated map, so this backing serializes signers within one
//! process only; multi-instance deployments need the database backing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

use super::{check_signature_len, Identity, IdentityLock, IdentityStore, StoreError};

#[derive(Serialize, Deserialize)]
struct IdentityFile {
    uid: Uuid,
    #[serde(with = "crate::b64")]
    private_key: Vec<u8>,
    public_key: String,
    #[serde(with = "crate::b64")]
    signature: Vec<u8>,
    auth_token: String,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl From<&Identity> for IdentityFile {
    fn from(identity: &Identity) -> Self {
        Self {
            uid: identity.uid,
            private_key: identity.private_key.clone(),
            public_key: identity.public_key.clone(),
            signature: identity.signature.clone(),
            auth_token: identity.auth_token.clone(),
            created_at: identity.created_at,
        }
    }
}

impl From<IdentityFile> for Identity {
    fn from(file: IdentityFile) -> Self {
        Self {
            uid: file.uid,
            private_key: file.private_key,
            public_key: file.public_key,
            signature: file.signature,
            auth_token: file.auth_token,
            created_at: file.created_at,
        }
    }
}

/// Filesystem-backed identity store
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    locks: StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl FileStore {
    /// Open a store rooted at `dir`, creating the directory if needed
    pub fn new(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir).map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            locks: StdMutex::new(HashMap::new()),
        })
    }

    fn identity_path(&self, uid: Uuid) -> PathBuf {
        self.dir.join(format!("{uid}.json"))
    }

    fn mutex_for(&self, uid: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock table poisoned");
        locks.entry(uid).or_default().clone()
    }

    async fn read_identity(&self, uid: Uuid) -> Result<Identity, StoreError> {
        let path = self.identity_path(uid);
        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(uid))
            }
            Err(e) => return Err(StoreError::Io(e.to_string())),
        };

        let file: IdentityFile = serde_json::from_slice(&contents).map_err(|e| {
            StoreError::Corrupt {
                uid,
                reason: format!("unreadable identity file: {e}"),
            }
        })?;

        let identity: Identity = file.into();
        check_signature_len(uid, &identity.signature)?;
        Ok(identity)
    }

    async fn write_identity(dir: &Path, identity: &Identity) -> Result<(), StoreError> {
        let contents = serde_json::to_vec_pretty(&IdentityFile::from(identity))
            .map_err(|e| StoreError::Io(e.to_string()))?;

        let path = dir.join(format!("{}.json", identity.uid));
        let tmp = dir.join(format!(".{}.tmp", identity.uid));

        tokio::fs::write(&tmp, &contents)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;

        debug!(uid = %identity.uid, "wrote identity file");
        Ok(())
    }
}

#[async_trait]
impl IdentityStore for FileStore {
    async fn fetch_identity(&self, uid: Uuid) -> Result<Identity, StoreError> {
        self.read_identity(uid).await
    }

    async fn store_identity(&self, identity: Identity) -> Result<(), StoreError> {
        identity.validate()?;

        // hold the identity mutex so a concurrent create cannot race the
        // existence check
        let mutex = self.mutex_for(identity.uid);
        let _guard = mutex.lock().await;

        if tokio::fs::try_exists(self.identity_path(identity.uid))
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?
        {
            return Err(StoreError::AlreadyExists(identity.uid));
        }

        Self::write_identity(&self.dir, &identity).await
    }

    async fn lock(&self, uid: Uuid) -> Result<Box<dyn IdentityLock>, StoreError> {
        let guard = self.mutex_for(uid).lock_owned().await;
        let identity = match self.read_identity(uid).await {
            Ok(identity) => identity,
            Err(e) => {
                drop(guard);
                return Err(e);
            }
        };

        Ok(Box::new(FileLock {
            dir: self.dir.clone(),
            identity,
            _guard: guard,
        }))
    }
}

/// Critical section holding the in-process identity mutex
struct FileLock {
    dir: PathBuf,
    identity: Identity,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl IdentityLock for FileLock {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn commit(mut self: Box<Self>, new_signature: Vec<u8>) -> Result<(), StoreError> {
        check_signature_len(self.identity.uid, &new_signature)?;
        self.identity.signature = new_signature;
        FileStore::write_identity(&self.dir, &self.identity).await
        // guard drops here, releasing the critical section
    }

    async fn release(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anchor_core::SIGNATURE_LEN;
    use chrono::Utc;

    fn new_identity() -> Identity {
        Identity {
            uid: Uuid::new_v4(),
            private_key: vec![0xaa; 48],
            public_key: "-----BEGIN PUBLIC KEY-----\n...".into(),
            signature: vec![],
            auth_token: "token".into(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_store_and_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let identity = new_identity();

        store.store_identity(identity.clone()).await.unwrap();
        let fetched = store.fetch_identity(identity.uid).await.unwrap();

        assert_eq!(fetched, identity);
    }

    #[tokio::test]
    async fn test_fetch_unknown_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();

        let uid = Uuid::new_v4();
        assert!(matches!(
            store.fetch_identity(uid).await,
            Err(StoreError::NotFound(u)) if u == uid
        ));
    }

    #[tokio::test]
    async fn test_double_store_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let identity = new_identity();

        store.store_identity(identity.clone()).await.unwrap();
        assert!(matches!(
            store.store_identity(identity).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_commit_advances_tip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let identity = new_identity();
        store.store_identity(identity.clone()).await.unwrap();

        let lock = store.lock(identity.uid).await.unwrap();
        assert!(lock.identity().signature.is_empty());
        lock.commit(vec![0x11; SIGNATURE_LEN]).await.unwrap();

        let tip = store.get_signature(identity.uid).await.unwrap();
        assert_eq!(tip, vec![0x11; SIGNATURE_LEN]);
    }

    #[tokio::test]
    async fn test_release_keeps_tip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let identity = new_identity();
        store.store_identity(identity.clone()).await.unwrap();

        let lock = store.lock(identity.uid).await.unwrap();
        lock.release().await.unwrap();

        let tip = store.get_signature(identity.uid).await.unwrap();
        assert!(tip.is_empty());
    }

    #[tokio::test]
    async fn test_lock_serializes_per_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path()).unwrap());
        let identity = new_identity();
        store.store_identity(identity.clone()).await.unwrap();

        let lock = store.lock(identity.uid).await.unwrap();

        // a second lock for the same identity must wait for the first
        let store2 = store.clone();
        let uid = identity.uid;
        let contender = tokio::spawn(async move {
            let lock = store2.lock(uid).await.unwrap();
            lock.identity().signature.clone()
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        lock.commit(vec![0x22; SIGNATURE_LEN]).await.unwrap();

        // the contender observes the committed tip, not the stale one
        let observed = contender.await.unwrap();
        assert_eq!(observed, vec![0x22; SIGNATURE_LEN]);
    }

    #[tokio::test]
    async fn test_corrupt_signature_rejected_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let mut identity = new_identity();
        store.store_identity(identity.clone()).await.unwrap();

        // shorten the stored signature behind the store's back
        identity.signature = vec![0x33; 20];
        FileStore::write_identity(dir.path(), &identity).await.unwrap();

        assert!(matches!(
            store.fetch_identity(identity.uid).await,
            Err(StoreError::Corrupt { .. })
        ));
    }
}
