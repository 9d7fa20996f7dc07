//! Shared file directory plus the per-handle client areas it copies from and to.

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex as SyncMutex, MutexGuard},
};

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
    sync::{Mutex, OwnedMutexGuard},
};
use tracing::info;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid file name '{0}'")]
    InvalidName(String),
    #[error("source file {} does not exist", .0.display())]
    SourceMissing(PathBuf),
    #[error("'{0}' already exists in the shared store")]
    AlreadyExists(String),
    #[error("'{0}' not found in the shared store")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The shared directory every `/store` uploads into.
///
/// Operations on the same file name are serialized through a per-name lock:
/// an upload's existence check and copy form one step, and a download never
/// observes a file while an upload of that name is still writing it.
/// Different names proceed concurrently.
pub struct FileStore {
    shared_dir: PathBuf,
    clients_dir: PathBuf,
    name_locks: NameLocks,
}

type NameLocks = SyncMutex<HashMap<String, Arc<Mutex<()>>>>;

impl FileStore {
    /// Opens the store, creating the shared directory when missing.
    pub async fn open(shared_dir: impl Into<PathBuf>, clients_dir: impl Into<PathBuf>) -> Result<Self> {
        let shared_dir = shared_dir.into();
        let clients_dir = clients_dir.into();
        fs::create_dir_all(&shared_dir).await.with_context(|| {
            format!(
                "failed to create storage directory: {}",
                shared_dir.display()
            )
        })?;

        info!(shared_dir = %shared_dir.display(), clients_dir = %clients_dir.display(), "file store opened");

        Ok(Self {
            shared_dir,
            clients_dir,
            name_locks: SyncMutex::new(HashMap::new()),
        })
    }

    pub fn shared_dir(&self) -> &Path {
        &self.shared_dir
    }

    /// Local area `<clients_dir>/<handle>_files` for one handle.
    pub fn client_area(&self, handle: &str) -> PathBuf {
        self.clients_dir.join(format!("{handle}_files"))
    }

    pub async fn prepare_client_area(&self, handle: &str) -> io::Result<PathBuf> {
        let area = self.client_area(handle);
        fs::create_dir_all(&area).await?;
        Ok(area)
    }

    /// Copies `filename` from the handle's client area into the shared store.
    ///
    /// Never overwrites: the destination is opened with `create_new`. A copy
    /// that fails midway leaves the partially written file in place.
    pub async fn upload(&self, handle: &str, filename: &str) -> Result<u64, StoreError> {
        validate_name(filename)?;
        let _guard = self.lock_name(filename).await;

        let source_path = self.client_area(handle).join(filename);
        if !fs::try_exists(&source_path).await? {
            return Err(StoreError::SourceMissing(source_path));
        }
        let mut source = fs::File::open(&source_path).await?;

        let dest_path = self.shared_dir.join(filename);
        let mut dest = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&dest_path)
            .await
        {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StoreError::AlreadyExists(filename.to_string()));
            }
            Err(err) => return Err(err.into()),
        };

        let bytes = tokio::io::copy(&mut source, &mut dest).await?;
        dest.flush().await?;
        info!(%handle, %filename, bytes, "file uploaded");
        Ok(bytes)
    }

    /// Copies `filename` from the shared store into the handle's client area,
    /// replacing any local copy. Creates nothing when the file is missing.
    pub async fn download(&self, handle: &str, filename: &str) -> Result<u64, StoreError> {
        validate_name(filename)?;
        let _guard = self.lock_name(filename).await;

        let source_path = self.shared_dir.join(filename);
        if !fs::try_exists(&source_path).await? {
            return Err(StoreError::NotFound(filename.to_string()));
        }

        let area = self.prepare_client_area(handle).await?;
        let bytes = fs::copy(&source_path, area.join(filename)).await?;
        info!(%handle, %filename, bytes, "file downloaded");
        Ok(bytes)
    }

    /// Names of the regular files in the shared store, sorted.
    pub async fn list(&self) -> io::Result<Vec<String>> {
        let mut entries = fs::read_dir(&self.shared_dir).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn lock_name(&self, filename: &str) -> NameGuard<'_> {
        let lock = {
            let mut locks = lock_map(&self.name_locks);
            Arc::clone(locks.entry(filename.to_string()).or_default())
        };
        NameGuard {
            locks: &self.name_locks,
            name: filename.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn tracked_names(&self) -> usize {
        lock_map(&self.name_locks).len()
    }
}

/// Exclusive hold on one file name. The name's lock is dropped from the map
/// once no other operation holds or waits on it.
struct NameGuard<'a> {
    locks: &'a NameLocks,
    name: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for NameGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = lock_map(self.locks);
        if locks
            .get(&self.name)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.name);
        }
    }
}

fn lock_map(locks: &NameLocks) -> MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> {
    locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A handle or file name must be a single plain path component.
pub fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.contains('\0')
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    if is_plain_name(name) {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}
