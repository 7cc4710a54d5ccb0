//! Byte-level storage adapters.
//!
//! The persistence engine talks to storage exclusively through
//! [`StorageAdapter`]; paths are opaque strings the adapter interprets.
//! [`MemoryStorage`] backs tests, [`FsStorage`] the local filesystem with
//! atomic replacement.

use crate::error::{Result, StorageOp};
use crate::Error;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Callback invoked when a watched path changes.
pub type ChangeCallback = Arc<dyn Fn() + Send + Sync>;

/// Handle for an active path watch; dropping it or calling
/// [`StorageWatch::unsubscribe`] stops further callbacks.
pub struct StorageWatch {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl StorageWatch {
    fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Stop watching. No callback fires after this returns.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for StorageWatch {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Pluggable byte-level storage.
///
/// All failures carry the path and the [`StorageOp`] that failed.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Read the full contents of a file.
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Replace the contents of a file, creating it if needed.
    async fn write(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Append bytes to a file, creating it if needed.
    async fn append(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Whether the path exists.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Remove a file. Removing a missing file is an error.
    async fn remove(&self, path: &str) -> Result<()>;

    /// Create a directory (and parents) if absent.
    async fn ensure_dir(&self, path: &str) -> Result<()>;

    /// Invoke `on_change` whenever the path's contents change, until the
    /// returned watch is dropped or unsubscribed.
    async fn watch(&self, path: &str, on_change: ChangeCallback) -> Result<StorageWatch>;
}

fn storage_error(path: &str, operation: StorageOp, message: impl std::fmt::Display) -> Error {
    Error::Storage {
        path: path.to_string(),
        operation,
        message: message.to_string(),
    }
}

/// In-memory storage for tests: a path-keyed byte map plus watch fan-out.
#[derive(Default)]
pub struct MemoryStorage {
    files: Mutex<HashMap<String, Vec<u8>>>,
    watchers: Arc<Mutex<HashMap<String, Vec<(u64, ChangeCallback)>>>>,
    next_watch_id: AtomicU64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a stored file, for assertions.
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().ok()?.get(path).cloned()
    }

    fn notify(&self, path: &str) {
        let callbacks: Vec<ChangeCallback> = match self.watchers.lock() {
            Ok(watchers) => watchers
                .get(path)
                .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        for callback in callbacks {
            callback();
        }
    }

    fn lock_files(&self, path: &str, op: StorageOp) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.files
            .lock()
            .map_err(|_| storage_error(path, op, "storage mutex poisoned"))
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.lock_files(path, StorageOp::Read)?
            .get(path)
            .cloned()
            .ok_or_else(|| storage_error(path, StorageOp::Read, "file not found"))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        self.lock_files(path, StorageOp::Write)?
            .insert(path.to_string(), data.to_vec());
        self.notify(path);
        Ok(())
    }

    async fn append(&self, path: &str, data: &[u8]) -> Result<()> {
        self.lock_files(path, StorageOp::Append)?
            .entry(path.to_string())
            .or_default()
            .extend_from_slice(data);
        self.notify(path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.lock_files(path, StorageOp::Exists)?.contains_key(path))
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.lock_files(path, StorageOp::Remove)?
            .remove(path)
            .ok_or_else(|| storage_error(path, StorageOp::Remove, "file not found"))?;
        self.notify(path);
        Ok(())
    }

    async fn ensure_dir(&self, _path: &str) -> Result<()> {
        // Directories are implicit in the path map
        Ok(())
    }

    async fn watch(&self, path: &str, on_change: ChangeCallback) -> Result<StorageWatch> {
        let id = self.next_watch_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut watchers = self
                .watchers
                .lock()
                .map_err(|_| storage_error(path, StorageOp::Watch, "storage mutex poisoned"))?;
            watchers
                .entry(path.to_string())
                .or_default()
                .push((id, on_change));
        }
        let watchers = Arc::clone(&self.watchers);
        let path = path.to_string();
        Ok(StorageWatch::new(move || {
            if let Ok(mut watchers) = watchers.lock() {
                if let Some(list) = watchers.get_mut(&path) {
                    list.retain(|(watch_id, _)| *watch_id != id);
                }
            }
        }))
    }
}

/// Local filesystem storage.
///
/// Writes ensure the parent directory and go through a temp file persisted
/// into place, so readers never observe a half-written file. Watching polls
/// file metadata.
pub struct FsStorage {
    poll_interval: std::time::Duration,
}

impl FsStorage {
    pub fn new() -> Self {
        Self {
            poll_interval: std::time::Duration::from_millis(500),
        }
    }

    /// Override the metadata poll interval used by `watch`.
    pub fn with_poll_interval(mut self, interval: std::time::Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl Default for FsStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn parent_dir(path: &str) -> Option<PathBuf> {
    Path::new(path)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
}

async fn file_stamp(path: &str) -> Option<(std::time::SystemTime, u64)> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    Some((meta.modified().ok()?, meta.len()))
}

#[async_trait]
impl StorageAdapter for FsStorage {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        tokio::fs::read(path)
            .await
            .map_err(|e| storage_error(path, StorageOp::Read, e))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        if let Some(parent) = parent_dir(path) {
            tokio::fs::create_dir_all(&parent)
                .await
                .map_err(|e| storage_error(path, StorageOp::Write, e))?;
        }
        let target = PathBuf::from(path);
        let data = data.to_vec();
        let result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            use std::io::Write;
            let dir = target
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            let mut temp = tempfile::NamedTempFile::new_in(dir)?;
            temp.write_all(&data)?;
            temp.flush()?;
            temp.persist(&target).map_err(|e| e.error)?;
            Ok(())
        })
        .await;
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(storage_error(path, StorageOp::Write, e)),
            Err(e) => Err(storage_error(path, StorageOp::Write, e)),
        }
    }

    async fn append(&self, path: &str, data: &[u8]) -> Result<()> {
        if let Some(parent) = parent_dir(path) {
            tokio::fs::create_dir_all(&parent)
                .await
                .map_err(|e| storage_error(path, StorageOp::Append, e))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| storage_error(path, StorageOp::Append, e))?;
        tokio::io::AsyncWriteExt::write_all(&mut file, data)
            .await
            .map_err(|e| storage_error(path, StorageOp::Append, e))?;
        tokio::io::AsyncWriteExt::flush(&mut file)
            .await
            .map_err(|e| storage_error(path, StorageOp::Append, e))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(path)
            .await
            .map_err(|e| storage_error(path, StorageOp::Exists, e))?)
    }

    async fn remove(&self, path: &str) -> Result<()> {
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| storage_error(path, StorageOp::Remove, e))
    }

    async fn ensure_dir(&self, path: &str) -> Result<()> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| storage_error(path, StorageOp::EnsureDir, e))
    }

    async fn watch(&self, path: &str, on_change: ChangeCallback) -> Result<StorageWatch> {
        let path_owned = path.to_string();
        let interval = self.poll_interval;
        let handle = tokio::spawn(async move {
            let mut last = file_stamp(&path_owned).await;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let current = file_stamp(&path_owned).await;
                if current != last {
                    last = current;
                    on_change();
                }
            }
        });
        Ok(StorageWatch::new(move || handle.abort()))
    }
}
