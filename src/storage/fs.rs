//! Filesystem storage backend.

use std::io::ErrorKind;
use std::path::PathBuf;

use crate::error::{ChatGuardError, Result};
use crate::storage::Storage;

/// Storage backend that keeps one file per key on the local filesystem.
///
/// Intermediate directories are created automatically. The key is joined
/// with the base directory to form the final path; a missing file reads as
/// `None`.
///
/// # Example
///
/// ```rust,no_run
/// use chat_guard::FsStorage;
///
/// let storage = FsStorage::new("/var/lib/chat_guard");
/// ```
#[derive(Debug, Clone)]
pub struct FsStorage {
    base_dir: PathBuf,
}

impl FsStorage {
    /// Create a new `FsStorage` rooted at the given directory.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

impl Storage for FsStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.base_dir.join(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ChatGuardError::Storage(Box::new(e))),
        }
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let path = self.base_dir.join(key);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ChatGuardError::Storage(Box::new(e)))?;
        }

        tokio::fs::write(&path, value)
            .await
            .map_err(|e| ChatGuardError::Storage(Box::new(e)))?;

        tracing::debug!("Wrote {} bytes to {}", value.len(), path.display());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.base_dir.join(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ChatGuardError::Storage(Box::new(e))),
        }
    }
}
