//! In-memory storage backend.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::storage::Storage;

/// Storage backend keeping values in a shared in-process map.
///
/// Clones share the same map, which makes it the natural stand-in for a
/// browser's per-tab `sessionStorage` and a convenient test double.
///
/// # Example
///
/// ```
/// use chat_guard::{MemoryStorage, Storage};
///
/// # async fn example() {
/// let storage = MemoryStorage::new();
/// storage.put("k", "v").await.unwrap();
/// assert_eq!(storage.clone().get("k").await.unwrap().as_deref(), Some("v"));
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous peek, mostly useful in tests.
    pub fn snapshot(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}
