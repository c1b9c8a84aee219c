use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use super::{CacheError, KeyValueCache};

/// An in-process cache. Clones share the same storage.
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryCache {
    fn entries(&self) -> Result<MutexGuard<'_, HashMap<String, String>>, CacheError> {
        self.entries.lock().map_err(|e| CacheError::CommandError(format!("Cache lock is poisoned: {e}")))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries().map(|e| e.contains_key(key)).unwrap_or(false)
    }
}

impl KeyValueCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.entries()?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
        self.entries()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, CacheError> {
        let mut entries = self.entries()?;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries()?.remove(key);
        Ok(())
    }
}
