//! In-memory backend (no durability).

use std::collections::HashMap;
use std::sync::RwLock;

use super::{Backend, Entry, StoreError};

#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::DatabaseError("memory backend lock poisoned".into())
}

impl Backend for MemoryBackend {
    fn load(&self, key: &str) -> Result<Option<Entry>, StoreError> {
        Ok(self.entries.read().map_err(poisoned)?.get(key).cloned())
    }

    fn save(&self, key: &str, entry: &Entry) -> Result<(), StoreError> {
        self.entries
            .write()
            .map_err(poisoned)?
            .insert(key.to_string(), entry.clone());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().map_err(poisoned)?.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.entries.read().map_err(poisoned)?.keys().cloned().collect())
    }
}
