//! In-memory store, used directly in tests and as the local cache behind
//! the remote versioned store.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::{Store, StoreError};

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        let entries = self.entries.read().unwrap();
        entries
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::not_found(key))
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut entries = self.entries.write().unwrap();
        entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }
}
