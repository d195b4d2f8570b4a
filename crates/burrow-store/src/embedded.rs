//! Embedded single-file B-tree store backed by redb.

use std::path::Path;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};

use crate::{Store, StoreError};

const TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("burrow");

#[derive(Debug)]
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open or create the database file and make sure the table exists, so
    /// reads never race table creation.
    pub fn new(path: impl AsRef<Path>) -> Result<RedbStore, StoreError> {
        let db = Database::create(path).map_err(backend)?;
        let tx = db.begin_write().map_err(backend)?;
        tx.open_table(TABLE).map_err(backend)?;
        tx.commit().map_err(backend)?;
        Ok(RedbStore { db })
    }
}

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[async_trait]
impl Store for RedbStore {
    async fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        let tx = self.db.begin_read().map_err(backend)?;
        let table = tx.open_table(TABLE).map_err(backend)?;
        match table.get(key).map_err(backend)? {
            Some(guard) => Ok(guard.value().to_vec()),
            None => Err(StoreError::not_found(key)),
        }
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let tx = self.db.begin_write().map_err(backend)?;
        {
            let mut table = tx.open_table(TABLE).map_err(backend)?;
            table.insert(key, value).map_err(backend)?;
        }
        tx.commit().map_err(backend)?;
        Ok(())
    }
}
