//! Content-addressed storage for file blocks.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::{hex, Store, StoreError};

/// SHA-256 of a block's bytes, which is also its storage key.
pub type BlockHash = [u8; 32];

/// File content is chunked into blocks of this size; only the final block
/// of a file may be shorter.
pub const BLOCK_SIZE: usize = 128 * 1024;

/// Content-addressed `put(bytes) → hash` / `get(hash) → bytes` on top of
/// any byte store. Writes are idempotent by construction: the same bytes
/// always land at the same key.
#[derive(Clone)]
pub struct BlobStore {
    inner: Arc<dyn Store>,
}

impl BlobStore {
    pub fn new(inner: Arc<dyn Store>) -> BlobStore {
        BlobStore { inner }
    }

    pub fn hash(data: &[u8]) -> BlockHash {
        Sha256::digest(data).into()
    }

    pub async fn put(&self, data: &[u8]) -> Result<BlockHash, StoreError> {
        let hash = Self::hash(data);
        self.inner.put(&hash, data).await?;
        Ok(hash)
    }

    pub async fn get(&self, hash: &BlockHash) -> Result<Vec<u8>, StoreError> {
        let data = self.inner.get(hash).await?;
        let actual = Self::hash(&data);
        if actual != *hash {
            return Err(StoreError::Protocol(format!(
                "blob {} does not hash to its key (got {})",
                hex(hash),
                hex(&actual),
            )));
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    #[tokio::test]
    async fn put_returns_the_content_hash() {
        let blobs = BlobStore::new(Arc::new(MemoryStore::new()));
        let hash = blobs.put(b"Peggy Sue").await.unwrap();
        assert_eq!(hash, BlobStore::hash(b"Peggy Sue"));
        assert_eq!(blobs.get(&hash).await.unwrap(), b"Peggy Sue");
    }

    #[tokio::test]
    async fn puts_are_idempotent() {
        let blobs = BlobStore::new(Arc::new(MemoryStore::new()));
        let first = blobs.put(b"same bytes").await.unwrap();
        let second = blobs.put(b"same bytes").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn unknown_hash_is_not_found() {
        let blobs = BlobStore::new(Arc::new(MemoryStore::new()));
        assert!(blobs.get(&[0u8; 32]).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn corrupted_blobs_are_rejected() {
        let inner = Arc::new(MemoryStore::new());
        let blobs = BlobStore::new(inner.clone());
        let hash = blobs.put(b"original").await.unwrap();
        inner.put(&hash, b"tampered").await.unwrap();
        match blobs.get(&hash).await {
            Err(StoreError::Protocol(_)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
