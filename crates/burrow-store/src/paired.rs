//! Fast/slow store composition.
//!
//! Reads fall through the fast store to the slow one; slow hits populate
//! the fast store. Writes go to both; the pair is in an unspecified state
//! after a partial failure, which is the operator's problem to reconcile.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::{Store, StoreError};

pub struct Paired {
    fast: Arc<dyn Store>,
    slow: Arc<dyn Store>,
}

impl Paired {
    pub fn new(fast: Arc<dyn Store>, slow: Arc<dyn Store>) -> Paired {
        Paired { fast, slow }
    }
}

#[async_trait]
impl Store for Paired {
    async fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        match self.fast.get(key).await {
            Ok(value) => Ok(value),
            Err(e) if e.is_not_found() => {
                let value = self.slow.get(key).await?;
                if let Err(e) = self.fast.put(key, &value).await {
                    warn!(error = %e, "Could not populate fast store");
                }
                Ok(value)
            }
            Err(e) => Err(e),
        }
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.fast.put(key, value).await?;
        self.slow.put(key, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    struct FailingStore;

    #[async_trait]
    impl Store for FailingStore {
        async fn get(&self, _key: &[u8]) -> Result<Vec<u8>, StoreError> {
            Err(StoreError::Backend("computer bought the farm".into()))
        }

        async fn put(&self, _key: &[u8], _value: &[u8]) -> Result<(), StoreError> {
            Err(StoreError::Backend("computer bought the farm".into()))
        }
    }

    #[tokio::test]
    async fn reads_fall_through_and_populate_fast() {
        let fast = Arc::new(MemoryStore::new());
        let slow = Arc::new(MemoryStore::new());
        slow.put(b"k", b"v").await.unwrap();

        let paired = Paired::new(fast.clone(), slow);
        assert_eq!(paired.get(b"k").await.unwrap(), b"v");
        // Populated: the fast store can now serve it alone.
        assert_eq!(fast.get(b"k").await.unwrap(), b"v");
    }

    #[tokio::test]
    async fn writes_reach_both() {
        let fast = Arc::new(MemoryStore::new());
        let slow = Arc::new(MemoryStore::new());
        let paired = Paired::new(fast.clone(), slow.clone());
        paired.put(b"k", b"v").await.unwrap();
        assert_eq!(fast.get(b"k").await.unwrap(), b"v");
        assert_eq!(slow.get(b"k").await.unwrap(), b"v");
    }

    #[tokio::test]
    async fn partial_put_failure_is_surfaced() {
        let paired = Paired::new(Arc::new(MemoryStore::new()), Arc::new(FailingStore));
        assert!(paired.put(b"k", b"v").await.is_err());
    }

    #[tokio::test]
    async fn fast_errors_other_than_not_found_are_surfaced() {
        let slow = Arc::new(MemoryStore::new());
        slow.put(b"k", b"v").await.unwrap();
        let paired = Paired::new(Arc::new(FailingStore), slow);
        let err = paired.get(b"k").await.unwrap_err();
        assert!(!err.is_not_found());
    }

    #[tokio::test]
    async fn missing_everywhere_is_not_found() {
        let paired = Paired::new(Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()));
        assert!(paired.get(b"k").await.unwrap_err().is_not_found());
    }
}
