//! Versioned wrapper over a plain byte store.
//!
//! Records are encoded as an 8-byte big-endian version followed by the
//! value. A put must carry a version strictly greater than the stored one
//! (or target an absent key), otherwise it is a stale put. The wrapper is
//! not atomic against concurrent writers in the same process; the metadata
//! server serializes message application per connection.

use std::sync::Arc;

use async_trait::async_trait;

use burrow_proto::Message;

use crate::{Store, StoreError, VersionedStore};

pub struct VersionedWrapper {
    inner: Arc<dyn Store>,
}

impl VersionedWrapper {
    pub fn new(inner: Arc<dyn Store>) -> VersionedWrapper {
        VersionedWrapper { inner }
    }
}

fn encode(version: u64, value: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(8 + value.len());
    raw.extend_from_slice(&version.to_be_bytes());
    raw.extend_from_slice(value);
    raw
}

fn decode(mut raw: Vec<u8>) -> Result<(u64, Vec<u8>), StoreError> {
    if raw.len() < 8 {
        return Err(StoreError::Protocol(format!(
            "versioned record too short: {} bytes",
            raw.len()
        )));
    }
    let version = u64::from_be_bytes(raw[..8].try_into().unwrap());
    raw.drain(..8);
    Ok((version, raw))
}

#[async_trait]
impl VersionedStore for VersionedWrapper {
    async fn get(&self, key: &[u8]) -> Result<(u64, Vec<u8>), StoreError> {
        decode(self.inner.get(key).await?)
    }

    async fn put(&self, version: u64, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        match self.inner.get(key).await {
            Ok(raw) => {
                let (current, _) = decode(raw)?;
                if version <= current {
                    return Err(StoreError::StalePut);
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.inner.put(key, &encode(version, value)).await
    }
}

/// Apply one protocol message to a versioned store, producing the reply
/// that describes the outcome. Both the server connection handler and the
/// client's broadcast path funnel through here.
pub async fn apply_message(store: &dyn VersionedStore, m: &Message) -> Message {
    match m {
        Message::Get { tag, key } => match store.get(key).await {
            Ok((version, value)) => Message::put(*tag, key.clone(), value, version),
            Err(e) => Message::error(*tag, e.to_string()),
        },
        Message::Put {
            tag,
            key,
            value,
            version,
        } => match store.put(*version, key, value).await {
            Ok(()) => m.clone(),
            Err(e) => Message::error(*tag, e.to_string()),
        },
        Message::Error { tag, .. } | Message::Auth { tag, .. } => Message::error(
            *tag,
            format!("messages of kind {} cannot be applied", m.kind()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    fn wrapper() -> VersionedWrapper {
        VersionedWrapper::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn increasing_versions_win() {
        let store = wrapper();
        for version in [1u64, 2, 5, 9] {
            store
                .put(version, b"k", format!("v{version}").as_bytes())
                .await
                .unwrap();
        }
        let (version, value) = store.get(b"k").await.unwrap();
        assert_eq!(version, 9);
        assert_eq!(value, b"v9");
    }

    #[tokio::test]
    async fn stale_puts_do_not_mutate() {
        let store = wrapper();
        store.put(3, b"k", b"three").await.unwrap();
        for stale in [0u64, 1, 3] {
            match store.put(stale, b"k", b"nope").await {
                Err(StoreError::StalePut) => {}
                other => panic!("unexpected result: {other:?}"),
            }
        }
        assert_eq!(store.get(b"k").await.unwrap(), (3, b"three".to_vec()));
    }

    #[tokio::test]
    async fn absent_key_accepts_any_version() {
        let store = wrapper();
        store.put(42, b"k", b"v").await.unwrap();
        assert_eq!(store.get(b"k").await.unwrap().0, 42);
    }

    #[tokio::test]
    async fn get_of_unknown_key_is_not_found() {
        assert!(wrapper().get(b"nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn empty_values_round_trip() {
        let store = wrapper();
        store.put(1, b"k", b"").await.unwrap();
        assert_eq!(store.get(b"k").await.unwrap(), (1, Vec::new()));
    }

    #[tokio::test]
    async fn apply_get_and_put_messages() {
        let store = wrapper();
        let put = Message::put(1, "name", "tony", 1);
        assert_eq!(apply_message(&store, &put).await, put);

        let get = Message::get(2, "name");
        assert_eq!(
            apply_message(&store, &get).await,
            Message::put(2, "name", "tony", 1)
        );

        let missing = Message::get(3, "surname");
        assert_eq!(
            apply_message(&store, &missing).await,
            Message::error(3, r#""surname": not found"#)
        );

        let stale = Message::put(4, "name", "mark", 1);
        assert_eq!(
            apply_message(&store, &stale).await,
            Message::error(4, "stale put")
        );
    }

    #[tokio::test]
    async fn auth_messages_cannot_be_applied() {
        let store = wrapper();
        assert_eq!(
            apply_message(&store, &Message::auth(7, "pw")).await,
            Message::error(7, "messages of kind AUTH cannot be applied")
        );
    }
}
