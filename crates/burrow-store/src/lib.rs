//! # burrow-store
//!
//! Storage abstractions for the burrow filesystem:
//!
//! - [`Store`] — opaque byte-keyed put/get with a dedicated not-found
//!   condition, implemented in memory ([`MemoryStore`]), on sharded disk
//!   ([`DiskStore`]), in a single-file B-tree ([`RedbStore`]), on S3
//!   ([`S3Store`]), on DynamoDB ([`DynamoStore`]), over another process
//!   ([`RemoteStore`]) and as a fast/slow composition ([`Paired`]).
//! - [`VersionedStore`] — `(version, key) → value` with compare-and-swap on
//!   a monotonic version ([`VersionedWrapper`], [`RemoteVersionedStore`]).
//! - [`BlobStore`] — content-addressed storage for file blocks.
//! - [`Builder`] — constructs stores from named TOML stanzas.

mod blob;
mod builder;
mod disk;
mod dynamo;
mod embedded;
mod memory;
mod paired;
mod remote;
mod s3;
mod versioned;

pub use blob::{BlobStore, BlockHash, BLOCK_SIZE};
pub use builder::{BuildError, Builder, Registry};
pub use disk::DiskStore;
pub use dynamo::DynamoStore;
pub use embedded::RedbStore;
pub use memory::MemoryStore;
pub use paired::Paired;
pub use remote::{RemoteOptions, RemoteStore, RemoteVersionedStore};
pub use s3::S3Store;
pub use versioned::{apply_message, VersionedWrapper};

use std::sync::Arc;

use async_trait::async_trait;

use burrow_proto::Message;

/// Storage failures, by kind rather than by backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The key is absent. Maps to `ENOENT` at the filesystem boundary.
    #[error("{0:?}: not found")]
    NotFound(String),
    /// A versioned put lost the compare-and-swap.
    #[error("stale put")]
    StalePut,
    /// A remote request exceeded its deadline; the connection is dropped.
    #[error("request timed out")]
    Timeout,
    /// The server requires authorization we do not (or no longer) have.
    #[error("not authorized: {0}")]
    Unauthorized(String),
    /// I/O-level failure.
    #[error("transport: {0}")]
    Transport(String),
    /// Unexpected or malformed message traffic.
    #[error("protocol: {0}")]
    Protocol(String),
    /// An error reported by the remote peer, verbatim.
    #[error("{0}")]
    Remote(String),
    /// Backend-specific failure (disk, embedded, cloud).
    #[error("{0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(key: &[u8]) -> StoreError {
        StoreError::NotFound(String::from_utf8_lossy(key).into_owned())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> StoreError {
        StoreError::Transport(e.to_string())
    }
}

/// Raw byte-keyed storage.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError>;
    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
}

/// Byte-keyed storage where every record carries a monotonic version and
/// writes are conditional on providing a strictly larger one.
#[async_trait]
pub trait VersionedStore: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<(u64, Vec<u8>), StoreError>;
    async fn put(&self, version: u64, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
}

/// Invoked with every broadcast `PUT` accepted into a local cache.
pub type ChangeListener = Arc<dyn Fn(&Message) + Send + Sync>;

/// Lowercase hex, the form keys take in path names and log lines.
pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
