//! Sharded on-disk store.
//!
//! Values live at `<dir>/<hex[0..2]>/<hex>`. Keys wider than a SHA-512
//! digest are replaced by their SHA-512 so path names stay under the
//! filename limit while collisions stay improbable.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha512};

use crate::{hex, Store, StoreError};

const FILE_MODE: u32 = 0o600;
const DIR_MODE: u32 = 0o700;

#[derive(Debug)]
pub struct DiskStore {
    dir: PathBuf,
}

impl DiskStore {
    /// Create the store, making `dir` (mode 0700) if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<DiskStore, StoreError> {
        let dir = dir.into();
        make_dirs(&dir)?;
        Ok(DiskStore { dir })
    }

    fn path_for(&self, key: &[u8]) -> PathBuf {
        let digest;
        let key = if key.len() > Sha512::output_size() {
            digest = Sha512::digest(key);
            &digest[..]
        } else {
            key
        };
        let name = hex(key);
        self.dir.join(&name[..2]).join(name)
    }
}

fn make_dirs(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(dir)
}

async fn write_value(path: &Path, value: &[u8]) -> std::io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true).mode(FILE_MODE);
    let mut f = options.open(path).await?;
    tokio::io::AsyncWriteExt::write_all(&mut f, value).await
}

#[async_trait]
impl Store for DiskStore {
    async fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(value) => Ok(value),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::not_found(key))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key);
        match write_value(&path, value).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Shard directory missing on first write of this prefix.
                let parent = path.parent().expect("sharded path has a parent");
                make_dirs(parent).map_err(|e| {
                    StoreError::Backend(format!("could not make dir for {path:?}: {e}"))
                })?;
                write_value(&path, value).await.map_err(StoreError::from)
            }
            Err(e) => Err(StoreError::Backend(format!("could not write {path:?}: {e}"))),
        }
    }
}
