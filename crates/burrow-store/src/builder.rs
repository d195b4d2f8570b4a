//! Construction of stores from configuration.
//!
//! Configuration is a TOML table of named stanzas, each carrying a `type`
//! and per-type keys. The [`Registry`] maps type tags to constructors; the
//! [`Builder`] resolves stanzas by name and memoizes what it builds —
//! including failures, so a broken stanza reports the same error every
//! time it is referenced.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::{
    DiskStore, DynamoStore, MemoryStore, Paired, RedbStore, RemoteOptions, RemoteStore,
    RemoteVersionedStore, S3Store, Store,
};

use burrow_client::{Client, ClientOptions};

/// Configuration-shape and construction failures. Cloneable and comparable
/// so cached errors are indistinguishable from the original.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("missing key: {0:?}")]
    MissingKey(String),
    #[error("key is not a table: {0:?}")]
    NotATable(String),
    #[error("key is not a string: {0:?}")]
    NotAString(String),
    #[error("don't know how to build stores of type {0:?}")]
    UnknownType(String),
    #[error("{0}")]
    Backend(String),
}

type BuildFn =
    Arc<dyn Fn(&mut Builder, &toml::Table) -> Result<Arc<dyn Store>, BuildError> + Send + Sync>;

/// Type tag → constructor. Built once at startup and never mutated after.
#[derive(Clone, Default)]
pub struct Registry {
    by_type: HashMap<String, BuildFn>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    pub fn register<F>(&mut self, store_type: impl Into<String>, build: F)
    where
        F: Fn(&mut Builder, &toml::Table) -> Result<Arc<dyn Store>, BuildError>
            + Send
            + Sync
            + 'static,
    {
        self.by_type.insert(store_type.into(), Arc::new(build));
    }

    pub fn with_defaults() -> Registry {
        let mut registry = Registry::new();
        registry.register("in-memory", |_, _| Ok(Arc::new(MemoryStore::new())));
        registry.register("disk", |_, config| {
            let dir = expand(&get_string(config, "dir")?);
            let store = DiskStore::new(dir).map_err(|e| BuildError::Backend(e.to_string()))?;
            Ok(Arc::new(store))
        });
        registry.register("redb", |_, config| {
            let file = expand(&get_string(config, "file")?);
            let store = RedbStore::new(file).map_err(|e| BuildError::Backend(e.to_string()))?;
            Ok(Arc::new(store))
        });
        registry.register("s3", |_, config| {
            let profile = get_string(config, "profile")?;
            let region = get_string(config, "region")?;
            let bucket = get_string(config, "bucket")?;
            Ok(Arc::new(S3Store::new(profile, region, bucket)))
        });
        registry.register("dynamodb", |_, config| {
            let profile = get_string(config, "profile")?;
            let region = get_string(config, "region")?;
            let table = get_string(config, "table")?;
            Ok(Arc::new(DynamoStore::new(profile, region, table)))
        });
        registry.register("paired", |builder, config| {
            let fast = get_string(config, "fast")?;
            let slow = get_string(config, "slow")?;
            let fast = builder.store_by_name(&fast)?;
            let slow = builder.store_by_name(&slow)?;
            Ok(Arc::new(Paired::new(fast, slow)))
        });
        registry.register("remote", |_, config| {
            let address = get_string(config, "address")?;
            let client = Arc::new(Client::new(ClientOptions::new(address)));
            let versioned = RemoteVersionedStore::new(client, RemoteOptions::default());
            Ok(Arc::new(RemoteStore::new(versioned)))
        });
        registry
    }
}

/// Resolves named store stanzas, memoizing results either way.
pub struct Builder {
    registry: Registry,
    config: toml::Table,
    stores: HashMap<String, Arc<dyn Store>>,
    errors: HashMap<String, BuildError>,
}

impl Builder {
    pub fn new(config: toml::Table) -> Builder {
        Builder::with_registry(config, Registry::with_defaults())
    }

    pub fn with_registry(config: toml::Table, registry: Registry) -> Builder {
        Builder {
            registry,
            config,
            stores: HashMap::new(),
            errors: HashMap::new(),
        }
    }

    pub fn store_by_name(&mut self, name: &str) -> Result<Arc<dyn Store>, BuildError> {
        if let Some(err) = self.errors.get(name) {
            return Err(err.clone());
        }
        if let Some(store) = self.stores.get(name) {
            return Ok(store.clone());
        }
        match self.build_uncached(name) {
            Ok(store) => {
                self.stores.insert(name.to_owned(), store.clone());
                Ok(store)
            }
            Err(e) => {
                self.errors.insert(name.to_owned(), e.clone());
                Err(e)
            }
        }
    }

    fn build_uncached(&mut self, name: &str) -> Result<Arc<dyn Store>, BuildError> {
        let stanza = get_table(&self.config, name)?;
        let store_type = get_string(&stanza, "type")?;
        let build = self
            .registry
            .by_type
            .get(&store_type)
            .cloned()
            .ok_or(BuildError::UnknownType(store_type))?;
        build(self, &stanza)
    }
}

fn get_table(table: &toml::Table, key: &str) -> Result<toml::Table, BuildError> {
    match table.get(key) {
        None => Err(BuildError::MissingKey(key.to_owned())),
        Some(toml::Value::Table(t)) => Ok(t.clone()),
        Some(_) => Err(BuildError::NotATable(key.to_owned())),
    }
}

fn get_string(table: &toml::Table, key: &str) -> Result<String, BuildError> {
    match table.get(key) {
        None => Err(BuildError::MissingKey(key.to_owned())),
        Some(toml::Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(BuildError::NotAString(key.to_owned())),
    }
}

/// Home-directory expansion for path-valued keys: a leading `~/` or
/// `$HOME/` resolves against the user's home.
fn expand(path: &str) -> PathBuf {
    for prefix in ["~/", "$HOME/"] {
        if let Some(rest) = path.strip_prefix(prefix) {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest);
            }
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn config(text: &str) -> toml::Table {
        text.parse().unwrap()
    }

    #[test]
    fn empty_config() {
        let mut builder = Builder::new(toml::Table::new());
        assert_eq!(
            builder.store_by_name("store"),
            Err(BuildError::MissingKey("store".into()))
        );
    }

    #[test]
    fn missing_store_stanza() {
        let mut builder = Builder::new(config("[another-store]\ntype = \"in-memory\"\n"));
        assert!(builder.store_by_name("store").is_err());
    }

    #[test]
    fn missing_store_type() {
        let mut builder = Builder::new(config("[store]\nfile = \"testing.db\"\n"));
        assert_eq!(
            builder.store_by_name("store"),
            Err(BuildError::MissingKey("type".into()))
        );
    }

    #[test]
    fn store_stanza_not_a_table() {
        let mut builder = Builder::new(config("store = 666\n"));
        assert_eq!(
            builder.store_by_name("store"),
            Err(BuildError::NotATable("store".into()))
        );
    }

    #[test]
    fn store_type_not_a_string() {
        let mut builder = Builder::new(config("[store]\ntype = 666\n"));
        assert_eq!(
            builder.store_by_name("store"),
            Err(BuildError::NotAString("type".into()))
        );
    }

    #[test]
    fn unknown_store_type() {
        let mut builder = Builder::new(config("[store]\ntype = \"without-builder\"\n"));
        assert_eq!(
            builder.store_by_name("store"),
            Err(BuildError::UnknownType("without-builder".into()))
        );
    }

    #[test]
    fn errors_are_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let mut registry = Registry::with_defaults();
        registry.register("faulty", move |_, _| {
            let n = counted.fetch_add(1, Ordering::SeqCst);
            Err(BuildError::Backend(format!("error@{n}")))
        });
        let mut builder = Builder::with_registry(config("[store]\ntype = \"faulty\"\n"), registry);
        let err1 = builder.store_by_name("store").unwrap_err();
        let err2 = builder.store_by_name("store").unwrap_err();
        assert_eq!(err1, err2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn successes_are_cached() {
        let mut builder = Builder::new(config("[store]\ntype = \"in-memory\"\n"));
        let first = builder.store_by_name("store").unwrap();
        let second = builder.store_by_name("store").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn builds_in_memory_stores() {
        let mut builder = Builder::new(config("[in-memory-store]\ntype = \"in-memory\"\n"));
        let store = builder.store_by_name("in-memory-store").unwrap();
        store.put(b"k", b"v").await.unwrap();
        assert_eq!(store.get(b"k").await.unwrap(), b"v");
    }

    #[tokio::test]
    async fn builds_disk_stores() {
        let dir = tempfile::tempdir().unwrap();
        let text = format!("[disk-store]\ntype = \"disk\"\ndir = {:?}\n", dir.path());
        let mut builder = Builder::new(config(&text));
        let store = builder.store_by_name("disk-store").unwrap();
        store.put(b"k", b"v").await.unwrap();
        assert_eq!(store.get(b"k").await.unwrap(), b"v");
    }

    #[tokio::test]
    async fn builds_redb_stores() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("kv.redb");
        let text = format!("[redb-store]\ntype = \"redb\"\nfile = {file:?}\n");
        let mut builder = Builder::new(config(&text));
        let store = builder.store_by_name("redb-store").unwrap();
        store.put(b"k", b"v").await.unwrap();
        assert_eq!(store.get(b"k").await.unwrap(), b"v");
    }

    #[tokio::test]
    async fn builds_paired_stores() {
        let mut builder = Builder::new(config(
            "[paired-distinct]\ntype = \"paired\"\nslow = \"first\"\nfast = \"second\"\n\
             [paired-same]\ntype = \"paired\"\nslow = \"first\"\nfast = \"first\"\n\
             [first]\ntype = \"in-memory\"\n\
             [second]\ntype = \"in-memory\"\n",
        ));
        let distinct = builder.store_by_name("paired-distinct").unwrap();
        distinct.put(b"k", b"v").await.unwrap();
        assert_eq!(distinct.get(b"k").await.unwrap(), b"v");

        // Pairing a store with itself (silly) still works.
        let same = builder.store_by_name("paired-same").unwrap();
        same.put(b"x", b"y").await.unwrap();
        assert_eq!(same.get(b"x").await.unwrap(), b"y");
        // The shared member sees writes through the pair.
        assert_eq!(
            builder.store_by_name("first").unwrap().get(b"x").await.unwrap(),
            b"y"
        );
    }

    #[test]
    fn builds_remote_stores_without_connecting() {
        let mut builder = Builder::new(config(
            "[remote-store]\ntype = \"remote\"\naddress = \"burrow.example.org:7777\"\n",
        ));
        assert!(builder.store_by_name("remote-store").is_ok());
    }

    #[test]
    fn builds_cloud_stores_without_connecting() {
        let mut builder = Builder::new(config(
            "[s3-store]\ntype = \"s3\"\nprofile = \"p\"\nregion = \"eu-west-1\"\nbucket = \"b\"\n\
             [dynamodb-store]\ntype = \"dynamodb\"\nprofile = \"p\"\nregion = \"eu-west-1\"\ntable = \"t\"\n",
        ));
        assert!(builder.store_by_name("s3-store").is_ok());
        assert!(builder.store_by_name("dynamodb-store").is_ok());
    }
}
