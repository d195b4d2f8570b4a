//! The burrow filesystem daemon.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use burrow_client::{Client, ClientOptions};
use burrow_fs::{config, BurrowFs, NodeFactory};
use burrow_store::{BlobStore, ChangeListener, DiskStore, RemoteOptions, RemoteVersionedStore};

/// Mount a burrow filesystem.
#[derive(Parser)]
#[command(name = "burrowfs")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Where to mount the filesystem.
    #[arg(value_name = "MOUNTPOINT")]
    mountpoint: PathBuf,

    /// Location of the configuration file.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"))
}

fn expand(path: &str) -> PathBuf {
    for prefix in ["~/", "$HOME/"] {
        if let Some(rest) = path.strip_prefix(prefix) {
            return home().join(rest);
        }
    }
    PathBuf::from(path)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .unwrap_or_else(|| home().join("lib/burrow/burrowfs.config"));
    let opts = config::load_options_from_file(&config_path)
        .with_context(|| format!("loading configuration from {config_path:?}"))?;

    let default_filter = if opts.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let mut client_opts = ClientOptions::new(&opts.metadata_server);
    if let Some(kp) = &opts.key_pair {
        client_opts = client_opts.with_key_pair(expand(&kp.cert_file), expand(&kp.key_file));
    }
    if opts.fallback_to_plain_tcp {
        client_opts = client_opts.with_fallback_to_plain_tcp();
    }
    let client = Arc::new(Client::new(client_opts));

    // The factory does not exist yet when the store needs its listener, so
    // broadcasts are forwarded through this slot.
    let factory_slot: Arc<OnceLock<Arc<NodeFactory>>> = Arc::new(OnceLock::new());
    let forward = factory_slot.clone();
    let listener: ChangeListener = Arc::new(move |m| {
        if let Some(factory) = forward.get() {
            factory.apply_broadcast(m);
        }
    });
    let mut remote_opts = RemoteOptions::default().with_listener(listener);
    if !opts.auth_key.is_empty() {
        remote_opts = remote_opts.with_auth_key(&opts.auth_key);
    }
    let metadata = RemoteVersionedStore::new(client, remote_opts);
    metadata.start();

    let blob_dir = if opts.blob_dir.is_empty() {
        home().join("lib/burrow/blobs")
    } else {
        expand(&opts.blob_dir)
    };
    let blobs = BlobStore::new(Arc::new(
        DiskStore::new(&blob_dir)
            .with_context(|| format!("opening blob store at {blob_dir:?}"))?,
    ));

    let factory = NodeFactory::new(metadata.clone(), blobs);
    let _ = factory_slot.set(factory.clone());

    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };
    let root = factory
        .bootstrap(uid, gid)
        .await
        .context("loading filesystem root")?;

    let name = if opts.name.is_empty() {
        "burrow"
    } else {
        opts.name.as_str()
    };
    info!(name, mountpoint = %cli.mountpoint.display(), "Mounting");

    let fs = BurrowFs::new(factory.clone(), root, tokio::runtime::Handle::current());
    let mountpoint = cli.mountpoint.clone();
    let mounted = tokio::task::spawn_blocking(move || fs.mount(&mountpoint)).await?;
    if let Err(e) = &mounted {
        warn!(error = %e, "Mount ended with error");
    }

    factory.stop();
    metadata.stop().await;
    mounted?;
    Ok(())
}
