//! The burrow metadata server daemon.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use burrow_metad::{config, Server, ServerOptions};
use burrow_store::{Builder, VersionedWrapper};

/// Versioned metadata server for burrow filesystems.
#[derive(Parser)]
#[command(name = "burrow-metad")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Location of the configuration file.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/"))
        .join("lib/burrow/metadataserver.config")
}

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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let opts = config::load_options_from_file(&config_path)
        .with_context(|| format!("loading configuration from {config_path:?}"))?;

    let default_filter = if opts.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let store = Builder::new(opts.stores.clone())
        .store_by_name(&opts.backend)
        .context("could not instantiate backend store")?;
    let metadata = Arc::new(VersionedWrapper::new(store));

    let mut server_opts = ServerOptions::new(&opts.listen_address).with_store(metadata);
    if !opts.cert_file.is_empty() {
        server_opts = server_opts.with_key_pair(expand(&opts.cert_file), expand(&opts.key_file));
    }
    if !opts.auth_hash.is_empty() {
        server_opts = server_opts.with_auth_hash(&opts.auth_hash);
    }

    let server = Arc::new(Server::new(server_opts));
    let addr = server.listen().await?;
    info!(addr = %addr, "Listening");

    // Installed before serve(), which only returns once shutdown is called.
    let on_signal = server.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutting down server");
                on_signal.shutdown();
            }
            Err(e) => warn!(error = %e, "Could not install signal handler"),
        }
    });

    server.serve().await?;
    Ok(())
}
