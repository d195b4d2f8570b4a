//! # burrow-metad
//!
//! The burrow metadata server: a TCP (optionally TLS) service that applies
//! `GET`/`PUT` messages to a versioned store and pushes every committed
//! `PUT` to all other connected clients so their caches stay coherent.

pub mod config;
mod conn;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use burrow_proto::Message;
use burrow_store::VersionedStore;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls configuration: {0}")]
    Tls(String),
    #[error("server is not listening")]
    NotListening,
}

/// Server construction options.
#[derive(Default)]
pub struct ServerOptions {
    pub address: String,
    pub store: Option<Arc<dyn VersionedStore>>,
    pub key_pair: Option<(PathBuf, PathBuf)>,
    pub auth_hash: Option<String>,
}

impl ServerOptions {
    pub fn new(address: impl Into<String>) -> ServerOptions {
        ServerOptions {
            address: address.into(),
            ..ServerOptions::default()
        }
    }

    pub fn with_store(mut self, store: Arc<dyn VersionedStore>) -> ServerOptions {
        self.store = Some(store);
        self
    }

    pub fn with_key_pair(mut self, cert_file: PathBuf, key_file: PathBuf) -> ServerOptions {
        self.key_pair = Some((cert_file, key_file));
        self
    }

    pub fn with_auth_hash(mut self, auth_hash: impl Into<String>) -> ServerOptions {
        self.auth_hash = Some(auth_hash.into());
        self
    }
}

/// Shared across connection handlers: the store, the password hash and the
/// broadcast subscriber set.
pub(crate) struct Shared {
    pub(crate) store: Option<Arc<dyn VersionedStore>>,
    pub(crate) auth_hash: Option<String>,
    subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<Message>>>,
    next_conn_id: AtomicU64,
}

impl Shared {
    pub(crate) fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Join the broadcast set. Only authorized connections subscribe.
    pub(crate) fn subscribe(&self, conn_id: u64, tx: mpsc::UnboundedSender<Message>) {
        self.subscribers.lock().unwrap().insert(conn_id, tx);
    }

    pub(crate) fn unsubscribe(&self, conn_id: u64) {
        self.subscribers.lock().unwrap().remove(&conn_id);
    }

    /// Push a committed put, as a tag-0 message, to every other subscriber.
    /// Best effort: a closed or slow peer never blocks the committer.
    pub(crate) fn broadcast_from(&self, from: u64, m: &Message) {
        let Message::Put {
            key,
            value,
            version,
            ..
        } = m
        else {
            return;
        };
        let b = Message::put(0, key.clone(), value.clone(), *version);
        let subscribers = self.subscribers.lock().unwrap();
        for (conn_id, tx) in subscribers.iter() {
            if *conn_id != from {
                let _ = tx.send(b.clone());
            }
        }
    }
}

pub struct Server {
    address: String,
    tls: Option<(PathBuf, PathBuf)>,
    shared: Arc<Shared>,
    listener: Mutex<Option<TcpListener>>,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(opts: ServerOptions) -> Server {
        Server {
            address: opts.address,
            tls: opts.key_pair,
            shared: Arc::new(Shared {
                store: opts.store,
                auth_hash: opts.auth_hash,
                subscribers: Mutex::new(HashMap::new()),
                next_conn_id: AtomicU64::new(1),
            }),
            listener: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Bind the listen address and return what was actually bound, which
    /// matters for `localhost:0`.
    pub async fn listen(&self) -> Result<SocketAddr, ServerError> {
        let listener = TcpListener::bind(&self.address).await?;
        let addr = listener.local_addr()?;
        *self.listener.lock().unwrap() = Some(listener);
        Ok(addr)
    }

    /// Accept and serve connections until [`Server::shutdown`].
    pub async fn serve(&self) -> Result<(), ServerError> {
        let listener = self
            .listener
            .lock()
            .unwrap()
            .take()
            .ok_or(ServerError::NotListening)?;
        let acceptor = match &self.tls {
            Some((cert_file, key_file)) => Some(tls_acceptor(cert_file, key_file)?),
            None => None,
        };
        let tracker = TaskTracker::new();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };
                    let shared = self.shared.clone();
                    let acceptor = acceptor.clone();
                    let token = self.shutdown.clone();
                    tracker.spawn(async move {
                        if let Err(e) = conn::handle(stream, acceptor, shared, token).await {
                            warn!(peer = %peer, error = %e, "Connection handler error");
                        }
                    });
                }
            }
        }
        tracker.close();
        tracker.wait().await;
        info!("Server stopped");
        Ok(())
    }

    /// Make [`Server::serve`] return; idempotent.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

fn tls_acceptor(cert_file: &PathBuf, key_file: &PathBuf) -> Result<TlsAcceptor, ServerError> {
    use std::fs::File;
    use std::io::BufReader;

    let mut cert_reader = BufReader::new(File::open(cert_file)?);
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Tls(e.to_string()))?;
    let mut key_reader = BufReader::new(File::open(key_file)?);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| ServerError::Tls(e.to_string()))?
        .ok_or_else(|| ServerError::Tls(format!("no private key in {}", key_file.display())))?;
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ServerError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
