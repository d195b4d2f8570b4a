//! # burrow-client
//!
//! Connection layer for the burrow metadata protocol. A [`Client`] owns one
//! connection to a metadata server, dialed lazily on first use. TLS is the
//! default transport; servers in self-hosted deployments present
//! self-signed certificates, so the client accepts any server certificate
//! and optionally presents its own keypair.
//!
//! [`Client::close`] drops the connection and wakes a blocked
//! [`Client::receive`]; the client stays usable and re-dials on the next
//! operation. The request/response multiplexing on top of this lives in
//! `burrow-store`.

mod tls;

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify, OnceCell};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

use burrow_proto::{read_message, write_message, Message, ProtoError};

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Client certificate and key, both PEM.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub address: String,
    pub dial_timeout: Duration,
    pub fallback_to_plain_tcp: bool,
    pub key_pair: Option<KeyPair>,
}

impl ClientOptions {
    pub fn new(address: impl Into<String>) -> ClientOptions {
        ClientOptions {
            address: address.into(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            fallback_to_plain_tcp: false,
            key_pair: None,
        }
    }

    pub fn with_fallback_to_plain_tcp(mut self) -> ClientOptions {
        self.fallback_to_plain_tcp = true;
        self
    }

    pub fn with_key_pair(mut self, cert_file: PathBuf, key_file: PathBuf) -> ClientOptions {
        self.key_pair = Some(KeyPair {
            cert_file,
            key_file,
        });
        self
    }

    pub fn with_dial_timeout(mut self, value: Duration) -> ClientOptions {
        self.dial_timeout = value;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("tls handshake failed: {0}")]
    Handshake(String),
    #[error("tls configuration: {0}")]
    TlsConfig(String),
    #[error("bad address {0:?}")]
    BadAddress(String),
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtoError),
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> ClientError {
        ClientError::Transport(e.to_string())
    }
}

type ReadHalf = Box<dyn AsyncRead + Send + Unpin>;
type WriteHalf = Box<dyn AsyncWrite + Send + Unpin>;

/// One lazily-dialed connection to a metadata server.
pub struct Client {
    opts: ClientOptions,
    tls: OnceCell<Arc<rustls::ClientConfig>>,
    // Lock order is dial, then writer, then reader. The reader lock is held
    // across a blocking read by design; `closed` is how close() gets a
    // blocked receive to let go.
    dial: Mutex<()>,
    writer: Mutex<Option<WriteHalf>>,
    reader: Mutex<Option<ReadHalf>>,
    closed: Notify,
}

impl Client {
    pub fn new(opts: ClientOptions) -> Client {
        Client {
            opts,
            tls: OnceCell::new(),
            dial: Mutex::new(()),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            closed: Notify::new(),
        }
    }

    pub fn address(&self) -> &str {
        &self.opts.address
    }

    /// Send one message, dialing first if there is no live connection.
    pub async fn send(&self, m: &Message) -> Result<(), ClientError> {
        loop {
            {
                let mut guard = self.writer.lock().await;
                if let Some(w) = guard.as_mut() {
                    let sent = write_message(w, m).await;
                    return match sent {
                        Ok(()) => Ok(()),
                        Err(e) => {
                            *guard = None;
                            Err(e.into())
                        }
                    };
                }
            }
            self.connect().await?;
        }
    }

    /// Receive one message. Blocks until a frame arrives, the peer closes
    /// the stream, or [`Client::close`] is called.
    pub async fn receive(&self) -> Result<Message, ClientError> {
        loop {
            {
                let mut guard = self.reader.lock().await;
                if let Some(mut r) = guard.take() {
                    // The read owns the half; a close drops it mid-frame,
                    // which is fine because the connection is gone anyway.
                    let read = async move {
                        let res = read_message(&mut r).await;
                        (r, res)
                    };
                    tokio::select! {
                        (r, res) = read => {
                            return match res {
                                Ok(m) => {
                                    *guard = Some(r);
                                    Ok(m)
                                }
                                Err(e) => Err(e.into()),
                            };
                        }
                        _ = self.closed.notified() => return Err(ClientError::Closed),
                    }
                }
            }
            self.connect().await?;
        }
    }

    /// Drop the current connection. A blocked receive returns
    /// [`ClientError::Closed`]; the next send or receive re-dials.
    pub async fn close(&self) {
        self.closed.notify_waiters();
        let mut guard = self.writer.lock().await;
        if let Some(w) = guard.as_mut() {
            // A clean shutdown sends FIN (and close_notify under TLS), which
            // also unblocks a receive that missed the notification.
            let _ = w.shutdown().await;
        }
        *guard = None;
    }

    async fn connect(&self) -> Result<(), ClientError> {
        let _dialing = self.dial.lock().await;
        let mut writer = self.writer.lock().await;
        let mut reader = self.reader.lock().await;
        if writer.is_some() && reader.is_some() {
            return Ok(());
        }
        let (r, w) = self.dial().await?;
        *reader = Some(r);
        *writer = Some(w);
        Ok(())
    }

    async fn dial(&self) -> Result<(ReadHalf, WriteHalf), ClientError> {
        let tcp = self.dial_tcp().await?;
        let config = self
            .tls
            .get_or_try_init(|| async { tls::client_config(self.opts.key_pair.as_ref()) })
            .await?
            .clone();
        let server_name = tls::server_name(&self.opts.address)?;
        let connector = TlsConnector::from(config);
        match timeout(self.opts.dial_timeout, connector.connect(server_name, tcp)).await {
            Ok(Ok(stream)) => {
                debug!(addr = %self.opts.address, "Connected over TLS");
                let (r, w) = tokio::io::split(stream);
                Ok((Box::new(r), Box::new(w)))
            }
            Ok(Err(e)) => self.maybe_fall_back(ClientError::Handshake(e.to_string())).await,
            Err(_) => {
                self.maybe_fall_back(ClientError::Handshake("handshake timed out".into()))
                    .await
            }
        }
    }

    async fn maybe_fall_back(
        &self,
        err: ClientError,
    ) -> Result<(ReadHalf, WriteHalf), ClientError> {
        if !self.opts.fallback_to_plain_tcp {
            return Err(err);
        }
        debug!(addr = %self.opts.address, error = %err, "Falling back to plain TCP");
        let tcp = self.dial_tcp().await?;
        let (r, w) = tcp.into_split();
        Ok((Box::new(r), Box::new(w)))
    }

    async fn dial_tcp(&self) -> Result<TcpStream, ClientError> {
        match timeout(self.opts.dial_timeout, TcpStream::connect(&self.opts.address)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ClientError::Transport(
                std::io::Error::new(ErrorKind::TimedOut, "dial timed out").to_string(),
            )),
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("address", &self.opts.address)
            .finish_non_exhaustive()
    }
}
