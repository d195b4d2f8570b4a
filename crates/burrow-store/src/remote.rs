//! Versioned store backed by a remote metadata server.
//!
//! One connection carries every request; replies are paired to callers by
//! tag, and tag-0 `PUT`s pushed by the server are applied to a local
//! write-through cache so reads of hot keys never leave the process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error};

use burrow_client::Client;
use burrow_proto::{Message, TagSequence};

use crate::{
    apply_message, ChangeListener, MemoryStore, Store, StoreError, VersionedStore,
    VersionedWrapper,
};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_RESPONSE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Clone, Default)]
pub struct RemoteOptions {
    pub request_timeout: Option<Duration>,
    pub response_backoff: Option<Duration>,
    pub auth_key: Option<String>,
    pub listener: Option<ChangeListener>,
}

impl RemoteOptions {
    pub fn with_request_timeout(mut self, value: Duration) -> RemoteOptions {
        self.request_timeout = Some(value);
        self
    }

    pub fn with_response_backoff(mut self, value: Duration) -> RemoteOptions {
        self.response_backoff = Some(value);
        self
    }

    pub fn with_auth_key(mut self, value: impl Into<String>) -> RemoteOptions {
        self.auth_key = Some(value.into());
        self
    }

    pub fn with_listener(mut self, value: ChangeListener) -> RemoteOptions {
        self.listener = Some(value);
        self
    }
}

/// [`VersionedStore`] implemented by a client of a remote metadata server.
pub struct RemoteVersionedStore {
    me: Weak<RemoteVersionedStore>,
    remote: Arc<Client>,
    tags: TagSequence,
    local: VersionedWrapper,
    opts: RemoteOptions,

    // Calls waiting for their tagged reply. Taken only to link or unlink,
    // never across I/O.
    pending: Mutex<HashMap<u16, oneshot::Sender<Message>>>,

    started: AtomicBool,
    stopped: AtomicBool,
    authorized: AtomicBool,
    receiver: Mutex<Option<JoinHandle<()>>>,

    // Counts in-flight do_request calls so stop() can drain them.
    in_flight: AtomicUsize,
    drained: Notify,
}

struct FlightGuard<'a>(&'a RemoteVersionedStore);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.0.drained.notify_waiters();
    }
}

impl RemoteVersionedStore {
    pub fn new(remote: Arc<Client>, opts: RemoteOptions) -> Arc<RemoteVersionedStore> {
        Arc::new_cyclic(|me| RemoteVersionedStore {
            me: me.clone(),
            remote,
            tags: TagSequence::new(),
            local: VersionedWrapper::new(Arc::new(MemoryStore::new())),
            opts,
            pending: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            authorized: AtomicBool::new(false),
            receiver: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        })
    }

    /// Spawn the receive loop. Idempotent; every request path calls it, so
    /// building a store has no side effects until it is first used.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let handle = tokio::spawn(me.receive_loop());
        *self.receiver.lock().unwrap() = Some(handle);
    }

    /// Stop the store: fail pending calls, close the connection, and wait
    /// for the receive loop and all in-flight requests to return.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.remote.close().await;
        self.pending.lock().unwrap().clear();
        let handle = self.receiver.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        loop {
            if self.in_flight.load(Ordering::Acquire) == 0 {
                break;
            }
            let notified = self.drained.notified();
            if self.in_flight.load(Ordering::Acquire) == 0 {
                break;
            }
            notified.await;
        }
    }

    fn request_timeout(&self) -> Duration {
        self.opts.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT)
    }

    fn response_backoff(&self) -> Duration {
        self.opts
            .response_backoff
            .unwrap_or(DEFAULT_RESPONSE_BACKOFF)
    }

    /// Send one request and wait for its tagged reply.
    async fn do_request(&self, request: Message) -> Result<Message, StoreError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(StoreError::Transport("store stopped".into()));
        }
        self.start();
        let _flight = {
            self.in_flight.fetch_add(1, Ordering::AcqRel);
            FlightGuard(self)
        };
        let tag = request.tag();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(tag, tx);
        if let Err(e) = self.remote.send(&request).await {
            self.pending.lock().unwrap().remove(&tag);
            return Err(StoreError::Transport(e.to_string()));
        }
        match timeout(self.request_timeout(), rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(StoreError::Transport("connection closed".into())),
            Err(_) => {
                self.pending.lock().unwrap().remove(&tag);
                // The request may just be slow rather than lost, but a
                // reply without a waiter is only noise; treat the
                // connection as wedged.
                self.remote.close().await;
                Err(StoreError::Timeout)
            }
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            match self.remote.receive().await {
                Ok(m) => self.dispatch(m).await,
                Err(e) => {
                    if self.stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    debug!(error = %e, "Receive error");
                    tokio::time::sleep(self.response_backoff()).await;
                }
            }
        }
    }

    async fn dispatch(&self, m: Message) {
        let tag = m.tag();
        if tag != 0 {
            debug!(message = %m, "Received response");
            let sender = self.pending.lock().unwrap().remove(&tag);
            match sender {
                Some(tx) => {
                    let _ = tx.send(m);
                }
                None => debug!(message = %m, "Response for no request?"),
            }
            return;
        }
        if let Message::Put { .. } = m {
            debug!(message = %m, "Received broadcast");
            let applied = apply_message(&self.local, &m).await;
            if let Message::Error { text, .. } = applied {
                error!(error = %text, "Could not apply broadcast locally");
            } else if let Some(listener) = &self.opts.listener {
                listener(&m);
            }
        }
    }

    async fn ensure_authorized(&self) -> Result<(), StoreError> {
        let Some(auth_key) = self.opts.auth_key.clone() else {
            return Ok(());
        };
        if self.authorized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let request = Message::auth(self.tags.next(), auth_key.into_bytes());
        let response = self
            .do_request(request)
            .await
            .map_err(|e| StoreError::Unauthorized(e.to_string()))?;
        match response {
            Message::Auth { .. } => {
                self.authorized.store(true, Ordering::SeqCst);
                Ok(())
            }
            Message::Error { text, .. } => Err(StoreError::Unauthorized(text)),
            other => Err(StoreError::Unauthorized(format!(
                "unexpected response kind: {}",
                other.kind()
            ))),
        }
    }

    fn note_rejection(&self, text: &str) {
        if text.contains("go away") {
            // Auth was revoked or never took; re-authorize lazily.
            self.authorized.store(false, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl VersionedStore for RemoteVersionedStore {
    async fn get(&self, key: &[u8]) -> Result<(u64, Vec<u8>), StoreError> {
        self.ensure_authorized().await?;
        if let Ok(hit) = self.local.get(key).await {
            return Ok(hit);
        }
        let response = self.do_request(Message::get(self.tags.next(), key)).await?;
        match response {
            Message::Put {
                value, version, ..
            } => {
                let cache = Message::put(0, key.to_vec(), value.clone(), version);
                if let Message::Error { text, .. } = apply_message(&self.local, &cache).await {
                    // A newer broadcast beat the reply here; keep the newer.
                    debug!(error = %text, "Reply not cached");
                }
                Ok((version, value))
            }
            Message::Error { text, .. } => {
                if text.ends_with("not found") {
                    return Err(StoreError::not_found(key));
                }
                self.note_rejection(&text);
                Err(StoreError::Remote(text))
            }
            other => Err(StoreError::Protocol(format!(
                "unexpected response kind: {}",
                other.kind()
            ))),
        }
    }

    async fn put(&self, version: u64, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.ensure_authorized().await?;
        let request = Message::put(self.tags.next(), key.to_vec(), value.to_vec(), version);
        let response = self.do_request(request.clone()).await?;
        match response {
            Message::Put { .. } => {
                if response != request {
                    error!(request = %request, response = %response, "Request and response do not match");
                    return Err(StoreError::Protocol(
                        "request and response do not match".into(),
                    ));
                }
                // The local cache is updated by the server's broadcast, not
                // here, so it never runs ahead of the committed sequence.
                Ok(())
            }
            Message::Error { text, .. } => {
                if text == StoreError::StalePut.to_string() {
                    return Err(StoreError::StalePut);
                }
                self.note_rejection(&text);
                Err(StoreError::Remote(text))
            }
            other => Err(StoreError::Protocol(format!(
                "unexpected response kind: {}",
                other.kind()
            ))),
        }
    }
}

/// Plain byte-KV view of a remote metadata server, for the `"remote"`
/// builder tag. Writes re-read the current version and retry a few times
/// when racing other writers.
pub struct RemoteStore {
    inner: Arc<RemoteVersionedStore>,
}

impl RemoteStore {
    pub fn new(inner: Arc<RemoteVersionedStore>) -> RemoteStore {
        RemoteStore { inner }
    }

    pub fn versioned(&self) -> &Arc<RemoteVersionedStore> {
        &self.inner
    }
}

#[async_trait]
impl Store for RemoteStore {
    async fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        let (_, value) = self.inner.get(key).await?;
        Ok(value)
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        for _ in 0..3 {
            let current = match self.inner.get(key).await {
                Ok((version, _)) => version,
                Err(e) if e.is_not_found() => 0,
                Err(e) => return Err(e),
            };
            match self.inner.put(current + 1, key, value).await {
                Ok(()) => return Ok(()),
                Err(StoreError::StalePut) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::StalePut)
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::net::{TcpListener, TcpStream};

    use burrow_client::ClientOptions;
    use burrow_proto::{read_message, write_message};

    use super::*;

    /// One-connection protocol server. The client always probes with a TLS
    /// ClientHello first; connections whose first byte is not a message
    /// kind are dropped, which is what makes the client fall back.
    async fn scripted_server<F, Fut>(script: F) -> SocketAddr
    where
        F: FnOnce(TcpStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let mut probe = [0u8; 1];
                match timeout(Duration::from_millis(200), stream.peek(&mut probe)).await {
                    Ok(Ok(n)) if n > 0 && burrow_proto::Kind::from_wire(probe[0]).is_none() => {
                        continue;
                    }
                    _ => {
                        script(stream).await;
                        return;
                    }
                }
            }
        });
        addr
    }

    fn store_for(addr: SocketAddr, opts: RemoteOptions) -> Arc<RemoteVersionedStore> {
        let client = Arc::new(Client::new(
            ClientOptions::new(addr.to_string()).with_fallback_to_plain_tcp(),
        ));
        RemoteVersionedStore::new(client, opts)
    }

    #[tokio::test]
    async fn put_succeeds_on_exact_echo() {
        let addr = scripted_server(|mut stream| async move {
            let m = read_message(&mut stream).await.unwrap();
            write_message(&mut stream, &m).await.unwrap();
            // Stay open so the receive loop does not spin on EOF.
            let _ = read_message(&mut stream).await;
        })
        .await;
        let store = store_for(addr, RemoteOptions::default());
        store.put(1, b"name", b"tony").await.unwrap();
        store.stop().await;
    }

    #[tokio::test]
    async fn stale_put_text_maps_to_stale_put() {
        let addr = scripted_server(|mut stream| async move {
            let m = read_message(&mut stream).await.unwrap();
            write_message(&mut stream, &Message::error(m.tag(), "stale put"))
                .await
                .unwrap();
            let _ = read_message(&mut stream).await;
        })
        .await;
        let store = store_for(addr, RemoteOptions::default());
        match store.put(1, b"name", b"tony").await {
            Err(StoreError::StalePut) => {}
            other => panic!("unexpected result: {other:?}"),
        }
        store.stop().await;
    }

    #[tokio::test]
    async fn not_found_suffix_maps_to_not_found() {
        let addr = scripted_server(|mut stream| async move {
            let m = read_message(&mut stream).await.unwrap();
            write_message(
                &mut stream,
                &Message::error(m.tag(), "\"surname\": not found"),
            )
            .await
            .unwrap();
            let _ = read_message(&mut stream).await;
        })
        .await;
        let store = store_for(addr, RemoteOptions::default());
        assert!(store.get(b"surname").await.unwrap_err().is_not_found());
        store.stop().await;
    }

    #[tokio::test]
    async fn unanswered_requests_time_out() {
        let addr = scripted_server(|mut stream| async move {
            // Swallow the request and never reply.
            let _ = read_message(&mut stream).await;
            let _ = read_message(&mut stream).await;
        })
        .await;
        let store = store_for(
            addr,
            RemoteOptions::default().with_request_timeout(Duration::from_millis(50)),
        );
        match store.put(1, b"k", b"v").await {
            Err(StoreError::Timeout) => {}
            other => panic!("unexpected result: {other:?}"),
        }
        store.stop().await;
    }

    #[tokio::test]
    async fn broadcasts_fill_the_local_cache_and_notify() {
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        let listener: ChangeListener = Arc::new(move |m: &Message| {
            let _ = seen_tx.send(m.clone());
        });
        let addr = scripted_server(|mut stream| async move {
            write_message(&mut stream, &Message::put(0, "name", "tony", 7))
                .await
                .unwrap();
            let _ = read_message(&mut stream).await;
        })
        .await;
        let store = store_for(addr, RemoteOptions::default().with_listener(listener));
        store.start();
        let broadcast = seen_rx.recv().await.unwrap();
        assert_eq!(broadcast, Message::put(0, "name", "tony", 7));
        // Served from the local cache: the scripted server never answers a GET.
        assert_eq!(
            store.get(b"name").await.unwrap(),
            (7, b"tony".to_vec())
        );
        store.stop().await;
    }
}
