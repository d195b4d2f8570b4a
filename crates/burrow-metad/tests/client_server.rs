//! Client/server integration over real sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use burrow_client::{Client, ClientOptions};
use burrow_metad::{Server, ServerOptions};
use burrow_proto::Message;
use burrow_store::{
    ChangeListener, MemoryStore, RemoteOptions, RemoteVersionedStore, StoreError, VersionedStore,
    VersionedWrapper,
};

// A possible hash for "foobar".
const FOOBAR_HASH: &str = "$2a$10$xdMaS2UL7abbg2sgnjhR3.aOXpKlg4R3z2XRQoA9MRRTF0I5NrDNy";

async fn start_server(auth_hash: Option<&str>) -> (Arc<Server>, SocketAddr) {
    let mut opts = ServerOptions::new("localhost:0")
        .with_store(Arc::new(VersionedWrapper::new(Arc::new(MemoryStore::new()))));
    if let Some(hash) = auth_hash {
        opts = opts.with_auth_hash(hash);
    }
    let server = Arc::new(Server::new(opts));
    let addr = server.listen().await.unwrap();
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve().await.unwrap();
    });
    (server, addr)
}

fn remote_store(addr: SocketAddr, opts: RemoteOptions) -> Arc<RemoteVersionedStore> {
    let client = Arc::new(Client::new(
        ClientOptions::new(addr.to_string()).with_fallback_to_plain_tcp(),
    ));
    RemoteVersionedStore::new(client, opts)
}

#[tokio::test]
async fn default_client_fails_against_a_plain_tcp_server() {
    let (server, addr) = start_server(None).await;
    let client = Client::new(ClientOptions::new(addr.to_string()));
    let err = client.send(&Message::get(1, "name")).await.unwrap_err();
    assert!(
        err.to_string().contains("handshake"),
        "error should mention the handshake: {err}"
    );
    server.shutdown();
}

#[tokio::test]
async fn client_falls_back_to_plain_tcp_when_configured() {
    let (server, addr) = start_server(None).await;
    let client = Client::new(ClientOptions::new(addr.to_string()).with_fallback_to_plain_tcp());
    client.send(&Message::put(12, "name", "tony", 1)).await.unwrap();
    client.close().await;
    server.shutdown();
}

#[tokio::test]
async fn auth_flow_over_the_wire() {
    let (server, addr) = start_server(Some(FOOBAR_HASH)).await;
    let client = Client::new(ClientOptions::new(addr.to_string()).with_fallback_to_plain_tcp());

    client.send(&Message::auth(1, "foobar")).await.unwrap();
    assert_eq!(client.receive().await.unwrap(), Message::auth(1, ""));

    client.send(&Message::put(2, "name", "tony", 1)).await.unwrap();
    assert_eq!(
        client.receive().await.unwrap(),
        Message::put(2, "name", "tony", 1)
    );

    client.close().await;
    server.shutdown();
}

#[tokio::test]
async fn unauthorized_messages_are_sent_away() {
    let (server, addr) = start_server(Some(FOOBAR_HASH)).await;
    let client = Client::new(ClientOptions::new(addr.to_string()).with_fallback_to_plain_tcp());

    client.send(&Message::put(1, "name", "tony", 1)).await.unwrap();
    assert_eq!(
        client.receive().await.unwrap(),
        Message::error(1, "go away")
    );
    client.send(&Message::auth(2, "not foobar")).await.unwrap();
    assert_eq!(
        client.receive().await.unwrap(),
        Message::error(2, "go away")
    );

    client.close().await;
    server.shutdown();
}

#[tokio::test]
async fn remote_store_round_trip() {
    let (server, addr) = start_server(None).await;
    let store = remote_store(addr, RemoteOptions::default());

    store.put(1, b"name", b"tony").await.unwrap();
    assert_eq!(store.get(b"name").await.unwrap(), (1, b"tony".to_vec()));
    assert!(store.get(b"surname").await.unwrap_err().is_not_found());

    match store.put(1, b"name", b"mark").await {
        Err(StoreError::StalePut) => {}
        other => panic!("unexpected result: {other:?}"),
    }

    store.stop().await;
    server.shutdown();
}

#[tokio::test]
async fn remote_store_authorizes_lazily() {
    let (server, addr) = start_server(Some(FOOBAR_HASH)).await;
    let store = remote_store(addr, RemoteOptions::default().with_auth_key("foobar"));

    store.put(1, b"name", b"tony").await.unwrap();
    assert_eq!(store.get(b"name").await.unwrap(), (1, b"tony".to_vec()));

    store.stop().await;
    server.shutdown();
}

#[tokio::test]
async fn remote_store_with_wrong_key_fails_closed() {
    let (server, addr) = start_server(Some(FOOBAR_HASH)).await;
    let store = remote_store(addr, RemoteOptions::default().with_auth_key("nope"));

    match store.put(1, b"name", b"tony").await {
        Err(StoreError::Unauthorized(_)) => {}
        other => panic!("unexpected result: {other:?}"),
    }

    store.stop().await;
    server.shutdown();
}

#[tokio::test]
async fn committed_puts_are_broadcast_to_other_clients() {
    let (server, addr) = start_server(None).await;

    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    let listener: ChangeListener = Arc::new(move |m: &Message| {
        let _ = seen_tx.send(m.clone());
    });

    let watcher = remote_store(addr, RemoteOptions::default().with_listener(listener));
    // Subscribe before the write: an idle store only connects once started.
    watcher.start();
    // The watcher must be connected before the commit or it misses the push.
    watcher.put(1, b"presence", b"here").await.unwrap();

    let writer = remote_store(addr, RemoteOptions::default());
    writer.put(1, b"name", b"tony").await.unwrap();

    let broadcast = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
        .await
        .expect("broadcast should arrive")
        .unwrap();
    assert_eq!(broadcast, Message::put(0, "name", "tony", 1));

    // The broadcast filled the watcher's cache; this get is local.
    assert_eq!(watcher.get(b"name").await.unwrap(), (1, b"tony".to_vec()));

    writer.stop().await;
    watcher.stop().await;
    server.shutdown();
}
