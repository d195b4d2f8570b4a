//! Per-connection protocol handling.
//!
//! A connection starts unauthorized when the server carries a password
//! hash, authorized otherwise. Unauthorized peers get `"go away"` for
//! everything except a correct `AUTH`. Authorized traffic is applied to
//! the versioned store; committed puts are echoed to the sender and pushed
//! to every other subscriber as a tag-0 broadcast.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use burrow_proto::{read_message, write_message, Message, ProtoError};
use burrow_store::apply_message;

use crate::Shared;

pub(crate) async fn handle(
    stream: TcpStream,
    acceptor: Option<TlsAcceptor>,
    shared: Arc<Shared>,
    token: CancellationToken,
) -> Result<(), ProtoError> {
    match acceptor {
        Some(acceptor) => {
            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(error = %e, "TLS accept failed");
                    return Ok(());
                }
            };
            let (reader, writer) = tokio::io::split(stream);
            serve_conn(reader, writer, shared, token).await
        }
        None => {
            let (reader, writer) = stream.into_split();
            serve_conn(reader, writer, shared, token).await
        }
    }
}

struct ConnState {
    conn_id: u64,
    authorized: bool,
    subscribed: bool,
}

async fn serve_conn<R, W>(
    mut reader: R,
    mut writer: W,
    shared: Arc<Shared>,
    token: CancellationToken,
) -> Result<(), ProtoError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // Replies and broadcasts funnel through one channel so a single writer
    // owns the stream and frames never interleave.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let mut state = ConnState {
        conn_id: shared.next_conn_id(),
        authorized: shared.auth_hash.is_none(),
        subscribed: false,
    };
    if state.authorized {
        shared.subscribe(state.conn_id, out_tx.clone());
        state.subscribed = true;
    }

    let write_loop = async {
        while let Some(m) = out_rx.recv().await {
            write_message(&mut writer, &m).await?;
        }
        Ok::<(), ProtoError>(())
    };

    let read_loop = async {
        let result = loop {
            tokio::select! {
                _ = token.cancelled() => break Ok(()),
                incoming = read_message(&mut reader) => {
                    let m = match incoming {
                        Ok(m) => m,
                        Err(e) if e.is_eof() => break Ok(()),
                        Err(e) => {
                            warn!(error = %e, "Dropping client after protocol error");
                            break Ok(());
                        }
                    };
                    let response = respond(&shared, &mut state, &out_tx, m).await;
                    if out_tx.send(response).is_err() {
                        break Ok(());
                    }
                }
            }
        };
        // Dropping every sender lets the writer drain and finish.
        if state.subscribed {
            shared.unsubscribe(state.conn_id);
        }
        drop(out_tx);
        result
    };

    let (wrote, read) = tokio::join!(write_loop, read_loop);
    read.and(wrote)
}

async fn respond(
    shared: &Shared,
    state: &mut ConnState,
    bcast_tx: &mpsc::UnboundedSender<Message>,
    m: Message,
) -> Message {
    if !state.authorized {
        if let Message::Auth { tag, secret } = &m {
            let hash = shared.auth_hash.as_deref().unwrap_or_default();
            if bcrypt::verify(secret, hash).unwrap_or(false) {
                state.authorized = true;
                shared.subscribe(state.conn_id, bcast_tx.clone());
                state.subscribed = true;
                return Message::auth(*tag, "");
            }
        }
        return Message::error(m.tag(), "go away");
    }
    let Some(store) = &shared.store else {
        return Message::error(m.tag(), "no store configured");
    };
    let response = apply_message(store.as_ref(), &m).await;
    if matches!(m, Message::Put { .. }) && matches!(response, Message::Put { .. }) {
        shared.broadcast_from(state.conn_id, &m);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    use burrow_proto::{Decoder, Encoder};
    use burrow_store::{MemoryStore, VersionedWrapper};

    // A possible hash for "foobar".
    const FOOBAR_HASH: &str = "$2a$10$xdMaS2UL7abbg2sgnjhR3.aOXpKlg4R3z2XRQoA9MRRTF0I5NrDNy";

    fn shared(auth_hash: Option<&str>) -> Arc<Shared> {
        let opts = crate::ServerOptions::new("localhost:0")
            .with_store(Arc::new(VersionedWrapper::new(Arc::new(MemoryStore::new()))));
        let opts = match auth_hash {
            Some(hash) => opts.with_auth_hash(hash),
            None => opts,
        };
        crate::Server::new(opts).shared.clone()
    }

    async fn exchange(shared: Arc<Shared>, requests: &[Message]) -> (Vec<Message>, bool) {
        let mut encoder = Encoder::new();
        let mut input = Vec::new();
        for m in requests {
            encoder.encode(&mut input, m).unwrap();
        }
        let mut output = Vec::new();
        let token = CancellationToken::new();
        serve_conn(Cursor::new(input), &mut output, shared.clone(), token)
            .await
            .unwrap();
        let mut responses = Vec::new();
        let mut decoder = Decoder::new();
        let mut cursor = Cursor::new(output);
        loop {
            match decoder.decode(&mut cursor) {
                Ok(m) => responses.push(m),
                Err(e) if e.is_eof() => break,
                Err(e) => panic!("{e}"),
            }
        }
        // serve_conn consumed the state; authorization shows in replies.
        let authorized = responses
            .iter()
            .any(|m| matches!(m, Message::Auth { .. } | Message::Put { .. }));
        (responses, authorized)
    }

    #[tokio::test]
    async fn without_auth_puts_and_gets_work_right_away() {
        let (responses, _) = exchange(
            shared(None),
            &[
                Message::put(1, "name", "tony", 1),
                Message::get(2, "name"),
                Message::get(3, "surname"),
            ],
        )
        .await;
        assert_eq!(
            responses,
            vec![
                Message::put(1, "name", "tony", 1),
                Message::put(2, "name", "tony", 1),
                Message::error(3, r#""surname": not found"#),
            ]
        );
    }

    #[tokio::test]
    async fn without_auth_auth_messages_get_an_error() {
        let (responses, _) = exchange(
            shared(None),
            &[Message::auth(1, "hello"), Message::auth(2, "world")],
        )
        .await;
        assert_eq!(
            responses,
            vec![
                Message::error(1, "messages of kind AUTH cannot be applied"),
                Message::error(2, "messages of kind AUTH cannot be applied"),
            ]
        );
    }

    #[tokio::test]
    async fn with_auth_everything_is_go_away_until_the_right_secret() {
        for request in [
            Message::get(1, "name"),
            Message::put(1, "name", "tony", 1),
            Message::error(1, "noise"),
            Message::auth(1, "wrong"),
        ] {
            let (responses, _) = exchange(shared(Some(FOOBAR_HASH)), &[request]).await;
            assert_eq!(responses, vec![Message::error(1, "go away")]);
        }
    }

    #[tokio::test]
    async fn with_auth_the_right_secret_authorizes_the_connection() {
        let (responses, authorized) = exchange(
            shared(Some(FOOBAR_HASH)),
            &[
                Message::auth(1, "foobar"),
                Message::put(2, "name", "tony", 1),
            ],
        )
        .await;
        assert_eq!(
            responses,
            vec![Message::auth(1, ""), Message::put(2, "name", "tony", 1)]
        );
        assert!(authorized);
    }

    #[tokio::test]
    async fn stale_puts_are_reported() {
        let shared = shared(None);
        let (responses, _) = exchange(
            shared.clone(),
            &[
                Message::put(1, "name", "tony", 2),
                Message::put(2, "name", "mark", 1),
            ],
        )
        .await;
        assert_eq!(
            responses,
            vec![
                Message::put(1, "name", "tony", 2),
                Message::error(2, "stale put"),
            ]
        );
    }
}
