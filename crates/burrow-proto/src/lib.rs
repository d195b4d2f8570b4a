//! # burrow-proto
//!
//! Wire protocol for the burrow metadata service.
//!
//! Four message kinds travel between node engines and the metadata server:
//! `GET`, `PUT`, `ERROR` and `AUTH`. Replies reuse the request's tag; tag 0
//! is reserved for server-initiated broadcasts of committed `PUT`s.
//!
//! Frame layout, big-endian:
//!
//! ```text
//! kind: u8, tag: u16, key_len: u16, key, value_len: u32, value
//! [, version: u64 when kind = PUT]
//! ```

mod codec;
mod tags;

pub use codec::{read_message, write_message, Decoder, Encoder};
pub use tags::TagSequence;

use std::fmt;

/// Upper bound on a frame's value field. Anything larger is treated as a
/// protocol violation rather than an allocation request.
pub const MAX_VALUE_LEN: u32 = 64 * 1024 * 1024;

/// Discriminants on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Kind {
    Get = 1,
    Put = 2,
    Error = 3,
    Auth = 4,
}

impl Kind {
    pub fn from_wire(b: u8) -> Option<Kind> {
        match b {
            1 => Some(Kind::Get),
            2 => Some(Kind::Put),
            3 => Some(Kind::Error),
            4 => Some(Kind::Auth),
            _ => None,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Kind::Get => "GET",
            Kind::Put => "PUT",
            Kind::Error => "ERROR",
            Kind::Auth => "AUTH",
        };
        f.write_str(s)
    }
}

/// One protocol message. Keys and values are opaque byte strings; the
/// `ERROR` payload is human-readable text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Get {
        tag: u16,
        key: Vec<u8>,
    },
    Put {
        tag: u16,
        key: Vec<u8>,
        value: Vec<u8>,
        version: u64,
    },
    Error {
        tag: u16,
        text: String,
    },
    Auth {
        tag: u16,
        secret: Vec<u8>,
    },
}

impl Message {
    pub fn get(tag: u16, key: impl Into<Vec<u8>>) -> Message {
        Message::Get {
            tag,
            key: key.into(),
        }
    }

    pub fn put(
        tag: u16,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        version: u64,
    ) -> Message {
        Message::Put {
            tag,
            key: key.into(),
            value: value.into(),
            version,
        }
    }

    pub fn error(tag: u16, text: impl Into<String>) -> Message {
        Message::Error {
            tag,
            text: text.into(),
        }
    }

    pub fn auth(tag: u16, secret: impl Into<Vec<u8>>) -> Message {
        Message::Auth {
            tag,
            secret: secret.into(),
        }
    }

    pub fn kind(&self) -> Kind {
        match self {
            Message::Get { .. } => Kind::Get,
            Message::Put { .. } => Kind::Put,
            Message::Error { .. } => Kind::Error,
            Message::Auth { .. } => Kind::Auth,
        }
    }

    pub fn tag(&self) -> u16 {
        match self {
            Message::Get { tag, .. }
            | Message::Put { tag, .. }
            | Message::Error { tag, .. }
            | Message::Auth { tag, .. } => *tag,
        }
    }
}

/// Values are elided after 8 characters so log lines stay one line.
fn abbreviate(s: &str) -> String {
    if s.chars().count() > 8 {
        let head: String = s.chars().take(8).collect();
        format!("{head}...")
    } else {
        s.to_owned()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Get { tag, key } => {
                write!(f, "kind=GET tag={tag} key={}", String::from_utf8_lossy(key))
            }
            Message::Put {
                tag,
                key,
                value,
                version,
            } => write!(
                f,
                "kind=PUT tag={tag} key={} value={} version={version}",
                String::from_utf8_lossy(key),
                abbreviate(&String::from_utf8_lossy(value)),
            ),
            Message::Error { tag, text } => {
                write!(f, "kind=ERROR tag={tag} value={}", abbreviate(text))
            }
            Message::Auth { tag, secret } => {
                write!(f, "kind=AUTH tag={tag} value={}", !secret.is_empty())
            }
        }
    }
}

/// Errors surfaced by the codec.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown message kind: {0:#x}")]
    UnknownKind(u8),
    #[error("frame value length {0} exceeds limit")]
    FrameTooLarge(u32),
}

impl ProtoError {
    /// True when the peer closed the stream cleanly between frames.
    pub fn is_eof(&self) -> bool {
        matches!(self, ProtoError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}
