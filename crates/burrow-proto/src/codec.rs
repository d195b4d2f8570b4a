//! Frame packing and unpacking.
//!
//! Encoders and decoders carry their own scratch buffers so a long-lived
//! instance and a freshly constructed one are interchangeable.

use std::io::{Read, Write};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Kind, Message, ProtoError, MAX_VALUE_LEN};

fn pack_into(buf: &mut Vec<u8>, m: &Message) {
    buf.clear();
    buf.push(m.kind() as u8);
    buf.extend_from_slice(&m.tag().to_be_bytes());
    let (key, value): (&[u8], &[u8]) = match m {
        Message::Get { key, .. } => (key, b""),
        Message::Put { key, value, .. } => (key, value),
        Message::Error { text, .. } => (b"", text.as_bytes()),
        Message::Auth { secret, .. } => (b"", secret),
    };
    buf.extend_from_slice(&(key.len() as u16).to_be_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
    buf.extend_from_slice(value);
    if let Message::Put { version, .. } = m {
        buf.extend_from_slice(&version.to_be_bytes());
    }
}

fn assemble(kind: Kind, tag: u16, key: Vec<u8>, value: Vec<u8>, version: u64) -> Message {
    match kind {
        Kind::Get => Message::Get { tag, key },
        Kind::Put => Message::Put {
            tag,
            key,
            value,
            version,
        },
        Kind::Error => Message::Error {
            tag,
            text: String::from_utf8_lossy(&value).into_owned(),
        },
        Kind::Auth => Message::Auth { tag, secret: value },
    }
}

/// Packs messages onto a byte sink.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Encoder {
        Encoder::default()
    }

    /// Write one frame. The whole frame is assembled first so a partial
    /// write cannot leave half a message on the wire buffer.
    pub fn encode<W: Write>(&mut self, w: &mut W, m: &Message) -> Result<(), ProtoError> {
        pack_into(&mut self.buf, m);
        w.write_all(&self.buf)?;
        Ok(())
    }

    /// Pack one frame and return it as a slice valid until the next call.
    pub fn frame(&mut self, m: &Message) -> &[u8] {
        pack_into(&mut self.buf, m);
        &self.buf
    }
}

/// Unpacks messages from a byte source.
#[derive(Debug, Default)]
pub struct Decoder {
    scratch: [u8; 8],
}

impl Decoder {
    pub fn new() -> Decoder {
        Decoder::default()
    }

    pub fn decode<R: Read>(&mut self, r: &mut R) -> Result<Message, ProtoError> {
        r.read_exact(&mut self.scratch[..1])?;
        let kind =
            Kind::from_wire(self.scratch[0]).ok_or(ProtoError::UnknownKind(self.scratch[0]))?;
        r.read_exact(&mut self.scratch[..2])?;
        let tag = u16::from_be_bytes([self.scratch[0], self.scratch[1]]);
        r.read_exact(&mut self.scratch[..2])?;
        let key_len = u16::from_be_bytes([self.scratch[0], self.scratch[1]]) as usize;
        let mut key = vec![0u8; key_len];
        r.read_exact(&mut key)?;
        r.read_exact(&mut self.scratch[..4])?;
        let value_len = u32::from_be_bytes([
            self.scratch[0],
            self.scratch[1],
            self.scratch[2],
            self.scratch[3],
        ]);
        if value_len > MAX_VALUE_LEN {
            return Err(ProtoError::FrameTooLarge(value_len));
        }
        let mut value = vec![0u8; value_len as usize];
        r.read_exact(&mut value)?;
        let mut version = 0;
        if kind == Kind::Put {
            r.read_exact(&mut self.scratch[..8])?;
            version = u64::from_be_bytes(self.scratch);
        }
        Ok(assemble(kind, tag, key, value, version))
    }
}

/// Read one frame from an async stream. Mirrors [`Decoder::decode`].
pub async fn read_message<R: AsyncRead + Unpin>(r: &mut R) -> Result<Message, ProtoError> {
    let kind_byte = r.read_u8().await?;
    let kind = Kind::from_wire(kind_byte).ok_or(ProtoError::UnknownKind(kind_byte))?;
    let tag = r.read_u16().await?;
    let key_len = r.read_u16().await? as usize;
    let mut key = vec![0u8; key_len];
    r.read_exact(&mut key).await?;
    let value_len = r.read_u32().await?;
    if value_len > MAX_VALUE_LEN {
        return Err(ProtoError::FrameTooLarge(value_len));
    }
    let mut value = vec![0u8; value_len as usize];
    r.read_exact(&mut value).await?;
    let mut version = 0;
    if kind == Kind::Put {
        version = r.read_u64().await?;
    }
    Ok(assemble(kind, tag, key, value, version))
}

/// Write one frame to an async stream.
pub async fn write_message<W: AsyncWrite + Unpin>(
    w: &mut W,
    m: &Message,
) -> Result<(), ProtoError> {
    let mut buf = Vec::new();
    pack_into(&mut buf, m);
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use proptest::collection::vec;
    use proptest::prelude::*;

    use super::*;

    fn arb_message() -> impl Strategy<Value = Message> {
        prop_oneof![
            (any::<u16>(), vec(any::<u8>(), 0..64)).prop_map(|(tag, key)| Message::get(tag, key)),
            (
                any::<u16>(),
                vec(any::<u8>(), 0..64),
                vec(any::<u8>(), 0..256),
                any::<u64>()
            )
                .prop_map(|(tag, key, value, version)| Message::put(tag, key, value, version)),
            (any::<u16>(), "\\PC{0,40}").prop_map(|(tag, text)| Message::error(tag, text)),
            (any::<u16>(), vec(any::<u8>(), 0..64))
                .prop_map(|(tag, secret)| Message::auth(tag, secret)),
        ]
    }

    proptest! {
        #[test]
        fn what_you_encode_is_what_you_decode(m in arb_message()) {
            let mut buf = Vec::new();
            Encoder::new().encode(&mut buf, &m).unwrap();
            let out = Decoder::new().decode(&mut Cursor::new(&buf)).unwrap();
            prop_assert_eq!(out, m);
        }

        #[test]
        fn shared_codec_behaves_like_a_fresh_one(msgs in vec(arb_message(), 1..16)) {
            let mut encoder = Encoder::new();
            let mut decoder = Decoder::new();
            let mut buf = Vec::new();
            for m in &msgs {
                encoder.encode(&mut buf, m).unwrap();
            }
            let mut cursor = Cursor::new(&buf);
            for m in &msgs {
                let out = decoder.decode(&mut cursor).unwrap();
                prop_assert_eq!(&out, m);
            }
            prop_assert_eq!(cursor.position() as usize, buf.len());
        }
    }

    #[tokio::test]
    async fn async_framing_matches_sync_framing() {
        let messages = [
            Message::get(7, "k"),
            Message::put(8, "k", "v", 3),
            Message::error(9, "boom"),
            Message::auth(10, "pw"),
        ];
        let mut buf = Vec::new();
        for m in &messages {
            write_message(&mut buf, m).await.unwrap();
        }
        let mut sync_cursor = Cursor::new(buf.clone());
        let mut decoder = Decoder::new();
        let mut async_cursor = Cursor::new(buf);
        for m in &messages {
            assert_eq!(&decoder.decode(&mut sync_cursor).unwrap(), m);
            assert_eq!(&read_message(&mut async_cursor).await.unwrap(), m);
        }
    }

    #[test]
    fn decode_rejects_unknown_kind() {
        // A TLS ClientHello starts with 0x16; the decoder must refuse it.
        let mut cursor = Cursor::new(vec![0x16, 0x03, 0x01, 0x00, 0x00]);
        match Decoder::new().decode(&mut cursor) {
            Err(ProtoError::UnknownKind(0x16)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_oversize_value() {
        let mut buf = Vec::new();
        buf.push(Kind::Error as u8);
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&u32::MAX.to_be_bytes());
        match Decoder::new().decode(&mut Cursor::new(buf)) {
            Err(ProtoError::FrameTooLarge(_)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
