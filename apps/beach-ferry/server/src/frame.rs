//! Bus envelope for relayed frames: one kind byte, then the payload untouched.

use axum::extract::ws::Message;
use bytes::{BufMut, Bytes, BytesMut};

const TEXT: u8 = b'T';
const BINARY: u8 = b'B';

/// Wraps a data frame for the bus. Control frames are not relayed.
pub fn encode(message: &Message) -> Option<Bytes> {
    let (kind, body) = match message {
        Message::Text(text) => (TEXT, text.as_bytes()),
        Message::Binary(bytes) => (BINARY, bytes.as_slice()),
        _ => return None,
    };
    let mut buf = BytesMut::with_capacity(body.len() + 1);
    buf.put_u8(kind);
    buf.put_slice(body);
    Some(buf.freeze())
}

/// Recovers the original frame, or `None` for a foreign or corrupt envelope.
pub fn decode(envelope: &[u8]) -> Option<Message> {
    let (&kind, body) = envelope.split_first()?;
    match kind {
        TEXT => std::str::from_utf8(body)
            .ok()
            .map(|text| Message::Text(text.to_owned())),
        BINARY => Some(Message::Binary(body.to_vec())),
        _ => None,
    }
}

pub fn payload_len(message: &Message) -> usize {
    match message {
        Message::Text(text) => text.len(),
        Message::Binary(bytes) => bytes.len(),
        _ => 0,
    }
}
