//! Framing: length-prefix (4 bytes LE) + type tag (1 byte) + bincode body.

use std::io::{Read, Write};

use serde::Serialize;

use crate::protocol::{Message, MessageTag};
use crate::types::{Key, Node, Seed};

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode a message body: tag byte followed by the bincode payload.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    fn body<T: Serialize>(tag: MessageTag, value: &T) -> Result<Vec<u8>, FrameEncodeError> {
        let mut out = vec![tag as u8];
        bincode::serialize_into(&mut out, value)?;
        Ok(out)
    }
    let out = match msg {
        Message::Alive | Message::Cancel => vec![msg.tag() as u8],
        Message::Ping(n) | Message::Pong(n) => body(msg.tag(), n)?,
        Message::Nodes(v) => body(msg.tag(), v)?,
        Message::BlocksLink(v) | Message::BlocksRequest(v) => body(msg.tag(), v)?,
        Message::Block { key, value } => body(msg.tag(), &(key, value))?,
        Message::SeedsRequest(v) => body(msg.tag(), v)?,
        Message::Seeds(v) => body(msg.tag(), v)?,
    };
    if out.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    Ok(out)
}

/// Decode a message body produced by `encode_message`.
pub fn decode_message(bytes: &[u8]) -> Result<Message, FrameDecodeError> {
    let (&tag, rest) = bytes.split_first().ok_or(FrameDecodeError::Empty)?;
    let tag = MessageTag::from_u8(tag).ok_or(FrameDecodeError::UnknownTag(tag))?;
    let msg = match tag {
        MessageTag::Alive => Message::Alive,
        MessageTag::Cancel => Message::Cancel,
        MessageTag::Ping => Message::Ping(bincode::deserialize(rest)?),
        MessageTag::Pong => Message::Pong(bincode::deserialize(rest)?),
        MessageTag::Nodes => Message::Nodes(bincode::deserialize::<Vec<Node>>(rest)?),
        MessageTag::BlocksLink => Message::BlocksLink(bincode::deserialize::<Vec<Key>>(rest)?),
        MessageTag::BlocksRequest => {
            Message::BlocksRequest(bincode::deserialize::<Vec<Key>>(rest)?)
        }
        MessageTag::Block => {
            let (key, value): (Key, Vec<u8>) = bincode::deserialize(rest)?;
            Message::Block { key, value }
        }
        MessageTag::SeedsRequest => Message::SeedsRequest(bincode::deserialize(rest)?),
        MessageTag::Seeds => Message::Seeds(bincode::deserialize::<Vec<Seed>>(rest)?),
    };
    if !msg.within_limits() {
        return Err(FrameDecodeError::TooManyElements(tag));
    }
    Ok(msg)
}

/// Error encoding a message into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Write one length-prefixed payload to a blocking stream.
pub fn write_prefixed<W: Write>(w: &mut W, payload: &[u8]) -> std::io::Result<()> {
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "frame too large",
        ));
    }
    w.write_all(&(payload.len() as u32).to_le_bytes())?;
    w.write_all(payload)?;
    w.flush()
}

/// Read one length-prefixed payload from a blocking stream.
pub fn read_prefixed<R: Read>(r: &mut R) -> std::io::Result<Vec<u8>> {
    let mut len = [0u8; LEN_SIZE];
    r.read_exact(&mut len)?;
    let len = u32::from_le_bytes(len);
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame too large",
        ));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Error decoding a message body.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("empty frame")]
    Empty,
    #[error("unknown message tag {0}")]
    UnknownTag(u8),
    #[error("{0:?} exceeds its element limit")]
    TooManyElements(MessageTag),
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}
