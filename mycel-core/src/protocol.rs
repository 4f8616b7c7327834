//! Mycel wire protocol: message types, type tags, handshake records and list limits.

use serde::{Deserialize, Serialize};

use crate::types::{Key, Node, Seed};

/// Protocol version flags. A connection proceeds on the highest common bit.
pub const PROTOCOL_VERSION_1: u32 = 1 << 0;

/// Versions this build speaks.
pub const SUPPORTED_VERSIONS: u32 = PROTOCOL_VERSION_1;

pub const MAX_NODES: usize = 1024;
pub const MAX_KEYS: usize = 8192;
pub const MAX_SIGNATURES: usize = 1024;
pub const MAX_SEEDS: usize = 1024;
/// Ping/Pong nonces and session ids are capped at this many bytes.
pub const MAX_NONCE_LEN: usize = 32;
pub const MAX_SESSION_ID_LEN: usize = 32;

/// One-byte tag that precedes every message body on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageTag {
    Alive = 0,
    Cancel = 1,
    Ping = 2,
    Pong = 3,
    Nodes = 4,
    BlocksLink = 5,
    BlocksRequest = 6,
    Block = 7,
    SeedsRequest = 8,
    Seeds = 9,
}

impl MessageTag {
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => MessageTag::Alive,
            1 => MessageTag::Cancel,
            2 => MessageTag::Ping,
            3 => MessageTag::Pong,
            4 => MessageTag::Nodes,
            5 => MessageTag::BlocksLink,
            6 => MessageTag::BlocksRequest,
            7 => MessageTag::Block,
            8 => MessageTag::SeedsRequest,
            9 => MessageTag::Seeds,
            _ => return None,
        })
    }
}

/// Messages exchanged after the handshake. Body encoding is bincode; framing is in `wire`.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Keeps an idle direction from timing out.
    Alive,
    /// The sender is dropping this peer.
    Cancel,
    /// Round-trip probe; echoed back as Pong.
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    /// Peer sample for the routing table.
    Nodes(Vec<Node>),
    /// Keys the sender can serve.
    BlocksLink(Vec<Key>),
    /// Keys the sender wants.
    BlocksRequest(Vec<Key>),
    Block { key: Key, value: Vec<u8> },
    /// Publisher signatures the sender wants seeds for.
    SeedsRequest(Vec<String>),
    Seeds(Vec<Seed>),
}

impl Message {
    pub fn tag(&self) -> MessageTag {
        match self {
            Message::Alive => MessageTag::Alive,
            Message::Cancel => MessageTag::Cancel,
            Message::Ping(_) => MessageTag::Ping,
            Message::Pong(_) => MessageTag::Pong,
            Message::Nodes(_) => MessageTag::Nodes,
            Message::BlocksLink(_) => MessageTag::BlocksLink,
            Message::BlocksRequest(_) => MessageTag::BlocksRequest,
            Message::Block { .. } => MessageTag::Block,
            Message::SeedsRequest(_) => MessageTag::SeedsRequest,
            Message::Seeds(_) => MessageTag::Seeds,
        }
    }

    /// Element count for list-typed messages, checked against the per-type cap.
    pub(crate) fn within_limits(&self) -> bool {
        match self {
            Message::Ping(n) | Message::Pong(n) => n.len() <= MAX_NONCE_LEN,
            Message::Nodes(v) => v.len() <= MAX_NODES,
            Message::BlocksLink(v) | Message::BlocksRequest(v) => v.len() <= MAX_KEYS,
            Message::SeedsRequest(v) => v.len() <= MAX_SIGNATURES,
            Message::Seeds(v) => v.len() <= MAX_SEEDS,
            Message::Alive | Message::Cancel | Message::Block { .. } => true,
        }
    }
}

/// Handshake records, exchanged in order: versions, session id, node descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Handshake {
    Hello { versions: u32 },
    SessionId(Vec<u8>),
    Identify(Node),
}

/// Highest version bit both sides support, if any.
pub fn negotiate_version(ours: u32, theirs: u32) -> Option<u32> {
    let common = ours & theirs;
    if common == 0 {
        None
    } else {
        Some(1 << (31 - common.leading_zeros()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_roundtrip() {
        for t in 0u8..10 {
            let tag = MessageTag::from_u8(t).unwrap();
            assert_eq!(tag as u8, t);
        }
        assert!(MessageTag::from_u8(10).is_none());
    }

    #[test]
    fn negotiation_picks_highest_common() {
        assert_eq!(negotiate_version(0b011, 0b110), Some(0b010));
        assert_eq!(negotiate_version(0b001, 0b001), Some(0b001));
        assert_eq!(negotiate_version(0b001, 0b100), None);
    }

    #[test]
    fn oversized_nonce_out_of_limits() {
        assert!(Message::Ping(vec![0; 32]).within_limits());
        assert!(!Message::Pong(vec![0; 33]).within_limits());
    }
}
