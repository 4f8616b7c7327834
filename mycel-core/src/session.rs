//! PeerSession: one authenticated connection to a peer.
//!
//! `connect` runs the handshake (versions, session ids, node descriptors).
//! `start` spawns the receive loop, which decodes one message per iteration,
//! answers pings, and forwards everything else to a [`SessionHandler`].
//! The receive loop reports `Closed` exactly once when it exits.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::RngCore;
use tracing::{debug, trace};

use crate::protocol::{
    negotiate_version, Handshake, Message, MAX_NONCE_LEN, MAX_SESSION_ID_LEN, SUPPORTED_VERSIONS,
};
use crate::transport::{Connection, ConnectionError};
use crate::types::{Key, Node, Seed};
use crate::wire::{decode_message, encode_message, FrameEncodeError};

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
pub const SEND_TIMEOUT: Duration = Duration::from_secs(6 * 60);
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(6 * 60);
/// Send Alive when nothing was sent for this long.
pub const ALIVE_INTERVAL: Duration = Duration::from_secs(3 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake timed out")]
    Timeout,
    #[error("malformed handshake record")]
    Malformed,
    #[error("no common protocol version")]
    NoCommonVersion,
    #[error("connection: {0}")]
    Connection(#[from] ConnectionError),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session closed")]
    Closed,
    #[error("encode: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("connection: {0}")]
    Connection(#[from] ConnectionError),
}

/// Events raised by the receive loop.
#[derive(Debug)]
pub enum SessionEvent {
    Nodes(Vec<Node>),
    BlocksLink(Vec<Key>),
    BlocksRequest(Vec<Key>),
    Block { key: Key, value: Vec<u8> },
    SeedsRequest(Vec<String>),
    Seeds(Vec<Seed>),
    Cancel,
    Closed,
}

pub trait SessionHandler: Send + Sync {
    fn on_event(&self, session: &Arc<PeerSession>, event: SessionEvent);
}

#[derive(Default)]
struct Liveness {
    last_sent: Option<Instant>,
    ping_nonce: Option<(Vec<u8>, Instant)>,
    round_trip: Option<Duration>,
}

pub struct PeerSession {
    connection: Arc<dyn Connection>,
    direction: SessionDirection,
    version: u32,
    other_node: Node,
    other_session_id: Vec<u8>,
    address: Option<String>,
    closed: AtomicBool,
    received_bytes: AtomicU64,
    sent_bytes: AtomicU64,
    liveness: Mutex<Liveness>,
}

fn send_record(conn: &dyn Connection, record: &Handshake, deadline: Instant) -> Result<(), HandshakeError> {
    let bytes = bincode::serialize(record).map_err(|_| HandshakeError::Malformed)?;
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .ok_or(HandshakeError::Timeout)?;
    conn.send(&bytes, remaining).map_err(|e| match e {
        ConnectionError::Timeout => HandshakeError::Timeout,
        other => HandshakeError::Connection(other),
    })
}

fn receive_record(conn: &dyn Connection, deadline: Instant) -> Result<Handshake, HandshakeError> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .ok_or(HandshakeError::Timeout)?;
    let bytes = conn.receive(remaining).map_err(|e| match e {
        ConnectionError::Timeout => HandshakeError::Timeout,
        other => HandshakeError::Connection(other),
    })?;
    bincode::deserialize(&bytes).map_err(|_| HandshakeError::Malformed)
}

impl PeerSession {
    /// Perform the handshake over `connection` and return a session that is not yet receiving.
    pub fn connect(
        connection: Arc<dyn Connection>,
        direction: SessionDirection,
        base_node: &Node,
        timeout: Duration,
    ) -> Result<Arc<PeerSession>, HandshakeError> {
        let result = Self::handshake(connection.as_ref(), base_node, timeout);
        match result {
            Ok((version, other_session_id, other_node)) => {
                let address = connection.remote_address();
                debug!(target: "session", peer = %other_node, ?direction, version, "handshake complete");
                Ok(Arc::new(PeerSession {
                    connection,
                    direction,
                    version,
                    other_node,
                    other_session_id,
                    address,
                    closed: AtomicBool::new(false),
                    received_bytes: AtomicU64::new(0),
                    sent_bytes: AtomicU64::new(0),
                    liveness: Mutex::new(Liveness::default()),
                }))
            }
            Err(e) => {
                connection.close();
                Err(e)
            }
        }
    }

    fn handshake(
        conn: &dyn Connection,
        base_node: &Node,
        timeout: Duration,
    ) -> Result<(u32, Vec<u8>, Node), HandshakeError> {
        let deadline = Instant::now() + timeout;

        send_record(conn, &Handshake::Hello { versions: SUPPORTED_VERSIONS }, deadline)?;
        let version = match receive_record(conn, deadline)? {
            Handshake::Hello { versions } => {
                negotiate_version(SUPPORTED_VERSIONS, versions).ok_or(HandshakeError::NoCommonVersion)?
            }
            _ => return Err(HandshakeError::Malformed),
        };

        let mut session_id = vec![0u8; MAX_SESSION_ID_LEN];
        rand::thread_rng().fill_bytes(&mut session_id);
        send_record(conn, &Handshake::SessionId(session_id), deadline)?;
        let other_session_id = match receive_record(conn, deadline)? {
            Handshake::SessionId(id) if !id.is_empty() && id.len() <= MAX_SESSION_ID_LEN => id,
            _ => return Err(HandshakeError::Malformed),
        };

        send_record(conn, &Handshake::Identify(base_node.clone()), deadline)?;
        let other_node = match receive_record(conn, deadline)? {
            Handshake::Identify(node) if !node.id.is_empty() && node.id.len() <= crate::types::MAX_NODE_ID_LEN => node,
            _ => return Err(HandshakeError::Malformed),
        };
        Ok((version, other_session_id, other_node))
    }

    pub fn other_node(&self) -> &Node {
        &self.other_node
    }

    pub fn other_session_id(&self) -> &[u8] {
        &self.other_session_id
    }

    pub fn direction(&self) -> SessionDirection {
        self.direction
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes.load(Ordering::Relaxed)
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes.load(Ordering::Relaxed)
    }

    /// Ping round-trip, recorded once.
    pub fn round_trip(&self) -> Option<Duration> {
        self.liveness.lock().round_trip
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Spawn the receive loop and send the initial ping.
    pub fn start(self: &Arc<Self>, handler: Arc<dyn SessionHandler>) {
        let session = self.clone();
        // Detached: the loop exits on its own once the session is closed.
        let spawned = std::thread::Builder::new()
            .name(format!("mycel-recv-{}", self.other_node.short_id()))
            .spawn(move || session.receive_loop(handler));
        if let Err(e) = spawned {
            debug!(target: "session", ?e, "failed to spawn receive loop");
            self.close();
            return;
        }
        let mut nonce = vec![0u8; MAX_NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        self.liveness.lock().ping_nonce = Some((nonce.clone(), Instant::now()));
        let _ = self.push(Message::Ping(nonce));
    }

    fn receive_loop(self: Arc<Self>, handler: Arc<dyn SessionHandler>) {
        while !self.is_closed() {
            let bytes = match self.connection.receive(RECEIVE_TIMEOUT) {
                Ok(b) => b,
                Err(e) => {
                    debug!(target: "session", peer = %self.other_node, %e, "receive failed");
                    break;
                }
            };
            self.received_bytes
                .fetch_add(bytes.len() as u64, Ordering::Relaxed);
            let msg = match decode_message(&bytes) {
                Ok(m) => m,
                Err(e) => {
                    debug!(target: "session", peer = %self.other_node, %e, "dropping frame");
                    continue;
                }
            };
            trace!(target: "session", peer = %self.other_node, tag = ?msg.tag(), "received");
            let event = match msg {
                Message::Alive => continue,
                Message::Ping(nonce) => {
                    let _ = self.push(Message::Pong(nonce));
                    continue;
                }
                Message::Pong(nonce) => {
                    let mut live = self.liveness.lock();
                    if let Some((expected, sent_at)) = live.ping_nonce.take() {
                        if expected == nonce {
                            live.round_trip = Some(sent_at.elapsed());
                        } else {
                            live.ping_nonce = Some((expected, sent_at));
                        }
                    }
                    continue;
                }
                Message::Nodes(v) => SessionEvent::Nodes(v),
                Message::BlocksLink(v) => SessionEvent::BlocksLink(v),
                Message::BlocksRequest(v) => SessionEvent::BlocksRequest(v),
                Message::Block { key, value } => SessionEvent::Block { key, value },
                Message::SeedsRequest(v) => SessionEvent::SeedsRequest(v),
                Message::Seeds(v) => SessionEvent::Seeds(v),
                Message::Cancel => SessionEvent::Cancel,
            };
            handler.on_event(&self, event);
        }
        self.close();
        handler.on_event(&self, SessionEvent::Closed);
    }

    /// Serialize and send. A failed send closes the session.
    pub fn push(&self, msg: Message) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let body = encode_message(&msg)?;
        match self.connection.send(&body, SEND_TIMEOUT) {
            Ok(()) => {
                self.sent_bytes
                    .fetch_add(body.len() as u64, Ordering::Relaxed);
                self.liveness.lock().last_sent = Some(Instant::now());
                Ok(())
            }
            Err(e) => {
                debug!(target: "session", peer = %self.other_node, %e, "send failed, closing");
                self.close();
                Err(e.into())
            }
        }
    }

    pub fn push_nodes(&self, nodes: Vec<Node>) -> Result<(), SessionError> {
        self.push(Message::Nodes(nodes))
    }

    pub fn push_blocks_link(&self, keys: Vec<Key>) -> Result<(), SessionError> {
        self.push(Message::BlocksLink(keys))
    }

    pub fn push_blocks_request(&self, keys: Vec<Key>) -> Result<(), SessionError> {
        self.push(Message::BlocksRequest(keys))
    }

    pub fn push_block(&self, key: Key, value: Vec<u8>) -> Result<(), SessionError> {
        self.push(Message::Block { key, value })
    }

    pub fn push_seeds_request(&self, signatures: Vec<String>) -> Result<(), SessionError> {
        self.push(Message::SeedsRequest(signatures))
    }

    pub fn push_seeds(&self, seeds: Vec<Seed>) -> Result<(), SessionError> {
        self.push(Message::Seeds(seeds))
    }

    pub fn push_cancel(&self) -> Result<(), SessionError> {
        self.push(Message::Cancel)
    }

    /// Send Alive if nothing was sent within `ALIVE_INTERVAL`.
    pub fn keep_alive(&self, now: Instant) {
        let idle = {
            let live = self.liveness.lock();
            match live.last_sent {
                Some(at) => now.saturating_duration_since(at) >= ALIVE_INTERVAL,
                None => true,
            }
        };
        if idle {
            let _ = self.push(Message::Alive);
        }
    }

    /// Idempotent; releases the transport.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.connection.close();
        }
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("peer", &self.other_node.short_id())
            .field("direction", &self.direction)
            .field("closed", &self.is_closed())
            .finish()
    }
}
