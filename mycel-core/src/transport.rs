//! Transport seam: framed, authenticated byte connections.
//!
//! `Connection` carries whole payloads (one message body each). The TCP
//! implementation runs an X25519 preamble and encrypts every frame with
//! ChaCha20-Poly1305; the in-memory implementation backs tests and
//! single-process simulations.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::identity::{decrypt_wire, derive_session_key, encrypt_wire, Keypair, PublicKey, WireCryptoError};
use crate::wire::{read_prefixed, write_prefixed};

/// Preamble: magic + transport public key.
const PREAMBLE_MAGIC: &[u8; 4] = b"MYC1";
const PREAMBLE_SIZE: usize = 4 + 32;
const POLL_STEP: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out")]
    Timeout,
    #[error("connection closed")]
    Closed,
    #[error("bad preamble")]
    Preamble,
    #[error("unsupported address {0}")]
    Address(String),
    #[error("wire crypto: {0}")]
    Crypto(#[from] WireCryptoError),
}

/// One bidirectional, message-oriented connection.
pub trait Connection: Send + Sync {
    fn send(&self, payload: &[u8], timeout: Duration) -> Result<(), ConnectionError>;
    /// Blocks up to `timeout` for the next payload.
    fn receive(&self, timeout: Duration) -> Result<Vec<u8>, ConnectionError>;
    /// Idempotent. Unblocks a pending `receive`.
    fn close(&self);
    fn remote_address(&self) -> Option<String>;
}

/// Opens outbound connections.
pub trait Dialer: Send + Sync {
    fn dial(&self, address: &str, timeout: Duration) -> Result<Arc<dyn Connection>, ConnectionError>;
}

/// Accepts inbound connections. `Ok(None)` when nothing arrived within `timeout`.
pub trait Listener: Send + Sync {
    fn accept(&self, timeout: Duration) -> Result<Option<Arc<dyn Connection>>, ConnectionError>;
}

/// Shared upload cap in bytes per second; 0 disables throttling.
#[derive(Debug, Default)]
pub struct BandwidthLimit(AtomicU64);

impl BandwidthLimit {
    pub fn new(bytes_per_second: u64) -> Self {
        Self(AtomicU64::new(bytes_per_second))
    }

    pub fn set(&self, bytes_per_second: u64) {
        self.0.store(bytes_per_second, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Time a send of `len` bytes should occupy.
    fn pace(&self, len: usize) -> Option<Duration> {
        match self.get() {
            0 => None,
            bps => Some(Duration::from_secs_f64(len as f64 / bps as f64)),
        }
    }
}

/// Strip an optional `tcp:` scheme.
pub fn parse_tcp_address(address: &str) -> Option<&str> {
    let rest = address.strip_prefix("tcp:").unwrap_or(address);
    if rest.contains(':') {
        Some(rest)
    } else {
        None
    }
}

struct TcpHalf {
    stream: TcpStream,
    key: [u8; 32],
    counter: u64,
}

/// Encrypted TCP connection.
pub struct TcpConnection {
    reader: Mutex<TcpHalf>,
    writer: Mutex<TcpHalf>,
    control: TcpStream,
    remote: Option<SocketAddr>,
    closed: AtomicBool,
    limit: Arc<BandwidthLimit>,
}

impl TcpConnection {
    /// Run the preamble over `stream`. `initiator` picks the key direction labels.
    pub fn establish(
        stream: TcpStream,
        keypair: &Keypair,
        initiator: bool,
        timeout: Duration,
        limit: Arc<BandwidthLimit>,
    ) -> Result<Self, ConnectionError> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        let mut out = [0u8; PREAMBLE_SIZE];
        out[..4].copy_from_slice(PREAMBLE_MAGIC);
        out[4..].copy_from_slice(keypair.public_key().as_bytes());
        (&stream).write_all(&out)?;
        let mut buf = [0u8; PREAMBLE_SIZE];
        (&stream).read_exact(&mut buf)?;
        if &buf[..4] != PREAMBLE_MAGIC {
            return Err(ConnectionError::Preamble);
        }
        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(&buf[4..]);
        let secret = keypair.shared_secret(&PublicKey::from_bytes(public_key));
        let (send_label, recv_label): (&[u8], &[u8]) = if initiator {
            (b"i2r", b"r2i")
        } else {
            (b"r2i", b"i2r")
        };
        let remote = stream.peer_addr().ok();
        Ok(Self {
            reader: Mutex::new(TcpHalf {
                stream: stream.try_clone()?,
                key: derive_session_key(&secret, recv_label),
                counter: 0,
            }),
            writer: Mutex::new(TcpHalf {
                stream: stream.try_clone()?,
                key: derive_session_key(&secret, send_label),
                counter: 0,
            }),
            control: stream,
            remote,
            closed: AtomicBool::new(false),
            limit,
        })
    }
}

fn io_to_connection(err: std::io::Error) -> ConnectionError {
    match err.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => ConnectionError::Timeout,
        std::io::ErrorKind::UnexpectedEof => ConnectionError::Closed,
        _ => ConnectionError::Io(err),
    }
}

impl Connection for TcpConnection {
    fn send(&self, payload: &[u8], timeout: Duration) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }
        let started = Instant::now();
        let mut half = self.writer.lock();
        let sealed = encrypt_wire(&half.key, half.counter, payload)?;
        half.counter += 1;
        half.stream.set_write_timeout(Some(timeout))?;
        write_prefixed(&mut half.stream, &sealed).map_err(io_to_connection)?;
        if let Some(pace) = self.limit.pace(sealed.len()) {
            let spent = started.elapsed();
            if pace > spent {
                std::thread::sleep(pace - spent);
            }
        }
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Result<Vec<u8>, ConnectionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }
        let mut half = self.reader.lock();
        half.stream.set_read_timeout(Some(timeout))?;
        let sealed = read_prefixed(&mut half.stream).map_err(io_to_connection)?;
        let plain = decrypt_wire(&half.key, half.counter, &sealed)?;
        half.counter += 1;
        Ok(plain)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.control.shutdown(Shutdown::Both);
        }
    }

    fn remote_address(&self) -> Option<String> {
        self.remote.map(|a| format!("tcp:{}", a))
    }
}

/// Dials `tcp:host:port` addresses.
pub struct TcpDialer {
    keypair: Arc<Keypair>,
    limit: Arc<BandwidthLimit>,
}

impl TcpDialer {
    pub fn new(keypair: Arc<Keypair>, limit: Arc<BandwidthLimit>) -> Self {
        Self { keypair, limit }
    }
}

impl Dialer for TcpDialer {
    fn dial(&self, address: &str, timeout: Duration) -> Result<Arc<dyn Connection>, ConnectionError> {
        let host = parse_tcp_address(address)
            .ok_or_else(|| ConnectionError::Address(address.to_string()))?;
        let addr = host
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| ConnectionError::Address(address.to_string()))?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        let conn = TcpConnection::establish(stream, &self.keypair, true, timeout, self.limit.clone())?;
        Ok(Arc::new(conn))
    }
}

/// Accepts encrypted TCP connections.
pub struct TcpAcceptor {
    listener: TcpListener,
    keypair: Arc<Keypair>,
    limit: Arc<BandwidthLimit>,
    preamble_timeout: Duration,
}

impl TcpAcceptor {
    pub fn bind(
        addr: impl ToSocketAddrs,
        keypair: Arc<Keypair>,
        limit: Arc<BandwidthLimit>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            keypair,
            limit,
            preamble_timeout: Duration::from_secs(30),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Listener for TcpAcceptor {
    fn accept(&self, timeout: Duration) -> Result<Option<Arc<dyn Connection>>, ConnectionError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false)?;
                    let conn = TcpConnection::establish(
                        stream,
                        &self.keypair,
                        false,
                        self.preamble_timeout,
                        self.limit.clone(),
                    )?;
                    return Ok(Some(Arc::new(conn)));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    std::thread::sleep(Duration::from_millis(50).min(deadline - now));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// In-memory connection end.
pub struct MemoryConnection {
    tx: Mutex<Option<Sender<Vec<u8>>>>,
    rx: Mutex<Receiver<Vec<u8>>>,
    closed: Arc<AtomicBool>,
    peer_closed: Arc<AtomicBool>,
    address: String,
}

impl MemoryConnection {
    /// Two connected ends. Each end reports the other's label as its remote address.
    pub fn pair(a_label: &str, b_label: &str) -> (Arc<MemoryConnection>, Arc<MemoryConnection>) {
        let (a_tx, b_rx) = mpsc::channel();
        let (b_tx, a_rx) = mpsc::channel();
        let a_closed = Arc::new(AtomicBool::new(false));
        let b_closed = Arc::new(AtomicBool::new(false));
        let a = MemoryConnection {
            tx: Mutex::new(Some(a_tx)),
            rx: Mutex::new(a_rx),
            closed: a_closed.clone(),
            peer_closed: b_closed.clone(),
            address: b_label.to_string(),
        };
        let b = MemoryConnection {
            tx: Mutex::new(Some(b_tx)),
            rx: Mutex::new(b_rx),
            closed: b_closed,
            peer_closed: a_closed,
            address: a_label.to_string(),
        };
        (Arc::new(a), Arc::new(b))
    }
}

impl Connection for MemoryConnection {
    fn send(&self, payload: &[u8], _timeout: Duration) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::SeqCst) || self.peer_closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }
        let tx = self.tx.lock();
        match tx.as_ref() {
            Some(tx) => tx
                .send(payload.to_vec())
                .map_err(|_| ConnectionError::Closed),
            None => Err(ConnectionError::Closed),
        }
    }

    fn receive(&self, timeout: Duration) -> Result<Vec<u8>, ConnectionError> {
        let deadline = Instant::now() + timeout;
        let rx = self.rx.lock();
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(ConnectionError::Closed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ConnectionError::Timeout);
            }
            match rx.recv_timeout(POLL_STEP.min(deadline - now)) {
                Ok(payload) => return Ok(payload),
                Err(RecvTimeoutError::Timeout) => {
                    if self.peer_closed.load(Ordering::SeqCst) {
                        return Err(ConnectionError::Closed);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Err(ConnectionError::Closed),
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.tx.lock().take();
    }

    fn remote_address(&self) -> Option<String> {
        Some(self.address.clone())
    }
}

/// In-process address space: listeners register under an address, dialers connect to it.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<Mutex<HashMap<String, Sender<Arc<dyn Connection>>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen(&self, address: &str) -> MemoryListener {
        let (tx, rx) = mpsc::channel();
        self.listeners.lock().insert(address.to_string(), tx);
        MemoryListener {
            address: address.to_string(),
            incoming: Mutex::new(rx),
        }
    }

    /// A dialer whose connections report `local_address` to the accepting side.
    pub fn dialer(&self, local_address: &str) -> MemoryDialer {
        MemoryDialer {
            network: self.clone(),
            local_address: local_address.to_string(),
        }
    }
}

pub struct MemoryListener {
    address: String,
    incoming: Mutex<Receiver<Arc<dyn Connection>>>,
}

impl MemoryListener {
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl Listener for MemoryListener {
    fn accept(&self, timeout: Duration) -> Result<Option<Arc<dyn Connection>>, ConnectionError> {
        match self.incoming.lock().recv_timeout(timeout) {
            Ok(conn) => Ok(Some(conn)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(ConnectionError::Closed),
        }
    }
}

pub struct MemoryDialer {
    network: MemoryNetwork,
    local_address: String,
}

impl Dialer for MemoryDialer {
    fn dial(&self, address: &str, _timeout: Duration) -> Result<Arc<dyn Connection>, ConnectionError> {
        let listeners = self.network.listeners.lock();
        let tx = listeners
            .get(address)
            .ok_or_else(|| ConnectionError::Address(address.to_string()))?;
        let (ours, theirs) = MemoryConnection::pair(&self.local_address, address);
        tx.send(theirs).map_err(|_| ConnectionError::Closed)?;
        Ok(ours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_pair_delivers_both_ways() {
        let (a, b) = MemoryConnection::pair("a", "b");
        a.send(b"ping", Duration::from_secs(1)).unwrap();
        assert_eq!(b.receive(Duration::from_secs(1)).unwrap(), b"ping");
        b.send(b"pong", Duration::from_secs(1)).unwrap();
        assert_eq!(a.receive(Duration::from_secs(1)).unwrap(), b"pong");
        assert_eq!(a.remote_address().as_deref(), Some("b"));
    }

    #[test]
    fn memory_close_unblocks_peer() {
        let (a, b) = MemoryConnection::pair("a", "b");
        a.close();
        assert!(matches!(
            b.receive(Duration::from_secs(5)),
            Err(ConnectionError::Closed)
        ));
        assert!(matches!(
            b.send(b"x", Duration::from_secs(1)),
            Err(ConnectionError::Closed)
        ));
    }

    #[test]
    fn memory_receive_times_out() {
        let (a, _b) = MemoryConnection::pair("a", "b");
        assert!(matches!(
            a.receive(Duration::from_millis(20)),
            Err(ConnectionError::Timeout)
        ));
    }

    #[test]
    fn memory_network_dial_and_accept() {
        let net = MemoryNetwork::new();
        let listener = net.listen("mem:b");
        let dialer = net.dialer("mem:a");
        let ours = dialer.dial("mem:b", Duration::from_secs(1)).unwrap();
        let theirs = listener.accept(Duration::from_secs(1)).unwrap().unwrap();
        ours.send(b"hi", Duration::from_secs(1)).unwrap();
        assert_eq!(theirs.receive(Duration::from_secs(1)).unwrap(), b"hi");
        assert_eq!(theirs.remote_address().as_deref(), Some("mem:a"));
        assert!(dialer.dial("mem:nowhere", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn tcp_roundtrip_is_encrypted_and_framed() {
        let limit = Arc::new(BandwidthLimit::default());
        let acceptor =
            TcpAcceptor::bind("127.0.0.1:0", Arc::new(Keypair::generate()), limit.clone()).unwrap();
        let addr = format!("tcp:{}", acceptor.local_addr().unwrap());
        let dialer = TcpDialer::new(Arc::new(Keypair::generate()), limit);
        let client = std::thread::spawn(move || dialer.dial(&addr, Duration::from_secs(5)));
        let server = acceptor.accept(Duration::from_secs(5)).unwrap().unwrap();
        let client = client.join().unwrap().unwrap();
        client.send(b"hello", Duration::from_secs(5)).unwrap();
        client.send(b"again", Duration::from_secs(5)).unwrap();
        assert_eq!(server.receive(Duration::from_secs(5)).unwrap(), b"hello");
        assert_eq!(server.receive(Duration::from_secs(5)).unwrap(), b"again");
        server.send(b"back", Duration::from_secs(5)).unwrap();
        assert_eq!(client.receive(Duration::from_secs(5)).unwrap(), b"back");
        server.close();
        assert!(client.receive(Duration::from_secs(5)).is_err());
    }

    #[test]
    fn tcp_address_parsing() {
        assert_eq!(parse_tcp_address("tcp:1.2.3.4:80"), Some("1.2.3.4:80"));
        assert_eq!(parse_tcp_address("localhost:80"), Some("localhost:80"));
        assert_eq!(parse_tcp_address("nonsense"), None);
    }
}
