//! Transfer pipelines.
//!
//! The upload side turns content into a layered tree of blocks and a signed
//! [`Seed`](crate::types::Seed) naming its root; the download side walks that
//! tree back down, asking the [`GossipEngine`](crate::engine::GossipEngine)
//! for missing blocks and decoding each layer once it can be reconstructed.

mod download;
mod upload;

use std::io::{self, Write};
use std::sync::atomic::AtomicBool;

use parking_lot::Mutex;

use crate::identity::CertificateError;
use crate::persist::PersistError;
use crate::store::StoreError;
use crate::types::{CodecParams, CompressionAlgorithm, CryptoAlgorithm, HashAlgorithm};

pub use download::{DownloadItem, DownloadManager, DownloadState};
pub use upload::{UploadItem, UploadManager, UploadSource, UploadState};

/// Intermediate (index) layers may decode to at most this many bytes, or the
/// seed's length if larger.
pub const MAX_INDEX_LAYER: u64 = 32 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("cancelled")]
    Cancelled,
    #[error("decoded layer exceeds {limit} bytes")]
    TooLarge { limit: u64 },
    #[error("store: {0}")]
    Store(StoreError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("index: {0}")]
    Index(#[from] bincode::Error),
    #[error("certificate: {0}")]
    Certificate(#[from] CertificateError),
    #[error("persist: {0}")]
    Persist(#[from] PersistError),
    #[error("{0}")]
    Invalid(&'static str),
}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Cancelled => PipelineError::Cancelled,
            other => PipelineError::Store(other),
        }
    }
}

impl PipelineError {
    /// Retried next cycle instead of failing the item.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Cancelled | PipelineError::TooLarge { .. })
    }
}

/// One pipeline item plus the flags workers coordinate on.
pub(crate) struct Slot<T> {
    pub(crate) item: Mutex<T>,
    /// Claimed by a worker.
    pub(crate) working: AtomicBool,
    /// Set under the item lock by `remove`.
    pub(crate) removed: AtomicBool,
}

impl<T> Slot<T> {
    pub(crate) fn new(item: T) -> Self {
        Self {
            item: Mutex::new(item),
            working: AtomicBool::new(false),
            removed: AtomicBool::new(false),
        }
    }
}

/// Snappy plus ChaCha20-Poly1305 keyed by the SHA-256 of the layer's plaintext.
pub(crate) fn layer_params(plaintext_digest: Vec<u8>) -> CodecParams {
    CodecParams {
        compression: CompressionAlgorithm::Snappy,
        crypto: CryptoAlgorithm::ChaCha20Poly1305,
        crypto_key: plaintext_digest,
    }
}

pub(crate) const LAYER_HASH: HashAlgorithm = HashAlgorithm::Sha256;

/// Fails once more than `limit` bytes have been written.
pub(crate) struct LimitedWriter<W> {
    inner: W,
    written: u64,
    limit: u64,
    exceeded: bool,
}

impl<W: Write> LimitedWriter<W> {
    pub(crate) fn new(inner: W, limit: u64) -> Self {
        Self {
            inner,
            written: 0,
            limit,
            exceeded: false,
        }
    }

    pub(crate) fn exceeded(&self) -> bool {
        self.exceeded
    }

    pub(crate) fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for LimitedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > self.limit {
            self.exceeded = true;
            return Err(io::Error::new(io::ErrorKind::Other, "size limit exceeded"));
        }
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limited_writer_stops_at_limit() {
        let mut w = LimitedWriter::new(Vec::new(), 4);
        w.write_all(b"abcd").unwrap();
        assert!(!w.exceeded());
        assert!(w.write_all(b"e").is_err());
        assert!(w.exceeded());
        assert_eq!(w.into_inner(), b"abcd");
    }

    #[test]
    fn cancellation_is_retryable() {
        let e: PipelineError = StoreError::Cancelled.into();
        assert!(matches!(e, PipelineError::Cancelled));
        assert!(e.is_retryable());
        assert!(!PipelineError::Invalid("x").is_retryable());
    }
}
