//! Mycel content distribution core.
//!
//! Peers exchange content-addressed blocks and signed seeds over authenticated
//! sessions. The [`GossipEngine`] decides what to announce, request and push on
//! every tick; the [`pipeline`] managers turn files into layered block trees and
//! back. Nothing here owns a runtime: hosts call `start` or drive the `tick_*`
//! methods themselves.

pub mod cancel;
pub mod config;
pub mod engine;
pub mod exist;
pub mod identity;
pub mod peer_state;
pub mod persist;
pub mod pipeline;
pub mod protocol;
pub mod routing;
pub mod seeds;
pub mod session;
pub mod store;
pub mod transport;
pub mod types;
pub mod volatile;
pub mod wire;

pub use config::{EngineConfig, PipelineConfig};
pub use engine::{EngineState, GossipEngine, Information, Network};
pub use identity::{DigitalSignature, Keypair};
pub use pipeline::{DownloadManager, DownloadState, UploadManager, UploadState};
pub use protocol::Message;
pub use store::{BlockStore, MemoryBlockStore};
pub use types::{Key, Node, Seed};
