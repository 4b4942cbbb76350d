//! Driftnet Core - Piece-based file distribution building blocks
//!
//! This crate provides the fundamental pieces of the Driftnet protocol:
//! torrent descriptors, the tracker's peer/piece registry, the peer agent
//! with its download session state machine, and the peer scoring policy.

pub mod config;
pub mod peer;
pub mod protocol;
pub mod storage;
pub mod torrent;
pub mod tracker;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::DriftnetConfig;
pub use peer::{PeerAgent, SessionOutcome, SessionStats};
pub use torrent::{InfoHash, PeerId, PieceIndex, TorrentDescriptor, TorrentError};
pub use tracker::TrackerRegistry;

/// Core errors that can bubble up from any Driftnet subsystem.
#[derive(Debug, thiserror::Error)]
pub enum DriftnetError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DriftnetError>;
