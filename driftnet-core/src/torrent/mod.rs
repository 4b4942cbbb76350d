//! Piece-based torrent modeling: identifiers, descriptors, piece storage.

pub mod descriptor;
pub mod piece_store;

use std::fmt;

use rand::Rng;
use rand::distr::Alphanumeric;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub use descriptor::TorrentDescriptor;
pub use piece_store::LocalPieceStore;

/// SHA-1 hash identifying a unique torrent.
///
/// Computed over the canonical encoding of a descriptor, so identical
/// file content always produces the identical identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Parses a 40-character hex string.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidInput` - If not valid 40-char hex
    pub fn parse(hex_str: &str) -> Result<Self, TorrentError> {
        let bytes = hex::decode(hex_str).map_err(|_| TorrentError::InvalidInput {
            reason: format!("invalid info hash: {hex_str}"),
        })?;
        let hash: [u8; 20] = bytes.try_into().map_err(|_| TorrentError::InvalidInput {
            reason: format!("info hash must be 20 bytes: {hex_str}"),
        })?;
        Ok(Self(hash))
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Serialize for InfoHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for InfoHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        InfoHash::parse(&text).map_err(D::Error::custom)
    }
}

/// Zero-based index of a piece within a torrent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Swarm-unique peer identifier.
///
/// Lexicographic ordering is part of the selection contract: the policy
/// breaks final ties by peer id so planning stays deterministic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Wraps an explicit identifier, e.g. one chosen on the command line.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random `DN-` prefixed identifier.
    pub fn generate() -> Self {
        let suffix: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();
        Self(format!("DN-{suffix}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur during torrent operations.
///
/// Per-piece conditions (`PieceUnavailable`, `VerificationFailure`,
/// `Timeout`) are recoverable and handled inside the download session;
/// only session-level failures reach the caller.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("Piece {index} unavailable at queried peer")]
    PieceUnavailable { index: PieceIndex },

    #[error("Piece {index} failed hash verification")]
    VerificationFailure { index: PieceIndex },

    #[error("Timed out during {operation}")]
    Timeout { operation: String },

    #[error("No remaining sources for pieces {pieces:?}")]
    ExhaustedSources { pieces: Vec<u32> },

    #[error("Tracker connection failed: {address}")]
    TrackerConnectionFailed { address: String },

    #[error("Peer connection failed: {address}: {reason}")]
    PeerConnectionFailed { address: String, reason: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Torrent {info_hash} not found")]
    TorrentNotFound { info_hash: InfoHash },

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}
