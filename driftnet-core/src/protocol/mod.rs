//! Wire protocol for tracker and peer services.
//!
//! Both services speak newline-delimited JSON over TCP. The framing is an
//! implementation choice; the field semantics are the contract. Piece
//! payloads travel hex-encoded inside the JSON frame.

use std::collections::BTreeSet;
use std::net::SocketAddr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::torrent::{InfoHash, PeerId, PieceIndex, TorrentError};

/// One peer's view in a tracker response: identity, address, held pieces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub peer_id: PeerId,
    pub address: SocketAddr,
    pub pieces: BTreeSet<u32>,
}

/// Requests a peer sends to the tracker service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrackerRequest {
    Announce {
        peer_id: PeerId,
        address: SocketAddr,
        info_hash: InfoHash,
        pieces: BTreeSet<u32>,
    },
    ListPeers {
        info_hash: InfoHash,
    },
    Deregister {
        peer_id: PeerId,
        info_hash: InfoHash,
    },
}

/// Tracker service responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrackerResponse {
    Announced { swarm_size: usize },
    Peers { peers: Vec<PeerEntry> },
    Deregistered,
    Error { message: String },
}

/// Requests one peer sends to another peer's server role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerRequest {
    Bitset {
        info_hash: InfoHash,
    },
    Piece {
        info_hash: InfoHash,
        index: PieceIndex,
    },
}

/// Peer server responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerResponse {
    Bitset {
        pieces: BTreeSet<u32>,
    },
    Piece {
        index: PieceIndex,
        #[serde(with = "hex::serde")]
        data: Vec<u8>,
    },
    Unavailable {
        index: PieceIndex,
    },
    Error {
        message: String,
    },
}

/// Writes one message as a JSON line and flushes it.
///
/// # Errors
///
/// - `TorrentError::Io` - Write failed
/// - `TorrentError::Protocol` - Message failed to encode
pub async fn send_message<T, W>(writer: &mut W, message: &T) -> Result<(), TorrentError>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(message).map_err(|e| TorrentError::Protocol {
        message: format!("encoding failed: {e}"),
    })?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one JSON-line message; `None` means the peer closed the stream.
///
/// # Errors
///
/// - `TorrentError::Io` - Read failed
/// - `TorrentError::Protocol` - Line was not a valid message
pub async fn read_message<T, R>(reader: &mut R) -> Result<Option<T>, TorrentError>
where
    T: DeserializeOwned,
    R: AsyncBufReadExt + Unpin,
{
    let mut line = String::new();
    let bytes_read = reader.read_line(&mut line).await?;
    if bytes_read == 0 {
        return Ok(None);
    }
    let message = serde_json::from_str(line.trim_end()).map_err(|e| TorrentError::Protocol {
        message: format!("malformed message: {e}"),
    })?;
    Ok(Some(message))
}
