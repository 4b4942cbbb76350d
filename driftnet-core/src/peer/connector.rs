//! Client side of the peer-to-peer protocol.
//!
//! The session schedules against this trait, so tests can substitute
//! slow, corrupt, or unreachable sources without sockets.

use std::collections::BTreeSet;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::NetworkConfig;
use crate::protocol::{self, PeerRequest, PeerResponse};
use crate::torrent::{InfoHash, PieceIndex, TorrentError};

/// Piece-exchange operations one peer performs against another.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Fetches the held-piece bitset of a remote peer.
    ///
    /// # Errors
    ///
    /// - `TorrentError::PeerConnectionFailed` - Peer unreachable
    /// - `TorrentError::Timeout` - No response within the window
    async fn fetch_bitset(
        &self,
        address: SocketAddr,
        info_hash: InfoHash,
    ) -> Result<BTreeSet<u32>, TorrentError>;

    /// Fetches the raw bytes of one piece from a remote peer.
    ///
    /// The returned bytes are untrusted until verified against the
    /// descriptor.
    ///
    /// # Errors
    ///
    /// - `TorrentError::PieceUnavailable` - Peer does not hold the piece
    /// - `TorrentError::PeerConnectionFailed` - Peer unreachable
    /// - `TorrentError::Timeout` - No response within the window
    async fn fetch_piece(
        &self,
        address: SocketAddr,
        info_hash: InfoHash,
        index: PieceIndex,
    ) -> Result<Bytes, TorrentError>;
}

/// TCP implementation opening one connection per request.
pub struct TcpPeerConnector {
    config: NetworkConfig,
}

impl TcpPeerConnector {
    pub fn new(config: NetworkConfig) -> Self {
        Self { config }
    }

    async fn request(
        &self,
        address: SocketAddr,
        request: PeerRequest,
    ) -> Result<PeerResponse, TorrentError> {
        let exchange = async {
            let stream = TcpStream::connect(address).await.map_err(|e| {
                TorrentError::PeerConnectionFailed {
                    address: address.to_string(),
                    reason: e.to_string(),
                }
            })?;
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);

            protocol::send_message(&mut write_half, &request).await?;
            protocol::read_message(&mut reader).await?.ok_or_else(|| {
                TorrentError::PeerConnectionFailed {
                    address: address.to_string(),
                    reason: "connection closed".to_string(),
                }
            })
        };

        match timeout(self.config.peer_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(TorrentError::Timeout {
                operation: format!("peer request to {address}"),
            }),
        }
    }
}

#[async_trait]
impl PeerConnector for TcpPeerConnector {
    async fn fetch_bitset(
        &self,
        address: SocketAddr,
        info_hash: InfoHash,
    ) -> Result<BTreeSet<u32>, TorrentError> {
        match self.request(address, PeerRequest::Bitset { info_hash }).await? {
            PeerResponse::Bitset { pieces } => Ok(pieces),
            PeerResponse::Error { message } => Err(TorrentError::Protocol { message }),
            other => Err(TorrentError::Protocol {
                message: format!("unexpected bitset response: {other:?}"),
            }),
        }
    }

    async fn fetch_piece(
        &self,
        address: SocketAddr,
        info_hash: InfoHash,
        index: PieceIndex,
    ) -> Result<Bytes, TorrentError> {
        match self
            .request(address, PeerRequest::Piece { info_hash, index })
            .await?
        {
            PeerResponse::Piece { data, .. } => Ok(Bytes::from(data)),
            PeerResponse::Unavailable { index } => {
                Err(TorrentError::PieceUnavailable { index })
            }
            PeerResponse::Error { message } => Err(TorrentError::Protocol { message }),
            other => Err(TorrentError::Protocol {
                message: format!("unexpected piece response: {other:?}"),
            }),
        }
    }
}
