//! Tracker clients: the trait peers program against, a TCP
//! implementation, and an in-process one for single-process swarms.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::NetworkConfig;
use crate::protocol::{self, PeerEntry, TrackerRequest, TrackerResponse};
use crate::torrent::{InfoHash, PeerId, TorrentError};
use crate::tracker::TrackerRegistry;

/// Tracker operations a peer agent needs.
///
/// Abstracted so sessions run identically against a remote tracker or an
/// in-process registry.
#[async_trait]
pub trait TrackerClient: Send + Sync {
    /// Announces identity, address, and held pieces; returns swarm size.
    ///
    /// # Errors
    ///
    /// - `TorrentError::TrackerConnectionFailed` - Tracker unreachable
    /// - `TorrentError::Timeout` - No response within the window
    async fn announce(
        &self,
        peer_id: PeerId,
        address: SocketAddr,
        info_hash: InfoHash,
        pieces: BTreeSet<u32>,
    ) -> Result<usize, TorrentError>;

    /// Fetches the current peer list for a torrent.
    ///
    /// # Errors
    ///
    /// - `TorrentError::TrackerConnectionFailed` - Tracker unreachable
    /// - `TorrentError::Timeout` - No response within the window
    async fn list_peers(&self, info_hash: InfoHash) -> Result<Vec<PeerEntry>, TorrentError>;

    /// Removes this peer's registration; idempotent.
    ///
    /// # Errors
    ///
    /// - `TorrentError::TrackerConnectionFailed` - Tracker unreachable
    async fn deregister(&self, peer_id: PeerId, info_hash: InfoHash) -> Result<(), TorrentError>;
}

/// Tracker client speaking the JSON-lines protocol over TCP.
///
/// Opens one connection per request; the tracker side tolerates both
/// this and persistent connections.
pub struct TcpTrackerClient {
    tracker_addr: SocketAddr,
    config: NetworkConfig,
}

impl TcpTrackerClient {
    pub fn new(tracker_addr: SocketAddr, config: NetworkConfig) -> Self {
        Self {
            tracker_addr,
            config,
        }
    }

    async fn request(&self, request: TrackerRequest) -> Result<TrackerResponse, TorrentError> {
        let exchange = async {
            let stream = TcpStream::connect(self.tracker_addr).await.map_err(|e| {
                TorrentError::TrackerConnectionFailed {
                    address: format!("{}: {e}", self.tracker_addr),
                }
            })?;
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);

            protocol::send_message(&mut write_half, &request).await?;
            protocol::read_message(&mut reader)
                .await?
                .ok_or_else(|| TorrentError::TrackerConnectionFailed {
                    address: format!("{}: connection closed", self.tracker_addr),
                })
        };

        match timeout(self.config.tracker_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(TorrentError::Timeout {
                operation: format!("tracker request to {}", self.tracker_addr),
            }),
        }
    }
}

#[async_trait]
impl TrackerClient for TcpTrackerClient {
    async fn announce(
        &self,
        peer_id: PeerId,
        address: SocketAddr,
        info_hash: InfoHash,
        pieces: BTreeSet<u32>,
    ) -> Result<usize, TorrentError> {
        let response = self
            .request(TrackerRequest::Announce {
                peer_id,
                address,
                info_hash,
                pieces,
            })
            .await?;
        match response {
            TrackerResponse::Announced { swarm_size } => Ok(swarm_size),
            other => Err(unexpected_response(other)),
        }
    }

    async fn list_peers(&self, info_hash: InfoHash) -> Result<Vec<PeerEntry>, TorrentError> {
        let response = self.request(TrackerRequest::ListPeers { info_hash }).await?;
        match response {
            TrackerResponse::Peers { peers } => Ok(peers),
            other => Err(unexpected_response(other)),
        }
    }

    async fn deregister(&self, peer_id: PeerId, info_hash: InfoHash) -> Result<(), TorrentError> {
        let response = self
            .request(TrackerRequest::Deregister { peer_id, info_hash })
            .await?;
        match response {
            TrackerResponse::Deregistered => Ok(()),
            other => Err(unexpected_response(other)),
        }
    }
}

fn unexpected_response(response: TrackerResponse) -> TorrentError {
    match response {
        TrackerResponse::Error { message } => TorrentError::Protocol { message },
        other => TorrentError::Protocol {
            message: format!("unexpected tracker response: {other:?}"),
        },
    }
}

/// In-process tracker client wrapping a shared registry directly.
///
/// Used by tests and single-process swarms where tracker and peers live
/// in the same runtime.
pub struct LocalTrackerClient {
    registry: Arc<TrackerRegistry>,
}

impl LocalTrackerClient {
    pub fn new(registry: Arc<TrackerRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl TrackerClient for LocalTrackerClient {
    async fn announce(
        &self,
        peer_id: PeerId,
        address: SocketAddr,
        info_hash: InfoHash,
        pieces: BTreeSet<u32>,
    ) -> Result<usize, TorrentError> {
        Ok(self
            .registry
            .announce(peer_id, address, info_hash, pieces)
            .await)
    }

    async fn list_peers(&self, info_hash: InfoHash) -> Result<Vec<PeerEntry>, TorrentError> {
        Ok(self
            .registry
            .list_peers(info_hash)
            .await
            .iter()
            .map(|record| record.to_entry())
            .collect())
    }

    async fn deregister(&self, peer_id: PeerId, info_hash: InfoHash) -> Result<(), TorrentError> {
        self.registry.deregister(&peer_id, info_hash).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_client_reflects_registry_state() {
        let registry = Arc::new(TrackerRegistry::new());
        let client = LocalTrackerClient::new(Arc::clone(&registry));
        let info_hash = InfoHash::new([7u8; 20]);

        let size = client
            .announce(
                PeerId::new("p1"),
                "127.0.0.1:7001".parse().unwrap(),
                info_hash,
                [0u32, 2].into_iter().collect(),
            )
            .await
            .unwrap();
        assert_eq!(size, 1);

        let peers = client.list_peers(info_hash).await.unwrap();
        assert_eq!(peers[0].peer_id, PeerId::new("p1"));

        client.deregister(PeerId::new("p1"), info_hash).await.unwrap();
        assert!(client.list_peers(info_hash).await.unwrap().is_empty());
    }
}
