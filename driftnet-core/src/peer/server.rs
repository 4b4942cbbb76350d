//! Server role of a peer agent.
//!
//! Serves bitset and piece requests from the local store over the same
//! JSON-lines framing the tracker uses. Only verified pieces ever leave
//! the store, so the server cannot re-share corrupt data.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::StorageConfig;
use crate::protocol::{self, PeerRequest, PeerResponse};
use crate::torrent::{LocalPieceStore, TorrentError};

/// Running peer service bound to a local address.
pub struct PeerServerHandle {
    pub local_addr: SocketAddr,
    join: JoinHandle<()>,
}

impl PeerServerHandle {
    pub fn shutdown(&self) {
        self.join.abort();
    }
}

impl Drop for PeerServerHandle {
    fn drop(&mut self) {
        self.join.abort();
    }
}

/// Piece-serving side of a peer agent.
pub struct PeerServer {
    store: Arc<LocalPieceStore>,
    config: StorageConfig,
}

impl PeerServer {
    pub fn new(store: Arc<LocalPieceStore>, config: StorageConfig) -> Self {
        Self { store, config }
    }

    /// Binds the listener and spawns the accept loop.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Io` - Bind failed
    pub async fn start(self, addr: SocketAddr) -> Result<PeerServerHandle, TorrentError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Peer server listening on {local_addr}");

        let store = Arc::clone(&self.store);
        let config = self.config.clone();

        let join = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let store = Arc::clone(&store);
                        let config = config.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, store, config).await {
                                tracing::debug!("Peer connection {remote}: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Peer accept failed: {e}");
                    }
                }
            }
        });

        Ok(PeerServerHandle { local_addr, join })
    }
}

async fn handle_connection(
    stream: TcpStream,
    store: Arc<LocalPieceStore>,
    config: StorageConfig,
) -> Result<(), TorrentError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    while let Some(request) = protocol::read_message::<PeerRequest, _>(&mut reader).await? {
        let response = handle_request(&store, &config, request).await;
        protocol::send_message(&mut write_half, &response).await?;
    }
    Ok(())
}

async fn handle_request(
    store: &Arc<LocalPieceStore>,
    config: &StorageConfig,
    request: PeerRequest,
) -> PeerResponse {
    match request {
        PeerRequest::Bitset { info_hash } => PeerResponse::Bitset {
            pieces: store.held(info_hash),
        },
        PeerRequest::Piece { info_hash, index } => {
            // The store lock is a blocking primitive; the read runs on the
            // blocking pool and a request waits on it at most read_timeout
            let reader = Arc::clone(store);
            let lookup = tokio::task::spawn_blocking(move || reader.piece(info_hash, index));
            match timeout(config.read_timeout, lookup).await {
                Ok(Ok(Some(data))) => PeerResponse::Piece {
                    index,
                    data: data.to_vec(),
                },
                Ok(Ok(None)) => PeerResponse::Unavailable { index },
                Ok(Err(e)) => {
                    tracing::warn!("Piece {index} read task failed: {e}");
                    PeerResponse::Unavailable { index }
                }
                Err(_) => {
                    tracing::warn!("Piece {index} read timed out");
                    PeerResponse::Unavailable { index }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::peer::connector::{PeerConnector, TcpPeerConnector};
    use crate::torrent::{PieceIndex, TorrentDescriptor};

    async fn start_seeded_server() -> (PeerServerHandle, TorrentDescriptor, Vec<u8>) {
        let data: Vec<u8> = (0u8..25).collect();
        let descriptor = TorrentDescriptor::from_bytes("demo.bin", &data, 10).unwrap();

        let store = Arc::new(LocalPieceStore::new());
        store.load_seed(&descriptor, &data).await.unwrap();

        let server = PeerServer::new(store, StorageConfig::default());
        let handle = server.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
        (handle, descriptor, data)
    }

    #[tokio::test]
    async fn test_bitset_reflects_held_pieces() {
        let (handle, descriptor, _data) = start_seeded_server().await;
        let connector = TcpPeerConnector::new(NetworkConfig::default());

        let pieces = connector
            .fetch_bitset(handle.local_addr, descriptor.info_hash())
            .await
            .unwrap();
        assert_eq!(pieces.into_iter().collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_piece_round_trip_over_tcp() {
        let (handle, descriptor, data) = start_seeded_server().await;
        let connector = TcpPeerConnector::new(NetworkConfig::default());

        let piece = connector
            .fetch_piece(handle.local_addr, descriptor.info_hash(), PieceIndex::new(2))
            .await
            .unwrap();
        assert_eq!(&piece[..], &data[20..]);
        assert!(descriptor.verify_piece(PieceIndex::new(2), &piece));
    }

    #[tokio::test]
    async fn test_missing_piece_reports_unavailable() {
        let data: Vec<u8> = (0u8..25).collect();
        let descriptor = TorrentDescriptor::from_bytes("demo.bin", &data, 10).unwrap();

        let server = PeerServer::new(Arc::new(LocalPieceStore::new()), StorageConfig::default());
        let handle = server.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let connector = TcpPeerConnector::new(NetworkConfig::default());

        let result = connector
            .fetch_piece(handle.local_addr, descriptor.info_hash(), PieceIndex::new(0))
            .await;
        assert!(matches!(
            result,
            Err(TorrentError::PieceUnavailable { index }) if index.as_u32() == 0
        ));
    }

    #[tokio::test]
    async fn test_exhausted_read_bound_reports_unavailable() {
        let data: Vec<u8> = (0u8..25).collect();
        let descriptor = TorrentDescriptor::from_bytes("demo.bin", &data, 10).unwrap();

        let store = Arc::new(LocalPieceStore::new());
        store.load_seed(&descriptor, &data).await.unwrap();

        // A zero read bound can never be met, even for a held piece
        let config = StorageConfig {
            read_timeout: std::time::Duration::ZERO,
            cache_dir: None,
        };
        let response = handle_request(
            &store,
            &config,
            PeerRequest::Piece {
                info_hash: descriptor.info_hash(),
                index: PieceIndex::new(0),
            },
        )
        .await;

        assert!(matches!(
            response,
            PeerResponse::Unavailable { index } if index.as_u32() == 0
        ));
    }

    #[tokio::test]
    async fn test_unknown_torrent_bitset_is_empty() {
        let (handle, _descriptor, _data) = start_seeded_server().await;
        let connector = TcpPeerConnector::new(NetworkConfig::default());

        let pieces = connector
            .fetch_bitset(handle.local_addr, crate::torrent::InfoHash::new([0u8; 20]))
            .await
            .unwrap();
        assert!(pieces.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_connection_error() {
        let (handle, descriptor, _data) = start_seeded_server().await;
        let addr = handle.local_addr;
        handle.shutdown();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let connector = TcpPeerConnector::new(NetworkConfig::default());
        let result = connector.fetch_bitset(addr, descriptor.info_hash()).await;
        assert!(result.is_err());
    }
}
