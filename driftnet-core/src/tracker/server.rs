//! Tracker network service.
//!
//! Accepts one task per connection; each connection carries a sequence of
//! JSON-line requests. Registry mutations go through the per-torrent
//! locks in `TrackerRegistry`, and every announce is mirrored into the
//! metadata store.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::NetworkConfig;
use crate::protocol::{self, TrackerRequest, TrackerResponse};
use crate::storage::MetadataStore;
use crate::torrent::TorrentError;
use crate::tracker::TrackerRegistry;

/// Running tracker service bound to a local address.
pub struct TrackerServerHandle {
    pub local_addr: SocketAddr,
    join: JoinHandle<()>,
}

impl TrackerServerHandle {
    /// Stops accepting connections.
    pub fn shutdown(&self) {
        self.join.abort();
    }
}

impl Drop for TrackerServerHandle {
    fn drop(&mut self) {
        self.join.abort();
    }
}

/// Tracker service: registry plus its persistence mirror.
pub struct TrackerServer {
    registry: Arc<TrackerRegistry>,
    store: Arc<dyn MetadataStore>,
    config: NetworkConfig,
}

impl TrackerServer {
    pub fn new(
        registry: Arc<TrackerRegistry>,
        store: Arc<dyn MetadataStore>,
        config: NetworkConfig,
    ) -> Self {
        Self {
            registry,
            store,
            config,
        }
    }

    /// Binds the listener and spawns the accept loop plus the periodic
    /// stale-peer expiry sweep.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Io` - Bind failed
    pub async fn start(self, addr: SocketAddr) -> Result<TrackerServerHandle, TorrentError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Tracker listening on {local_addr}");

        let registry = Arc::clone(&self.registry);
        let store = Arc::clone(&self.store);
        let config = self.config.clone();

        let join = tokio::spawn(async move {
            let mut sweep = tokio::time::interval(config.expiry_sweep_interval);
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, remote)) => {
                                let registry = Arc::clone(&registry);
                                let store = Arc::clone(&store);
                                let config = config.clone();
                                tokio::spawn(async move {
                                    if let Err(e) =
                                        handle_connection(stream, registry, store, config).await
                                    {
                                        tracing::debug!("Tracker connection {remote}: {e}");
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::warn!("Tracker accept failed: {e}");
                            }
                        }
                    }
                    _ = sweep.tick() => {
                        registry.expire_peers(config.peer_expiry).await;
                    }
                }
            }
        });

        Ok(TrackerServerHandle { local_addr, join })
    }
}

async fn handle_connection(
    stream: TcpStream,
    registry: Arc<TrackerRegistry>,
    store: Arc<dyn MetadataStore>,
    config: NetworkConfig,
) -> Result<(), TorrentError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        // Idle connections are closed rather than held open forever
        let request = match timeout(config.tracker_timeout, protocol::read_message(&mut reader))
            .await
        {
            Ok(Ok(Some(request))) => request,
            Ok(Ok(None)) => return Ok(()),
            Ok(Err(e)) => {
                let response = TrackerResponse::Error {
                    message: e.to_string(),
                };
                protocol::send_message(&mut write_half, &response).await?;
                return Err(e);
            }
            Err(_) => return Ok(()),
        };

        let response = handle_request(&registry, store.as_ref(), request).await;
        timeout(
            config.tracker_timeout,
            protocol::send_message(&mut write_half, &response),
        )
        .await
        .map_err(|_| TorrentError::Timeout {
            operation: "tracker response write".to_string(),
        })??;
    }
}

async fn handle_request(
    registry: &TrackerRegistry,
    store: &dyn MetadataStore,
    request: TrackerRequest,
) -> TrackerResponse {
    match request {
        TrackerRequest::Announce {
            peer_id,
            address,
            info_hash,
            pieces,
        } => {
            let swarm_size = registry
                .announce(peer_id.clone(), address, info_hash, pieces)
                .await;
            // Mirror the merged record, not the raw request
            if let Some(record) = registry
                .list_peers(info_hash)
                .await
                .into_iter()
                .find(|record| record.peer_id == peer_id)
            {
                store.upsert_peer(record.to_document(info_hash)).await;
            }
            TrackerResponse::Announced { swarm_size }
        }
        TrackerRequest::ListPeers { info_hash } => {
            let peers = registry
                .list_peers(info_hash)
                .await
                .iter()
                .map(|record| record.to_entry())
                .collect();
            TrackerResponse::Peers { peers }
        }
        TrackerRequest::Deregister { peer_id, info_hash } => {
            registry.deregister(&peer_id, info_hash).await;
            store.remove_peer(&peer_id, info_hash).await;
            TrackerResponse::Deregistered
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::storage::InMemoryMetadataStore;
    use crate::torrent::{InfoHash, PeerId};
    use crate::tracker::{TcpTrackerClient, TrackerClient};

    async fn start_test_tracker() -> (TrackerServerHandle, Arc<TrackerRegistry>) {
        let registry = Arc::new(TrackerRegistry::new());
        let store = Arc::new(InMemoryMetadataStore::new());
        let server = TrackerServer::new(
            Arc::clone(&registry),
            store,
            NetworkConfig::default(),
        );
        let handle = server.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
        (handle, registry)
    }

    #[tokio::test]
    async fn test_announce_and_list_over_tcp() {
        let (handle, _registry) = start_test_tracker().await;
        let client = TcpTrackerClient::new(handle.local_addr, NetworkConfig::default());
        let info_hash = InfoHash::new([3u8; 20]);

        let swarm_size = client
            .announce(
                PeerId::new("p1"),
                "127.0.0.1:7001".parse().unwrap(),
                info_hash,
                [0u32, 1].into_iter().collect(),
            )
            .await
            .unwrap();
        assert_eq!(swarm_size, 1);

        let peers = client.list_peers(info_hash).await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].pieces, [0u32, 1].into_iter().collect::<BTreeSet<_>>());
    }

    #[tokio::test]
    async fn test_deregister_over_tcp() {
        let (handle, _registry) = start_test_tracker().await;
        let client = TcpTrackerClient::new(handle.local_addr, NetworkConfig::default());
        let info_hash = InfoHash::new([3u8; 20]);

        client
            .announce(
                PeerId::new("p1"),
                "127.0.0.1:7001".parse().unwrap(),
                info_hash,
                [0u32].into_iter().collect(),
            )
            .await
            .unwrap();
        client.deregister(PeerId::new("p1"), info_hash).await.unwrap();

        assert!(client.list_peers(info_hash).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_tracker_is_connection_error() {
        // Bind then immediately shut down to get a dead port
        let (handle, _registry) = start_test_tracker().await;
        let addr = handle.local_addr;
        handle.shutdown();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let client = TcpTrackerClient::new(addr, NetworkConfig::default());
        let result = client.list_peers(InfoHash::new([3u8; 20])).await;
        assert!(result.is_err());
    }
}
