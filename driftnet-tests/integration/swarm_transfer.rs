//! Swarm transfer integration tests
//!
//! Runs a real tracker service and peer agents over TCP loopback and
//! verifies complete piece transfers between them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use driftnet_core::config::DriftnetConfig;
use driftnet_core::peer::PeerAgent;
use driftnet_core::storage::InMemoryMetadataStore;
use driftnet_core::torrent::{PeerId, TorrentDescriptor};
use driftnet_core::tracker::{
    TcpTrackerClient, TrackerClient, TrackerRegistry, TrackerServer, TrackerServerHandle,
};

fn any_addr() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

async fn start_tracker(config: &DriftnetConfig) -> TrackerServerHandle {
    let registry = Arc::new(TrackerRegistry::new());
    let store = Arc::new(InMemoryMetadataStore::new());
    TrackerServer::new(registry, store, config.network.clone())
        .start(any_addr())
        .await
        .expect("tracker failed to start")
}

async fn start_peer(
    name: &str,
    tracker_addr: SocketAddr,
    config: &DriftnetConfig,
) -> PeerAgent<TcpTrackerClient> {
    let client = TcpTrackerClient::new(tracker_addr, config.network.clone());
    PeerAgent::start(PeerId::new(name), any_addr(), client, config.clone())
        .await
        .expect("peer agent failed to start")
}

fn demo_content() -> (TorrentDescriptor, Vec<u8>) {
    let data: Vec<u8> = (0u8..25).collect();
    let descriptor = TorrentDescriptor::from_bytes("demo.bin", &data, 10).unwrap();
    (descriptor, data)
}

#[tokio::test]
async fn test_single_seeder_serves_full_download() {
    let config = DriftnetConfig::for_testing();
    let tracker = start_tracker(&config).await;
    let (descriptor, data) = demo_content();

    let seeder = start_peer("seeder", tracker.local_addr, &config).await;
    seeder.seed(&descriptor, &data).await.unwrap();

    let downloader = start_peer("downloader", tracker.local_addr, &config).await;
    let outcome = downloader.download(&descriptor).await.unwrap();

    assert!(outcome.is_complete());
    assert_eq!(outcome.stats.pieces_downloaded, 3);
    assert_eq!(outcome.stats.failed_attempts, 0);
    assert_eq!(downloader.store().assemble(&descriptor).unwrap(), data);
}

#[tokio::test]
async fn test_downloader_reshares_verified_pieces() {
    let config = DriftnetConfig::for_testing();
    let tracker = start_tracker(&config).await;
    let (descriptor, data) = demo_content();
    let info_hash = descriptor.info_hash();

    let seeder = start_peer("seeder", tracker.local_addr, &config).await;
    seeder.seed(&descriptor, &data).await.unwrap();

    // First downloader pulls from the original seeder
    let first = start_peer("first", tracker.local_addr, &config).await;
    assert!(first.download(&descriptor).await.unwrap().is_complete());

    // With the seeder gone, the first downloader is the only source left
    seeder.deregister(info_hash).await.unwrap();
    seeder.shutdown();

    let second = start_peer("second", tracker.local_addr, &config).await;
    let outcome = second.download(&descriptor).await.unwrap();

    assert!(outcome.is_complete());
    assert_eq!(second.store().assemble(&descriptor).unwrap(), data);
    let delivered_by_first = outcome
        .stats
        .per_peer
        .iter()
        .find(|peer| peer.peer_id == PeerId::new("first"))
        .map(|peer| peer.pieces_delivered)
        .unwrap_or(0);
    assert_eq!(delivered_by_first, 3);
}

#[tokio::test]
async fn test_swarm_size_grows_with_announces() {
    let config = DriftnetConfig::for_testing();
    let tracker = start_tracker(&config).await;
    let (descriptor, data) = demo_content();

    let seeder = start_peer("seeder", tracker.local_addr, &config).await;
    seeder.seed(&descriptor, &data).await.unwrap();

    let other = start_peer("other", tracker.local_addr, &config).await;
    let swarm_size = other.announce(&descriptor).await.unwrap();
    assert_eq!(swarm_size, 2);
}

#[tokio::test]
async fn test_stale_peers_expire_from_swarm() {
    let mut config = DriftnetConfig::for_testing();
    config.network.peer_expiry = Duration::from_millis(100);
    config.network.expiry_sweep_interval = Duration::from_millis(50);

    let tracker = start_tracker(&config).await;
    let (descriptor, data) = demo_content();
    let info_hash = descriptor.info_hash();

    let seeder = start_peer("seeder", tracker.local_addr, &config).await;
    seeder.seed(&descriptor, &data).await.unwrap();

    let client = TcpTrackerClient::new(tracker.local_addr, config.network.clone());
    assert_eq!(client.list_peers(info_hash).await.unwrap().len(), 1);

    // No re-announce: the record goes stale and the sweep removes it
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(client.list_peers(info_hash).await.unwrap().is_empty());
}
