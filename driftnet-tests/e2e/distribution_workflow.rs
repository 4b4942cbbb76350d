//! End-to-end distribution workflow test
//!
//! Walks the full pipeline a user would: describe a file, persist the
//! torrent artifact, stand up a tracker, seed from disk, download on a
//! second peer, and check the reassembled file byte for byte.

use std::net::SocketAddr;
use std::sync::Arc;

use driftnet_core::config::DriftnetConfig;
use driftnet_core::peer::PeerAgent;
use driftnet_core::storage::InMemoryMetadataStore;
use driftnet_core::torrent::{PeerId, TorrentDescriptor};
use driftnet_core::tracker::{TcpTrackerClient, TrackerRegistry, TrackerServer};

fn any_addr() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[tokio::test]
async fn test_full_distribution_workflow() {
    let config = DriftnetConfig::for_testing();
    let workspace = tempfile::tempdir().unwrap();

    // A file worth several pieces, with an uneven final piece
    let content: Vec<u8> = (0u32..5000).flat_map(|i| i.to_le_bytes()).collect();
    let source_path = workspace.path().join("dataset.bin");
    tokio::fs::write(&source_path, &content).await.unwrap();

    // Describe it and persist the artifact, then work only from the artifact
    let descriptor = TorrentDescriptor::from_file(&source_path, 1024).await.unwrap();
    let torrent_path = workspace.path().join("dataset.torrent");
    descriptor.write_torrent_file(&torrent_path).await.unwrap();
    let descriptor = TorrentDescriptor::read_torrent_file(&torrent_path)
        .await
        .unwrap();
    assert_eq!(descriptor.piece_count(), 20);

    let registry = Arc::new(TrackerRegistry::new());
    let tracker = TrackerServer::new(
        Arc::clone(&registry),
        Arc::new(InMemoryMetadataStore::new()),
        config.network.clone(),
    )
    .start(any_addr())
    .await
    .unwrap();

    let seeder = PeerAgent::start(
        PeerId::new("seeder"),
        any_addr(),
        TcpTrackerClient::new(tracker.local_addr, config.network.clone()),
        config.clone(),
    )
    .await
    .unwrap();
    seeder.seed_file(&descriptor, &source_path).await.unwrap();

    let downloader = PeerAgent::start(
        PeerId::generate(),
        any_addr(),
        TcpTrackerClient::new(tracker.local_addr, config.network.clone()),
        config.clone(),
    )
    .await
    .unwrap();

    let output_path = workspace.path().join("downloaded.bin");
    let outcome = downloader
        .download_to_file(&descriptor, &output_path)
        .await
        .unwrap();

    assert!(outcome.is_complete());
    assert_eq!(outcome.stats.pieces_downloaded, 20);
    assert_eq!(outcome.stats.failed_attempts, 0);
    assert!(outcome.missing_pieces.is_empty());

    let downloaded = tokio::fs::read(&output_path).await.unwrap();
    assert_eq!(downloaded, content);

    // Both peers now advertise the full bitset
    let records = registry.list_peers(descriptor.info_hash()).await;
    assert_eq!(records.len(), 2);
    for record in records {
        assert_eq!(record.pieces.len(), 20);
    }
}
