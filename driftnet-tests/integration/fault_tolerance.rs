//! Fault tolerance integration tests
//!
//! Puts misbehaving peers on real sockets: one that serves corrupted
//! piece bytes, and a swarm that simply never has some pieces.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use driftnet_core::config::DriftnetConfig;
use driftnet_core::peer::{PeerAgent, PeerServer};
use driftnet_core::protocol::{self, PeerRequest, PeerResponse};
use driftnet_core::storage::InMemoryMetadataStore;
use driftnet_core::torrent::{LocalPieceStore, PeerId, PieceIndex, TorrentDescriptor};
use driftnet_core::tracker::{
    TcpTrackerClient, TrackerClient, TrackerRegistry, TrackerServer, TrackerServerHandle,
};
use tokio::io::BufReader;
use tokio::net::TcpListener;

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

fn demo_content() -> (TorrentDescriptor, Vec<u8>) {
    let data: Vec<u8> = (0u8..25).collect();
    let descriptor = TorrentDescriptor::from_bytes("demo.bin", &data, 10).unwrap();
    (descriptor, data)
}

/// Speaks the peer protocol but flips a byte in every piece it serves.
async fn start_corrupting_peer(data: Vec<u8>, piece_length: usize) -> SocketAddr {
    let listener = TcpListener::bind(any_addr()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let piece_count = data.len().div_ceil(piece_length) as u32;

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let data = data.clone();
            tokio::spawn(async move {
                let (read_half, mut write_half) = stream.into_split();
                let mut reader = BufReader::new(read_half);
                while let Ok(Some(request)) =
                    protocol::read_message::<PeerRequest, _>(&mut reader).await
                {
                    let response = match request {
                        PeerRequest::Bitset { .. } => PeerResponse::Bitset {
                            pieces: (0..piece_count).collect::<BTreeSet<u32>>(),
                        },
                        PeerRequest::Piece { index, .. } => {
                            let start = index.as_u32() as usize * piece_length;
                            let end = (start + piece_length).min(data.len());
                            let mut bytes = data[start..end].to_vec();
                            bytes[0] ^= 0xff;
                            PeerResponse::Piece { index, data: bytes }
                        }
                    };
                    if protocol::send_message(&mut write_half, &response)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_corrupt_peer_triggers_verified_failover() {
    let config = DriftnetConfig::for_testing();
    let tracker = start_tracker(&config).await;
    let (descriptor, data) = demo_content();
    let info_hash = descriptor.info_hash();

    // Corrupt peer sorts first by id, so it gets picked before the
    // honest seeder on the initial pass
    let corrupt_addr = start_corrupting_peer(data.clone(), 10).await;
    let registrar = TcpTrackerClient::new(tracker.local_addr, config.network.clone());
    registrar
        .announce(
            PeerId::new("aa-corrupt"),
            corrupt_addr,
            info_hash,
            (0u32..3).collect(),
        )
        .await
        .unwrap();

    let client = TcpTrackerClient::new(tracker.local_addr, config.network.clone());
    let honest = PeerAgent::start(
        PeerId::new("zz-honest"),
        any_addr(),
        client,
        config.clone(),
    )
    .await
    .unwrap();
    honest.seed(&descriptor, &data).await.unwrap();

    let downloader_client = TcpTrackerClient::new(tracker.local_addr, config.network.clone());
    let downloader = PeerAgent::start(
        PeerId::new("downloader"),
        any_addr(),
        downloader_client,
        config.clone(),
    )
    .await
    .unwrap();
    let outcome = downloader.download(&descriptor).await.unwrap();

    // Corruption never reaches the store; the honest seeder fills the gaps
    assert!(outcome.is_complete());
    assert!(outcome.stats.failed_attempts >= 1);
    assert_eq!(downloader.store().assemble(&descriptor).unwrap(), data);

    let score = |id: &str| {
        outcome
            .stats
            .per_peer
            .iter()
            .find(|peer| peer.peer_id == PeerId::new(id))
            .unwrap()
            .final_score
    };
    assert!(score("aa-corrupt") < score("zz-honest"));
}

#[tokio::test]
async fn test_swarm_missing_piece_aborts_with_partial_result() {
    let config = DriftnetConfig::for_testing();
    let tracker = start_tracker(&config).await;
    let (descriptor, data) = demo_content();
    let info_hash = descriptor.info_hash();

    // A peer holding only pieces 0 and 2, announced directly
    let store = Arc::new(LocalPieceStore::new());
    store
        .commit(&descriptor, PieceIndex::new(0), Bytes::copy_from_slice(&data[..10]))
        .await
        .unwrap();
    store
        .commit(&descriptor, PieceIndex::new(2), Bytes::copy_from_slice(&data[20..]))
        .await
        .unwrap();
    let partial_server = PeerServer::new(Arc::clone(&store), config.storage.clone())
        .start(any_addr())
        .await
        .unwrap();

    let registrar = TcpTrackerClient::new(tracker.local_addr, config.network.clone());
    registrar
        .announce(
            PeerId::new("partial"),
            partial_server.local_addr,
            info_hash,
            store.held(info_hash),
        )
        .await
        .unwrap();

    let client = TcpTrackerClient::new(tracker.local_addr, config.network.clone());
    let downloader = PeerAgent::start(
        PeerId::new("downloader"),
        any_addr(),
        client,
        config.clone(),
    )
    .await
    .unwrap();
    let outcome = downloader.download(&descriptor).await.unwrap();

    assert!(!outcome.is_complete());
    assert_eq!(outcome.missing_pieces, vec![1]);
    assert_eq!(outcome.stats.pieces_downloaded, 2);
    assert_eq!(
        downloader
            .store()
            .held(info_hash)
            .into_iter()
            .collect::<Vec<_>>(),
        vec![0, 2]
    );
}
