//! Persistence collaborator for tracker-side records.
//!
//! A document store is assumed to live elsewhere; the core only needs a
//! narrow get/upsert/query-by-torrent surface over three logical
//! collections (peers, torrents, files). The in-memory implementation
//! keeps the core testable without a real storage engine.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::torrent::{InfoHash, PeerId, TorrentDescriptor};

/// Persisted peer record: one document per (peer, torrent) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDocument {
    pub peer_id: PeerId,
    pub address: SocketAddr,
    pub info_hash: InfoHash,
    pub pieces: BTreeSet<u32>,
}

/// Derived per-torrent view: which peers currently distribute a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDistributionRecord {
    pub info_hash: InfoHash,
    pub file_name: Option<String>,
    pub peers: Vec<PeerDocument>,
}

impl FileDistributionRecord {
    /// Peers holding every piece of the torrent.
    pub fn seeders(&self, piece_count: u32) -> usize {
        self.peers
            .iter()
            .filter(|peer| peer.pieces.len() as u32 == piece_count)
            .count()
    }

    /// Peers still missing pieces.
    pub fn leechers(&self, piece_count: u32) -> usize {
        self.peers.len() - self.seeders(piece_count)
    }
}

/// Narrow document-store interface the tracker persists through.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Fetches the record for one (peer, torrent) pair.
    async fn peer(&self, peer_id: &PeerId, info_hash: InfoHash) -> Option<PeerDocument>;

    /// Inserts or replaces a peer record.
    async fn upsert_peer(&self, document: PeerDocument);

    /// Removes a peer record; no-op if absent.
    async fn remove_peer(&self, peer_id: &PeerId, info_hash: InfoHash);

    /// Fetches a stored torrent descriptor.
    async fn torrent(&self, info_hash: InfoHash) -> Option<TorrentDescriptor>;

    /// Inserts or replaces a torrent descriptor.
    async fn upsert_torrent(&self, descriptor: TorrentDescriptor);

    /// Lists all peer records for a torrent.
    async fn peers_for_torrent(&self, info_hash: InfoHash) -> Vec<PeerDocument>;

    /// Assembles the derived distribution view for a torrent.
    async fn distribution(&self, info_hash: InfoHash) -> FileDistributionRecord {
        FileDistributionRecord {
            info_hash,
            file_name: self
                .torrent(info_hash)
                .await
                .map(|descriptor| descriptor.file_name().to_string()),
            peers: self.peers_for_torrent(info_hash).await,
        }
    }
}

/// In-memory metadata store for tests and single-process deployments.
pub struct InMemoryMetadataStore {
    peers: RwLock<HashMap<(PeerId, InfoHash), PeerDocument>>,
    torrents: RwLock<HashMap<InfoHash, TorrentDescriptor>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            torrents: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn peer(&self, peer_id: &PeerId, info_hash: InfoHash) -> Option<PeerDocument> {
        let peers = self.peers.read().await;
        peers.get(&(peer_id.clone(), info_hash)).cloned()
    }

    async fn upsert_peer(&self, document: PeerDocument) {
        let mut peers = self.peers.write().await;
        peers.insert((document.peer_id.clone(), document.info_hash), document);
    }

    async fn remove_peer(&self, peer_id: &PeerId, info_hash: InfoHash) {
        let mut peers = self.peers.write().await;
        peers.remove(&(peer_id.clone(), info_hash));
    }

    async fn torrent(&self, info_hash: InfoHash) -> Option<TorrentDescriptor> {
        let torrents = self.torrents.read().await;
        torrents.get(&info_hash).cloned()
    }

    async fn upsert_torrent(&self, descriptor: TorrentDescriptor) {
        let mut torrents = self.torrents.write().await;
        torrents.insert(descriptor.info_hash(), descriptor);
    }

    async fn peers_for_torrent(&self, info_hash: InfoHash) -> Vec<PeerDocument> {
        let peers = self.peers.read().await;
        let mut matching: Vec<PeerDocument> = peers
            .values()
            .filter(|document| document.info_hash == info_hash)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        matching
    }
}
