//! The tracker's authoritative map of who has what.
//!
//! One mutex per torrent bounds lock contention to peers of the same
//! swarm. Announce merges bitsets by union, never overwrite, so
//! concurrent announces cannot lose pieces and announced bitsets only
//! ever grow.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};

use crate::protocol::PeerEntry;
use crate::storage::PeerDocument;
use crate::torrent::{InfoHash, PeerId};

/// Tracker-side record of one peer in one swarm.
///
/// Owned and mutated exclusively by the registry; peers only submit
/// updates through announces.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub address: SocketAddr,
    pub pieces: BTreeSet<u32>,
    pub last_announce: Instant,
}

impl PeerRecord {
    /// Wire form for tracker responses.
    pub fn to_entry(&self) -> PeerEntry {
        PeerEntry {
            peer_id: self.peer_id.clone(),
            address: self.address,
            pieces: self.pieces.clone(),
        }
    }

    /// Persistence form for the metadata store.
    pub fn to_document(&self, info_hash: InfoHash) -> PeerDocument {
        PeerDocument {
            peer_id: self.peer_id.clone(),
            address: self.address,
            info_hash,
            pieces: self.pieces.clone(),
        }
    }
}

type Swarm = HashMap<PeerId, PeerRecord>;

/// Single source of truth mapping torrents to peers to piece bitsets.
///
/// Transfers no file bytes itself; it only coordinates discovery.
pub struct TrackerRegistry {
    swarms: RwLock<HashMap<InfoHash, Arc<Mutex<Swarm>>>>,
}

impl TrackerRegistry {
    pub fn new() -> Self {
        Self {
            swarms: RwLock::new(HashMap::new()),
        }
    }

    /// Upserts a peer record, merging bitsets by union.
    ///
    /// Idempotent and safe under concurrent announces from multiple
    /// peers. Returns the swarm size after the announce.
    pub async fn announce(
        &self,
        peer_id: PeerId,
        address: SocketAddr,
        info_hash: InfoHash,
        pieces: BTreeSet<u32>,
    ) -> usize {
        let swarm = self.swarm_handle(info_hash).await;
        let mut swarm = swarm.lock().await;

        let record = swarm.entry(peer_id.clone()).or_insert_with(|| PeerRecord {
            peer_id: peer_id.clone(),
            address,
            pieces: BTreeSet::new(),
            last_announce: Instant::now(),
        });
        record.address = address;
        record.pieces.extend(pieces);
        record.last_announce = Instant::now();

        tracing::debug!(
            "Announce: peer={peer_id} torrent={info_hash} holds {} pieces",
            record.pieces.len()
        );
        swarm.len()
    }

    /// Returns the current peer records for a torrent.
    ///
    /// No staleness guarantee beyond "most recent announce". Sorted by
    /// peer id for deterministic consumers.
    pub async fn list_peers(&self, info_hash: InfoHash) -> Vec<PeerRecord> {
        let Some(swarm) = self.existing_swarm(info_hash).await else {
            return Vec::new();
        };
        let swarm = swarm.lock().await;
        let mut records: Vec<PeerRecord> = swarm.values().cloned().collect();
        records.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        records
    }

    /// Removes a peer's record; idempotent if already absent.
    pub async fn deregister(&self, peer_id: &PeerId, info_hash: InfoHash) {
        let Some(swarm) = self.existing_swarm(info_hash).await else {
            return;
        };
        let mut swarm = swarm.lock().await;
        if swarm.remove(peer_id).is_some() {
            tracing::debug!("Deregistered peer={peer_id} from torrent={info_hash}");
        }
    }

    /// Removes peers whose last announce is older than `max_age`.
    ///
    /// Returns how many records were expired.
    pub async fn expire_peers(&self, max_age: Duration) -> usize {
        let swarm_handles: Vec<Arc<Mutex<Swarm>>> = {
            let swarms = self.swarms.read().await;
            swarms.values().cloned().collect()
        };

        let cutoff = Instant::now();
        let mut expired = 0;
        for handle in swarm_handles {
            let mut swarm = handle.lock().await;
            let before = swarm.len();
            swarm.retain(|_, record| {
                cutoff.duration_since(record.last_announce) <= max_age
            });
            expired += before - swarm.len();
        }

        if expired > 0 {
            tracing::info!("Expired {expired} stale peer records");
        }
        expired
    }

    /// Returns the number of peers in a swarm.
    pub async fn swarm_size(&self, info_hash: InfoHash) -> usize {
        match self.existing_swarm(info_hash).await {
            Some(swarm) => swarm.lock().await.len(),
            None => 0,
        }
    }

    async fn swarm_handle(&self, info_hash: InfoHash) -> Arc<Mutex<Swarm>> {
        {
            let swarms = self.swarms.read().await;
            if let Some(swarm) = swarms.get(&info_hash) {
                return Arc::clone(swarm);
            }
        }
        let mut swarms = self.swarms.write().await;
        Arc::clone(swarms.entry(info_hash).or_default())
    }

    async fn existing_swarm(&self, info_hash: InfoHash) -> Option<Arc<Mutex<Swarm>>> {
        let swarms = self.swarms.read().await;
        swarms.get(&info_hash).cloned()
    }
}

impl Default for TrackerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn bitset(indices: &[u32]) -> BTreeSet<u32> {
        indices.iter().copied().collect()
    }

    #[tokio::test]
    async fn test_announce_merges_bitsets_by_union() {
        let registry = TrackerRegistry::new();
        let info_hash = InfoHash::new([1u8; 20]);
        let peer = PeerId::new("p1");

        registry
            .announce(peer.clone(), addr(7001), info_hash, bitset(&[1, 2]))
            .await;
        registry
            .announce(peer.clone(), addr(7001), info_hash, bitset(&[2, 3]))
            .await;

        let peers = registry.list_peers(info_hash).await;
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].pieces, bitset(&[1, 2, 3]));
    }

    #[tokio::test]
    async fn test_announce_is_idempotent() {
        let registry = TrackerRegistry::new();
        let info_hash = InfoHash::new([1u8; 20]);
        let peer = PeerId::new("p1");

        for _ in 0..3 {
            registry
                .announce(peer.clone(), addr(7001), info_hash, bitset(&[0, 1]))
                .await;
        }

        let peers = registry.list_peers(info_hash).await;
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].pieces, bitset(&[0, 1]));
    }

    #[tokio::test]
    async fn test_concurrent_announces_lose_no_updates() {
        let registry = Arc::new(TrackerRegistry::new());
        let info_hash = InfoHash::new([1u8; 20]);

        let mut tasks = Vec::new();
        for i in 0..20u32 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let peer = PeerId::new(format!("peer-{i:02}"));
                registry
                    .announce(peer, addr(7000 + i as u16), info_hash, bitset(&[i]))
                    .await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let peers = registry.list_peers(info_hash).await;
        assert_eq!(peers.len(), 20);
    }

    #[tokio::test]
    async fn test_concurrent_same_peer_announces_union() {
        let registry = Arc::new(TrackerRegistry::new());
        let info_hash = InfoHash::new([1u8; 20]);

        let mut tasks = Vec::new();
        for i in 0..10u32 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                registry
                    .announce(PeerId::new("p1"), addr(7001), info_hash, bitset(&[i]))
                    .await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let peers = registry.list_peers(info_hash).await;
        assert_eq!(peers[0].pieces, (0..10).collect::<BTreeSet<u32>>());
    }

    #[tokio::test]
    async fn test_deregister_is_idempotent() {
        let registry = TrackerRegistry::new();
        let info_hash = InfoHash::new([1u8; 20]);
        let peer = PeerId::new("p1");

        registry
            .announce(peer.clone(), addr(7001), info_hash, bitset(&[0]))
            .await;
        registry.deregister(&peer, info_hash).await;
        registry.deregister(&peer, info_hash).await;

        assert!(registry.list_peers(info_hash).await.is_empty());
    }

    #[tokio::test]
    async fn test_expire_peers_removes_only_stale_records() {
        let registry = TrackerRegistry::new();
        let info_hash = InfoHash::new([1u8; 20]);

        registry
            .announce(PeerId::new("old"), addr(7001), info_hash, bitset(&[0]))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        registry
            .announce(PeerId::new("fresh"), addr(7002), info_hash, bitset(&[1]))
            .await;

        let expired = registry.expire_peers(Duration::from_millis(25)).await;
        assert_eq!(expired, 1);

        let peers = registry.list_peers(info_hash).await;
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].peer_id, PeerId::new("fresh"));
    }
}
