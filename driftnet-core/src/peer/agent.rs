//! Peer agent: one node in the swarm, serving and downloading at once.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use crate::config::DriftnetConfig;
use crate::peer::connector::TcpPeerConnector;
use crate::peer::server::{PeerServer, PeerServerHandle};
use crate::peer::session::{DownloadSession, SessionOutcome};
use crate::torrent::{InfoHash, LocalPieceStore, PeerId, TorrentDescriptor, TorrentError};
use crate::tracker::TrackerClient;

/// A running peer: piece store, serving endpoint, and tracker link.
///
/// The same agent can seed some torrents and download others; both roles
/// share the one store, so a piece verified by a download is served to
/// other peers from that moment on.
pub struct PeerAgent<T: TrackerClient> {
    peer_id: PeerId,
    store: Arc<LocalPieceStore>,
    tracker: T,
    config: DriftnetConfig,
    server: PeerServerHandle,
}

impl<T: TrackerClient> PeerAgent<T> {
    /// Starts the serving endpoint and returns the ready agent.
    ///
    /// Binding to port 0 picks a free port; the advertised address is the
    /// one actually bound.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Io` - Listener bind failed
    pub async fn start(
        peer_id: PeerId,
        listen_addr: SocketAddr,
        tracker: T,
        config: DriftnetConfig,
    ) -> Result<Self, TorrentError> {
        let store = Arc::new(match &config.storage.cache_dir {
            Some(dir) => LocalPieceStore::with_cache_dir(dir.clone()),
            None => LocalPieceStore::new(),
        });
        let server = PeerServer::new(Arc::clone(&store), config.storage.clone())
            .start(listen_addr)
            .await?;
        tracing::info!("Peer {peer_id} serving on {}", server.local_addr);

        Ok(Self {
            peer_id,
            store,
            tracker,
            config,
            server,
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Address other peers reach this agent at.
    pub fn address(&self) -> SocketAddr {
        self.server.local_addr
    }

    pub fn store(&self) -> &Arc<LocalPieceStore> {
        &self.store
    }

    /// Loads a complete file as verified pieces and joins the swarm as a
    /// seeder.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidInput` - Bytes do not match the descriptor
    /// - `TorrentError::VerificationFailure` - A piece digest mismatched
    /// - `TorrentError::TrackerConnectionFailed` - Announce failed
    pub async fn seed(
        &self,
        descriptor: &TorrentDescriptor,
        bytes: &[u8],
    ) -> Result<u32, TorrentError> {
        let pieces = self.store.load_seed(descriptor, bytes).await?;
        self.announce(descriptor).await?;
        tracing::info!(
            "Seeding {} ({} pieces) as {}",
            descriptor.file_name(),
            pieces,
            self.peer_id
        );
        Ok(pieces)
    }

    /// Reads a file from disk and seeds it.
    ///
    /// # Errors
    ///
    /// Same as [`PeerAgent::seed`], plus `TorrentError::Io` on read failure.
    pub async fn seed_file(
        &self,
        descriptor: &TorrentDescriptor,
        path: &Path,
    ) -> Result<u32, TorrentError> {
        let bytes = tokio::fs::read(path).await?;
        self.seed(descriptor, &bytes).await
    }

    /// Announces the currently held bitset; returns the swarm size.
    ///
    /// # Errors
    ///
    /// - `TorrentError::TrackerConnectionFailed` - Tracker unreachable
    /// - `TorrentError::Timeout` - No response within the window
    pub async fn announce(&self, descriptor: &TorrentDescriptor) -> Result<usize, TorrentError> {
        let info_hash = descriptor.info_hash();
        self.tracker
            .announce(
                self.peer_id.clone(),
                self.address(),
                info_hash,
                self.store.held(info_hash),
            )
            .await
    }

    /// Downloads a torrent into the local store, resuming from any pieces
    /// already cached on disk.
    ///
    /// # Errors
    ///
    /// - `TorrentError::TrackerConnectionFailed` - Tracker unreachable at
    ///   session start
    pub async fn download(
        &self,
        descriptor: &TorrentDescriptor,
    ) -> Result<SessionOutcome, TorrentError> {
        let restored = self.store.load_cached(descriptor).await?;
        if !restored.is_empty() {
            tracing::info!("Resuming with {} cached pieces", restored.len());
        }

        let connector = Arc::new(TcpPeerConnector::new(self.config.network.clone()));
        let session = DownloadSession::new(
            descriptor,
            Arc::clone(&self.store),
            &self.tracker,
            connector,
            self.peer_id.clone(),
            self.address(),
            self.config.session.clone(),
        );
        session.run().await
    }

    /// Downloads a torrent and writes the assembled file to `path`.
    ///
    /// The file is only written when the session completed; an aborted
    /// outcome is returned as-is with nothing on disk.
    ///
    /// # Errors
    ///
    /// Same as [`PeerAgent::download`], plus `TorrentError::Io` on write
    /// failure.
    pub async fn download_to_file(
        &self,
        descriptor: &TorrentDescriptor,
        path: &Path,
    ) -> Result<SessionOutcome, TorrentError> {
        let outcome = self.download(descriptor).await?;
        if outcome.is_complete() {
            self.store.write_file(descriptor, path).await?;
        }
        Ok(outcome)
    }

    /// Leaves a swarm, removing this peer's tracker registration.
    ///
    /// # Errors
    ///
    /// - `TorrentError::TrackerConnectionFailed` - Tracker unreachable
    pub async fn deregister(&self, info_hash: InfoHash) -> Result<(), TorrentError> {
        self.tracker
            .deregister(self.peer_id.clone(), info_hash)
            .await
    }

    /// Stops the serving endpoint.
    pub fn shutdown(&self) {
        self.server.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{LocalTrackerClient, TrackerRegistry};

    fn listen_addr() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    async fn start_agent(
        registry: &Arc<TrackerRegistry>,
        peer_id: &str,
    ) -> PeerAgent<LocalTrackerClient> {
        PeerAgent::start(
            PeerId::new(peer_id),
            listen_addr(),
            LocalTrackerClient::new(Arc::clone(registry)),
            DriftnetConfig::for_testing(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_seed_then_download_between_two_agents() {
        let data: Vec<u8> = (0u8..25).collect();
        let descriptor = TorrentDescriptor::from_bytes("demo.bin", &data, 10).unwrap();
        let registry = Arc::new(TrackerRegistry::new());

        let seeder = start_agent(&registry, "seeder").await;
        seeder.seed(&descriptor, &data).await.unwrap();

        let downloader = start_agent(&registry, "downloader").await;
        let outcome = downloader.download(&descriptor).await.unwrap();

        assert!(outcome.is_complete());
        assert_eq!(outcome.stats.pieces_downloaded, 3);
        assert_eq!(outcome.stats.failed_attempts, 0);
        assert_eq!(downloader.store().assemble(&descriptor).unwrap(), data);
    }

    #[tokio::test]
    async fn test_download_to_file_writes_only_on_completion() {
        let data: Vec<u8> = (0u8..25).collect();
        let descriptor = TorrentDescriptor::from_bytes("demo.bin", &data, 10).unwrap();
        let registry = Arc::new(TrackerRegistry::new());

        let seeder = start_agent(&registry, "seeder").await;
        seeder.seed(&descriptor, &data).await.unwrap();

        let downloader = start_agent(&registry, "downloader").await;
        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("demo.bin");

        let outcome = downloader
            .download_to_file(&descriptor, &out_path)
            .await
            .unwrap();

        assert!(outcome.is_complete());
        assert_eq!(tokio::fs::read(&out_path).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_seed_rejects_mismatched_bytes() {
        let data: Vec<u8> = (0u8..25).collect();
        let descriptor = TorrentDescriptor::from_bytes("demo.bin", &data, 10).unwrap();
        let registry = Arc::new(TrackerRegistry::new());

        let agent = start_agent(&registry, "seeder").await;
        let mut wrong = data.clone();
        wrong[5] ^= 0xff;

        assert!(agent.seed(&descriptor, &wrong).await.is_err());
        assert!(agent.store().held(descriptor.info_hash()).is_empty());
    }

    #[tokio::test]
    async fn test_deregister_leaves_swarm() {
        let data: Vec<u8> = (0u8..25).collect();
        let descriptor = TorrentDescriptor::from_bytes("demo.bin", &data, 10).unwrap();
        let registry = Arc::new(TrackerRegistry::new());

        let agent = start_agent(&registry, "seeder").await;
        agent.seed(&descriptor, &data).await.unwrap();
        assert_eq!(registry.swarm_size(descriptor.info_hash()).await, 1);

        agent.deregister(descriptor.info_hash()).await.unwrap();
        assert_eq!(registry.swarm_size(descriptor.info_hash()).await, 0);
    }
}
