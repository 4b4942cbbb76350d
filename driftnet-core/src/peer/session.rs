//! Download session: drives one torrent from descriptor to complete file.
//!
//! Each iteration refreshes the swarm view, schedules fetches for missing
//! pieces up to the in-flight cap, then consumes one completion. Every
//! delivered piece goes through `LocalPieceStore::commit`, which verifies
//! the digest before the piece is counted, re-shared, or announced.
//!
//! Per-piece failures (timeouts, verification failures, unreachable
//! sources) are absorbed here with retries and cooldowns; only a tracker
//! that is unreachable at startup aborts the session with an error.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::time::timeout;

use crate::config::SessionConfig;
use crate::peer::connector::PeerConnector;
use crate::peer::selection::Scoreboard;
use crate::torrent::{LocalPieceStore, PeerId, PieceIndex, TorrentDescriptor, TorrentError};
use crate::tracker::TrackerClient;

/// Terminal state of a download session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Every piece verified and held.
    Completed,
    /// Some pieces were permanently missing or exhausted their retries.
    Aborted,
}

/// One peer's contribution to a finished session.
#[derive(Debug, Clone)]
pub struct PeerContribution {
    pub peer_id: PeerId,
    pub pieces_delivered: u32,
    pub final_score: f64,
}

/// Transfer counters for a finished session.
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub pieces_downloaded: u32,
    pub failed_attempts: u32,
    pub per_peer: Vec<PeerContribution>,
}

/// Result of a download session, terminal state plus statistics.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub state: SessionState,
    pub stats: SessionStats,
    /// Piece indices that could not be obtained, empty on completion.
    pub missing_pieces: Vec<u32>,
}

impl SessionOutcome {
    pub fn is_complete(&self) -> bool {
        self.state == SessionState::Completed
    }

    /// Converts an aborted outcome into the error naming its missing
    /// pieces, for callers that need all-or-nothing semantics.
    ///
    /// # Errors
    ///
    /// - `TorrentError::ExhaustedSources` - The session aborted
    pub fn ensure_complete(self) -> Result<Self, TorrentError> {
        if self.state == SessionState::Aborted {
            return Err(TorrentError::ExhaustedSources {
                pieces: self.missing_pieces,
            });
        }
        Ok(self)
    }
}

struct FetchResult {
    piece: u32,
    peer_id: PeerId,
    latency: Duration,
    result: Result<Bytes, TorrentError>,
}

/// State machine downloading one torrent into a local piece store.
pub struct DownloadSession<'a, C> {
    descriptor: &'a TorrentDescriptor,
    store: Arc<LocalPieceStore>,
    tracker: &'a dyn TrackerClient,
    connector: Arc<C>,
    peer_id: PeerId,
    address: SocketAddr,
    config: SessionConfig,
}

impl<'a, C: PeerConnector> DownloadSession<'a, C> {
    pub fn new(
        descriptor: &'a TorrentDescriptor,
        store: Arc<LocalPieceStore>,
        tracker: &'a dyn TrackerClient,
        connector: Arc<C>,
        peer_id: PeerId,
        address: SocketAddr,
        config: SessionConfig,
    ) -> Self {
        Self {
            descriptor,
            store,
            tracker,
            connector,
            peer_id,
            address,
            config,
        }
    }

    /// Runs the session to its terminal state.
    ///
    /// # Errors
    ///
    /// - `TorrentError::TrackerConnectionFailed` - Tracker unreachable at
    ///   session start
    /// - `TorrentError::Timeout` - Initial announce timed out
    pub async fn run(self) -> Result<SessionOutcome, TorrentError> {
        let info_hash = self.descriptor.info_hash();
        let held = self.store.held(info_hash);
        let mut missing: BTreeSet<u32> = (0..self.descriptor.piece_count())
            .filter(|index| !held.contains(index))
            .collect();

        tracing::info!(
            "Session start: torrent={info_hash} pieces={} held={} missing={}",
            self.descriptor.piece_count(),
            held.len(),
            missing.len()
        );

        // Joining the swarm must succeed; everything after this point is
        // handled with retries.
        self.tracker
            .announce(self.peer_id.clone(), self.address, info_hash, held)
            .await?;

        let mut scoreboard = Scoreboard::new(&self.config);
        let mut fetches: FuturesUnordered<_> = FuturesUnordered::new();
        let mut in_flight: HashMap<u32, PeerId> = HashMap::new();
        let mut attempts: HashMap<u32, u32> = HashMap::new();
        let mut source_waits: HashMap<u32, u32> = HashMap::new();
        let mut permanently_missing: BTreeSet<u32> = BTreeSet::new();
        let mut pieces_downloaded = 0u32;
        let mut failed_attempts = 0u32;
        let mut known_peers = Vec::new();

        while !missing.is_empty() || !in_flight.is_empty() {
            match self.tracker.list_peers(info_hash).await {
                Ok(peers) => known_peers = peers,
                Err(e) => {
                    tracing::warn!("Peer list refresh failed, reusing last view: {e}");
                }
            }
            for entry in &known_peers {
                if entry.peer_id != self.peer_id {
                    scoreboard.observe(&entry.peer_id);
                }
            }
            scoreboard.prune_cooldowns();

            let mut in_flight_counts: HashMap<PeerId, usize> = HashMap::new();
            for peer in in_flight.values() {
                *in_flight_counts.entry(peer.clone()).or_insert(0) += 1;
            }

            for piece in missing.clone() {
                if in_flight.len() >= self.config.max_in_flight {
                    break;
                }

                let holders: Vec<&crate::protocol::PeerEntry> = known_peers
                    .iter()
                    .filter(|entry| {
                        entry.peer_id != self.peer_id && entry.pieces.contains(&piece)
                    })
                    .collect();

                if holders.is_empty() {
                    let waits = source_waits.entry(piece).or_insert(0);
                    *waits += 1;
                    if *waits >= self.config.max_source_waits {
                        tracing::warn!("Piece {piece} has no sources, giving up");
                        missing.remove(&piece);
                        permanently_missing.insert(piece);
                    }
                    continue;
                }

                let holder_ids: Vec<PeerId> =
                    holders.iter().map(|entry| entry.peer_id.clone()).collect();
                let Some(chosen) = scoreboard.select(piece, &holder_ids, &in_flight_counts)
                else {
                    // Every holder is cooling down; the piece stays
                    // pending without burning its source-wait budget.
                    continue;
                };
                let address = holders
                    .iter()
                    .find(|entry| entry.peer_id == chosen)
                    .map(|entry| entry.address);
                let Some(address) = address else {
                    continue;
                };

                missing.remove(&piece);
                in_flight.insert(piece, chosen.clone());
                *in_flight_counts.entry(chosen.clone()).or_insert(0) += 1;

                let connector = Arc::clone(&self.connector);
                let piece_timeout = self.config.piece_timeout;
                fetches.push(async move {
                    let started = Instant::now();
                    let result = match timeout(
                        piece_timeout,
                        connector.fetch_piece(address, info_hash, PieceIndex::new(piece)),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(TorrentError::Timeout {
                            operation: format!("piece {piece} from {address}"),
                        }),
                    };
                    FetchResult {
                        piece,
                        peer_id: chosen,
                        latency: started.elapsed(),
                        result,
                    }
                });
            }

            if in_flight.is_empty() {
                if missing.is_empty() {
                    break;
                }
                // Nothing schedulable right now; wait for cooldowns to
                // expire or new peers to announce.
                tokio::time::sleep(self.config.replan_interval).await;
                continue;
            }

            let Some(fetched) = fetches.next().await else {
                continue;
            };
            in_flight.remove(&fetched.piece);

            let commit_result = match fetched.result {
                Ok(data) => {
                    self.store
                        .commit(self.descriptor, PieceIndex::new(fetched.piece), data)
                        .await
                }
                Err(e) => Err(e),
            };

            match commit_result {
                Ok(()) => {
                    pieces_downloaded += 1;
                    scoreboard.record_success(&fetched.peer_id, fetched.latency);
                    tracing::debug!(
                        "Piece {} verified from {} in {:?}",
                        fetched.piece,
                        fetched.peer_id,
                        fetched.latency
                    );
                    // Immediately advertise the grown bitset so other
                    // downloaders can pull this piece from us.
                    if let Err(e) = self
                        .tracker
                        .announce(
                            self.peer_id.clone(),
                            self.address,
                            info_hash,
                            self.store.held(info_hash),
                        )
                        .await
                    {
                        tracing::warn!("Re-announce after piece {} failed: {e}", fetched.piece);
                    }
                }
                Err(e) => {
                    failed_attempts += 1;
                    scoreboard.record_failure(&fetched.peer_id, fetched.piece);
                    tracing::warn!(
                        "Piece {} from {} failed: {e}",
                        fetched.piece,
                        fetched.peer_id
                    );

                    let piece_attempts = attempts.entry(fetched.piece).or_insert(0);
                    *piece_attempts += 1;
                    if *piece_attempts >= self.config.max_piece_retries {
                        tracing::warn!(
                            "Piece {} exhausted its {} attempts",
                            fetched.piece,
                            self.config.max_piece_retries
                        );
                        permanently_missing.insert(fetched.piece);
                    } else {
                        missing.insert(fetched.piece);
                    }
                }
            }
        }

        let state = if permanently_missing.is_empty() {
            SessionState::Completed
        } else {
            SessionState::Aborted
        };
        let per_peer = scoreboard
            .snapshot()
            .into_iter()
            .map(|(peer_id, pieces_delivered, final_score)| PeerContribution {
                peer_id,
                pieces_delivered,
                final_score,
            })
            .collect();

        tracing::info!(
            "Session end: torrent={info_hash} state={state:?} downloaded={pieces_downloaded} failed={failed_attempts}"
        );

        Ok(SessionOutcome {
            state,
            stats: SessionStats {
                pieces_downloaded,
                failed_attempts,
                per_peer,
            },
            missing_pieces: permanently_missing.into_iter().collect(),
        })
    }
}
