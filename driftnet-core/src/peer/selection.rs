//! Peer scoring and source selection.
//!
//! Every peer starts at a neutral baseline. Verified deliveries raise a
//! peer's score, scaled up when the delivery was fast; timeouts and
//! verification failures lower it and put the (peer, piece) pair in
//! cooldown. Scores order candidates; they never gate correctness, since
//! every delivered piece is verified independently.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::SessionConfig;
use crate::torrent::PeerId;

/// Per-session view of peer reliability.
///
/// Local to one download session; peers exchange no reputation data.
pub struct Scoreboard {
    baseline_score: f64,
    success_reward: f64,
    failure_penalty: f64,
    cooldown: Duration,
    piece_timeout: Duration,
    scores: HashMap<PeerId, f64>,
    delivered: HashMap<PeerId, u32>,
    cooldowns: HashMap<(PeerId, u32), Instant>,
}

impl Scoreboard {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            baseline_score: config.baseline_score,
            success_reward: config.success_reward,
            failure_penalty: config.failure_penalty,
            cooldown: config.cooldown,
            piece_timeout: config.piece_timeout,
            scores: HashMap::new(),
            delivered: HashMap::new(),
            cooldowns: HashMap::new(),
        }
    }

    /// Registers a peer at the baseline score if not yet seen.
    pub fn observe(&mut self, peer_id: &PeerId) {
        if !self.scores.contains_key(peer_id) {
            self.scores.insert(peer_id.clone(), self.baseline_score);
        }
    }

    /// Rewards a verified delivery, scaled by how fast it arrived.
    ///
    /// A delivery near-instant relative to the piece timeout earns up to
    /// double the base reward; one that barely beat the timeout earns the
    /// base reward alone.
    pub fn record_success(&mut self, peer_id: &PeerId, latency: Duration) {
        let headroom = self.piece_timeout.saturating_sub(latency);
        let factor = 1.0 + headroom.as_secs_f64() / self.piece_timeout.as_secs_f64().max(f64::EPSILON);
        let score = self
            .scores
            .entry(peer_id.clone())
            .or_insert(self.baseline_score);
        *score += self.success_reward * factor;
        *self.delivered.entry(peer_id.clone()).or_insert(0) += 1;
    }

    /// Penalizes a failed delivery and starts the (peer, piece) cooldown.
    ///
    /// Applies equally to timeouts and verification failures.
    pub fn record_failure(&mut self, peer_id: &PeerId, piece: u32) {
        let score = self
            .scores
            .entry(peer_id.clone())
            .or_insert(self.baseline_score);
        *score -= self.failure_penalty;
        self.cooldowns
            .insert((peer_id.clone(), piece), Instant::now() + self.cooldown);
    }

    /// Whether this peer recently failed to deliver this piece.
    pub fn in_cooldown(&self, peer_id: &PeerId, piece: u32) -> bool {
        self.cooldowns
            .get(&(peer_id.clone(), piece))
            .is_some_and(|expires| Instant::now() < *expires)
    }

    /// Picks the best source for a piece among its advertised holders.
    ///
    /// Filters out pairs in cooldown, then orders by highest score,
    /// fewest in-flight requests, and finally smallest peer id, so the
    /// same inputs always yield the same choice. Returns `None` when
    /// every holder is cooling down.
    pub fn select(
        &self,
        piece: u32,
        holders: &[PeerId],
        in_flight_counts: &HashMap<PeerId, usize>,
    ) -> Option<PeerId> {
        holders
            .iter()
            .filter(|peer| !self.in_cooldown(peer, piece))
            .min_by(|a, b| {
                let score_a = self.score(a);
                let score_b = self.score(b);
                score_b
                    .total_cmp(&score_a)
                    .then_with(|| {
                        let load_a = in_flight_counts.get(*a).copied().unwrap_or(0);
                        let load_b = in_flight_counts.get(*b).copied().unwrap_or(0);
                        load_a.cmp(&load_b)
                    })
                    .then_with(|| a.cmp(b))
            })
            .cloned()
    }

    pub fn score(&self, peer_id: &PeerId) -> f64 {
        self.scores
            .get(peer_id)
            .copied()
            .unwrap_or(self.baseline_score)
    }

    pub fn pieces_delivered(&self, peer_id: &PeerId) -> u32 {
        self.delivered.get(peer_id).copied().unwrap_or(0)
    }

    /// Snapshot of all observed peers, sorted by peer id.
    pub fn snapshot(&self) -> Vec<(PeerId, u32, f64)> {
        let mut rows: Vec<(PeerId, u32, f64)> = self
            .scores
            .iter()
            .map(|(peer, score)| (peer.clone(), self.pieces_delivered(peer), *score))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    /// Drops expired cooldown entries so the map stays bounded.
    pub fn prune_cooldowns(&mut self) {
        let now = Instant::now();
        self.cooldowns.retain(|_, expires| now < *expires);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> SessionConfig {
        SessionConfig {
            cooldown: Duration::from_millis(20),
            ..SessionConfig::default()
        }
    }

    fn peers(ids: &[&str]) -> Vec<PeerId> {
        ids.iter().map(|id| PeerId::new(*id)).collect()
    }

    #[test]
    fn test_unknown_peers_tie_break_by_id() {
        let board = Scoreboard::new(&test_config());
        let holders = peers(&["peer-b", "peer-a", "peer-c"]);

        let chosen = board.select(0, &holders, &HashMap::new()).unwrap();
        assert_eq!(chosen, PeerId::new("peer-a"));
    }

    #[test]
    fn test_higher_score_wins() {
        let mut board = Scoreboard::new(&test_config());
        let holders = peers(&["peer-a", "peer-b"]);

        board.record_success(&PeerId::new("peer-b"), Duration::from_millis(50));

        let chosen = board.select(0, &holders, &HashMap::new()).unwrap();
        assert_eq!(chosen, PeerId::new("peer-b"));
    }

    #[test]
    fn test_fast_delivery_earns_more_than_slow() {
        let config = test_config();
        let mut board = Scoreboard::new(&config);

        board.record_success(&PeerId::new("fast"), Duration::from_millis(10));
        board.record_success(&PeerId::new("slow"), config.piece_timeout);

        assert!(board.score(&PeerId::new("fast")) > board.score(&PeerId::new("slow")));
    }

    #[test]
    fn test_equal_scores_prefer_less_loaded_peer() {
        let board = Scoreboard::new(&test_config());
        let holders = peers(&["peer-a", "peer-b"]);

        let mut in_flight = HashMap::new();
        in_flight.insert(PeerId::new("peer-a"), 2usize);

        let chosen = board.select(0, &holders, &in_flight).unwrap();
        assert_eq!(chosen, PeerId::new("peer-b"));
    }

    #[test]
    fn test_failure_starts_cooldown_for_that_piece_only() {
        let mut board = Scoreboard::new(&test_config());
        let failed = PeerId::new("peer-a");

        board.record_failure(&failed, 3);

        assert!(board.in_cooldown(&failed, 3));
        assert!(!board.in_cooldown(&failed, 4));
        assert!(board.select(3, &peers(&["peer-a"]), &HashMap::new()).is_none());
        assert!(board.select(4, &peers(&["peer-a"]), &HashMap::new()).is_some());
    }

    #[test]
    fn test_cooldown_expires() {
        let mut board = Scoreboard::new(&test_config());
        let failed = PeerId::new("peer-a");

        board.record_failure(&failed, 0);
        assert!(board.in_cooldown(&failed, 0));

        std::thread::sleep(Duration::from_millis(40));
        assert!(!board.in_cooldown(&failed, 0));
        assert_eq!(
            board.select(0, &peers(&["peer-a"]), &HashMap::new()),
            Some(failed)
        );
    }

    #[test]
    fn test_cooldown_excludes_failed_peer_while_other_remains() {
        let mut board = Scoreboard::new(&test_config());
        board.record_failure(&PeerId::new("peer-a"), 1);

        let chosen = board
            .select(1, &peers(&["peer-a", "peer-b"]), &HashMap::new())
            .unwrap();
        assert_eq!(chosen, PeerId::new("peer-b"));
    }

    #[test]
    fn test_snapshot_sorted_with_delivery_counts() {
        let mut board = Scoreboard::new(&test_config());
        board.observe(&PeerId::new("peer-b"));
        board.record_success(&PeerId::new("peer-a"), Duration::from_millis(10));
        board.record_success(&PeerId::new("peer-a"), Duration::from_millis(10));

        let rows = board.snapshot();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, PeerId::new("peer-a"));
        assert_eq!(rows[0].1, 2);
        assert_eq!(rows[1].1, 0);
    }
}
