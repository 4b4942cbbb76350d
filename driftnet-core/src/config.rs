//! Centralized configuration for Driftnet.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::path::PathBuf;
use std::time::Duration;

/// Central configuration for all Driftnet components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct DriftnetConfig {
    pub torrent: TorrentConfig,
    pub network: NetworkConfig,
    pub session: SessionConfig,
    pub storage: StorageConfig,
}

/// Torrent descriptor and piece layout configuration.
#[derive(Debug, Clone)]
pub struct TorrentConfig {
    /// Default piece size for new torrents
    pub default_piece_length: u32,
    /// Upper bound accepted when creating descriptors
    pub max_piece_length: u32,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            default_piece_length: 32_768,  // 32 KiB
            max_piece_length: 1_048_576,   // 1 MiB
        }
    }
}

impl TorrentConfig {
    /// Picks a piece length suited to the file size.
    ///
    /// Small files get small pieces so a swarm still has several pieces
    /// to spread across peers; everything else uses the default.
    pub fn piece_length_for(&self, file_size: u64) -> u32 {
        if file_size < 1_048_576 {
            1024
        } else {
            self.default_piece_length
        }
    }
}

/// Network communication configuration for tracker and peer protocols.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Request timeout for tracker round-trips
    pub tracker_timeout: Duration,
    /// Connect/request timeout for peer connections
    pub peer_timeout: Duration,
    /// Tracker-side: announce records older than this are expired
    pub peer_expiry: Duration,
    /// Tracker-side: interval between expiry sweeps
    pub expiry_sweep_interval: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            tracker_timeout: Duration::from_secs(10),
            peer_timeout: Duration::from_secs(5),
            peer_expiry: Duration::from_secs(300),
            expiry_sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Download session scheduling, retry, and scoring configuration.
///
/// The scoring constants are tuning knobs, not a protocol contract:
/// selection quality only affects throughput, never correctness.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum simultaneous in-flight piece requests
    pub max_in_flight: usize,
    /// Timeout for a single piece request
    pub piece_timeout: Duration,
    /// Failed attempts allowed per piece before it is reported missing
    pub max_piece_retries: u32,
    /// Planning passes a piece may spend with zero advertised sources
    pub max_source_waits: u32,
    /// Cooldown applied to a (peer, piece) pair after a failed delivery
    pub cooldown: Duration,
    /// Pause between planning passes when nothing is schedulable
    pub replan_interval: Duration,
    /// Neutral starting score for newly discovered peers
    pub baseline_score: f64,
    /// Score reward for a verified delivery (scaled up for fast peers)
    pub success_reward: f64,
    /// Score penalty for a timeout or verification failure
    pub failure_penalty: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 5,
            piece_timeout: Duration::from_secs(10),
            max_piece_retries: 5,
            max_source_waits: 10,
            cooldown: Duration::from_secs(15),
            replan_interval: Duration::from_millis(250),
            baseline_score: 50.0,
            success_reward: 10.0,
            failure_penalty: 20.0,
        }
    }
}

/// Piece persistence configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Bound on piece store reads when serving remote requests
    pub read_timeout: Duration,
    /// Optional directory for caching verified pieces to disk
    pub cache_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(2),
            cache_dir: None,
        }
    }
}

impl DriftnetConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(timeout) = std::env::var("DRIFTNET_TRACKER_TIMEOUT") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.network.tracker_timeout = Duration::from_secs(seconds);
            }
        }

        if let Ok(timeout) = std::env::var("DRIFTNET_PIECE_TIMEOUT") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.session.piece_timeout = Duration::from_secs(seconds);
            }
        }

        if let Ok(in_flight) = std::env::var("DRIFTNET_MAX_IN_FLIGHT") {
            if let Ok(count) = in_flight.parse::<usize>() {
                config.session.max_in_flight = count;
            }
        }

        if let Ok(dir) = std::env::var("DRIFTNET_CACHE_DIR") {
            config.storage.cache_dir = Some(PathBuf::from(dir));
        }

        config
    }

    /// Creates a configuration with short timeouts suited to tests.
    pub fn for_testing() -> Self {
        let mut config = Self::default();
        config.network.tracker_timeout = Duration::from_secs(2);
        config.network.peer_timeout = Duration::from_secs(2);
        config.session.piece_timeout = Duration::from_millis(500);
        config.session.cooldown = Duration::from_millis(100);
        config.session.replan_interval = Duration::from_millis(10);
        config.session.max_piece_retries = 3;
        config.session.max_source_waits = 3;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = DriftnetConfig::default();

        assert_eq!(config.torrent.default_piece_length, 32_768);
        assert_eq!(config.session.max_in_flight, 5);
        assert_eq!(config.network.tracker_timeout, Duration::from_secs(10));
        assert_eq!(config.session.max_piece_retries, 5);
        assert!(config.storage.cache_dir.is_none());
    }

    #[test]
    fn test_piece_length_for_file_size() {
        let config = TorrentConfig::default();

        assert_eq!(config.piece_length_for(10), 1024);
        assert_eq!(config.piece_length_for(1_048_575), 1024);
        assert_eq!(config.piece_length_for(10_485_760), 32_768);
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("DRIFTNET_TRACKER_TIMEOUT", "60");
            std::env::set_var("DRIFTNET_MAX_IN_FLIGHT", "12");
        }

        let config = DriftnetConfig::from_env();

        assert_eq!(config.network.tracker_timeout, Duration::from_secs(60));
        assert_eq!(config.session.max_in_flight, 12);

        // Cleanup
        unsafe {
            std::env::remove_var("DRIFTNET_TRACKER_TIMEOUT");
            std::env::remove_var("DRIFTNET_MAX_IN_FLIGHT");
        }
    }

    #[test]
    fn test_testing_preset_shrinks_timeouts() {
        let config = DriftnetConfig::for_testing();
        assert!(config.session.piece_timeout < Duration::from_secs(1));
        assert!(config.session.cooldown < Duration::from_secs(1));
    }
}
