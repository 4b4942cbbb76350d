//! CLI command implementations

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Subcommand;
use driftnet_core::config::DriftnetConfig;
use driftnet_core::peer::{PeerAgent, SessionOutcome};
use driftnet_core::storage::InMemoryMetadataStore;
use driftnet_core::torrent::{PeerId, TorrentDescriptor};
use driftnet_core::tracker::{TcpTrackerClient, TrackerRegistry, TrackerServer};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run the tracker service
    Tracker {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: IpAddr,
        /// Port to bind to
        #[arg(short, long, default_value = "6888")]
        port: u16,
    },
    /// Create a torrent file describing a local file
    Create {
        /// File to describe
        file: PathBuf,
        /// Where to write the torrent file (defaults to <file>.torrent)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Piece length in bytes (defaults to a size-appropriate value)
        #[arg(long)]
        piece_length: Option<u32>,
    },
    /// Show the contents of a torrent file
    Info {
        /// Torrent file to inspect
        torrent: PathBuf,
    },
    /// Seed a complete file into a swarm
    Seed {
        /// Torrent file describing the content
        torrent: PathBuf,
        /// The complete file to serve
        file: PathBuf,
        /// Tracker address
        #[arg(long, default_value = "127.0.0.1:6888")]
        tracker: SocketAddr,
        /// Port to serve pieces on (0 picks a free port)
        #[arg(short, long, default_value = "0")]
        port: u16,
        /// Peer identifier (defaults to a generated one)
        #[arg(long)]
        peer_id: Option<String>,
    },
    /// Download a torrent from its swarm
    Download {
        /// Torrent file describing the content
        torrent: PathBuf,
        /// Tracker address
        #[arg(long, default_value = "127.0.0.1:6888")]
        tracker: SocketAddr,
        /// Where to write the completed file (defaults to the torrent's file name)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Port to serve pieces on while downloading (0 picks a free port)
        #[arg(short, long, default_value = "0")]
        port: u16,
        /// Peer identifier (defaults to a generated one)
        #[arg(long)]
        peer_id: Option<String>,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Tracker { host, port } => run_tracker(host, port).await,
        Commands::Create {
            file,
            output,
            piece_length,
        } => create_torrent(file, output, piece_length).await,
        Commands::Info { torrent } => show_info(torrent).await,
        Commands::Seed {
            torrent,
            file,
            tracker,
            port,
            peer_id,
        } => seed(torrent, file, tracker, port, peer_id).await,
        Commands::Download {
            torrent,
            tracker,
            output,
            port,
            peer_id,
        } => download(torrent, tracker, output, port, peer_id).await,
    }
}

async fn run_tracker(host: IpAddr, port: u16) -> anyhow::Result<()> {
    let config = DriftnetConfig::from_env();
    let registry = Arc::new(TrackerRegistry::new());
    let store = Arc::new(InMemoryMetadataStore::new());

    let server = TrackerServer::new(registry, store, config.network);
    let handle = server
        .start(SocketAddr::new(host, port))
        .await
        .context("failed to start tracker")?;

    println!("Tracker running on {}", handle.local_addr);
    println!("Press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    handle.shutdown();
    println!("Tracker stopped");
    Ok(())
}

async fn create_torrent(
    file: PathBuf,
    output: Option<PathBuf>,
    piece_length: Option<u32>,
) -> anyhow::Result<()> {
    let config = DriftnetConfig::from_env();
    let file_size = tokio::fs::metadata(&file)
        .await
        .with_context(|| format!("cannot read {}", file.display()))?
        .len();

    let piece_length = match piece_length {
        Some(length) => {
            anyhow::ensure!(
                length > 0 && length <= config.torrent.max_piece_length,
                "piece length must be between 1 and {}",
                config.torrent.max_piece_length
            );
            length
        }
        None => config.torrent.piece_length_for(file_size),
    };

    let descriptor = TorrentDescriptor::from_file(&file, piece_length).await?;
    let output = output.unwrap_or_else(|| file.with_extension("torrent"));
    descriptor.write_torrent_file(&output).await?;

    println!("Created {}", output.display());
    print_descriptor(&descriptor);
    Ok(())
}

async fn show_info(torrent: PathBuf) -> anyhow::Result<()> {
    let descriptor = TorrentDescriptor::read_torrent_file(&torrent).await?;
    print_descriptor(&descriptor);
    Ok(())
}

async fn seed(
    torrent: PathBuf,
    file: PathBuf,
    tracker: SocketAddr,
    port: u16,
    peer_id: Option<String>,
) -> anyhow::Result<()> {
    let config = DriftnetConfig::from_env();
    let descriptor = TorrentDescriptor::read_torrent_file(&torrent).await?;
    let peer_id = peer_id.map(PeerId::new).unwrap_or_else(PeerId::generate);
    let reannounce_interval = config.network.peer_expiry / 2;

    let client = TcpTrackerClient::new(tracker, config.network.clone());
    let agent = PeerAgent::start(
        peer_id,
        SocketAddr::new([127, 0, 0, 1].into(), port),
        client,
        config,
    )
    .await?;

    let pieces = agent.seed_file(&descriptor, &file).await?;
    println!(
        "Seeding {} ({} pieces) as {} on {}",
        descriptor.file_name(),
        pieces,
        agent.peer_id(),
        agent.address()
    );
    println!("Press Ctrl-C to stop");

    // Keep the tracker record fresh until shutdown
    let mut reannounce = tokio::time::interval(reannounce_interval);
    reannounce.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = reannounce.tick() => {
                if let Err(e) = agent.announce(&descriptor).await {
                    tracing::warn!("Re-announce failed: {e}");
                }
            }
        }
    }

    agent.deregister(descriptor.info_hash()).await.ok();
    agent.shutdown();
    println!("Stopped seeding");
    Ok(())
}

async fn download(
    torrent: PathBuf,
    tracker: SocketAddr,
    output: Option<PathBuf>,
    port: u16,
    peer_id: Option<String>,
) -> anyhow::Result<()> {
    let config = DriftnetConfig::from_env();
    let descriptor = TorrentDescriptor::read_torrent_file(&torrent).await?;
    let peer_id = peer_id.map(PeerId::new).unwrap_or_else(PeerId::generate);
    let output = output.unwrap_or_else(|| PathBuf::from(descriptor.file_name()));

    let client = TcpTrackerClient::new(tracker, config.network.clone());
    let agent = PeerAgent::start(
        peer_id,
        SocketAddr::new([127, 0, 0, 1].into(), port),
        client,
        config,
    )
    .await?;

    println!(
        "Downloading {} ({}, {} pieces)",
        descriptor.file_name(),
        format_size(descriptor.file_size()),
        descriptor.piece_count()
    );

    let started = Instant::now();
    let outcome = agent.download_to_file(&descriptor, &output).await?;
    print_session_report(&outcome, started.elapsed());

    if outcome.is_complete() {
        println!("Wrote {}", output.display());
    }

    agent.deregister(descriptor.info_hash()).await.ok();
    agent.shutdown();
    outcome.ensure_complete()?;
    Ok(())
}

fn print_descriptor(descriptor: &TorrentDescriptor) {
    println!("  File:         {}", descriptor.file_name());
    println!("  Size:         {}", format_size(descriptor.file_size()));
    println!(
        "  Pieces:       {} x {}",
        descriptor.piece_count(),
        format_size(u64::from(descriptor.piece_length()))
    );
    println!("  Info hash:    {}", descriptor.info_hash());
}

fn print_session_report(outcome: &SessionOutcome, elapsed: Duration) {
    if outcome.is_complete() {
        println!("Download complete in {}", format_duration(elapsed));
    } else {
        println!(
            "Download aborted after {}: pieces {:?} could not be obtained",
            format_duration(elapsed),
            outcome.missing_pieces
        );
    }
    println!(
        "  Pieces downloaded: {}, failed attempts: {}",
        outcome.stats.pieces_downloaded, outcome.stats.failed_attempts
    );
    if !outcome.stats.per_peer.is_empty() {
        println!("  Peer contributions:");
        for peer in &outcome.stats.per_peer {
            println!(
                "    {:<20} {:>3} pieces  score {:.1}",
                peer.peer_id.as_str(),
                peer.pieces_delivered,
                peer.final_score
            );
        }
    }
}

/// Formats a byte count using binary units.
fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs_f64();
    if seconds < 1.0 {
        format!("{:.0}ms", seconds * 1000.0)
    } else if seconds < 60.0 {
        format!("{seconds:.1}s")
    } else {
        format!("{}m{:02}s", duration.as_secs() / 60, duration.as_secs() % 60)
    }
}
