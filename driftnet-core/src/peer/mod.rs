//! Peer agent: server role answering piece requests, client role running
//! download sessions, and the scoring policy that picks sources.

pub mod agent;
pub mod connector;
pub mod selection;
pub mod server;
pub mod session;

pub use agent::PeerAgent;
pub use connector::{PeerConnector, TcpPeerConnector};
pub use selection::Scoreboard;
pub use server::{PeerServer, PeerServerHandle};
pub use session::{
    DownloadSession, PeerContribution, SessionOutcome, SessionState, SessionStats,
};
