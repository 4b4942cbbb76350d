//! Tracker side of the protocol: the peer/piece registry and its
//! network service.

pub mod client;
pub mod registry;
pub mod server;

pub use client::{LocalTrackerClient, TcpTrackerClient, TrackerClient};
pub use registry::{PeerRecord, TrackerRegistry};
pub use server::{TrackerServer, TrackerServerHandle};
