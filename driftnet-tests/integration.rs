//! Integration tests for Driftnet
//!
//! These tests exercise real TCP connections between the tracker service
//! and peer agents, verifying component interactions and wire contracts.

#[path = "integration/swarm_transfer.rs"]
mod swarm_transfer;

#[path = "integration/fault_tolerance.rs"]
mod fault_tolerance;
