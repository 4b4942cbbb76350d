//! End-to-end tests for Driftnet
//!
//! These tests verify complete user workflows from start to finish:
//! descriptor creation, torrent file artifacts, seeding, downloading,
//! and the assembled file landing on disk.

mod distribution_workflow;
