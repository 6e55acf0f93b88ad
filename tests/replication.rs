//! Replication integration tests.
//!
//! This module contains integration tests for blob replication:
//! - Blobs: chunk partitioning and reassembly across an origin and a receiver
//! - Live: reload on Sync, the Ready barrier, lockstep after GoLive and backpressure

// Shared test infrastructure
#[path = "common/mod.rs"]
mod common;

// Replication test modules
mod replication {
    pub mod blobs;
    pub mod live;
}
