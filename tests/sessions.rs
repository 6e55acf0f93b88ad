//! Session integration tests.
//!
//! This module contains integration tests for netplay sessions over a
//! [`MemoryNetwork`](lockstep_netplay::MemoryNetwork):
//! - Lobby: joins, rejections, roster broadcasts, the client mesh, leaving
//! - Lockstep: game start, instance mapping, delayed input across peers, stalls

// Shared test infrastructure
#[path = "common/mod.rs"]
mod common;

// Session test modules
mod sessions {
    pub mod lobby;
    pub mod lockstep;
}
