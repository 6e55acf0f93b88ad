//! Common test infrastructure shared across integration tests.
//!
//! This module provides:
//! - `stubs`: a recording [`Simulation`](lockstep_netplay::Simulation) with any number of instances
//! - `test_utils`: addresses, session construction and helpers that drive joins and lockstep rounds
//!
//! # Usage
//!
//! From any integration test file:
//! ```ignore
//! #[path = "common/mod.rs"]
//! mod common;
//! use common::stubs::SimStub;
//! use common::{host_session, join, settle};
//! ```

pub mod stubs;
pub mod test_utils;

// Re-export commonly used items for convenience.
// Not every integration crate uses every helper.
#[allow(unused_imports)]
pub use test_utils::{
    client_session, host_session, ip, join, run_round, session_with, settle, PORT, SETTLE_PASSES,
};
