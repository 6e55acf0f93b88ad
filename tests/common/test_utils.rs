//! Shared test utilities for integration tests.
//!
//! Every test builds its own [`MemoryNetwork`], so addresses and ports never
//! collide between tests running in parallel. Participants are told apart by
//! IP: `10.0.0.1` hosts, clients take the following addresses.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    dead_code
)]

use std::net::{IpAddr, Ipv4Addr};
use std::thread;

use lockstep_netplay::{
    MemoryNetwork, NetplayError, NetplaySession, ProcessOutcome, SessionBuilder, SessionConfig,
};
use web_time::Duration;

use super::stubs::SimStub;

/// Session port shared by every participant.
pub const PORT: u16 = 8064;

/// Upper bound on passes [`settle`] makes before giving up.
pub const SETTLE_PASSES: usize = 64;

/// How often the host is polled while a client blocks in its handshake.
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// `10.0.0.last`.
#[must_use]
pub fn ip(last: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
}

/// An idle session living at `ip(last)`.
#[must_use]
pub fn session_with(network: &MemoryNetwork, last: u8, config: SessionConfig) -> NetplaySession {
    SessionBuilder::new()
        .with_session_config(config)
        .with_transport_factory(network.factory(ip(last)))
        .build()
        .expect("session config should be valid")
}

/// A session hosting at `ip(1)`.
#[must_use]
pub fn host_session(network: &MemoryNetwork, config: SessionConfig) -> NetplaySession {
    let mut host = session_with(network, 1, config);
    host.start_as_host("Host", PORT)
        .expect("hosting on a fresh network should succeed");
    host
}

/// An idle session at `ip(last)` with the default config.
#[must_use]
pub fn client_session(network: &MemoryNetwork, last: u8) -> NetplaySession {
    session_with(network, last, SessionConfig::default())
}

/// Joins `client` to the session hosted by `host`.
///
/// The join blocks, so it runs on a scoped thread while this thread keeps the
/// host polling. Once the handshake is over the host is polled once more so
/// the client's registration is handled and the roster goes out.
pub fn join(
    host: &mut NetplaySession,
    client: &mut NetplaySession,
    name: &str,
) -> Result<(), NetplayError> {
    let host_ip = ip(1);
    thread::scope(|scope| {
        let joining = scope.spawn(|| client.start_as_client(name, host_ip, PORT));
        while !joining.is_finished() {
            host.poll_network();
            thread::sleep(JOIN_POLL_INTERVAL);
        }
        let result = joining.join().expect("join thread panicked");
        host.poll_network();
        result
    })
}

/// Polls every session until a full pass handles no events.
///
/// Returns the number of passes that handled something.
pub fn settle(sessions: &mut [&mut NetplaySession]) -> usize {
    for pass in 0..SETTLE_PASSES {
        let handled: usize = sessions
            .iter_mut()
            .map(|session| session.poll_network())
            .sum();
        if handled == 0 {
            return pass;
        }
    }
    panic!("sessions did not settle after {SETTLE_PASSES} passes");
}

/// One tick for every session: instance 0 first, then every other mapped instance.
///
/// `sims[i]` belongs to `sessions[i]`. Returns the outcomes per session, per instance.
pub fn run_round(
    sessions: &mut [&mut NetplaySession],
    sims: &mut [SimStub],
) -> Vec<Vec<ProcessOutcome>> {
    sessions
        .iter_mut()
        .zip(sims.iter_mut())
        .map(|(session, sim)| {
            let instances = session.state().instances.len().max(1);
            (0..instances)
                .map(|instance| {
                    session
                        .process(instance, sim)
                        .expect("process should succeed on an active session")
                })
                .collect()
        })
        .collect()
}
