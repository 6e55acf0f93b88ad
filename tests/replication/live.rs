//! End-to-end replication: reload, Ready barrier, lockstep and backpressure.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use lockstep_netplay::telemetry::{CollectingObserver, ViolationKind};
use lockstep_netplay::{
    Backpressure, Frame, LocalInput, MemoryNetwork, NetplayError, ObserverPhase, ProcessOutcome,
    ReplicationConfig, ReplicationObserver, ReplicationOrigin, DEFAULT_LAG_DEPTH,
    NEUTRAL_KEY_MASK,
};
use web_time::{Duration, Instant};

use crate::common::ip;
use crate::common::stubs::SimStub;

const ORIGIN_PORT: u16 = 7064;
const START: i32 = 120;
const TEST_DEADLINE: Duration = Duration::from_secs(10);
const IDLE_WAIT: Duration = Duration::from_millis(1);

fn addr(last: u8) -> SocketAddr {
    SocketAddr::new(ip(last), ORIGIN_PORT)
}

fn config() -> ReplicationConfig {
    ReplicationConfig {
        chunk_size: 64,
        sync_timeout: Duration::from_secs(5),
        max_observer_lag: 8,
        ..ReplicationConfig::default()
    }
}

fn connect_observer(network: &MemoryNetwork, last: u8) -> ReplicationObserver {
    ReplicationObserver::connect(&network.factory(ip(last)), addr(last), addr(1), config())
        .unwrap()
}

/// Pumps until the observer is live.
fn until_live(observer: &mut ReplicationObserver, sim: &mut SimStub) {
    let deadline = Instant::now() + TEST_DEADLINE;
    loop {
        match observer.pump(sim, Duration::from_millis(10)) {
            ObserverPhase::Live => return,
            ObserverPhase::Closed => panic!("origin went away before going live"),
            ObserverPhase::Receiving | ObserverPhase::Synced => {
                assert!(Instant::now() < deadline, "observer never went live");
            },
        }
    }
}

fn origin_input(frame: i32) -> LocalInput {
    LocalInput {
        key_mask: (frame as u32) & NEUTRAL_KEY_MASK,
        touch: None,
    }
}

#[test]
fn observers_reload_and_follow_the_origin() {
    const END: i32 = START + 60;
    let network = MemoryNetwork::new();
    let mut origin = ReplicationOrigin::bind(&network.factory(ip(1)), addr(1), config()).unwrap();
    let observers: Vec<_> = (2..=3).map(|last| connect_observer(&network, last)).collect();
    assert_eq!(origin.wait_for_observers(2, Duration::from_secs(1)), 2);

    let cart: Vec<u8> = (0..1000_u32).map(|i| (i % 251) as u8).collect();
    let save = vec![0xA5; 130];
    let mut origin_sim = SimStub::new(1).at_frame(START);

    let (report, observer_sims) = thread::scope(|scope| {
        let handles: Vec<_> = observers
            .into_iter()
            .map(|mut observer| {
                scope.spawn(move || {
                    let mut sim = SimStub::new(1);
                    until_live(&mut observer, &mut sim);
                    let deadline = Instant::now() + TEST_DEADLINE;
                    while sim.frame(0) < END {
                        assert!(Instant::now() < deadline, "observer stalled at {}", sim.frame(0));
                        if !observer.process(&mut sim).may_advance() {
                            thread::sleep(IDLE_WAIT);
                        }
                    }
                    sim
                })
            })
            .collect();

        let report = origin
            .replicate(&origin_sim, &cart, Some(&save), 2, 2)
            .unwrap();
        let deadline = Instant::now() + TEST_DEADLINE;
        while origin_sim.frame(0) < END {
            assert!(Instant::now() < deadline, "origin stalled at {}", origin_sim.frame(0));
            let input = origin_input(origin_sim.frame(0));
            if !origin.process(&mut origin_sim, input).unwrap().may_advance() {
                thread::sleep(IDLE_WAIT);
            }
        }
        let sims: Vec<SimStub> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        (report, sims)
    });

    assert!(report.is_complete());
    assert_eq!(report.ready, 2);

    for sim in &observer_sims {
        assert_eq!(sim.console_type, Some(2));
        assert_eq!(sim.resets, 1);
        assert_eq!(sim.cart.as_deref(), Some(&cart[..]));
        assert_eq!(sim.save.as_deref(), Some(&save[..]));
        assert_eq!(sim.frame(0), END);
        assert_eq!(sim.applied[0], origin_sim.applied[0]);
    }

    let applied = &origin_sim.applied[0];
    assert_eq!(applied.first().map(|a| a.frame), Some(Frame::new(START)));
    assert!(applied[..DEFAULT_LAG_DEPTH]
        .iter()
        .all(|a| a.key_mask == NEUTRAL_KEY_MASK));
    for a in &applied[DEFAULT_LAG_DEPTH..] {
        let sampled_at = a.frame.as_i32() - DEFAULT_LAG_DEPTH as i32;
        assert_eq!(a.key_mask, origin_input(sampled_at).key_mask);
    }
}

#[test]
fn origin_pauses_for_an_observer_that_falls_behind() {
    let network = MemoryNetwork::new();
    let mut origin = ReplicationOrigin::bind(&network.factory(ip(1)), addr(1), config()).unwrap();
    let observer = connect_observer(&network, 2);
    assert_eq!(origin.wait_for_observers(1, Duration::from_secs(1)), 1);
    let mut origin_sim = SimStub::new(1).at_frame(START);

    let (mut observer, mut observer_sim) = thread::scope(|scope| {
        let handle = scope.spawn(move || {
            let mut observer = observer;
            let mut sim = SimStub::new(1);
            until_live(&mut observer, &mut sim);
            (observer, sim)
        });
        origin.replicate(&origin_sim, b"cart", None, 0, 1).unwrap();
        handle.join().unwrap()
    });
    assert_eq!(observer_sim.frame(0), START);
    assert_eq!(observer_sim.save, None);

    // The observer does not run, so its last ack stays at the live frame.
    let max_lag = config().max_observer_lag;
    for frame in START..=START + max_lag {
        assert_eq!(
            origin.process(&mut origin_sim, origin_input(frame)).unwrap(),
            ProcessOutcome::Applied(Frame::new(frame))
        );
    }
    let stalled_at = Frame::new(START + max_lag + 1);
    assert!(matches!(
        origin.backpressure(stalled_at),
        Backpressure::Paused { behind, .. } if behind == max_lag + 1
    ));
    assert_eq!(
        origin.process(&mut origin_sim, origin_input(stalled_at.as_i32())).unwrap(),
        ProcessOutcome::Waiting
    );
    assert_eq!(origin_sim.frame(0), stalled_at.as_i32());

    // Catching up releases the origin.
    for _ in 0..4 {
        assert!(observer.process(&mut observer_sim).may_advance());
    }
    origin.pump(Duration::ZERO);
    assert_eq!(origin.backpressure(stalled_at), Backpressure::Clear);
    assert_eq!(
        origin.process(&mut origin_sim, origin_input(stalled_at.as_i32())).unwrap(),
        ProcessOutcome::Applied(stalled_at)
    );
}

#[test]
fn missing_ready_times_out_and_goes_live_anyway() {
    let network = MemoryNetwork::new();
    let violations = Arc::new(CollectingObserver::new());
    let mut origin = ReplicationOrigin::bind(
        &network.factory(ip(1)),
        addr(1),
        ReplicationConfig {
            sync_timeout: Duration::from_millis(50),
            ..config()
        },
    )
    .unwrap()
    .with_violation_observer(violations.clone());
    // Connected but never pumped, so it never answers.
    let _silent = connect_observer(&network, 2);
    assert_eq!(origin.wait_for_observers(1, Duration::from_secs(1)), 1);

    let mut sim = SimStub::new(1);
    let report = origin.replicate(&sim, b"cart", None, 0, 1).unwrap();
    assert!(!report.is_complete());
    assert_eq!(report.ready, 0);
    assert!(report.waited >= Duration::from_millis(50));
    assert!(violations.has_violation(ViolationKind::Replication));
    assert!(origin.is_live());

    // The silent observer never acks, yet the origin keeps running well past the lag limit.
    let ticks = 20 * config().max_observer_lag;
    for frame in 0..ticks {
        assert_eq!(
            origin.process(&mut sim, origin_input(frame)).unwrap(),
            ProcessOutcome::Applied(Frame::new(frame))
        );
    }
    assert_eq!(sim.frame(0), ticks);

    assert!(matches!(
        origin.replicate(&sim, b"cart", None, 0, 1),
        Err(NetplayError::InvalidRequest { .. })
    ));
}

#[test]
fn observer_that_cannot_load_never_reports_ready() {
    let network = MemoryNetwork::new();
    let mut origin = ReplicationOrigin::bind(
        &network.factory(ip(1)),
        addr(1),
        ReplicationConfig {
            sync_timeout: Duration::from_millis(200),
            ..config()
        },
    )
    .unwrap();
    let violations = Arc::new(CollectingObserver::new());
    let observer = connect_observer(&network, 2).with_violation_observer(violations.clone());
    assert_eq!(origin.wait_for_observers(1, Duration::from_secs(1)), 1);

    let report = thread::scope(|scope| {
        let handle = scope.spawn(move || {
            let mut observer = observer;
            let mut sim = SimStub::new(1);
            sim.refuse_cart = true;
            let deadline = Instant::now() + Duration::from_millis(500);
            while Instant::now() < deadline {
                observer.pump(&mut sim, Duration::from_millis(10));
            }
            observer.phase()
        });
        let report = origin.replicate(&SimStub::new(1), b"cart", None, 0, 1).unwrap();
        // GoLive is refused by an observer that never synced.
        assert_eq!(handle.join().unwrap(), ObserverPhase::Receiving);
        report
    });
    assert_eq!(report.ready, 0);
    assert!(violations.has_violation(ViolationKind::Replication));
}
