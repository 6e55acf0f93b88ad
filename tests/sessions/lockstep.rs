//! Game start and lockstep integration tests.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::collections::BTreeMap;

use lockstep_netplay::{
    Frame, LocalInput, MemoryNetwork, NetplayError, NetplayEvent, NetplaySession, PlayerId,
    ProcessOutcome, SessionConfig, SessionHealth, Touch, NEUTRAL_KEY_MASK,
};

use crate::common::stubs::{Applied, SimStub};
use crate::common::{client_session, host_session, join, run_round, settle};

/// Host plus two clients, lobby settled, game not started.
fn three_peers(network: &MemoryNetwork) -> (NetplaySession, NetplaySession, NetplaySession) {
    let mut host = host_session(network, SessionConfig::default());
    let mut alice = client_session(network, 2);
    let mut bob = client_session(network, 3);
    join(&mut host, &mut alice, "Alice").unwrap();
    join(&mut host, &mut bob, "Bob").unwrap();
    settle(&mut [&mut host, &mut alice, &mut bob]);
    (host, alice, bob)
}

/// What each player applied, keyed by player, as seen by one session.
fn by_player(session: &NetplaySession, sim: &SimStub) -> BTreeMap<PlayerId, Vec<Applied>> {
    session
        .state()
        .instances
        .iter()
        .map(|(instance, player)| (player, sim.applied[instance].clone()))
        .collect()
}

fn input_for(player: PlayerId, round: u32) -> LocalInput {
    LocalInput {
        key_mask: (round * 16 + u32::from(player.as_u8())) & NEUTRAL_KEY_MASK,
        touch: (round % 3 == 0).then_some(Touch {
            x: round as u16,
            y: u16::from(player.as_u8()),
        }),
    }
}

#[test]
fn start_maps_the_local_player_to_instance_zero_everywhere() {
    let network = MemoryNetwork::new();
    let (mut host, mut alice, mut bob) = three_peers(&network);

    assert_eq!(alice.start_game(), Err(NetplayError::NotHost));
    host.start_game().unwrap();
    assert_eq!(host.start_game(), Err(NetplayError::GameAlreadyRunning));
    settle(&mut [&mut host, &mut alice, &mut bob]);

    let expected = [
        (&host, [0, 1, 2]),
        (&alice, [1, 0, 2]),
        (&bob, [2, 0, 1]),
    ];
    for (session, players) in expected {
        let instances = &session.state().instances;
        assert!(session.state().running);
        assert_eq!(instances.len(), 3);
        for (instance, player) in players.into_iter().enumerate() {
            assert_eq!(instances.player_for(instance), Some(PlayerId::new(player)));
            assert_eq!(instances.instance_for(PlayerId::new(player)), Some(instance));
        }
    }

    for (session, local) in [(&mut host, 0), (&mut alice, 1), (&mut bob, 2)] {
        let started: Vec<_> = session
            .events()
            .filter(|event| matches!(event, NetplayEvent::GameStarted { .. }))
            .collect();
        assert_eq!(
            started,
            vec![NetplayEvent::GameStarted {
                local_player: PlayerId::new(local),
                instances: 3,
            }]
        );
    }
}

#[test]
fn every_peer_applies_the_same_inputs_on_the_same_frames() {
    const ROUNDS: u32 = 40;
    let network = MemoryNetwork::new();
    let (mut host, mut alice, mut bob) = three_peers(&network);
    let lag = host.config().lag_depth;
    host.start_game().unwrap();

    let mut sims = vec![SimStub::new(3), SimStub::new(3), SimStub::new(3)];
    for round in 0..ROUNDS {
        for (session, player) in [(&mut host, 0), (&mut alice, 1), (&mut bob, 2)] {
            session
                .add_local_input(input_for(PlayerId::new(player), round))
                .unwrap();
        }
        run_round(&mut [&mut host, &mut alice, &mut bob], &mut sims);
    }

    let views = [
        by_player(&host, &sims[0]),
        by_player(&alice, &sims[1]),
        by_player(&bob, &sims[2]),
    ];
    for player in (0..3).map(PlayerId::new) {
        let reference = &views[0][&player];
        for view in &views[1..] {
            let applied = &view[&player];
            let common = applied.len().min(reference.len());
            assert!(common >= (ROUNDS as usize) - lag, "player {player} fell behind");
            assert_eq!(applied[..common], reference[..common], "player {player} diverged");
        }
        // Frames are applied in order, one at a time, starting with the neutral prefill.
        for (index, applied) in reference.iter().enumerate() {
            assert_eq!(applied.frame, Frame::new(index as i32));
        }
        assert!(reference[..lag]
            .iter()
            .all(|applied| applied.key_mask == NEUTRAL_KEY_MASK && applied.touch.is_none()));
        assert_eq!(reference[lag].key_mask, u32::from(player.as_u8()));
        assert_eq!(
            reference[lag].touch,
            Some(Touch {
                x: 0,
                y: u16::from(player.as_u8())
            })
        );
    }

    for session in [&host, &alice, &bob] {
        assert_eq!(session.health(), SessionHealth::Healthy);
    }
}

#[test]
fn a_silent_peer_stalls_its_instance_until_input_arrives() {
    let network = MemoryNetwork::new();
    let mut host = host_session(&network, SessionConfig::default());
    let mut alice = client_session(&network, 2);
    join(&mut host, &mut alice, "Alice").unwrap();
    settle(&mut [&mut host, &mut alice]);
    let lag = host.config().lag_depth;

    host.start_game().unwrap();
    settle(&mut [&mut host, &mut alice]);
    assert!(alice.state().running);

    let alice_instance = host.state().instances.instance_for(PlayerId::new(1)).unwrap();
    let mut host_sim = SimStub::new(2);
    let mut outcomes = Vec::new();
    for _ in 0..lag + 2 {
        host.process(0, &mut host_sim).unwrap();
        outcomes.push(host.process(alice_instance, &mut host_sim).unwrap());
    }
    let applied: Vec<_> = (0..lag as i32)
        .map(|frame| ProcessOutcome::Applied(Frame::new(frame)))
        .collect();
    assert_eq!(outcomes[..lag], applied[..]);
    assert_eq!(outcomes[lag..], [ProcessOutcome::Starved, ProcessOutcome::Starved]);
    assert!(!ProcessOutcome::Starved.may_advance());
    assert_eq!(host_sim.frame(alice_instance), lag as i32);
    assert_eq!(
        host.health(),
        SessionHealth::InputStarved {
            player: PlayerId::new(1),
            frame: Frame::new(lag as i32),
        }
    );
    assert!(host.events().any(|event| event
        == NetplayEvent::InputStarved {
            player: PlayerId::new(1),
            frame: Frame::new(lag as i32),
        }));

    // Alice catches up; her first real input lands on frame `lag`.
    let mut alice_sim = SimStub::new(2);
    alice
        .add_local_input(LocalInput {
            key_mask: 0x0AA,
            touch: None,
        })
        .unwrap();
    for _ in 0..lag + 2 {
        alice.process(0, &mut alice_sim).unwrap();
    }
    host.process(0, &mut host_sim).unwrap();
    assert_eq!(
        host.process(alice_instance, &mut host_sim).unwrap(),
        ProcessOutcome::Applied(Frame::new(lag as i32))
    );
    assert_eq!(host_sim.key_masks(alice_instance).last(), Some(&0x0AA));
}

#[test]
fn unmapped_instances_are_rejected_after_start() {
    let network = MemoryNetwork::new();
    let (mut host, _alice, _bob) = three_peers(&network);
    host.start_game().unwrap();
    let mut sim = SimStub::new(4);
    assert!(matches!(
        host.process(3, &mut sim),
        Err(NetplayError::InvalidRequest { .. })
    ));
}
