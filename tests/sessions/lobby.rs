//! Lobby integration tests: handshake, roster and mesh.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use lockstep_netplay::network::messages::{ClientInit, PlayerInfo};
use lockstep_netplay::sessions::player_registry::LOOPBACK;
use lockstep_netplay::telemetry::{CollectingObserver, ViolationKind};
use lockstep_netplay::{
    Channel, ControlMessage, Delivery, HostHandshake, MemoryNetwork, NetplayError, NetplayEvent,
    PlayerId, PlayerName, PlayerRecord, PlayerRegistry, PlayerStatus, RejectReason,
    SessionBuilder, SessionConfig, SessionHealth, Transport, TransportEvent, TransportFactory,
    CHANNEL_COUNT,
};
use web_time::Duration;

use crate::common::{client_session, host_session, ip, join, settle, PORT};

const EVENT_WAIT: Duration = Duration::from_secs(2);

/// Polls a raw endpoint until an event matching `accept` arrives.
fn wait_for(
    transport: &mut Box<dyn Transport>,
    accept: impl Fn(&TransportEvent) -> bool,
) -> TransportEvent {
    loop {
        let event = transport
            .poll(EVENT_WAIT)
            .expect("timed out waiting for a transport event");
        if accept(&event) {
            return event;
        }
    }
}

fn control_payload(event: TransportEvent) -> ControlMessage {
    match event {
        TransportEvent::Received {
            channel, payload, ..
        } if channel == Channel::CONTROL => ControlMessage::decode(&payload).unwrap(),
        other => panic!("expected a control message, got {other:?}"),
    }
}

fn is_control(event: &TransportEvent) -> bool {
    matches!(event, TransportEvent::Received { channel, .. } if *channel == Channel::CONTROL)
}

#[test]
fn join_assigns_the_next_slot_and_broadcasts_the_roster() {
    let network = MemoryNetwork::new();
    let mut host = host_session(&network, SessionConfig::default());
    let mut alice = client_session(&network, 2);

    join(&mut host, &mut alice, "Alice").unwrap();
    settle(&mut [&mut host, &mut alice]);

    assert_eq!(alice.local_player(), Some(PlayerId::new(1)));
    assert_eq!(alice.state().max_players, 16);
    assert!(!alice.state().is_host);

    let roster = alice.player_list();
    assert_eq!(roster.len(), 2);
    assert_eq!(roster[0].status, PlayerStatus::Host);
    assert_eq!(roster[1].name.as_str(), "Alice");
    assert_eq!(roster[1].status, PlayerStatus::Connected);
    assert!(roster[1].is_local);
    let seen_by_host = host.player_list();
    assert_eq!(seen_by_host.len(), 2);
    assert!(seen_by_host[0].is_local);
    assert!(!seen_by_host[1].is_local);
    assert_eq!(seen_by_host[1].address, ip(2));
    assert_eq!(seen_by_host[1].name, roster[1].name);

    let host_events: Vec<_> = host.events().collect();
    assert!(host_events.contains(&NetplayEvent::PlayerJoined {
        player: PlayerId::new(1),
        name: PlayerName::new("Alice"),
    }));
    let alice_events: Vec<_> = alice.events().collect();
    assert!(alice_events.contains(&NetplayEvent::RosterUpdated { players: 2 }));
}

#[test]
fn full_roster_turns_the_next_client_away() {
    let network = MemoryNetwork::new();
    let mut host = host_session(
        &network,
        SessionConfig {
            max_players: 2,
            ..SessionConfig::default()
        },
    );
    let mut alice = client_session(&network, 2);
    let mut bob = client_session(&network, 3);

    join(&mut host, &mut alice, "Alice").unwrap();
    assert_eq!(alice.local_player(), Some(PlayerId::new(1)));

    let result = join(&mut host, &mut bob, "Bob");
    assert_eq!(result, Err(NetplayError::Disconnected));
    assert!(!bob.state().active);
    assert!(!network.is_bound(SocketAddr::new(ip(3), PORT)));

    assert_eq!(host.player_list().len(), 2);
    let events: Vec<_> = host.events().collect();
    assert!(events.contains(&NetplayEvent::ConnectionRejected {
        addr: SocketAddr::new(ip(3), PORT),
        reason: RejectReason::RosterFull,
    }));
}

#[test]
fn silent_peer_loses_its_reserved_slot_after_the_handshake_timeout() {
    let network = MemoryNetwork::new();
    let handshake_timeout = Duration::from_millis(50);
    let mut host = host_session(
        &network,
        SessionConfig {
            max_players: 2,
            handshake_timeout,
            ..SessionConfig::default()
        },
    );
    let mut silent = network
        .factory(ip(9))
        .create_host(SocketAddr::new(ip(9), PORT), 1, CHANNEL_COUNT)
        .unwrap();
    silent.connect(SocketAddr::new(ip(1), PORT)).unwrap();
    host.poll_network();
    let statuses: Vec<_> = host
        .player_list()
        .iter()
        .map(|record| (record.id, record.status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            (PlayerId::HOST, PlayerStatus::Host),
            (PlayerId::new(1), PlayerStatus::Connecting)
        ]
    );

    std::thread::sleep(handshake_timeout * 2);
    host.poll_network();
    assert_eq!(host.player_list().len(), 1);
    wait_for(&mut silent, |event| {
        matches!(event, TransportEvent::Disconnected { .. })
    });

    let mut alice = client_session(&network, 2);
    join(&mut host, &mut alice, "Alice").unwrap();
    assert_eq!(alice.local_player(), Some(PlayerId::new(1)));
    settle(&mut [&mut host, &mut alice]);
    assert_eq!(host.player_list().len(), 2);
}

#[test]
fn client_adopts_whatever_the_host_assigns() {
    let network = MemoryNetwork::new();
    let mut raw_host = network
        .factory(ip(1))
        .create_host(SocketAddr::new(ip(1), PORT), 16, CHANNEL_COUNT)
        .unwrap();
    let mut carol = client_session(&network, 2);

    thread::scope(|scope| {
        let joining = scope.spawn(|| carol.start_as_client("Carol", ip(1), PORT));

        let TransportEvent::Connected { peer, .. } =
            wait_for(&mut raw_host, |event| {
                matches!(event, TransportEvent::Connected { .. })
            })
        else {
            unreachable!()
        };
        let init = ControlMessage::ClientInit(ClientInit::new(PlayerId::new(3), 8))
            .encode()
            .unwrap();
        raw_host
            .send(peer, Channel::CONTROL, &init, Delivery::Reliable)
            .unwrap();

        let ControlMessage::PlayerInfo(info) = control_payload(wait_for(&mut raw_host, is_control))
        else {
            panic!("expected player info");
        };
        assert_eq!(info, PlayerInfo::new(info.player.clone()));
        assert_eq!(info.player.id, PlayerId::new(3));
        assert_eq!(info.player.name.as_str(), "Carol");

        joining.join().unwrap().unwrap();
    });

    assert_eq!(carol.local_player(), Some(PlayerId::new(3)));
    assert_eq!(carol.state().max_players, 8);
    assert_eq!(
        carol.state().host_address,
        Some(SocketAddr::new(ip(1), PORT))
    );
}

#[test]
fn applying_the_same_roster_twice_changes_nothing() {
    let network = MemoryNetwork::new();
    let mut raw_host = network
        .factory(ip(1))
        .create_host(SocketAddr::new(ip(1), PORT), 16, CHANNEL_COUNT)
        .unwrap();
    let mut carol = client_session(&network, 2);

    let host_peer = thread::scope(|scope| {
        let joining = scope.spawn(|| carol.start_as_client("Carol", ip(1), PORT));
        let TransportEvent::Connected { peer, .. } =
            wait_for(&mut raw_host, |event| {
                matches!(event, TransportEvent::Connected { .. })
            })
        else {
            unreachable!()
        };
        let init = ControlMessage::ClientInit(ClientInit::new(PlayerId::new(1), 4))
            .encode()
            .unwrap();
        raw_host
            .send(peer, Channel::CONTROL, &init, Delivery::Reliable)
            .unwrap();
        joining.join().unwrap().unwrap();
        peer
    });

    let roster = PlayerRegistry::new();
    roster.upsert(PlayerRecord {
        id: PlayerId::HOST,
        name: PlayerName::new("Host"),
        status: PlayerStatus::Host,
        address: LOOPBACK,
        is_local: false,
    });
    roster.upsert(PlayerRecord {
        id: PlayerId::new(1),
        name: PlayerName::new("Carol"),
        status: PlayerStatus::Connected,
        address: ip(2),
        is_local: false,
    });
    let list = ControlMessage::PlayerList(HostHandshake::roster_message(&roster))
        .encode()
        .unwrap();

    raw_host
        .send(host_peer, Channel::CONTROL, &list, Delivery::Reliable)
        .unwrap();
    carol.poll_network();
    let once = carol.player_list();

    raw_host
        .send(host_peer, Channel::CONTROL, &list, Delivery::Reliable)
        .unwrap();
    carol.poll_network();
    let twice = carol.player_list();

    assert_eq!(once, twice);
    assert_eq!(once.len(), 2);
    assert!(twice[1].is_local);
    let updates = carol
        .events()
        .filter(|event| matches!(event, NetplayEvent::RosterUpdated { players: 2 }))
        .count();
    assert_eq!(updates, 2);
    assert!(carol.health().is_healthy());
}

#[test]
fn clients_connect_to_each_other() {
    let network = MemoryNetwork::new();
    let observer = Arc::new(CollectingObserver::new());
    let mut host = host_session(&network, SessionConfig::default());
    let mut clients: Vec<_> = (2..=4)
        .map(|last| {
            SessionBuilder::new()
                .with_violation_observer(observer.clone())
                .with_transport_factory(network.factory(ip(last)))
                .build()
                .unwrap()
        })
        .collect();

    for (index, client) in clients.iter_mut().enumerate() {
        join(&mut host, client, &format!("Client{index}")).unwrap();
    }

    let (first, rest) = clients.split_at_mut(1);
    let (second, third) = rest.split_at_mut(1);
    settle(&mut [&mut host, &mut first[0], &mut second[0], &mut third[0]]);

    assert!(
        !observer.has_violation(ViolationKind::Roster),
        "unexpected roster violations: {:?}",
        observer.violations()
    );
    assert!(!observer.has_violation(ViolationKind::Transport));
    for client in &clients {
        let roster = client.player_list();
        assert_eq!(roster.len(), 4);
        assert!(roster[1..]
            .iter()
            .all(|record| record.status == PlayerStatus::Connected));
    }
    for (index, client) in clients.iter().enumerate() {
        assert_eq!(client.local_player(), Some(PlayerId::new(index as u8 + 1)));
    }
}

#[test]
fn late_joiners_are_refused_once_the_game_runs() {
    let network = MemoryNetwork::new();
    let mut host = host_session(&network, SessionConfig::default());
    let mut alice = client_session(&network, 2);
    let mut late = client_session(&network, 3);

    join(&mut host, &mut alice, "Alice").unwrap();
    host.start_game().unwrap();
    settle(&mut [&mut host, &mut alice]);

    assert_eq!(join(&mut host, &mut late, "Late"), Err(NetplayError::Disconnected));
    assert_eq!(host.player_list().len(), 2);
    assert!(host.events().any(|event| matches!(
        event,
        NetplayEvent::ConnectionRejected {
            reason: RejectReason::GameRunning,
            ..
        }
    )));
}

#[test]
fn misreported_id_gets_the_peer_dropped() {
    let network = MemoryNetwork::new();
    let observer = Arc::new(CollectingObserver::new());
    let mut host = SessionBuilder::new()
        .with_violation_observer(observer.clone())
        .with_transport_factory(network.factory(ip(1)))
        .build()
        .unwrap();
    host.start_as_host("Host", PORT).unwrap();

    let mut rogue = network
        .factory(ip(7))
        .create_host(SocketAddr::new(ip(7), PORT), 16, CHANNEL_COUNT)
        .unwrap();
    let host_peer = rogue.connect(SocketAddr::new(ip(1), PORT)).unwrap();
    host.poll_network();

    let ControlMessage::ClientInit(init) = control_payload(wait_for(&mut rogue, is_control)) else {
        panic!("expected an init");
    };
    assert_eq!(init.assigned_id, 1);

    let claimed = PlayerRecord {
        id: PlayerId::new(5),
        name: PlayerName::new("Mallory"),
        status: PlayerStatus::Client,
        address: LOOPBACK,
        is_local: true,
    };
    let info = ControlMessage::PlayerInfo(PlayerInfo::new(claimed))
        .encode()
        .unwrap();
    rogue
        .send(host_peer, Channel::CONTROL, &info, Delivery::Reliable)
        .unwrap();
    host.poll_network();

    wait_for(&mut rogue, |event| {
        matches!(event, TransportEvent::Disconnected { peer } if *peer == host_peer)
    });
    assert_eq!(host.player_list().len(), 1);
    assert!(host.registry().get(PlayerId::new(1)).is_some_and(|r| !r.is_occupied()));
    assert!(observer.has_violation(ViolationKind::Handshake));
}

#[test]
fn losing_the_host_ends_every_client_session() {
    let network = MemoryNetwork::new();
    let mut host = host_session(&network, SessionConfig::default());
    let mut alice = client_session(&network, 2);
    let mut bob = client_session(&network, 3);
    join(&mut host, &mut alice, "Alice").unwrap();
    join(&mut host, &mut bob, "Bob").unwrap();
    settle(&mut [&mut host, &mut alice, &mut bob]);

    host.end_session();
    settle(&mut [&mut alice, &mut bob]);

    for client in [&mut alice, &mut bob] {
        assert!(!client.state().active);
        assert_eq!(client.health(), SessionHealth::HostLost);
        assert!(client.player_list().is_empty());
        assert!(client.events().any(|event| event == NetplayEvent::HostLost));
    }
}

#[test]
fn leaving_client_frees_its_slot_for_everyone() {
    let network = MemoryNetwork::new();
    let mut host = host_session(&network, SessionConfig::default());
    let mut alice = client_session(&network, 2);
    let mut bob = client_session(&network, 3);
    join(&mut host, &mut alice, "Alice").unwrap();
    join(&mut host, &mut bob, "Bob").unwrap();
    settle(&mut [&mut host, &mut alice, &mut bob]);

    alice.end_session();
    settle(&mut [&mut host, &mut bob]);

    assert!(host.events().any(|event| event
        == NetplayEvent::PlayerLeft {
            player: PlayerId::new(1)
        }));
    let roster = bob.player_list();
    assert_eq!(roster.len(), 2);
    assert!(roster.iter().all(|record| record.id != PlayerId::new(1)));
    assert!(bob.health().is_healthy());

    // The freed slot is handed out again.
    let mut carol = client_session(&network, 4);
    join(&mut host, &mut carol, "Carol").unwrap();
    assert_eq!(carol.local_player(), Some(PlayerId::new(1)));
}
