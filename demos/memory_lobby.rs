//! # In-process lobby
//!
//! Hosts a session, joins a number of clients to it over a [`MemoryNetwork`],
//! starts the game and runs every participant in lockstep for a while. At the
//! end each participant's view of every player is compared.
//!
//! Run with: `cargo run --example memory_lobby -- --clients 3 --frames 300`

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::thread;

use clap::Parser;
use lockstep_netplay::{
    Frame, LocalInput, MemoryNetwork, NetplaySession, PlayerId, SessionBuilder, SessionConfig,
    Simulation, Touch, NEUTRAL_KEY_MASK,
};
use tracing::{info, warn};
use web_time::Duration;

const PORT: u16 = 8064;

#[derive(Parser)]
struct Opt {
    /// Clients joining the host.
    #[arg(short, long, default_value_t = 3, value_parser = clap::value_parser!(u8).range(1..=15))]
    clients: u8,
    /// Frames to run after the start.
    #[arg(short, long, default_value_t = 300)]
    frames: i32,
    /// Frames between sampling an input and applying it.
    #[arg(short, long, default_value_t = 4)]
    lag_depth: usize,
    /// Log protocol detail.
    #[arg(short, long)]
    verbose: bool,
}

/// Every instance folds its inputs into a running hash.
#[derive(Debug, Default)]
struct Game {
    frames: Vec<i32>,
    hashes: Vec<u64>,
}

impl Game {
    fn with_instances(instances: usize) -> Self {
        Self {
            frames: vec![0; instances],
            hashes: vec![0xcbf2_9ce4_8422_2325; instances],
        }
    }
}

impl Simulation for Game {
    fn current_frame(&self, instance: usize) -> Frame {
        Frame::new(self.frames[instance])
    }

    fn apply_input(&mut self, instance: usize, key_mask: u32, touch: Option<Touch>) {
        let touch = touch.map_or(0, |t| (u64::from(t.x) << 16) | u64::from(t.y));
        let hash = &mut self.hashes[instance];
        for word in [u64::from(key_mask), touch] {
            *hash ^= word;
            *hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        self.frames[instance] += 1;
    }

    fn reset(&mut self) {}

    fn load_cartridge(&mut self, _image: &[u8], _save: Option<&[u8]>) -> bool {
        true
    }

    fn serialize_state(&self) -> Vec<u8> {
        Vec::new()
    }

    fn deserialize_state(&mut self, _state: &[u8]) -> bool {
        true
    }

    fn set_console_type(&mut self, _console_type: u8) {}
}

fn ip(last: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
}

fn sampled_input(player: PlayerId, tick: i32) -> LocalInput {
    let phase = (tick / 15 + i32::from(player.as_u8())) % 12;
    LocalInput {
        key_mask: NEUTRAL_KEY_MASK & !(1 << phase),
        touch: (tick % 40 < 5).then_some(Touch {
            x: (tick % 256) as u16,
            y: u16::from(player.as_u8()) * 12,
        }),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opt = Opt::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(if opt.verbose {
                tracing::Level::DEBUG
            } else {
                tracing::Level::INFO
            })
            .finish(),
    )
    .expect("setting up tracing subscriber failed");

    let network = MemoryNetwork::new();
    let config = SessionConfig {
        lag_depth: opt.lag_depth,
        ..SessionConfig::lan()
    };
    let build = |last: u8| {
        SessionBuilder::new()
            .with_session_config(config)
            .with_transport_factory(network.factory(ip(last)))
            .build()
    };

    let mut host = build(1)?;
    host.start_as_host("Host", PORT)?;
    let mut clients = Vec::new();
    for index in 0..opt.clients {
        let mut client = build(index + 2)?;
        let name = format!("Client {}", index + 1);
        // Joining blocks until the host answers, so keep the host polling meanwhile.
        thread::scope(|scope| {
            let joining = scope.spawn(|| client.start_as_client(&name, ip(1), PORT));
            while !joining.is_finished() {
                host.poll_network();
                thread::sleep(Duration::from_millis(1));
            }
            joining.join().expect("join thread panicked")
        })?;
        clients.push(client);
    }

    let mut sessions: Vec<NetplaySession> = std::iter::once(host).chain(clients).collect();
    while sessions.iter_mut().map(NetplaySession::poll_network).sum::<usize>() > 0 {}
    for event in sessions[0].events() {
        info!("host event: {:?}", event);
    }
    info!("roster: {:?}", sessions[0].player_list());

    sessions[0].start_game()?;
    let players = sessions[0].player_list().len();
    let mut games: Vec<Game> = (0..sessions.len()).map(|_| Game::with_instances(players)).collect();

    for tick in 0..opt.frames + opt.lag_depth as i32 {
        for (session, game) in sessions.iter_mut().zip(&mut games) {
            let me = session.local_player().unwrap_or_default();
            session.add_local_input(sampled_input(me, tick))?;
            let instances = session.state().instances.len().max(1);
            for instance in 0..instances {
                session.process(instance, game)?;
            }
        }
    }

    let mut views: Vec<BTreeMap<PlayerId, (i32, u64)>> = Vec::new();
    for (session, game) in sessions.iter_mut().zip(&games) {
        let local_player = session.local_player();
        for event in session.events() {
            info!("player {:?} event: {:?}", local_player, event);
        }
        views.push(
            session
                .state()
                .instances
                .iter()
                .map(|(instance, player)| (player, (game.frames[instance], game.hashes[instance])))
                .collect(),
        );
    }

    let mut diverged = false;
    for player in views[0].keys() {
        let frames = views.iter().map(|view| view[player].0).min().unwrap_or(0);
        info!("player {}: every participant reached frame {}", player, frames);
        let mut hashes = views
            .iter()
            .filter(|view| view[player].0 == frames)
            .map(|view| view[player].1);
        let first = hashes.next();
        if hashes.any(|hash| Some(hash) != first) {
            warn!("player {} applied different inputs on different participants", player);
            diverged = true;
        }
    }
    for session in &mut sessions {
        session.end_session();
    }
    if diverged {
        return Err("participants diverged".into());
    }
    info!("{} participants stayed in lockstep", views.len());
    Ok(())
}
