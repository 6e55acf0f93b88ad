//! The receiving side of replication.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, error, info, trace, warn};
use web_time::{Duration, Instant};

use crate::error::NetplayError;
use crate::input_queue::{ConsumeOutcome, InputQueue};
use crate::network::messages::{BlobMessage, InputMessage};
use crate::network::transport::{
    Channel, Delivery, PeerId, Transport, TransportEvent, TransportFactory, CHANNEL_COUNT,
};
use crate::replication::receiver::{BlobKind, BlobReceiver};
use crate::report_violation_to;
use crate::sessions::config::ReplicationConfig;
use crate::sessions::netplay_session::ProcessOutcome;
use crate::telemetry::{
    report_to_observer, ProtocolViolation, ViolationKind, ViolationObserver, ViolationSeverity,
};
use crate::{Frame, PlayerId, Simulation, DEFAULT_LAG_DEPTH};

/// Where an observer is.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ObserverPhase {
    /// Collecting blobs, waiting for Sync.
    Receiving,
    /// Reloaded and answered Ready; waiting for GoLive.
    Synced,
    /// Running in lockstep with the origin.
    Live,
    /// The origin went away.
    Closed,
}

/// Mirror of a [`ReplicationOrigin`](crate::ReplicationOrigin).
///
/// Drive it with [`pump`](Self::pump) until [`ObserverPhase::Live`], then call
/// [`process`](Self::process) once per tick.
pub struct ReplicationObserver {
    lag_depth: usize,
    transport: Box<dyn Transport>,
    origin: PeerId,
    phase: ObserverPhase,
    receiver: BlobReceiver,
    queue: InputQueue,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for ReplicationObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            lag_depth,
            transport,
            origin,
            phase,
            receiver,
            queue,
            violation_observer,
        } = self;

        f.debug_struct("ReplicationObserver")
            .field("lag_depth", lag_depth)
            .field("local_addr", &transport.local_addr())
            .field("origin", origin)
            .field("phase", phase)
            .field("receiver", receiver)
            .field("queued_inputs", &queue.len())
            .field("has_violation_observer", &violation_observer.is_some())
            .finish()
    }
}

impl ReplicationObserver {
    /// Opens an endpoint at `bind` and connects to the origin at `origin`,
    /// waiting up to the configured connect timeout.
    ///
    /// # Errors
    /// - [`NetplayError::InvalidConfig`] if `config` does not validate.
    /// - [`NetplayError::Transport`] if the endpoint or the connection cannot be created.
    /// - [`NetplayError::ReplicationTimeout`] if the connection does not complete in time.
    /// - [`NetplayError::Disconnected`] if the origin refuses the connection.
    pub fn connect(
        factory: &dyn TransportFactory,
        bind: SocketAddr,
        origin: SocketAddr,
        config: ReplicationConfig,
    ) -> Result<Self, NetplayError> {
        config.validate()?;
        let mut transport = factory.create_host(bind, 1, CHANNEL_COUNT)?;
        let origin_peer = transport.connect(origin)?;

        let deadline = Instant::now() + config.connect_timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                transport.disconnect(origin_peer);
                return Err(NetplayError::ReplicationTimeout {
                    waited_ms: config.connect_timeout.as_millis() as u64,
                });
            }
            match transport.poll(deadline - now) {
                Some(TransportEvent::Connected { peer, .. }) if peer == origin_peer => break,
                Some(TransportEvent::Disconnected { peer }) if peer == origin_peer => {
                    return Err(NetplayError::Disconnected);
                },
                _ => {},
            }
        }
        info!("observing {} from {}", origin, transport.local_addr());

        Ok(Self {
            lag_depth: DEFAULT_LAG_DEPTH,
            transport,
            origin: origin_peer,
            phase: ObserverPhase::Receiving,
            receiver: BlobReceiver::new(&config),
            queue: InputQueue::new(),
            violation_observer: None,
        })
    }

    /// Sets the input delay. Must match the origin's.
    #[must_use]
    pub fn with_lag_depth(mut self, lag_depth: usize) -> Self {
        self.lag_depth = lag_depth;
        self
    }

    /// Routes protocol violations to `observer`.
    #[must_use]
    pub fn with_violation_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.receiver
            .set_violation_observer(Some(Arc::clone(&observer)));
        self.violation_observer = Some(observer);
        self
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> ObserverPhase {
        self.phase
    }

    /// The blob reassembly state.
    #[must_use]
    pub fn receiver(&self) -> &BlobReceiver {
        &self.receiver
    }

    /// Handles transport events for up to `timeout`. Returns the phase afterwards.
    ///
    /// The first poll waits; the rest only drain what is already queued.
    pub fn pump<S: Simulation + ?Sized>(&mut self, sim: &mut S, timeout: Duration) -> ObserverPhase {
        let mut wait = timeout;
        while self.phase != ObserverPhase::Closed {
            let Some(event) = self.transport.poll(wait) else {
                break;
            };
            wait = Duration::ZERO;
            self.handle_event(sim, event);
        }
        self.phase
    }

    fn handle_event<S: Simulation + ?Sized>(&mut self, sim: &mut S, event: TransportEvent) {
        match event {
            TransportEvent::Disconnected { peer } if peer == self.origin => {
                warn!("origin disconnected");
                self.phase = ObserverPhase::Closed;
                self.receiver.clear();
                self.queue.clear();
            },
            TransportEvent::Received {
                peer,
                channel,
                payload,
            } if peer == self.origin => {
                if channel == Channel::BLOB {
                    self.on_blob_message(sim, &payload);
                } else if channel == Channel::input(PlayerId::HOST) {
                    self.on_input(sim, &payload);
                } else {
                    trace!("ignoring message on {}", channel);
                }
            },
            TransportEvent::Connected { peer, addr } if peer != self.origin => {
                debug!("refusing unexpected connection from {}", addr);
                self.transport.disconnect(peer);
            },
            _ => {},
        }
    }

    fn on_blob_message<S: Simulation + ?Sized>(&mut self, sim: &mut S, payload: &[u8]) {
        let message = match BlobMessage::decode(payload) {
            Ok(message) => message,
            Err(err) => {
                report_violation_to!(
                    self.violation_observer,
                    ViolationSeverity::Warning,
                    ViolationKind::Replication,
                    "malformed message from the origin: {}",
                    err
                );
                return;
            },
        };
        // Rejected frames are reported by the receiver and otherwise ignored.
        match message {
            BlobMessage::Begin(header) => {
                let _ = self.receiver.begin(header);
            },
            BlobMessage::Chunk(chunk) => {
                let _ = self.receiver.chunk(&chunk);
            },
            BlobMessage::End(header) => {
                let _ = self.receiver.end(header);
            },
            BlobMessage::Sync { console_type } => self.reload(sim, console_type),
            BlobMessage::GoLive => self.go_live(sim),
            other => report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Warning,
                ViolationKind::Replication,
                "unexpected message from the origin: {:?}",
                other
            ),
        }
    }

    fn reload<S: Simulation + ?Sized>(&mut self, sim: &mut S, console_type: u8) {
        sim.set_console_type(console_type);
        sim.reset();

        if let Some(cart) = self.receiver.blob(BlobKind::CartImage) {
            let save = self.receiver.blob(BlobKind::SaveImage);
            if !sim.load_cartridge(cart, save) {
                error!("cart image from the origin failed to load");
                report_violation_to!(
                    self.violation_observer,
                    ViolationSeverity::Error,
                    ViolationKind::Replication,
                    "cart image of {} bytes failed to load",
                    cart.len()
                );
                return;
            }
        }
        if let Some(state) = self.receiver.blob(BlobKind::InitialState) {
            if !sim.deserialize_state(state) {
                report_violation_to!(
                    self.violation_observer,
                    ViolationSeverity::Error,
                    ViolationKind::Replication,
                    "initial state of {} bytes failed to restore",
                    state.len()
                );
            }
        }
        self.receiver.clear();

        if let Err(err) = self.send(&BlobMessage::Ready) {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Error,
                ViolationKind::Transport,
                "could not send ready: {}",
                err
            );
            return;
        }
        debug!("reloaded at frame {}, ready", sim.current_frame(0));
        self.phase = ObserverPhase::Synced;
    }

    fn go_live<S: Simulation + ?Sized>(&mut self, sim: &S) {
        if self.phase != ObserverPhase::Synced {
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Error,
                ViolationKind::Replication,
                "go-live while {:?}; the observer was never synced",
                self.phase
            );
            return;
        }
        let current = sim.current_frame(0);
        self.queue.prefill_from(current, self.lag_depth);
        self.phase = ObserverPhase::Live;
        info!("observer live at frame {}", current);
    }

    fn on_input<S: Simulation + ?Sized>(&mut self, sim: &S, payload: &[u8]) {
        match InputMessage::decode(payload) {
            Ok(message) => self.queue.push(message.frame),
            Err(err) => {
                report_violation_to!(
                    self.violation_observer,
                    ViolationSeverity::Warning,
                    ViolationKind::InputQueue,
                    "malformed input from the origin: {}",
                    err
                );
                return;
            },
        }
        self.acknowledge(sim.current_frame(0));
    }

    /// Tells the origin how far this observer has come.
    fn acknowledge(&mut self, frame: Frame) {
        if let Err(err) = self.send(&BlobMessage::FrameAck { frame }) {
            trace!("frame ack not sent: {}", err);
        }
    }

    fn send(&mut self, message: &BlobMessage) -> Result<(), NetplayError> {
        let bytes = message.encode()?;
        self.transport
            .send(self.origin, Channel::BLOB, &bytes, Delivery::Reliable)?;
        Ok(())
    }

    /// One tick once live: drains the network, applies the origin's input
    /// for the current frame to instance 0 and acknowledges the frame reached.
    pub fn process<S: Simulation + ?Sized>(&mut self, sim: &mut S) -> ProcessOutcome {
        self.pump(sim, Duration::ZERO);
        if self.phase != ObserverPhase::Live {
            return ProcessOutcome::Idle;
        }
        let current = sim.current_frame(0);
        match self.queue.consume(current) {
            ConsumeOutcome::Ready { input, dropped } => {
                if dropped > 0 {
                    report_violation_to!(
                        self.violation_observer,
                        ViolationSeverity::Warning,
                        ViolationKind::InputQueue,
                        "discarded {} stale input frames before {}",
                        dropped,
                        input.frame
                    );
                }
                sim.apply_input(0, input.key_mask, input.touch());
                self.acknowledge(input.frame + 1);
                ProcessOutcome::Applied(input.frame)
            },
            ConsumeOutcome::Pending { .. } => ProcessOutcome::Waiting,
            ConsumeOutcome::Starved => {
                let violation = ProtocolViolation::new(
                    ViolationSeverity::Critical,
                    ViolationKind::InputQueue,
                    "no input from the origin; observer stalled",
                    concat!(file!(), ":", line!()),
                )
                .with_frame(current);
                report_to_observer(self.violation_observer.as_ref(), &violation);
                ProcessOutcome::Starved
            },
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::network::memory_transport::MemoryNetwork;
    use crate::network::messages::{BlobChunk, BlobHeader};
    use crate::telemetry::CollectingObserver;
    use crate::Touch;
    use std::net::{IpAddr, Ipv4Addr};

    #[derive(Default)]
    struct Mirror {
        frame: i32,
        console_type: Option<u8>,
        resets: usize,
        cart: Option<(Vec<u8>, Option<Vec<u8>>)>,
        state: Option<Vec<u8>>,
        refuse_cart: bool,
    }

    impl Simulation for Mirror {
        fn current_frame(&self, _instance: usize) -> Frame {
            Frame::new(self.frame)
        }
        fn apply_input(&mut self, _instance: usize, _key_mask: u32, _touch: Option<Touch>) {}
        fn reset(&mut self) {
            self.resets += 1;
        }
        fn load_cartridge(&mut self, image: &[u8], save: Option<&[u8]>) -> bool {
            self.cart = Some((image.to_vec(), save.map(<[u8]>::to_vec)));
            !self.refuse_cart
        }
        fn serialize_state(&self) -> Vec<u8> {
            self.frame.to_le_bytes().to_vec()
        }
        fn deserialize_state(&mut self, state: &[u8]) -> bool {
            self.state = Some(state.to_vec());
            true
        }
        fn set_console_type(&mut self, console_type: u8) {
            self.console_type = Some(console_type);
        }
    }

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 2, last)), 7064)
    }

    fn raw_origin_and_observer() -> (MemoryNetwork, Box<dyn Transport>, ReplicationObserver) {
        let network = MemoryNetwork::new();
        let origin = network
            .factory(addr(1).ip())
            .create_host(addr(1), 4, CHANNEL_COUNT)
            .unwrap();
        let observer = ReplicationObserver::connect(
            &network.factory(addr(2).ip()),
            addr(2),
            addr(1),
            ReplicationConfig::default(),
        )
        .unwrap();
        (network, origin, observer)
    }

    fn send(origin: &mut Box<dyn Transport>, channel: Channel, payload: Vec<u8>) {
        let peer = origin.peers()[0];
        origin
            .send(peer, channel, &payload, Delivery::Reliable)
            .unwrap();
    }

    fn send_blob(origin: &mut Box<dyn Transport>, kind: BlobKind, data: &[u8]) {
        let header = BlobHeader {
            kind: kind.as_u8(),
            total_length: data.len() as u32,
        };
        send(origin, Channel::BLOB, BlobMessage::Begin(header).encode().unwrap());
        send(
            origin,
            Channel::BLOB,
            BlobMessage::Chunk(BlobChunk {
                kind: header.kind,
                total_length: header.total_length,
                offset: 0,
                bytes: data.to_vec(),
            })
            .encode()
            .unwrap(),
        );
        send(origin, Channel::BLOB, BlobMessage::End(header).encode().unwrap());
    }

    fn received_blob_messages(origin: &mut Box<dyn Transport>) -> Vec<BlobMessage> {
        let mut messages = Vec::new();
        while let Some(event) = origin.poll(Duration::ZERO) {
            if let TransportEvent::Received {
                channel: Channel::BLOB,
                payload,
                ..
            } = event
            {
                messages.push(BlobMessage::decode(&payload).unwrap());
            }
        }
        messages
    }

    #[test]
    fn connect_to_missing_origin_fails() {
        let network = MemoryNetwork::new();
        let result = ReplicationObserver::connect(
            &network.factory(addr(2).ip()),
            addr(2),
            addr(9),
            ReplicationConfig::default(),
        );
        assert!(matches!(result, Err(NetplayError::Transport(_))));
    }

    #[test]
    fn sync_reloads_and_answers_ready() {
        let (_network, mut origin, mut observer) = raw_origin_and_observer();
        send_blob(&mut origin, BlobKind::CartImage, b"cart");
        send_blob(&mut origin, BlobKind::SaveImage, b"save");
        send_blob(&mut origin, BlobKind::InitialState, &42_i32.to_le_bytes());
        send(
            &mut origin,
            Channel::BLOB,
            BlobMessage::Sync { console_type: 1 }.encode().unwrap(),
        );

        let mut sim = Mirror::default();
        let phase = observer.pump(&mut sim, Duration::from_millis(100));
        assert_eq!(phase, ObserverPhase::Synced);
        assert_eq!(sim.console_type, Some(1));
        assert_eq!(sim.resets, 1);
        assert_eq!(
            sim.cart,
            Some((b"cart".to_vec(), Some(b"save".to_vec())))
        );
        assert_eq!(sim.state, Some(42_i32.to_le_bytes().to_vec()));
        assert_eq!(observer.receiver().blob(BlobKind::CartImage), None);

        let replies = received_blob_messages(&mut origin);
        assert_eq!(replies, vec![BlobMessage::Ready]);
    }

    #[test]
    fn failed_load_sends_no_ready() {
        let (_network, mut origin, mut observer) = raw_origin_and_observer();
        let collector = Arc::new(CollectingObserver::new());
        observer = observer.with_violation_observer(collector.clone());
        send_blob(&mut origin, BlobKind::CartImage, b"bad");
        send(
            &mut origin,
            Channel::BLOB,
            BlobMessage::Sync { console_type: 0 }.encode().unwrap(),
        );

        let mut sim = Mirror {
            refuse_cart: true,
            ..Mirror::default()
        };
        assert_eq!(
            observer.pump(&mut sim, Duration::from_millis(100)),
            ObserverPhase::Receiving
        );
        assert!(received_blob_messages(&mut origin).is_empty());
        assert!(collector.has_violation(ViolationKind::Replication));
    }

    #[test]
    fn go_live_prefills_and_acks_progress() {
        let (_network, mut origin, mut observer) = raw_origin_and_observer();
        let mut sim = Mirror {
            frame: 10,
            ..Mirror::default()
        };
        send(
            &mut origin,
            Channel::BLOB,
            BlobMessage::Sync { console_type: 0 }.encode().unwrap(),
        );
        assert_eq!(
            observer.pump(&mut sim, Duration::from_millis(100)),
            ObserverPhase::Synced
        );
        assert_eq!(received_blob_messages(&mut origin), vec![BlobMessage::Ready]);
        send(
            &mut origin,
            Channel::BLOB,
            BlobMessage::GoLive.encode().unwrap(),
        );
        observer.pump(&mut sim, Duration::from_millis(100));
        assert_eq!(observer.phase(), ObserverPhase::Live);

        for _ in 0..DEFAULT_LAG_DEPTH {
            let outcome = observer.process(&mut sim);
            assert_eq!(outcome, ProcessOutcome::Applied(Frame::new(sim.frame)));
            sim.frame += 1;
        }
        assert_eq!(observer.process(&mut sim), ProcessOutcome::Starved);

        let input = crate::InputFrame::neutral(Frame::new(sim.frame));
        send(
            &mut origin,
            Channel::input(PlayerId::HOST),
            InputMessage { frame: input }.encode().unwrap(),
        );
        assert_eq!(
            observer.process(&mut sim),
            ProcessOutcome::Applied(Frame::new(sim.frame))
        );
        // One ack per applied frame, plus one when the input arrived.
        let acked: Vec<i32> = received_blob_messages(&mut origin)
            .into_iter()
            .map(|message| match message {
                BlobMessage::FrameAck { frame } => frame.as_i32(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(acked, vec![11, 12, 13, 14, 14, 15]);
    }

    #[test]
    fn origin_loss_closes_the_observer() {
        let (_network, origin, mut observer) = raw_origin_and_observer();
        drop(origin);
        let mut sim = Mirror::default();
        assert_eq!(
            observer.pump(&mut sim, Duration::from_millis(100)),
            ObserverPhase::Closed
        );
        assert_eq!(observer.process(&mut sim), ProcessOutcome::Idle);
    }
}
