//! The sending side of replication.
//!
//! An origin brings observers to its own state and then keeps them there:
//!
//! 1. [`send_blob`](ReplicationOrigin::send_blob) for every image, each as Begin, chunks in order, End
//! 2. `Sync`, then wait for a `Ready` from every expected observer
//! 3. `GoLive`; both sides prefill their queues from the current frame and run in lockstep
//!
//! [`replicate`](ReplicationOrigin::replicate) performs all three. Afterwards
//! [`process`](ReplicationOrigin::process) distributes the origin's input and holds the
//! origin back while any observer lags too far behind.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};
use web_time::{Duration, Instant};

use crate::error::NetplayError;
use crate::input_queue::{ConsumeOutcome, InputFrame, InputQueue, LocalInput};
use crate::network::messages::{BlobChunk, BlobHeader, BlobMessage, InputMessage};
use crate::network::transport::{
    Channel, Delivery, PeerId, Transport, TransportEvent, TransportFactory, CHANNEL_COUNT,
};
use crate::replication::receiver::BlobKind;
use crate::report_violation_to;
use crate::sessions::config::ReplicationConfig;
use crate::sessions::netplay_session::ProcessOutcome;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::{Frame, PlayerId, Simulation, DEFAULT_LAG_DEPTH, MAX_PLAYERS};

/// Whether the origin may advance.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Backpressure {
    /// Every observer is within the allowed lag.
    Clear,
    /// An observer is too far behind. The origin must not advance.
    Paused {
        /// The furthest-behind observer.
        peer: PeerId,
        /// How many frames it is behind.
        behind: i32,
    },
}

/// Result of a Sync/Ready barrier.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Observers the origin waited for.
    pub expected: usize,
    /// Observers that answered Ready.
    pub ready: usize,
    /// Time spent waiting.
    pub waited: Duration,
}

impl SyncReport {
    /// Returns `true` if every expected observer answered.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.ready >= self.expected
    }
}

#[derive(Debug, Clone)]
struct ObserverLink {
    addr: SocketAddr,
    ready: bool,
    acked: Frame,
}

/// Fan-out side of the replication protocol.
pub struct ReplicationOrigin {
    config: ReplicationConfig,
    lag_depth: usize,
    transport: Box<dyn Transport>,
    observers: BTreeMap<PeerId, ObserverLink>,
    queue: InputQueue,
    live: bool,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for ReplicationOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            config,
            lag_depth,
            transport,
            observers,
            queue,
            live,
            violation_observer,
        } = self;

        f.debug_struct("ReplicationOrigin")
            .field("config", config)
            .field("lag_depth", lag_depth)
            .field("local_addr", &transport.local_addr())
            .field("observers", observers)
            .field("queued_inputs", &queue.len())
            .field("live", live)
            .field("has_violation_observer", &violation_observer.is_some())
            .finish()
    }
}

impl ReplicationOrigin {
    /// Opens an endpoint at `bind` that observers connect to.
    ///
    /// # Errors
    /// - [`NetplayError::InvalidConfig`] if `config` does not validate.
    /// - [`NetplayError::Transport`] if the endpoint cannot be created.
    pub fn bind(
        factory: &dyn TransportFactory,
        bind: SocketAddr,
        config: ReplicationConfig,
    ) -> Result<Self, NetplayError> {
        config.validate()?;
        let transport = factory.create_host(bind, MAX_PLAYERS, CHANNEL_COUNT)?;
        info!("replication origin listening on {}", transport.local_addr());
        Ok(Self {
            config,
            lag_depth: DEFAULT_LAG_DEPTH,
            transport,
            observers: BTreeMap::new(),
            queue: InputQueue::new(),
            live: false,
            violation_observer: None,
        })
    }

    /// Sets the input delay used once live. Observers must use the same value.
    #[must_use]
    pub fn with_lag_depth(mut self, lag_depth: usize) -> Self {
        self.lag_depth = lag_depth;
        self
    }

    /// Routes protocol violations to `observer`.
    #[must_use]
    pub fn with_violation_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.violation_observer = Some(observer);
        self
    }

    /// Address observers should connect to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Connected observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Returns `true` after `GoLive` was sent.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        self.live
    }

    /// Last frame each observer acknowledged.
    pub fn acknowledged_frames(&self) -> impl Iterator<Item = (PeerId, Frame)> + '_ {
        self.observers.iter().map(|(peer, link)| (*peer, link.acked))
    }

    /// Handles transport events for up to `timeout`. Returns the number handled.
    ///
    /// The first poll waits; the rest only drain what is already queued.
    pub fn pump(&mut self, timeout: Duration) -> usize {
        let mut handled = 0;
        let mut wait = timeout;
        while let Some(event) = self.transport.poll(wait) {
            wait = Duration::ZERO;
            handled += 1;
            self.handle_event(event);
        }
        handled
    }

    /// Waits until `count` observers are connected or `timeout` passes.
    /// Returns the number connected.
    pub fn wait_for_observers(&mut self, count: usize, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        while self.observers.len() < count {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.pump(deadline - now);
        }
        self.observers.len()
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { peer, addr } => {
                debug!("observer {} connected from {}", peer, addr);
                self.observers.insert(
                    peer,
                    ObserverLink {
                        addr,
                        ready: false,
                        acked: Frame::NULL,
                    },
                );
            },
            TransportEvent::Disconnected { peer } => {
                if let Some(link) = self.observers.remove(&peer) {
                    info!("observer at {} left", link.addr);
                }
            },
            TransportEvent::Received {
                peer,
                channel,
                payload,
            } if channel == Channel::BLOB => self.on_blob_message(peer, &payload),
            TransportEvent::Received { channel, peer, .. } => {
                trace!("ignoring message on {} from {}", channel, peer);
            },
        }
    }

    fn on_blob_message(&mut self, peer: PeerId, payload: &[u8]) {
        let message = match BlobMessage::decode(payload) {
            Ok(message) => message,
            Err(err) => {
                report_violation_to!(
                    self.violation_observer,
                    ViolationSeverity::Warning,
                    ViolationKind::Replication,
                    "malformed message from observer {}: {}",
                    peer,
                    err
                );
                return;
            },
        };
        let Some(link) = self.observers.get_mut(&peer) else {
            return;
        };
        match message {
            BlobMessage::Ready => {
                trace!("observer {} ready", peer);
                link.ready = true;
            },
            BlobMessage::FrameAck { frame } => {
                link.acked = link.acked.max(frame);
            },
            other => report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Warning,
                ViolationKind::Replication,
                "unexpected message from observer {}: {:?}",
                peer,
                other
            ),
        }
    }

    fn broadcast(&mut self, message: &BlobMessage) -> Result<(), NetplayError> {
        let bytes = message.encode()?;
        self.transport
            .broadcast(Channel::BLOB, &bytes, Delivery::Reliable)?;
        Ok(())
    }

    /// Sends one blob to every connected observer.
    ///
    /// # Errors
    /// - [`NetplayError::InvalidRequest`] if `data` is larger than the observers accept.
    /// - [`NetplayError::Transport`] or [`NetplayError::Codec`] if a frame cannot be sent.
    pub fn send_blob(&mut self, kind: BlobKind, data: &[u8]) -> Result<(), NetplayError> {
        let total_length = u32::try_from(data.len())
            .ok()
            .filter(|len| *len <= self.config.max_blob_length)
            .ok_or_else(|| NetplayError::InvalidRequest {
                info: format!(
                    "{kind} of {} bytes exceeds the maximum of {}",
                    data.len(),
                    self.config.max_blob_length
                ),
            })?;
        let header = BlobHeader {
            kind: kind.as_u8(),
            total_length,
        };

        self.broadcast(&BlobMessage::Begin(header))?;
        let mut offset = 0_u32;
        for bytes in data.chunks(self.config.chunk_size) {
            self.broadcast(&BlobMessage::Chunk(BlobChunk {
                kind: header.kind,
                total_length,
                offset,
                bytes: bytes.to_vec(),
            }))?;
            // Bounded by total_length, which fits in u32.
            offset = offset.saturating_add(bytes.len() as u32);
        }
        self.broadcast(&BlobMessage::End(header))?;
        debug!("sent {} of {} bytes", kind, total_length);
        Ok(())
    }

    /// Brings `expected` observers to the state of `sim` and releases them.
    ///
    /// Sends the cart image, the save image if any, and a snapshot of `sim`,
    /// then Sync. Waits up to the sync timeout for Ready from `expected`
    /// observers; a shortfall is reported and replication goes live anyway.
    ///
    /// # Errors
    /// - [`NetplayError::InvalidRequest`] if the origin is already live or a blob is too large.
    /// - [`NetplayError::Transport`] or [`NetplayError::Codec`] if a message cannot be sent.
    pub fn replicate<S: Simulation + ?Sized>(
        &mut self,
        sim: &S,
        cart: &[u8],
        save: Option<&[u8]>,
        console_type: u8,
        expected: usize,
    ) -> Result<SyncReport, NetplayError> {
        if self.live {
            return Err(NetplayError::InvalidRequest {
                info: "replication is already live".to_owned(),
            });
        }
        self.pump(Duration::ZERO);
        for link in self.observers.values_mut() {
            link.ready = false;
        }

        self.send_blob(BlobKind::CartImage, cart)?;
        if let Some(save) = save {
            self.send_blob(BlobKind::SaveImage, save)?;
        }
        self.send_blob(BlobKind::InitialState, &sim.serialize_state())?;
        self.broadcast(&BlobMessage::Sync { console_type })?;

        let started = Instant::now();
        let deadline = started + self.config.sync_timeout;
        while self.ready_count() < expected {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.pump(deadline - now);
        }
        let report = SyncReport {
            expected,
            ready: self.ready_count(),
            waited: started.elapsed(),
        };
        if !report.is_complete() {
            warn!(
                "only {} of {} observers ready after {:?}, going live without the rest",
                report.ready, report.expected, report.waited
            );
            report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Warning,
                ViolationKind::Replication,
                "sync shortfall: {} of {} observers ready",
                report.ready,
                report.expected
            );
        }

        self.broadcast(&BlobMessage::GoLive)?;
        let current = sim.current_frame(0);
        for link in self.observers.values_mut() {
            link.acked = current;
        }
        self.queue.clear();
        self.queue.prefill_from(current, self.lag_depth);
        self.live = true;
        info!("replication live at frame {}", current);
        Ok(report)
    }

    fn ready_count(&self) -> usize {
        self.observers.values().filter(|link| link.ready).count()
    }

    /// Whether the origin, about to run `current`, must wait for an observer.
    ///
    /// Only observers that answered Ready count. One that never synced ignores
    /// GoLive and never acknowledges a frame.
    #[must_use]
    pub fn backpressure(&self, current: Frame) -> Backpressure {
        let worst = self
            .observers
            .iter()
            .filter(|(_, link)| link.ready)
            .map(|(peer, link)| (*peer, current - link.acked))
            .max_by_key(|(_, behind)| *behind);
        match worst {
            Some((peer, behind)) if behind > self.config.max_observer_lag => {
                Backpressure::Paused { peer, behind }
            },
            _ => Backpressure::Clear,
        }
    }

    /// Sends an input frame to every observer on the origin's input channel.
    ///
    /// # Errors
    /// - [`NetplayError::Transport`] or [`NetplayError::Codec`] if it cannot be sent.
    pub fn broadcast_input(&mut self, input: InputFrame) -> Result<(), NetplayError> {
        let bytes = InputMessage { frame: input }.encode()?;
        self.transport
            .broadcast(Channel::input(PlayerId::HOST), &bytes, Delivery::Reliable)?;
        Ok(())
    }

    /// One tick of the origin once live.
    ///
    /// Drains acks, and if no observer is too far behind, samples `input` for
    /// frame `current + lag_depth`, sends it, and applies the input due for the
    /// current frame to instance 0 of `sim`.
    ///
    /// # Errors
    /// - [`NetplayError::Transport`] or [`NetplayError::Codec`] if the input cannot be sent.
    pub fn process<S: Simulation + ?Sized>(
        &mut self,
        sim: &mut S,
        input: LocalInput,
    ) -> Result<ProcessOutcome, NetplayError> {
        if !self.live {
            return Ok(ProcessOutcome::Idle);
        }
        self.pump(Duration::ZERO);
        let current = sim.current_frame(0);
        if let Backpressure::Paused { peer, behind } = self.backpressure(current) {
            trace!("paused at {}: {} is {} frames behind", current, peer, behind);
            return Ok(ProcessOutcome::Waiting);
        }

        let frame = InputFrame::new(current.delayed_by(self.lag_depth), input);
        self.queue.push(frame);
        self.broadcast_input(frame)?;

        Ok(match self.queue.consume(current) {
            ConsumeOutcome::Ready { input, .. } => {
                sim.apply_input(0, input.key_mask, input.touch());
                ProcessOutcome::Applied(input.frame)
            },
            ConsumeOutcome::Pending { .. } => ProcessOutcome::Waiting,
            ConsumeOutcome::Starved => ProcessOutcome::Starved,
        })
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
    use crate::replication::receiver::{BlobReceiver, ReceiveOutcome};
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 1, last)), 7064)
    }

    fn origin_with_raw_observer(
        config: ReplicationConfig,
    ) -> (MemoryNetwork, ReplicationOrigin, Box<dyn Transport>) {
        let network = MemoryNetwork::new();
        let mut origin =
            ReplicationOrigin::bind(&network.factory(addr(1).ip()), addr(1), config).unwrap();
        let mut raw = network
            .factory(addr(2).ip())
            .create_host(addr(2), 1, CHANNEL_COUNT)
            .unwrap();
        raw.connect(addr(1)).unwrap();
        assert_eq!(origin.wait_for_observers(1, Duration::from_millis(100)), 1);
        (network, origin, raw)
    }

    fn drain_blobs(raw: &mut Box<dyn Transport>) -> Vec<BlobMessage> {
        let mut messages = Vec::new();
        while let Some(event) = raw.poll(Duration::ZERO) {
            if let TransportEvent::Received {
                channel, payload, ..
            } = event
            {
                if channel == Channel::BLOB {
                    messages.push(BlobMessage::decode(&payload).unwrap());
                }
            }
        }
        messages
    }

    #[test]
    fn blob_is_sent_as_begin_chunks_end() {
        let config = ReplicationConfig {
            chunk_size: 4,
            ..ReplicationConfig::default()
        };
        let (_network, mut origin, mut raw) = origin_with_raw_observer(config);
        let data: Vec<u8> = (0..10).collect();
        origin.send_blob(BlobKind::SaveImage, &data).unwrap();

        let messages = drain_blobs(&mut raw);
        assert_eq!(messages.len(), 5);
        assert!(matches!(messages[0], BlobMessage::Begin(h) if h.total_length == 10));
        assert!(matches!(messages[4], BlobMessage::End(_)));

        let mut rx = BlobReceiver::new(&config);
        for message in messages {
            match message {
                BlobMessage::Begin(h) => {
                    rx.begin(h).unwrap();
                },
                BlobMessage::Chunk(c) => {
                    rx.chunk(&c).unwrap();
                },
                BlobMessage::End(h) => {
                    assert_eq!(rx.end(h), Ok(ReceiveOutcome::Completed(BlobKind::SaveImage)));
                },
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(rx.blob(BlobKind::SaveImage), Some(&data[..]));
    }

    #[test]
    fn oversized_blob_is_refused() {
        let config = ReplicationConfig {
            max_blob_length: 8,
            ..ReplicationConfig::default()
        };
        let (_network, mut origin, mut raw) = origin_with_raw_observer(config);
        let result = origin.send_blob(BlobKind::CartImage, &[0; 9]);
        assert!(matches!(result, Err(NetplayError::InvalidRequest { .. })));
        assert!(drain_blobs(&mut raw).is_empty());
    }

    fn send_to_origin(raw: &mut Box<dyn Transport>, message: &BlobMessage) {
        let origin_peer = raw.peers()[0];
        raw.send(origin_peer, Channel::BLOB, &message.encode().unwrap(), Delivery::Reliable)
            .unwrap();
    }

    #[test]
    fn backpressure_pauses_on_lagging_observer() {
        let config = ReplicationConfig {
            max_observer_lag: 8,
            ..ReplicationConfig::default()
        };
        let (_network, mut origin, mut raw) = origin_with_raw_observer(config);
        let peer = origin.acknowledged_frames().next().unwrap().0;

        send_to_origin(&mut raw, &BlobMessage::Ready);
        send_to_origin(
            &mut raw,
            &BlobMessage::FrameAck {
                frame: Frame::new(100),
            },
        );
        origin.pump(Duration::from_millis(100));

        assert_eq!(origin.backpressure(Frame::new(108)), Backpressure::Clear);
        assert_eq!(
            origin.backpressure(Frame::new(109)),
            Backpressure::Paused { peer, behind: 9 }
        );
    }

    #[test]
    fn observer_that_never_readied_does_not_hold_the_origin() {
        let config = ReplicationConfig {
            max_observer_lag: 8,
            ..ReplicationConfig::default()
        };
        let (_network, mut origin, mut raw) = origin_with_raw_observer(config);
        send_to_origin(
            &mut raw,
            &BlobMessage::FrameAck {
                frame: Frame::new(100),
            },
        );
        origin.pump(Duration::from_millis(100));
        assert_eq!(origin.backpressure(Frame::new(1_000)), Backpressure::Clear);
    }

    #[test]
    fn stale_acks_do_not_move_backwards() {
        let (_network, mut origin, mut raw) = origin_with_raw_observer(ReplicationConfig::default());
        let origin_peer = raw.peers()[0];
        for frame in [50, 40] {
            let ack = BlobMessage::FrameAck {
                frame: Frame::new(frame),
            }
            .encode()
            .unwrap();
            raw.send(origin_peer, Channel::BLOB, &ack, Delivery::Reliable)
                .unwrap();
        }
        origin.pump(Duration::from_millis(100));
        assert_eq!(origin.acknowledged_frames().next().unwrap().1, Frame::new(50));
    }

    #[test]
    fn no_observers_means_no_pause() {
        let network = MemoryNetwork::new();
        let origin = ReplicationOrigin::bind(
            &network.factory(addr(1).ip()),
            addr(1),
            ReplicationConfig::default(),
        )
        .unwrap();
        assert_eq!(origin.backpressure(Frame::new(1_000)), Backpressure::Clear);
        assert!(!origin.is_live());
    }

    #[test]
    fn report_completeness() {
        let report = SyncReport {
            expected: 2,
            ready: 1,
            waited: Duration::ZERO,
        };
        assert!(!report.is_complete());
        assert!(SyncReport { ready: 2, ..report }.is_complete());
    }
}
