//! In-process transport.
//!
//! All endpoints of a [`MemoryNetwork`] share one hub. Messages are delivered
//! in order and never lost, so unreliable sends behave like reliable ones.
//! Endpoints are plain values and can be moved to other threads; `poll` with
//! a non-zero timeout blocks on a condition variable until something arrives.
//!
//! ```
//! use lockstep_netplay::{Channel, Delivery, MemoryNetwork, TransportEvent, TransportFactory};
//! use std::net::{IpAddr, Ipv4Addr, SocketAddr};
//! use web_time::Duration;
//!
//! let network = MemoryNetwork::new();
//! let ip_a = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
//! let ip_b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
//! let mut a = network.factory(ip_a).create_host(SocketAddr::new(ip_a, 9000), 4, 18).unwrap();
//! let mut b = network.factory(ip_b).create_host(SocketAddr::new(ip_b, 9000), 4, 18).unwrap();
//!
//! let peer = b.connect(a.local_addr()).unwrap();
//! b.send(peer, Channel::CONTROL, b"hi", Delivery::Reliable).unwrap();
//!
//! assert!(matches!(a.poll(Duration::ZERO), Some(TransportEvent::Connected { .. })));
//! assert!(matches!(
//!     a.poll(Duration::ZERO),
//!     Some(TransportEvent::Received { payload, .. }) if payload == b"hi"
//! ));
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::trace;
use web_time::{Duration, Instant};

use crate::network::transport::{
    Channel, Delivery, PeerId, PeerVec, Transport, TransportError, TransportEvent,
    TransportFactory,
};

#[derive(Debug, Clone, Copy)]
struct Link {
    remote: SocketAddr,
    remote_peer: PeerId,
}

#[derive(Debug)]
struct Endpoint {
    max_peers: usize,
    inbox: VecDeque<TransportEvent>,
    links: BTreeMap<PeerId, Link>,
}

#[derive(Debug, Default)]
struct HubState {
    endpoints: BTreeMap<SocketAddr, Endpoint>,
    next_peer: u64,
}

impl HubState {
    fn allocate_peer(&mut self) -> PeerId {
        self.next_peer += 1;
        PeerId::new(self.next_peer)
    }

    fn deliver(&mut self, to: SocketAddr, event: TransportEvent) {
        if let Some(endpoint) = self.endpoints.get_mut(&to) {
            endpoint.inbox.push_back(event);
        }
    }

    /// Removes both halves of a link and tells the remote side.
    fn sever(&mut self, local: SocketAddr, peer: PeerId) -> Option<Link> {
        let link = self.endpoints.get_mut(&local)?.links.remove(&peer)?;
        if let Some(remote) = self.endpoints.get_mut(&link.remote) {
            remote.links.remove(&link.remote_peer);
            remote.inbox.push_back(TransportEvent::Disconnected {
                peer: link.remote_peer,
            });
        }
        Some(link)
    }
}

#[derive(Debug, Default)]
struct Hub {
    state: Mutex<HubState>,
    signal: Condvar,
}

/// A set of in-process endpoints that can reach each other by address.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Hub>,
}

impl MemoryNetwork {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory whose endpoints live at `ip`.
    #[must_use]
    pub fn factory(&self, ip: IpAddr) -> MemoryTransportFactory {
        MemoryTransportFactory {
            hub: Arc::clone(&self.hub),
            ip,
        }
    }

    /// Returns `true` if an endpoint is bound at `addr`.
    #[must_use]
    pub fn is_bound(&self, addr: SocketAddr) -> bool {
        self.hub.state.lock().endpoints.contains_key(&addr)
    }

    /// Number of live endpoints.
    #[must_use]
    pub fn endpoint_count(&self) -> usize {
        self.hub.state.lock().endpoints.len()
    }
}

/// Creates [`MemoryTransport`] endpoints at one IP address.
#[derive(Debug, Clone)]
pub struct MemoryTransportFactory {
    hub: Arc<Hub>,
    ip: IpAddr,
}

impl TransportFactory for MemoryTransportFactory {
    fn create_host(
        &self,
        bind: SocketAddr,
        max_peers: usize,
        channel_count: usize,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let addr = if bind.ip().is_unspecified() {
            SocketAddr::new(self.ip, bind.port())
        } else {
            bind
        };
        if channel_count == 0 {
            return Err(TransportError::Bind {
                addr,
                reason: "an endpoint needs at least one channel".to_owned(),
            });
        }

        let mut state = self.hub.state.lock();
        if state.endpoints.contains_key(&addr) {
            return Err(TransportError::Bind {
                addr,
                reason: "address already in use".to_owned(),
            });
        }
        state.endpoints.insert(
            addr,
            Endpoint {
                max_peers,
                inbox: VecDeque::new(),
                links: BTreeMap::new(),
            },
        );
        trace!("memory endpoint bound at {}", addr);

        Ok(Box::new(MemoryTransport {
            hub: Arc::clone(&self.hub),
            addr,
            channel_count,
        }))
    }
}

/// One endpoint of a [`MemoryNetwork`]. Dropping it disconnects every peer.
#[derive(Debug)]
pub struct MemoryTransport {
    hub: Arc<Hub>,
    addr: SocketAddr,
    channel_count: usize,
}

impl MemoryTransport {
    fn check_channel(&self, channel: Channel) -> Result<(), TransportError> {
        if channel.as_usize() >= self.channel_count {
            return Err(TransportError::ChannelOutOfRange {
                channel,
                channel_count: self.channel_count,
            });
        }
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn connect(&mut self, addr: SocketAddr) -> Result<PeerId, TransportError> {
        let connect_error = |reason: &str| TransportError::Connect {
            addr,
            reason: reason.to_owned(),
        };
        if addr == self.addr {
            return Err(connect_error("cannot connect to self"));
        }

        let mut state = self.hub.state.lock();
        let local = state.endpoints.get(&self.addr).ok_or(TransportError::Closed)?;
        if local.links.len() >= local.max_peers {
            return Err(connect_error("local peer limit reached"));
        }
        let remote = state
            .endpoints
            .get(&addr)
            .ok_or_else(|| connect_error("no endpoint listening"))?;
        if remote.links.len() >= remote.max_peers {
            return Err(connect_error("remote peer limit reached"));
        }

        let local_peer = state.allocate_peer();
        let remote_peer = state.allocate_peer();
        if let Some(local) = state.endpoints.get_mut(&self.addr) {
            local.links.insert(
                local_peer,
                Link {
                    remote: addr,
                    remote_peer,
                },
            );
            local.inbox.push_back(TransportEvent::Connected {
                peer: local_peer,
                addr,
            });
        }
        if let Some(remote) = state.endpoints.get_mut(&addr) {
            remote.links.insert(
                remote_peer,
                Link {
                    remote: self.addr,
                    remote_peer: local_peer,
                },
            );
            remote.inbox.push_back(TransportEvent::Connected {
                peer: remote_peer,
                addr: self.addr,
            });
        }
        drop(state);
        self.hub.signal.notify_all();

        trace!("{} connected to {} as {}", self.addr, addr, local_peer);
        Ok(local_peer)
    }

    fn disconnect(&mut self, peer: PeerId) {
        let severed = self.hub.state.lock().sever(self.addr, peer);
        if let Some(link) = severed {
            trace!("{} disconnected from {}", self.addr, link.remote);
            self.hub.signal.notify_all();
        }
    }

    fn poll(&mut self, timeout: Duration) -> Option<TransportEvent> {
        let deadline = Instant::now() + timeout;
        let mut state = self.hub.state.lock();
        loop {
            if let Some(event) = state
                .endpoints
                .get_mut(&self.addr)
                .and_then(|endpoint| endpoint.inbox.pop_front())
            {
                return Some(event);
            }
            let now = Instant::now();
            if now >= deadline || !state.endpoints.contains_key(&self.addr) {
                return None;
            }
            self.hub.signal.wait_for(&mut state, deadline - now);
        }
    }

    fn send(
        &mut self,
        peer: PeerId,
        channel: Channel,
        payload: &[u8],
        _delivery: Delivery,
    ) -> Result<(), TransportError> {
        self.check_channel(channel)?;
        let mut state = self.hub.state.lock();
        let link = state
            .endpoints
            .get(&self.addr)
            .ok_or(TransportError::Closed)?
            .links
            .get(&peer)
            .copied()
            .ok_or(TransportError::UnknownPeer { peer })?;
        state.deliver(
            link.remote,
            TransportEvent::Received {
                peer: link.remote_peer,
                channel,
                payload: payload.to_vec(),
            },
        );
        drop(state);
        self.hub.signal.notify_all();
        Ok(())
    }

    fn broadcast(
        &mut self,
        channel: Channel,
        payload: &[u8],
        _delivery: Delivery,
    ) -> Result<(), TransportError> {
        self.check_channel(channel)?;
        let mut state = self.hub.state.lock();
        let links: Vec<Link> = state
            .endpoints
            .get(&self.addr)
            .ok_or(TransportError::Closed)?
            .links
            .values()
            .copied()
            .collect();
        for link in links {
            state.deliver(
                link.remote,
                TransportEvent::Received {
                    peer: link.remote_peer,
                    channel,
                    payload: payload.to_vec(),
                },
            );
        }
        drop(state);
        self.hub.signal.notify_all();
        Ok(())
    }

    fn peer_addr(&self, peer: PeerId) -> Option<SocketAddr> {
        let state = self.hub.state.lock();
        state
            .endpoints
            .get(&self.addr)?
            .links
            .get(&peer)
            .map(|link| link.remote)
    }

    fn peers(&self) -> PeerVec {
        let state = self.hub.state.lock();
        state
            .endpoints
            .get(&self.addr)
            .map(|endpoint| endpoint.links.keys().copied().collect())
            .unwrap_or_default()
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        let mut state = self.hub.state.lock();
        let peers: Vec<PeerId> = state
            .endpoints
            .get(&self.addr)
            .map(|endpoint| endpoint.links.keys().copied().collect())
            .unwrap_or_default();
        for peer in peers {
            state.sever(self.addr, peer);
        }
        state.endpoints.remove(&self.addr);
        drop(state);
        self.hub.signal.notify_all();
        trace!("memory endpoint at {} closed", self.addr);
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
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn endpoint(network: &MemoryNetwork, last: u8) -> Box<dyn Transport> {
        network
            .factory(ip(last))
            .create_host(SocketAddr::new(ip(last), 7000), 4, 18)
            .unwrap()
    }

    #[test]
    fn unspecified_bind_uses_factory_ip() {
        let network = MemoryNetwork::new();
        let transport = network
            .factory(ip(9))
            .create_host(
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 7000),
                4,
                18,
            )
            .unwrap();
        assert_eq!(transport.local_addr(), SocketAddr::new(ip(9), 7000));
    }

    #[test]
    fn binding_twice_fails() {
        let network = MemoryNetwork::new();
        let _first = endpoint(&network, 1);
        let second = network
            .factory(ip(1))
            .create_host(SocketAddr::new(ip(1), 7000), 4, 18);
        assert!(matches!(second, Err(TransportError::Bind { .. })));
    }

    #[test]
    fn connect_to_nobody_fails() {
        let network = MemoryNetwork::new();
        let mut a = endpoint(&network, 1);
        let result = a.connect(SocketAddr::new(ip(2), 7000));
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }

    #[test]
    fn both_sides_see_connect_and_messages_in_order() {
        let network = MemoryNetwork::new();
        let mut a = endpoint(&network, 1);
        let mut b = endpoint(&network, 2);

        let peer_b = a.connect(b.local_addr()).unwrap();
        assert_eq!(a.peer_addr(peer_b), Some(b.local_addr()));

        a.send(peer_b, Channel::CONTROL, &[1], Delivery::Reliable)
            .unwrap();
        a.send(peer_b, Channel::CONTROL, &[2], Delivery::Reliable)
            .unwrap();

        let Some(TransportEvent::Connected { peer: peer_a, addr }) = b.poll(Duration::ZERO) else {
            panic!("expected connect");
        };
        assert_eq!(addr, a.local_addr());
        for expected in [1_u8, 2] {
            match b.poll(Duration::ZERO) {
                Some(TransportEvent::Received {
                    peer,
                    channel,
                    payload,
                }) => {
                    assert_eq!(peer, peer_a);
                    assert_eq!(channel, Channel::CONTROL);
                    assert_eq!(payload, vec![expected]);
                },
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(b.poll(Duration::ZERO).is_none());
        assert!(matches!(
            a.poll(Duration::ZERO),
            Some(TransportEvent::Connected { .. })
        ));
    }

    #[test]
    fn channel_out_of_range_is_rejected() {
        let network = MemoryNetwork::new();
        let mut a = endpoint(&network, 1);
        let b = endpoint(&network, 2);
        let peer = a.connect(b.local_addr()).unwrap();
        let result = a.send(peer, Channel::new(18), &[], Delivery::Unreliable);
        assert!(matches!(
            result,
            Err(TransportError::ChannelOutOfRange { .. })
        ));
    }

    #[test]
    fn dropping_an_endpoint_disconnects_peers() {
        let network = MemoryNetwork::new();
        let a = endpoint(&network, 1);
        let mut b = endpoint(&network, 2);
        b.connect(a.local_addr()).unwrap();
        let _ = b.poll(Duration::ZERO);

        drop(a);
        assert_eq!(network.endpoint_count(), 1);
        assert!(matches!(
            b.poll(Duration::ZERO),
            Some(TransportEvent::Disconnected { .. })
        ));
        assert!(b.peers().is_empty());
    }

    #[test]
    fn poll_wakes_up_for_messages_from_another_thread() {
        let network = MemoryNetwork::new();
        let mut a = endpoint(&network, 1);
        let mut b = endpoint(&network, 2);
        let peer = b.connect(a.local_addr()).unwrap();
        let _ = a.poll(Duration::ZERO);

        let sender = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            b.send(peer, Channel::BLOB, &[7], Delivery::Reliable).unwrap();
            b
        });
        let event = a.poll(Duration::from_secs(5));
        assert!(matches!(event, Some(TransportEvent::Received { .. })));
        drop(sender.join().unwrap());
    }

    #[test]
    fn peer_limit_is_enforced() {
        let network = MemoryNetwork::new();
        let host = network
            .factory(ip(1))
            .create_host(SocketAddr::new(ip(1), 7000), 1, 18)
            .unwrap();
        let mut b = endpoint(&network, 2);
        let mut c = endpoint(&network, 3);
        b.connect(host.local_addr()).unwrap();
        assert!(c.connect(host.local_addr()).is_err());
    }
}
