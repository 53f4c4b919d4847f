//! In-memory collaborators for tests, benchmarks and fuzzing.
//!
//! A [Network] queues every datagram instead of delivering it, so the caller decides when (and
//! whether) each one reaches the [crate::Endpoint] it is addressed to.

use crate::{
    crypto::{KeyPair, PublicKey, SharedKey},
    ConnectionId, Error, RelayId,
};
use bytes::Bytes;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::SocketAddr,
    sync::{Arc, Mutex},
};

/// How a queued datagram arrives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Via {
    Udp { from: SocketAddr },
    Relay(RelayId),
}

/// A datagram in flight.
#[derive(Clone, Debug)]
pub struct Datagram {
    /// Address of the node that receives it.
    pub to: SocketAddr,
    pub via: Via,
    pub packet: Bytes,
}

/// A queue of datagrams between nodes identified by their UDP address.
#[derive(Default)]
pub struct Network {
    queue: Mutex<VecDeque<Datagram>>,
    links: Mutex<HashMap<(SocketAddr, RelayId), (SocketAddr, RelayId)>>,
    blocked: Mutex<HashSet<SocketAddr>>,
}

impl Network {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connect `a` and `b` through a relay, known to `a` as `a_relay` and to `b` as `b_relay`.
    pub fn link(&self, a: SocketAddr, a_relay: RelayId, b: SocketAddr, b_relay: RelayId) {
        let mut links = self.links.lock().unwrap();
        links.insert((a, a_relay), (b, b_relay));
        links.insert((b, b_relay), (a, a_relay));
    }

    /// Silently drop every UDP datagram sent to or from `addr`.
    pub fn block_udp(&self, addr: SocketAddr) {
        self.blocked.lock().unwrap().insert(addr);
    }

    /// Undo [Network::block_udp].
    pub fn unblock_udp(&self, addr: SocketAddr) {
        self.blocked.lock().unwrap().remove(&addr);
    }

    /// Take the oldest datagram in flight.
    pub fn pop(&self) -> Option<Datagram> {
        self.queue.lock().unwrap().pop_front()
    }

    /// Drop every datagram in flight.
    pub fn clear(&self) {
        self.queue.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, datagram: Datagram) {
        self.queue.lock().unwrap().push_back(datagram);
    }
}

/// A node attached to a [Network].
pub struct Substrate {
    network: Arc<Network>,
    addr: SocketAddr,
    dht: KeyPair,
}

impl Substrate {
    pub fn new(network: Arc<Network>, addr: SocketAddr, dht: KeyPair) -> Self {
        Self { network, addr, dht }
    }

    /// The UDP address of this node.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl crate::Substrate for Substrate {
    fn dht_public_key(&self) -> PublicKey {
        *self.dht.public()
    }

    fn dht_shared_key(&self, peer: &PublicKey) -> Result<SharedKey, Error> {
        SharedKey::derive(self.dht.secret(), peer)
    }

    fn send_udp(&self, addr: SocketAddr, packet: &[u8]) -> Result<(), Error> {
        {
            let blocked = self.network.blocked.lock().unwrap();
            if blocked.contains(&addr) || blocked.contains(&self.addr) {
                return Ok(());
            }
        }
        self.network.push(Datagram {
            to: addr,
            via: Via::Udp { from: self.addr },
            packet: Bytes::copy_from_slice(packet),
        });
        Ok(())
    }

    fn send_relay(&self, relay: RelayId, packet: &[u8]) -> Result<(), Error> {
        let link = self
            .network
            .links
            .lock()
            .unwrap()
            .get(&(self.addr, relay))
            .copied();
        let Some((to, relay)) = link else {
            return Err(Error::NoRoute);
        };
        self.network.push(Datagram {
            to,
            via: Via::Relay(relay),
            packet: Bytes::copy_from_slice(packet),
        });
        Ok(())
    }
}

/// A callback received by a [Handler].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Status(ConnectionId, bool),
    Lossless(ConnectionId, Bytes),
    Lossy(ConnectionId, Bytes),
    DhtKeyChanged(ConnectionId, PublicKey),
}

type Hook = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
struct State {
    events: Mutex<Vec<Event>>,
    rejected: Mutex<HashSet<PublicKey>>,
    hook: Mutex<Option<Hook>>,
}

/// Records every callback and optionally runs a hook after each one.
///
/// Clones share the same record.
#[derive(Clone, Default)]
pub struct Handler {
    state: Arc<State>,
}

impl Handler {
    /// Every callback received so far.
    pub fn events(&self) -> Vec<Event> {
        self.state.events.lock().unwrap().clone()
    }

    /// Every callback received since the last call.
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.state.events.lock().unwrap())
    }

    /// Lossless packets delivered on `id`, in order.
    pub fn lossless_on(&self, id: ConnectionId) -> Vec<Bytes> {
        self.state
            .events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                Event::Lossless(on, data) if *on == id => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Refuse inbound handshakes from `identity`.
    pub fn reject(&self, identity: PublicKey) {
        self.state.rejected.lock().unwrap().insert(identity);
    }

    /// Run `hook` after every callback (without any lock held).
    pub fn set_hook(&self, hook: impl Fn(&Event) + Send + Sync + 'static) {
        *self.state.hook.lock().unwrap() = Some(Arc::new(hook));
    }

    fn record(&self, event: Event) {
        self.state.events.lock().unwrap().push(event.clone());
        let hook = self.state.hook.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook(&event);
        }
    }
}

impl crate::Handler for Handler {
    fn allows_peer(&self, identity: &PublicKey) -> bool {
        !self.state.rejected.lock().unwrap().contains(identity)
    }

    fn connection_status(&self, id: ConnectionId, established: bool) {
        self.record(Event::Status(id, established));
    }

    fn lossless(&self, id: ConnectionId, data: Bytes) {
        self.record(Event::Lossless(id, data));
    }

    fn lossy(&self, id: ConnectionId, data: Bytes) {
        self.record(Event::Lossy(id, data));
    }

    fn dht_key_changed(&self, id: ConnectionId, dht: PublicKey) {
        self.record(Event::DhtKeyChanged(id, dht));
    }
}
