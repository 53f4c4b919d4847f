//! The entry point for every inbound datagram and every call from the layer above.
//!
//! An [Endpoint] owns a table of [Connection]s. Inbound packets are classified by their type
//! byte and routed to a connection by the address or relay they arrived on (cookie responses and
//! data) or by the identity bound in their outer cookie (handshakes). Cookie requests are
//! answered without touching the table.
//!
//! # Locking
//!
//! The table lock is only held to look up, insert or remove a connection, never while a
//! connection lock is acquired. Callbacks to the [Handler] run after both are released, so a
//! callback may call back into the [Endpoint].

use crate::{
    array::MAX_CAPACITY,
    config::Config,
    connection::{
        secs, Connection, Context, Effects, Event, Info, Restart, Route, Settings, Status,
    },
    cookie::{self, CookieKey, CookieRequest, CookieResponse},
    crypto::{KeyPair, PublicKey},
    handshake::{legacy, noise, HandshakeKind},
    metrics::{Metrics, Packet},
    packet::{DataPacket, PacketType},
    table::{ConnectionId, RelayId, Table},
    Error, Handler, Substrate,
};
use commonware_codec::{DecodeExt, Encode};
use prometheus_client::registry::Registry;
use rand::{rngs::StdRng, CryptoRng, Rng, SeedableRng};
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, RwLock},
};
use tracing::{debug, trace};

/// The connection layer of a single node.
pub struct Endpoint<S: Substrate, H: Handler> {
    settings: Settings,
    max_connections: usize,
    identity: KeyPair,
    cookie_key: CookieKey,
    substrate: S,
    handler: H,

    table: RwLock<Table<Arc<Mutex<Connection>>>>,
    rng: Mutex<StdRng>,
    metrics: Metrics,
}

impl<S: Substrate, H: Handler> Endpoint<S, H> {
    /// Create an endpoint for the long-term key pair `identity`.
    ///
    /// # Panics
    ///
    /// Panics if `cfg.packet_buffer_size` is not a power of two no larger than
    /// [crate::array::MAX_CAPACITY].
    pub fn new<R: Rng + CryptoRng>(
        rng: &mut R,
        cfg: Config,
        identity: KeyPair,
        substrate: S,
        handler: H,
        registry: &mut Registry,
    ) -> Self {
        assert!(
            cfg.packet_buffer_size.is_power_of_two(),
            "packet_buffer_size must be a power of two"
        );
        assert!(
            cfg.packet_buffer_size <= MAX_CAPACITY,
            "packet_buffer_size too large"
        );
        Self {
            settings: Settings::from(&cfg),
            max_connections: cfg.max_connections,
            identity,
            cookie_key: CookieKey::new(rng, cfg.cookie_timeout.as_secs()),
            substrate,
            handler,
            table: RwLock::new(Table::new()),
            rng: Mutex::new(StdRng::from_seed(rng.gen())),
            metrics: Metrics::init(registry),
        }
    }

    /// Our long-term public key.
    pub fn identity(&self) -> &PublicKey {
        self.identity.public()
    }

    pub fn substrate(&self) -> &S {
        &self.substrate
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    fn context(&self) -> Context<'_, S> {
        Context {
            settings: &self.settings,
            substrate: &self.substrate,
            identity: &self.identity,
            cookie_key: &self.cookie_key,
            metrics: &self.metrics,
        }
    }

    /// A generator for a new connection, seeded from ours.
    fn fork_rng(&self) -> StdRng {
        StdRng::from_seed(self.rng.lock().unwrap().gen())
    }

    // Public API

    /// Start connecting to the peer `identity`, reachable through its DHT key `dht`.
    ///
    /// Nothing is sent until a route is provided with [Endpoint::set_direct_addr] or
    /// [Endpoint::set_relay].
    pub fn connect(
        &self,
        now: u64,
        identity: PublicKey,
        dht: PublicKey,
    ) -> Result<ConnectionId, Error> {
        if identity == *self.identity.public() {
            return Err(Error::ConnectSelf);
        }
        let rng = self.fork_rng();
        let ctx = self.context();
        let mut table = self.table.write().unwrap();
        if table.len() >= self.max_connections {
            return Err(Error::TooManyConnections);
        }
        let id = table.insert_with(identity, |id| {
            Connection::connect(&ctx, id, now, rng, identity, dht)
                .map(|connection| Arc::new(Mutex::new(connection)))
        })?;
        self.metrics.connections.set(table.len() as i64);
        debug!(%id, peer = ?identity, "created connection");
        Ok(id)
    }

    /// Tear down a connection, telling the peer if it was established.
    pub fn kill(&self, now: u64, id: ConnectionId) -> Result<(), Error> {
        self.with_connection(id, |connection, ctx| {
            connection.kill(ctx, now, true);
            Ok(())
        })
    }

    /// Queue a lossless packet. The first byte of `data` must be a lossless packet id.
    ///
    /// With `congestion_control` the packet is refused once the current budget is spent and may
    /// be held back until the next [Endpoint::tick]. Returns the packet's sequence number.
    pub fn send_lossless(
        &self,
        now: u64,
        id: ConnectionId,
        data: &[u8],
        congestion_control: bool,
    ) -> Result<u32, Error> {
        self.with_connection(id, |connection, ctx| {
            connection.send_lossless(ctx, now, data, congestion_control)
        })
    }

    /// Send a lossy packet. The first byte of `data` must be a lossy packet id.
    pub fn send_lossy(&self, now: u64, id: ConnectionId, data: &[u8]) -> Result<(), Error> {
        self.with_connection(id, |connection, ctx| connection.send_lossy(ctx, now, data))
    }

    /// Whether the lossless packet `number` has been acknowledged by the peer.
    pub fn is_delivered(&self, id: ConnectionId, number: u32) -> Result<bool, Error> {
        self.with_connection(id, |connection, _| connection.is_delivered(number))
    }

    /// How many lossless packets may be queued under congestion control right now.
    pub fn free_send_slots(&self, id: ConnectionId) -> Result<u32, Error> {
        self.with_connection(id, |connection, _| Ok(connection.free_send_slots()))
    }

    pub fn connection_info(&self, now: u64, id: ConnectionId) -> Result<Info, Error> {
        self.with_connection(id, |connection, ctx| Ok(connection.info(now, ctx.settings)))
    }

    /// Set the UDP address of the peer (one per address family).
    pub fn set_direct_addr(
        &self,
        now: u64,
        id: ConnectionId,
        addr: SocketAddr,
    ) -> Result<(), Error> {
        self.table.write().unwrap().set_addr(id, addr)?;
        self.with_connection(id, |connection, ctx| {
            connection.set_direct_addr(ctx, now, addr);
            Ok(())
        })
    }

    /// Set the relay through which the peer can be reached.
    pub fn set_relay(&self, now: u64, id: ConnectionId, relay: RelayId) -> Result<(), Error> {
        self.table.write().unwrap().set_relay(id, relay)?;
        self.with_connection(id, |connection, ctx| {
            connection.set_relay(ctx, now, relay);
            Ok(())
        })
    }

    /// The connection to the peer `identity`, if any.
    pub fn id_of(&self, identity: &PublicKey) -> Option<ConnectionId> {
        self.table.read().unwrap().by_identity(identity)
    }

    /// The status of a connection ([Status::Free] if it does not exist).
    pub fn status(&self, id: ConnectionId) -> Status {
        let Some(connection) = self.table.read().unwrap().get(id).cloned() else {
            return Status::Free;
        };
        let status = connection.lock().unwrap().status();
        status
    }

    /// Number of connections held.
    pub fn connections(&self) -> usize {
        self.table.read().unwrap().len()
    }

    /// Resend handshakes, acknowledge and retransmit data and expire connections.
    ///
    /// Returns the earliest time at which it must be called again, if any connection needs it.
    pub fn tick(&self, now: u64) -> Option<u64> {
        let connections: Vec<_> = {
            let table = self.table.read().unwrap();
            table
                .ids()
                .into_iter()
                .filter_map(|id| table.get(id).map(|c| (id, c.clone())))
                .collect()
        };

        let ctx = self.context();
        let mut next: Option<u64> = None;
        for (id, connection) in connections {
            let (deadline, effects) = {
                let mut connection = connection.lock().unwrap();
                let deadline = connection.tick(&ctx, now);
                (deadline, connection.take_effects())
            };
            self.apply(id, effects);
            if let Some(deadline) = deadline {
                next = Some(next.map_or(deadline, |n| n.min(deadline)));
            }
        }
        next
    }

    // Inbound

    /// Handle a datagram received from `from` over UDP.
    pub fn handle_udp(&self, now: u64, from: SocketAddr, packet: &[u8]) {
        self.handle(now, Route::Udp(from), packet);
    }

    /// Handle a packet received through `relay`.
    pub fn handle_relay(&self, now: u64, relay: RelayId, packet: &[u8]) {
        self.handle(now, Route::Relay(relay), packet);
    }

    fn handle(&self, now: u64, route: Route, packet: &[u8]) {
        let kind = packet.first().copied().and_then(PacketType::from_u8);
        let label = Packet::new(kind);
        self.metrics.received.get_or_create(&label).inc();

        let result = match kind {
            Some(PacketType::CookieRequest) => self.handle_cookie_request(now, route, packet),
            Some(PacketType::CookieResponse) => self.handle_cookie_response(now, route, packet),
            Some(PacketType::Handshake) => self.handle_handshake(now, route, packet),
            Some(PacketType::Data) => self.handle_data(now, route, packet),
            None => Err(Error::InvalidPacketId(
                packet.first().copied().unwrap_or_default(),
            )),
        };
        if let Err(err) = result {
            self.metrics.dropped.get_or_create(&label).inc();
            debug!(?route, ?err, "dropped packet");
        }
    }

    /// Answer a cookie request on the route it arrived on. No state is kept.
    fn handle_cookie_request(&self, now: u64, route: Route, packet: &[u8]) -> Result<(), Error> {
        let request = CookieRequest::decode(packet)?;
        let shared = self.substrate.dht_shared_key(&request.dht)?;
        let plain = cookie::handle_cookie_request(&request, &shared)?;
        let response = {
            let mut rng = self.rng.lock().unwrap();
            cookie::create_cookie_response(
                &mut *rng,
                &self.cookie_key,
                secs(now),
                &plain,
                &request.dht,
                &shared,
            )?
        };

        let response = response.encode();
        match route {
            Route::Udp(addr) => self.substrate.send_udp(addr, &response)?,
            Route::Relay(relay) => self.substrate.send_relay(relay, &response)?,
        }
        trace!(?route, "issued cookie");
        self.metrics.cookies_issued.inc();
        self.metrics
            .sent
            .get_or_create(&Packet::new(Some(PacketType::CookieResponse)))
            .inc();
        Ok(())
    }

    fn handle_cookie_response(&self, now: u64, route: Route, packet: &[u8]) -> Result<(), Error> {
        let response = CookieResponse::decode(packet)?;
        let id = self.lookup(route).ok_or(Error::UnknownConnection)?;
        self.with_connection(id, |connection, ctx| {
            connection.on_cookie_response(ctx, now, route, &response)
        })
    }

    /// Route a handshake to the connection for the identity bound in its outer cookie, creating
    /// one if the handshake opens a new connection.
    fn handle_handshake(&self, now: u64, route: Route, packet: &[u8]) -> Result<(), Error> {
        match self.settings.handshake {
            HandshakeKind::NoiseIK => {
                let message = noise::Message::decode(packet)?;
                let outer = match &message {
                    noise::Message::Initiation(initiation) => &initiation.cookie,
                    noise::Message::Response(response) => &response.cookie,
                };
                let contents = self.cookie_key.open(outer, secs(now))?;
                let existing = self.id_of(&contents.identity);
                match (message, existing) {
                    (noise::Message::Initiation(initiation), Some(id)) => {
                        let restart = self.with_connection(id, |connection, ctx| {
                            connection.on_initiation(ctx, now, route, &initiation)
                        })?;
                        self.restart(now, route, restart)
                    }
                    (noise::Message::Response(response), Some(id)) => {
                        self.with_connection(id, |connection, ctx| {
                            connection.on_response(ctx, now, route, &response)
                        })
                    }
                    (noise::Message::Initiation(initiation), None) => {
                        let (responder, peer) = noise::Responder::read(
                            &self.identity,
                            &self.cookie_key,
                            secs(now),
                            &initiation,
                        )?;
                        let ephemeral = initiation.ephemeral;
                        self.accept(peer.identity, |ctx, id, rng| {
                            Connection::accept_noise(
                                ctx, id, now, rng, route, responder, peer, ephemeral,
                            )
                        })
                    }
                    (noise::Message::Response(_), None) => Err(Error::UnknownConnection),
                }
            }
            HandshakeKind::Legacy => {
                let message = legacy::Message::decode(packet)?;
                let contents = self.cookie_key.open(&message.cookie, secs(now))?;
                if let Some(id) = self.id_of(&contents.identity) {
                    let restart = self.with_connection(id, |connection, ctx| {
                        connection.on_legacy(ctx, now, route, &message)
                    })?;
                    return self.restart(now, route, restart);
                }
                let (peer, session) =
                    legacy::read(&self.identity, &self.cookie_key, secs(now), &message, None)?;
                self.accept(peer.identity, |ctx, id, rng| {
                    Connection::accept_legacy(ctx, id, now, rng, route, peer, session)
                })
            }
        }
    }

    fn handle_data(&self, now: u64, route: Route, packet: &[u8]) -> Result<(), Error> {
        let packet = DataPacket::decode(packet)?;
        let id = self.lookup(route).ok_or(Error::UnknownConnection)?;
        self.with_connection(id, |connection, ctx| connection.on_data(ctx, now, route, &packet))
    }

    /// Store a connection created for a peer that reached out first.
    fn accept(
        &self,
        identity: PublicKey,
        build: impl FnOnce(&Context<S>, ConnectionId, StdRng) -> Result<Connection, Error>,
    ) -> Result<(), Error> {
        if !self.handler.allows_peer(&identity) {
            return Err(Error::PeerRejected);
        }
        let rng = self.fork_rng();
        let ctx = self.context();
        let (id, effects) = {
            let mut table = self.table.write().unwrap();
            if table.len() >= self.max_connections {
                return Err(Error::TooManyConnections);
            }
            let mut effects = Effects::default();
            let id = table.insert_with(identity, |id| {
                let mut connection = build(&ctx, id, rng)?;
                effects = connection.take_effects();
                Ok(Arc::new(Mutex::new(connection)))
            })?;
            self.metrics.connections.set(table.len() as i64);
            (id, effects)
        };
        debug!(%id, peer = ?identity, "accepted connection");
        self.apply(id, effects);
        Ok(())
    }

    /// Accept the handshake of a peer whose stale connection was just removed.
    fn restart(&self, now: u64, route: Route, restart: Option<Restart>) -> Result<(), Error> {
        match restart {
            None => Ok(()),
            Some(Restart::Noise {
                responder,
                peer,
                ephemeral,
            }) => self.accept(peer.identity, |ctx, id, rng| {
                Connection::accept_noise(ctx, id, now, rng, route, responder, peer, ephemeral)
            }),
            Some(Restart::Legacy { peer, session }) => {
                self.accept(peer.identity, |ctx, id, rng| {
                    Connection::accept_legacy(ctx, id, now, rng, route, peer, session)
                })
            }
        }
    }

    // Helpers

    fn lookup(&self, route: Route) -> Option<ConnectionId> {
        let table = self.table.read().unwrap();
        match route {
            Route::Udp(addr) => table.by_addr(&addr),
            Route::Relay(relay) => table.by_relay(relay),
        }
    }

    /// Run `f` on a live connection, then apply the effects it recorded.
    fn with_connection<R>(
        &self,
        id: ConnectionId,
        f: impl FnOnce(&mut Connection, &Context<S>) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let connection = self
            .table
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or(Error::UnknownConnection)?;

        let ctx = self.context();
        let (result, effects) = {
            let mut connection = connection.lock().unwrap();
            if connection.status() == Status::Free {
                return Err(Error::UnknownConnection);
            }
            let result = f(&mut *connection, &ctx);
            (result, connection.take_effects())
        };
        self.apply(id, effects);
        result
    }

    /// Update the table and notify the handler. Must be called without any lock held.
    fn apply(&self, id: ConnectionId, effects: Effects) {
        if effects.killed {
            let mut table = self.table.write().unwrap();
            if table.remove(id).is_some() {
                self.metrics.connections.set(table.len() as i64);
                debug!(%id, "removed connection");
            }
        } else if let Some(route) = effects.learned {
            let mut table = self.table.write().unwrap();
            let result = match route {
                Route::Udp(addr) => table.set_addr(id, addr),
                Route::Relay(relay) => table.set_relay(id, relay),
            };
            if let Err(err) = result {
                trace!(%id, ?err, "unable to index route");
            }
        }

        for event in effects.events {
            match event {
                Event::Status(established) => self.handler.connection_status(id, established),
                Event::Lossless(data) => self.handler.lossless(id, data),
                Event::Lossy(data) => self.handler.lossy(id, data),
                Event::DhtKeyChanged(dht) => self.handler.dht_key_changed(id, dht),
            }
        }
    }
}
