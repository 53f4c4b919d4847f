//! A connection to a single peer and its state machine.
//!
//! ```text
//! NoConnection -> CookieRequesting -> HandshakeSent -> NotConfirmed -> Established
//!                         \________________________________/
//!                           (peer initiated, we answered)
//! ```
//!
//! Any state moves to [Status::Free] when the connection is killed. A [Connection] never does
//! I/O of its own beyond handing datagrams to the [Substrate] and records what the caller must do
//! next (callbacks, index updates, removal) in its [Effects].

use crate::{
    array::PacketArray,
    config::Config,
    congestion::{Congestion, AVERAGE_INTERVAL},
    cookie::{self, CookieContents, CookieKey, CookieResponse},
    crypto::{KeyPair, Nonce, PublicKey, SharedKey},
    handshake::{legacy, noise, Handshake, HandshakeKind, Payload, Peer, TransportKeys},
    metrics::{Metrics, Packet},
    packet::{self, DataPacket, Kind, PacketType, PACKET_ID_KILL},
    request::{self, Outbound},
    table::{ConnectionId, RelayId},
    Error, Substrate,
};
use bytes::Bytes;
use commonware_codec::Encode;
use rand::{rngs::StdRng, Rng};
use std::net::SocketAddr;
use tracing::{debug, trace};
use x25519_dalek::StaticSecret;

/// Datagrams shorter than this are also probed over UDP while the relay is in use.
const UDP_PROBE_SIZE: usize = 96;

/// How long after sending through the relay the rate estimator holds its rates once the direct
/// path is back.
const RELAY_HOLD: u64 = 1_000;

/// Where a connection is in its life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// Created locally, waiting for a route to the peer.
    NoConnection,

    /// A cookie request was sent.
    CookieRequesting,

    /// Our handshake was sent and not yet answered.
    HandshakeSent,

    /// Both sides hold transport keys but the peer has not proven it yet.
    NotConfirmed,

    /// A valid data packet was received.
    Established,

    /// Killed (or never existed).
    Free,
}

/// How a datagram reached us.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Route {
    Udp(SocketAddr),
    Relay(RelayId),
}

/// [Config] with every duration in milliseconds.
#[derive(Clone, Debug)]
pub(crate) struct Settings {
    pub handshake: HandshakeKind,
    pub send_packet_interval: u64,
    pub max_send_packet_tries: u32,
    pub udp_direct_timeout: u64,
    pub packet_buffer_size: usize,
    pub initial_rtt: u64,
}

impl From<&Config> for Settings {
    fn from(cfg: &Config) -> Self {
        Self {
            handshake: cfg.handshake,
            send_packet_interval: cfg.send_packet_interval.as_millis() as u64,
            max_send_packet_tries: cfg.max_send_packet_tries,
            udp_direct_timeout: cfg.udp_direct_timeout.as_millis() as u64,
            packet_buffer_size: cfg.packet_buffer_size,
            initial_rtt: cfg.initial_rtt.as_millis() as u64,
        }
    }
}

/// What a connection needs from its endpoint.
pub(crate) struct Context<'a, S: Substrate> {
    pub settings: &'a Settings,
    pub substrate: &'a S,
    pub identity: &'a KeyPair,
    pub cookie_key: &'a CookieKey,
    pub metrics: &'a Metrics,
}

/// A callback owed to the [crate::Handler].
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Event {
    Status(bool),
    Lossless(Bytes),
    Lossy(Bytes),
    DhtKeyChanged(PublicKey),
}

/// Work left for the endpoint once the connection lock is released.
#[derive(Debug, Default)]
pub(crate) struct Effects {
    pub events: Vec<Event>,
    pub killed: bool,
    pub learned: Option<Route>,
}

/// A verified handshake from a peer that came back with a new DHT key while we still held an
/// established session with it.
///
/// The stale connection is killed and the endpoint accepts the handshake as a new one.
pub(crate) enum Restart {
    Noise {
        responder: noise::Responder,
        peer: Peer,
        ephemeral: PublicKey,
    },
    Legacy {
        peer: Peer,
        session: PublicKey,
    },
}

/// A snapshot of a connection, returned by [crate::Endpoint::connection_info].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Info {
    pub status: Status,

    /// Whether packets currently go straight to the peer over UDP.
    pub direct: bool,

    /// Lowest round-trip time observed, in milliseconds.
    pub rtt: u64,

    /// Lossless packets per second the connection may currently send.
    pub send_rate: f64,
}

/// A cookie request or handshake that is resent until the connection makes progress.
struct Retry {
    packet: Option<Bytes>,
    sent_at: u64,
    tries: u32,
}

impl Retry {
    fn new(packet: Option<Bytes>, now: u64) -> Self {
        Self {
            packet,
            sent_at: now,
            tries: 0,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Direct {
    addr: SocketAddr,
    last_recv: Option<u64>,
}

/// Transport state, allocated once keys exist.
struct Session {
    keys: TransportKeys,
    sent_nonce: Nonce,
    recv_nonce: Nonce,
    send: PacketArray<Outbound>,
    recv: PacketArray<Bytes>,
    congestion: Congestion,
    rtt: u64,
    last_request_sent: Option<u64>,
    max_speed_reached: bool,
}

impl Session {
    fn new(settings: &Settings, now: u64, keys: TransportKeys, sent: Nonce, recv: Nonce) -> Self {
        Self {
            keys,
            sent_nonce: sent,
            recv_nonce: recv,
            send: PacketArray::new(settings.packet_buffer_size),
            recv: PacketArray::new(settings.packet_buffer_size),
            congestion: Congestion::new(now),
            rtt: settings.initial_rtt,
            last_request_sent: None,
            max_speed_reached: false,
        }
    }

    /// Encrypt `payload` as packet `number` and advance the send nonce.
    fn seal(&mut self, rng: &mut StdRng, number: u32, payload: &[u8]) -> Result<Bytes, Error> {
        let packet = packet::seal(
            rng,
            &self.keys.send,
            &self.sent_nonce,
            self.recv.start(),
            number,
            payload,
        )?;
        self.sent_nonce.increment();
        Ok(packet.encode().freeze())
    }
}

/// Key material for the current step of the connection.
enum Phase {
    /// Waiting for the answer to cookie request `number`.
    CookieRequesting { number: u64, shared: SharedKey },

    /// Waiting for the answer to our handshake.
    Handshaking(Handshake),

    /// Keys are derived.
    Transport(Box<Session>),

    /// Killed.
    Closed,
}

/// A connection to a single peer.
pub struct Connection {
    id: ConnectionId,
    status: Status,
    identity: PublicKey,
    dht: PublicKey,
    phase: Phase,

    /// Base nonce advertised in our handshake.
    sent_nonce: Nonce,

    /// Initiator ephemeral (Noise) or session key (legacy) of the handshake we last accepted.
    answered: Option<PublicKey>,

    retry: Option<Retry>,
    ipv4: Option<Direct>,
    ipv6: Option<Direct>,
    relay: Option<RelayId>,
    last_relay_sent: Option<u64>,
    rng: StdRng,
    effects: Effects,
}

/// Cookie timestamps are in seconds.
pub(crate) fn secs(now: u64) -> u64 {
    now / 1_000
}

impl Connection {
    fn new(id: ConnectionId, identity: PublicKey, dht: PublicKey, phase: Phase, rng: StdRng) -> Self {
        Self {
            id,
            status: Status::NoConnection,
            identity,
            dht,
            phase,
            sent_nonce: Nonce::default(),
            answered: None,
            retry: None,
            ipv4: None,
            ipv6: None,
            relay: None,
            last_relay_sent: None,
            rng,
            effects: Effects::default(),
        }
    }

    /// Start a connection to `identity` by asking its DHT key `dht` for a cookie.
    ///
    /// The request is sent as soon as a route is known.
    pub(crate) fn connect<S: Substrate>(
        ctx: &Context<S>,
        id: ConnectionId,
        now: u64,
        mut rng: StdRng,
        identity: PublicKey,
        dht: PublicKey,
    ) -> Result<Self, Error> {
        let shared = ctx.substrate.dht_shared_key(&dht)?;
        let number = rng.gen();
        let request = cookie::create_cookie_request(
            &mut rng,
            ctx.identity.public(),
            &ctx.substrate.dht_public_key(),
            &shared,
            number,
        )?;
        let mut connection = Self::new(
            id,
            identity,
            dht,
            Phase::CookieRequesting { number, shared },
            rng,
        );
        connection.retry = Some(Retry::new(Some(request.encode().freeze()), now));
        Ok(connection)
    }

    /// Create a connection for a peer whose Noise initiation arrived over `route`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn accept_noise<S: Substrate>(
        ctx: &Context<S>,
        id: ConnectionId,
        now: u64,
        rng: StdRng,
        route: Route,
        responder: noise::Responder,
        peer: Peer,
        ephemeral: PublicKey,
    ) -> Result<Self, Error> {
        let mut connection = Self::new(id, peer.identity, peer.dht, Phase::Closed, rng);
        connection.received_via(route, now);
        connection.respond_noise(ctx, now, responder, peer, ephemeral)?;
        Ok(connection)
    }

    /// Create a connection for a peer whose legacy handshake arrived over `route`.
    pub(crate) fn accept_legacy<S: Substrate>(
        ctx: &Context<S>,
        id: ConnectionId,
        now: u64,
        rng: StdRng,
        route: Route,
        peer: Peer,
        session: PublicKey,
    ) -> Result<Self, Error> {
        let mut connection = Self::new(id, peer.identity, peer.dht, Phase::Closed, rng);
        connection.received_via(route, now);
        connection.respond_legacy(ctx, now, peer, session)?;
        Ok(connection)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Long-term key of the peer.
    pub fn identity(&self) -> &PublicKey {
        &self.identity
    }

    /// DHT key of the peer.
    pub fn dht(&self) -> &PublicKey {
        &self.dht
    }

    pub(crate) fn take_effects(&mut self) -> Effects {
        std::mem::take(&mut self.effects)
    }

    fn session(&self) -> Option<&Session> {
        match &self.phase {
            Phase::Transport(session) => Some(session),
            _ => None,
        }
    }

    fn session_mut(&mut self) -> Option<&mut Session> {
        match &mut self.phase {
            Phase::Transport(session) => Some(session),
            _ => None,
        }
    }

    pub(crate) fn info(&self, now: u64, settings: &Settings) -> Info {
        let session = self.session();
        Info {
            status: self.status,
            direct: self.direct_addr(now, settings.udp_direct_timeout).is_some(),
            rtt: session.map_or(settings.initial_rtt, |s| s.rtt),
            send_rate: session.map_or(0.0, |s| s.congestion.send_rate()),
        }
    }

    // Routing

    /// The freshest address we received from within `timeout`.
    fn direct_addr(&self, now: u64, timeout: u64) -> Option<SocketAddr> {
        [self.ipv4, self.ipv6]
            .into_iter()
            .flatten()
            .filter_map(|d| d.last_recv.map(|at| (at, d.addr)))
            .filter(|(at, _)| at.saturating_add(timeout) > now)
            .max_by_key(|(at, _)| *at)
            .map(|(_, addr)| addr)
    }

    fn direct_slot(&mut self, addr: &SocketAddr) -> &mut Option<Direct> {
        if addr.is_ipv4() {
            &mut self.ipv4
        } else {
            &mut self.ipv6
        }
    }

    /// Use `addr` as the peer's address for its family.
    pub(crate) fn set_direct_addr<S: Substrate>(
        &mut self,
        ctx: &Context<S>,
        now: u64,
        addr: SocketAddr,
    ) {
        let slot = self.direct_slot(&addr);
        if slot.map(|d| d.addr) != Some(addr) {
            *slot = Some(Direct {
                addr,
                last_recv: None,
            });
        }
        self.route_available(ctx, now);
    }

    /// Use `relay` to reach the peer.
    pub(crate) fn set_relay<S: Substrate>(&mut self, ctx: &Context<S>, now: u64, relay: RelayId) {
        self.relay = Some(relay);
        self.route_available(ctx, now);
    }

    fn route_available<S: Substrate>(&mut self, ctx: &Context<S>, now: u64) {
        if self.status == Status::NoConnection {
            self.send_temp(ctx, now);
        }
    }

    /// Record that a valid packet arrived over `route`.
    fn received_via(&mut self, route: Route, now: u64) {
        match route {
            Route::Udp(addr) => {
                let slot = self.direct_slot(&addr);
                match slot {
                    Some(direct) if direct.addr == addr => direct.last_recv = Some(now),
                    _ => {
                        *slot = Some(Direct {
                            addr,
                            last_recv: Some(now),
                        });
                        self.effects.learned = Some(route);
                    }
                }
            }
            Route::Relay(relay) => {
                if self.relay != Some(relay) {
                    self.relay = Some(relay);
                    self.effects.learned = Some(route);
                }
            }
        }
    }

    /// Hand a datagram to the substrate over the best route.
    ///
    /// A peer we recently heard from directly is sent to over UDP. Otherwise the packet goes
    /// through the relay, and small packets (or any packet other than data) are also tried over
    /// UDP to discover whether the direct path works.
    fn transmit<S: Substrate>(
        &mut self,
        ctx: &Context<S>,
        now: u64,
        packet: &[u8],
    ) -> Result<(), Error> {
        let kind = PacketType::from_u8(packet.first().copied().unwrap_or_default());
        let label = Packet::new(kind);
        if let Some(addr) = self.direct_addr(now, ctx.settings.udp_direct_timeout) {
            match ctx.substrate.send_udp(addr, packet) {
                Ok(()) => {
                    ctx.metrics.sent.get_or_create(&label).inc();
                    return Ok(());
                }
                Err(err) => trace!(?addr, ?err, "direct send failed"),
            }
        }

        let mut sent = false;
        if kind != Some(PacketType::Data) || packet.len() < UDP_PROBE_SIZE {
            for direct in [self.ipv4, self.ipv6].into_iter().flatten() {
                sent |= ctx.substrate.send_udp(direct.addr, packet).is_ok();
            }
        }
        if let Some(relay) = self.relay {
            if ctx.substrate.send_relay(relay, packet).is_ok() {
                self.last_relay_sent = Some(now);
                sent = true;
            }
        }
        if sent {
            ctx.metrics.sent.get_or_create(&label).inc();
            return Ok(());
        }
        if self.ipv4.is_none() && self.ipv6.is_none() && self.relay.is_none() {
            return Err(Error::NoRoute);
        }
        Err(Error::SendFailed)
    }

    /// Send (or count an attempt at sending) the temporary packet.
    fn send_temp<S: Substrate>(&mut self, ctx: &Context<S>, now: u64) {
        let Some(retry) = self.retry.as_mut() else {
            return;
        };
        retry.sent_at = now;
        retry.tries += 1;
        let Some(packet) = retry.packet.clone() else {
            return;
        };
        match self.transmit(ctx, now, &packet) {
            Ok(()) => {
                if self.status == Status::NoConnection {
                    self.status = Status::CookieRequesting;
                }
            }
            Err(err) => debug!(peer = ?self.identity, ?err, "unable to send handshake packet"),
        }
    }

    /// Resend the temporary packet without counting a try.
    fn resend_temp<S: Substrate>(&mut self, ctx: &Context<S>, now: u64) {
        if let Some(packet) = self.retry.as_ref().and_then(|r| r.packet.clone()) {
            if let Err(err) = self.transmit(ctx, now, &packet) {
                debug!(peer = ?self.identity, ?err, "unable to resend handshake packet");
            }
        }
    }

    // Handshake

    fn check_dht(&mut self, dht: &PublicKey) -> Result<(), Error> {
        if *dht != self.dht {
            debug!(peer = ?self.identity, ?dht, "peer DHT key changed");
            self.effects.events.push(Event::DhtKeyChanged(*dht));
            return Err(Error::WrongPeer);
        }
        Ok(())
    }

    /// Build the payload for a handshake message wrapped in `outer`.
    fn payload<S: Substrate>(
        &mut self,
        ctx: &Context<S>,
        now: u64,
        outer: &cookie::Cookie,
    ) -> Result<Payload, Error> {
        let base_nonce = Nonce::random(&mut self.rng);
        let other = ctx.cookie_key.create(
            &mut self.rng,
            secs(now),
            &CookieContents {
                identity: self.identity,
                dht: self.dht,
            },
        )?;
        self.sent_nonce = base_nonce;
        Ok(Payload::new(base_nonce, outer, other))
    }

    /// Enter [Status::NotConfirmed] with fresh transport state.
    fn confirm_keys<S: Substrate>(
        &mut self,
        ctx: &Context<S>,
        now: u64,
        keys: TransportKeys,
        recv_nonce: Nonce,
    ) {
        let session = Session::new(ctx.settings, now, keys, self.sent_nonce, recv_nonce);
        self.phase = Phase::Transport(Box::new(session));
        self.status = Status::NotConfirmed;
        ctx.metrics.handshakes.inc();
    }

    /// Handle a cookie response, answering with our handshake.
    pub(crate) fn on_cookie_response<S: Substrate>(
        &mut self,
        ctx: &Context<S>,
        now: u64,
        route: Route,
        response: &CookieResponse,
    ) -> Result<(), Error> {
        let Phase::CookieRequesting { number, shared } = &self.phase else {
            return Err(Error::UnexpectedHandshake(self.status));
        };
        let cookie = cookie::handle_cookie_response(response, shared, *number)?;
        self.received_via(route, now);

        let payload = self.payload(ctx, now, &cookie)?;
        let (handshake, packet) = match ctx.settings.handshake {
            HandshakeKind::NoiseIK => {
                let (initiator, message) =
                    noise::Initiator::new(&mut self.rng, ctx.identity, &self.identity, cookie, &payload)?;
                (Handshake::Noise(initiator), message.encode().freeze())
            }
            HandshakeKind::Legacy => {
                let session = StaticSecret::random_from_rng(&mut self.rng);
                let message = legacy::create(
                    &mut self.rng,
                    ctx.identity,
                    &self.identity,
                    cookie,
                    &PublicKey::from(&session),
                    &payload,
                )?;
                (Handshake::Legacy { session }, message.encode().freeze())
            }
        };
        debug!(peer = ?self.identity, "received cookie, sending handshake");
        self.phase = Phase::Handshaking(handshake);
        self.status = Status::HandshakeSent;
        self.retry = Some(Retry::new(Some(packet), now));
        self.send_temp(ctx, now);
        Ok(())
    }

    /// Handle a Noise initiation from the peer.
    ///
    /// While we are initiating ourselves, the side with the lower identity key yields and
    /// answers. A connection that already answered re-sends its response to a duplicate and
    /// answers again (with fresh keys) a new initiation.
    ///
    /// An established connection only answers a peer that restarted with a new DHT key, by
    /// returning the verified handshake for the endpoint to accept in its place.
    pub(crate) fn on_initiation<S: Substrate>(
        &mut self,
        ctx: &Context<S>,
        now: u64,
        route: Route,
        initiation: &noise::Initiation,
    ) -> Result<Option<Restart>, Error> {
        if self.status == Status::Established {
            let (responder, peer) =
                noise::Responder::read(ctx.identity, ctx.cookie_key, secs(now), initiation)?;
            if peer.identity != self.identity {
                return Err(Error::WrongPeer);
            }
            self.restart(ctx, now, &peer.dht)?;
            return Ok(Some(Restart::Noise {
                responder,
                peer,
                ephemeral: initiation.ephemeral,
            }));
        }

        let yields = ctx.identity.public().as_bytes() < self.identity.as_bytes();
        match self.status {
            Status::NoConnection | Status::CookieRequesting | Status::HandshakeSent if yields => {}
            Status::NotConfirmed => match self.answered {
                Some(ephemeral) if ephemeral == initiation.ephemeral => {
                    trace!(peer = ?self.identity, "duplicate initiation, resending response");
                    self.received_via(route, now);
                    self.resend_temp(ctx, now);
                    return Ok(None);
                }
                Some(_) => {}
                None if yields => {}
                None => return Err(Error::UnexpectedHandshake(self.status)),
            },
            status => return Err(Error::UnexpectedHandshake(status)),
        }

        let (responder, peer) =
            noise::Responder::read(ctx.identity, ctx.cookie_key, secs(now), initiation)?;
        if peer.identity != self.identity {
            return Err(Error::WrongPeer);
        }
        self.check_dht(&peer.dht)?;
        self.received_via(route, now);
        self.respond_noise(ctx, now, responder, peer, initiation.ephemeral)?;
        Ok(None)
    }

    fn respond_noise<S: Substrate>(
        &mut self,
        ctx: &Context<S>,
        now: u64,
        responder: noise::Responder,
        peer: Peer,
        ephemeral: PublicKey,
    ) -> Result<(), Error> {
        let payload = self.payload(ctx, now, &peer.other_cookie)?;
        let (response, keys) = responder.respond(&mut self.rng, peer.other_cookie, &payload)?;
        debug!(peer = ?self.identity, "answered initiation");
        self.confirm_keys(ctx, now, keys, peer.base_nonce);
        self.answered = Some(ephemeral);
        self.retry = Some(Retry::new(Some(response.encode().freeze()), now));
        self.send_temp(ctx, now);
        Ok(())
    }

    /// Handle the Noise response to our initiation.
    pub(crate) fn on_response<S: Substrate>(
        &mut self,
        ctx: &Context<S>,
        now: u64,
        route: Route,
        response: &noise::Response,
    ) -> Result<(), Error> {
        let Phase::Handshaking(Handshake::Noise(initiator)) = &self.phase else {
            return Err(Error::UnexpectedHandshake(self.status));
        };
        let (peer, keys) = initiator.finish(ctx.identity, ctx.cookie_key, secs(now), response)?;
        self.check_dht(&peer.dht)?;
        self.received_via(route, now);
        debug!(peer = ?self.identity, "handshake complete");
        self.confirm_keys(ctx, now, keys, peer.base_nonce);

        // Nothing left to resend, the peer repeats its response until our data arrives
        self.retry = Some(Retry::new(None, now));
        self.send_request(ctx, now);
        Ok(())
    }

    /// Handle a legacy handshake from the peer.
    ///
    /// Both sides send the same message, so a handshake is either the answer to ours or the
    /// peer's first message, which we answer. An established connection behaves as in
    /// [Connection::on_initiation].
    pub(crate) fn on_legacy<S: Substrate>(
        &mut self,
        ctx: &Context<S>,
        now: u64,
        route: Route,
        message: &legacy::Message,
    ) -> Result<Option<Restart>, Error> {
        if self.status == Status::Free {
            return Err(Error::UnexpectedHandshake(self.status));
        }
        let (peer, session) = legacy::read(
            ctx.identity,
            ctx.cookie_key,
            secs(now),
            message,
            Some(&self.identity),
        )?;
        if self.status == Status::Established {
            self.restart(ctx, now, &peer.dht)?;
            return Ok(Some(Restart::Legacy { peer, session }));
        }
        self.check_dht(&peer.dht)?;
        if self.status == Status::NotConfirmed && self.answered == Some(session) {
            trace!(peer = ?self.identity, "duplicate handshake");
            self.received_via(route, now);
            return Ok(None);
        }
        self.received_via(route, now);

        if let Phase::Handshaking(Handshake::Legacy { session: own }) = &self.phase {
            let keys = legacy::transport_keys(own, &session)?;
            debug!(peer = ?self.identity, "handshake complete");
            self.confirm_keys(ctx, now, keys, peer.base_nonce);
            self.answered = Some(session);

            // Keep resending our handshake in case the peer never saw it
            if let Some(retry) = self.retry.as_mut() {
                retry.tries = 0;
            }
            return Ok(None);
        }
        self.respond_legacy(ctx, now, peer, session)?;
        Ok(None)
    }

    /// Give up an established session to a peer whose verified handshake carries `dht`.
    ///
    /// A handshake with the DHT key we already know is a replay or a duplicate and is ignored.
    fn restart<S: Substrate>(
        &mut self,
        ctx: &Context<S>,
        now: u64,
        dht: &PublicKey,
    ) -> Result<(), Error> {
        if *dht == self.dht {
            return Err(Error::UnexpectedHandshake(self.status));
        }
        debug!(peer = ?self.identity, ?dht, "peer restarted with a new DHT key");
        self.effects.events.push(Event::DhtKeyChanged(*dht));
        self.effects.events.push(Event::Status(false));
        self.kill(ctx, now, false);
        Ok(())
    }

    fn respond_legacy<S: Substrate>(
        &mut self,
        ctx: &Context<S>,
        now: u64,
        peer: Peer,
        session: PublicKey,
    ) -> Result<(), Error> {
        let own = StaticSecret::random_from_rng(&mut self.rng);
        let payload = self.payload(ctx, now, &peer.other_cookie)?;
        let message = legacy::create(
            &mut self.rng,
            ctx.identity,
            &peer.identity,
            peer.other_cookie,
            &PublicKey::from(&own),
            &payload,
        )?;
        let keys = legacy::transport_keys(&own, &session)?;
        debug!(peer = ?self.identity, "answered handshake");
        self.confirm_keys(ctx, now, keys, peer.base_nonce);
        self.answered = Some(session);
        self.retry = Some(Retry::new(Some(message.encode().freeze()), now));
        self.send_temp(ctx, now);
        Ok(())
    }

    // Data

    /// Handle an encrypted data packet.
    pub(crate) fn on_data<S: Substrate>(
        &mut self,
        ctx: &Context<S>,
        now: u64,
        route: Route,
        packet: &DataPacket,
    ) -> Result<(), Error> {
        let status = self.status;
        let Phase::Transport(session) = &mut self.phase else {
            return Err(Error::NotEstablished);
        };
        let (nonce, plain) = packet::open(&session.keys.recv, &session.recv_nonce, packet)?;
        let id = plain.payload.first().copied().ok_or(Error::EmptyPayload)?;
        let kind = Kind::of(id)?;

        // The peer holds everything before its buffer start
        let mut sample = None;
        if plain.buffer_start != session.send.start() {
            sample = session
                .send
                .get(session.send.start())
                .and_then(|entry| entry.sent_at);
            session.send.clear_until(plain.buffer_start)?;
        }

        if kind == Kind::Kill {
            debug!(peer = ?self.identity, "peer killed connection");
            self.effects.events.push(Event::Status(false));
            self.kill(ctx, now, false);
            return Ok(());
        }

        if status == Status::NotConfirmed {
            debug!(peer = ?self.identity, "connection established");
            self.status = Status::Established;
            self.retry = None;
            self.effects.events.push(Event::Status(true));
            ctx.metrics.established.inc();
        }

        let mut result = Ok(());
        match kind {
            Kind::Request => {
                match request::handle(&mut session.send, &plain.payload, session.rtt, now) {
                    Ok(ack) => {
                        if ack.latest_sent.is_some() {
                            sample = ack.latest_sent;
                        }
                        if let Err(err) = session.recv.set_end(plain.number) {
                            debug!(peer = ?self.identity, ?err, "request behind receive window");
                        }
                    }
                    Err(err) => result = Err(err),
                }
            }
            Kind::Lossless => match session.recv.insert(plain.number, plain.payload) {
                Ok(()) => {
                    session.congestion.on_received();
                    while let Some(data) = session.recv.pop_front() {
                        self.effects.events.push(Event::Lossless(data));
                    }
                }
                // Held or already delivered, the peer resent it before seeing our request
                Err(Error::Occupied(number)) => {
                    trace!(peer = ?self.identity, number, "duplicate lossless packet")
                }
                Err(Error::OutOfWindow(number)) if session.recv.is_behind(number) => {
                    trace!(peer = ?self.identity, number, "duplicate lossless packet")
                }
                Err(err) => result = Err(err),
            },
            Kind::Lossy => {
                if let Err(err) = session.recv.set_end(plain.number) {
                    debug!(peer = ?self.identity, ?err, "lossy packet behind receive window");
                }
                self.effects.events.push(Event::Lossy(plain.payload));
            }
            Kind::Reserved | Kind::Kill => {
                trace!(peer = ?self.identity, "ignoring reserved packet id")
            }
        }
        result?;

        if let Some(sent_at) = sample {
            session.rtt = session.rtt.min(now.saturating_sub(sent_at));
        }
        packet::advance_nonce(&mut session.recv_nonce, &nonce);
        self.received_via(route, now);
        Ok(())
    }

    /// Send a data packet numbered `number`.
    fn send_data<S: Substrate>(
        &mut self,
        ctx: &Context<S>,
        now: u64,
        number: u32,
        payload: &[u8],
    ) -> Result<(), Error> {
        let Phase::Transport(session) = &mut self.phase else {
            return Err(Error::NotEstablished);
        };
        let packet = session.seal(&mut self.rng, number, payload)?;
        self.transmit(ctx, now, &packet)
    }

    /// Queue a lossless packet, sending it right away unless the path is saturated.
    ///
    /// Returns its sequence number.
    pub(crate) fn send_lossless<S: Substrate>(
        &mut self,
        ctx: &Context<S>,
        now: u64,
        data: &[u8],
        congestion_control: bool,
    ) -> Result<u32, Error> {
        packet::check_lossless(data)?;
        if self.status != Status::Established {
            return Err(Error::NotEstablished);
        }
        let session = self.session_mut().ok_or(Error::NotEstablished)?;
        if congestion_control && session.congestion.packets_left() == 0 {
            return Err(Error::Congested);
        }
        let number = session
            .send
            .push(Outbound::new(Bytes::copy_from_slice(data)))?;
        let send_now = !(congestion_control && session.max_speed_reached);

        if send_now {
            let sent = self.send_data(ctx, now, number, data);
            let session = self.session_mut().ok_or(Error::NotEstablished)?;
            match sent {
                Ok(()) => {
                    if let Some(entry) = session.send.get_mut(number) {
                        entry.sent_at = Some(now);
                    }
                }
                Err(err) => {
                    trace!(?err, "lossless send deferred");
                    session.max_speed_reached = true;
                }
            }
        }
        if congestion_control {
            if let Some(session) = self.session_mut() {
                session.congestion.on_queued();
            }
        }
        Ok(number)
    }

    /// Send a lossy packet.
    pub(crate) fn send_lossy<S: Substrate>(
        &mut self,
        ctx: &Context<S>,
        now: u64,
        data: &[u8],
    ) -> Result<(), Error> {
        packet::check_lossy(data)?;
        if self.status != Status::Established {
            return Err(Error::NotEstablished);
        }
        let number = self.session().ok_or(Error::NotEstablished)?.send.end();
        self.send_data(ctx, now, number, data)
    }

    /// Whether lossless packet `number` was acknowledged by the peer.
    pub(crate) fn is_delivered(&self, number: u32) -> Result<bool, Error> {
        if self.status != Status::Established {
            return Err(Error::NotEstablished);
        }
        let session = self.session().ok_or(Error::NotEstablished)?;
        Ok(session.send.is_released(number))
    }

    /// How many lossless packets may be queued under congestion control right now.
    pub(crate) fn free_send_slots(&self) -> u32 {
        match (self.status, self.session()) {
            (Status::Established, Some(session)) => session
                .congestion
                .packets_left()
                .min(session.send.free()),
            _ => 0,
        }
    }

    /// Describe the holes in our receive window to the peer.
    fn send_request<S: Substrate>(&mut self, ctx: &Context<S>, now: u64) {
        let Some(session) = self.session() else {
            return;
        };
        let request = request::generate(&session.recv);
        let number = session.send.end();
        match self.send_data(ctx, now, number, &request) {
            Ok(()) => {
                if let Some(session) = self.session_mut() {
                    session.last_request_sent = Some(now);
                }
            }
            Err(err) => trace!(peer = ?self.identity, ?err, "unable to send request packet"),
        }
    }

    /// Send the packets marked for (re)sending, within the retransmission budget.
    fn send_requested<S: Substrate>(&mut self, ctx: &Context<S>, now: u64) {
        let Some(session) = self.session_mut() else {
            return;
        };
        session.max_speed_reached = false;
        let budget = session.congestion.packets_left_requested() as usize;
        let pending: Vec<(u32, Bytes)> = session
            .send
            .numbers()
            .filter_map(|number| {
                let entry = session.send.get(number)?;
                entry.sent_at.is_none().then(|| (number, entry.data.clone()))
            })
            .take(budget)
            .collect();

        let mut count = 0;
        for (number, data) in pending {
            if let Err(err) = self.send_data(ctx, now, number, &data) {
                trace!(peer = ?self.identity, ?err, "resend failed");
                if let Some(session) = self.session_mut() {
                    session.max_speed_reached = true;
                }
                break;
            }
            if let Some(entry) = self.session_mut().and_then(|s| s.send.get_mut(number)) {
                entry.sent_at = Some(now);
            }
            count += 1;
        }
        if count > 0 {
            ctx.metrics.retransmissions.inc_by(count as u64);
            if let Some(session) = self.session_mut() {
                session.congestion.on_resent(count, now);
            }
        }
    }

    /// Do periodic work, returning when it must be done again.
    pub(crate) fn tick<S: Substrate>(&mut self, ctx: &Context<S>, now: u64) -> Option<u64> {
        if self.status == Status::Free {
            return None;
        }
        let interval = ctx.settings.send_packet_interval;

        if let Some(retry) = &self.retry {
            if retry.sent_at.saturating_add(interval) <= now {
                if retry.tries >= ctx.settings.max_send_packet_tries {
                    debug!(peer = ?self.identity, status = ?self.status, "connection timed out");
                    self.effects.events.push(Event::Status(false));
                    self.kill(ctx, now, false);
                    return None;
                }
                self.send_temp(ctx, now);
            }
        }

        let established = self.status == Status::Established;
        if let Some(session) = self.session() {
            let request_interval = if established {
                session
                    .congestion
                    .request_interval(session.recv.len(), interval)
                    .unwrap_or(interval)
            } else {
                interval
            };
            let due = session
                .last_request_sent
                .map_or(true, |at| at.saturating_add(request_interval) <= now);
            if due {
                self.send_request(ctx, now);
            }
        }

        if established {
            let hold = self
                .direct_addr(now, ctx.settings.udp_direct_timeout)
                .is_some()
                && self
                    .last_relay_sent
                    .is_some_and(|at| at.saturating_add(RELAY_HOLD) > now);
            if let Some(session) = self.session_mut() {
                let queue = session.send.len();
                session.congestion.update(now, queue, session.rtt, hold);
                session.congestion.refill(now);
            }
            self.send_requested(ctx, now);
        }

        let mut next = self
            .retry
            .as_ref()
            .map(|retry| retry.sent_at.saturating_add(interval));
        if let Some(session) = self.session() {
            let at = if established {
                now + AVERAGE_INTERVAL
            } else {
                session
                    .last_request_sent
                    .map_or(now, |at| at.saturating_add(interval))
            };
            next = Some(next.map_or(at, |n| n.min(at)));
        }
        next
    }

    /// Tear the connection down.
    ///
    /// If `notify` is set and the connection is established, the peer is told first.
    pub(crate) fn kill<S: Substrate>(&mut self, ctx: &Context<S>, now: u64, notify: bool) {
        if self.status == Status::Free {
            return;
        }
        if notify && self.status == Status::Established {
            if let Some(number) = self.session().map(|s| s.send.end()) {
                if let Err(err) = self.send_data(ctx, now, number, &[PACKET_ID_KILL]) {
                    debug!(peer = ?self.identity, ?err, "unable to send kill packet");
                }
            }
        }
        self.status = Status::Free;
        self.phase = Phase::Closed;
        self.retry = None;
        self.effects.killed = true;
        ctx.metrics.kills.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mocks::{self, Network, Via},
        table::Table,
    };
    use rand::SeedableRng;
    use std::sync::Arc;

    const OWN: &str = "127.0.0.1:3000";
    const PEER: &str = "127.0.0.1:3001";

    struct Fixture {
        network: Arc<Network>,
        settings: Settings,
        substrate: mocks::Substrate,
        identity: KeyPair,
        cookie_key: CookieKey,
        metrics: Metrics,
    }

    impl Fixture {
        fn new() -> Self {
            let network = Network::new();
            let substrate =
                mocks::Substrate::new(network.clone(), OWN.parse().unwrap(), KeyPair::from_seed(10));
            Self {
                network,
                settings: Settings::from(&Config::test(HandshakeKind::NoiseIK)),
                substrate,
                identity: KeyPair::from_seed(0),
                cookie_key: CookieKey::new(&mut StdRng::seed_from_u64(0), 15),
                metrics: Metrics::default(),
            }
        }

        fn context(&self) -> Context<'_, mocks::Substrate> {
            Context {
                settings: &self.settings,
                substrate: &self.substrate,
                identity: &self.identity,
                cookie_key: &self.cookie_key,
                metrics: &self.metrics,
            }
        }

        fn connection(&self) -> Connection {
            let peer = *KeyPair::from_seed(1).public();
            let id = Table::new().insert(peer, ()).unwrap();
            Connection::connect(
                &self.context(),
                id,
                0,
                StdRng::seed_from_u64(1),
                peer,
                *KeyPair::from_seed(11).public(),
            )
            .unwrap()
        }

        fn routes(&self) -> Vec<Via> {
            let mut routes = Vec::new();
            while let Some(datagram) = self.network.pop() {
                routes.push(datagram.via);
            }
            routes
        }
    }

    fn data(len: usize) -> Vec<u8> {
        vec![PacketType::Data as u8; len]
    }

    #[test]
    fn test_transmit_routes() {
        let fixture = Fixture::new();
        let ctx = fixture.context();
        let own = OWN.parse().unwrap();
        let peer = PEER.parse().unwrap();
        fixture.network.link(own, RelayId(1), peer, RelayId(2));

        let mut connection = fixture.connection();
        connection.relay = Some(RelayId(1));
        connection.ipv4 = Some(Direct {
            addr: peer,
            last_recv: None,
        });

        // Small packets probe the address alongside the relay
        connection.transmit(&ctx, 0, &data(40)).unwrap();
        assert_eq!(
            fixture.routes(),
            vec![Via::Udp { from: own }, Via::Relay(RelayId(2))]
        );
        assert_eq!(connection.last_relay_sent, Some(0));

        // Large ones only use the relay
        connection.transmit(&ctx, 0, &data(UDP_PROBE_SIZE)).unwrap();
        assert_eq!(fixture.routes(), vec![Via::Relay(RelayId(2))]);

        // Once the peer is heard from directly, UDP alone is used until it goes quiet
        connection.received_via(Route::Udp(peer), 100);
        assert!(connection.take_effects().learned.is_none());
        connection.transmit(&ctx, 200, &data(UDP_PROBE_SIZE)).unwrap();
        assert_eq!(fixture.routes(), vec![Via::Udp { from: own }]);

        let expiry = 100 + fixture.settings.udp_direct_timeout;
        connection
            .transmit(&ctx, expiry, &data(UDP_PROBE_SIZE))
            .unwrap();
        assert_eq!(fixture.routes(), vec![Via::Relay(RelayId(2))]);
    }

    #[test]
    fn test_received_via_learns() {
        let fixture = Fixture::new();
        let mut connection = fixture.connection();
        let v4: SocketAddr = PEER.parse().unwrap();
        let v6: SocketAddr = "[::1]:3001".parse().unwrap();

        connection.received_via(Route::Udp(v4), 0);
        assert_eq!(connection.take_effects().learned, Some(Route::Udp(v4)));
        connection.received_via(Route::Udp(v6), 10);
        assert_eq!(connection.take_effects().learned, Some(Route::Udp(v6)));
        connection.received_via(Route::Relay(RelayId(3)), 20);
        assert_eq!(
            connection.take_effects().learned,
            Some(Route::Relay(RelayId(3)))
        );

        // The freshest address wins
        assert_eq!(connection.direct_addr(20, 1_000), Some(v6));
        connection.received_via(Route::Udp(v4), 30);
        assert_eq!(connection.direct_addr(30, 1_000), Some(v4));
        assert_eq!(connection.direct_addr(2_000, 1_000), None);
    }

    #[test]
    fn test_transmit_failures() {
        let fixture = Fixture::new();
        let ctx = fixture.context();
        let mut connection = fixture.connection();
        assert!(matches!(
            connection.transmit(&ctx, 0, &data(40)),
            Err(Error::NoRoute)
        ));

        // A relay the substrate does not know
        connection.relay = Some(RelayId(9));
        assert!(matches!(
            connection.transmit(&ctx, 0, &data(40)),
            Err(Error::SendFailed)
        ));
        assert!(fixture.network.is_empty());
    }

    #[test]
    fn test_retry_without_route() {
        let fixture = Fixture::new();
        let ctx = fixture.context();
        let mut connection = fixture.connection();
        let interval = fixture.settings.send_packet_interval;

        // Tries are spent even though nothing can be sent
        let mut now = 0;
        for _ in 0..fixture.settings.max_send_packet_tries {
            now += interval;
            assert_eq!(connection.tick(&ctx, now), Some(now + interval));
            assert_eq!(connection.status(), Status::NoConnection);
        }
        assert!(fixture.network.is_empty());

        assert_eq!(connection.tick(&ctx, now + interval), None);
        assert_eq!(connection.status(), Status::Free);
        let effects = connection.take_effects();
        assert!(effects.killed);
        assert_eq!(effects.events, vec![Event::Status(false)]);
    }

    #[test]
    fn test_route_sends_cookie_request() {
        let fixture = Fixture::new();
        let ctx = fixture.context();
        let mut connection = fixture.connection();
        assert_eq!(connection.status(), Status::NoConnection);

        connection.set_direct_addr(&ctx, 0, PEER.parse().unwrap());
        assert_eq!(connection.status(), Status::CookieRequesting);
        assert_eq!(fixture.network.len(), 1);

        // Later routes do not resend
        connection.set_relay(&ctx, 0, RelayId(1));
        assert_eq!(fixture.network.len(), 1);
    }

    #[test]
    fn test_not_established() {
        let fixture = Fixture::new();
        let ctx = fixture.context();
        let mut connection = fixture.connection();
        assert!(matches!(
            connection.send_lossless(&ctx, 0, &[16, 1], true),
            Err(Error::NotEstablished)
        ));
        assert!(matches!(
            connection.send_lossy(&ctx, 0, &[192, 1]),
            Err(Error::NotEstablished)
        ));
        assert!(matches!(
            connection.send_lossless(&ctx, 0, &[192, 1], true),
            Err(Error::InvalidPacketId(192))
        ));
        assert_eq!(connection.free_send_slots(), 0);
        assert!(matches!(
            connection.is_delivered(0),
            Err(Error::NotEstablished)
        ));
    }
}
