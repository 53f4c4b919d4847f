//! Establish authenticated, encrypted and reliable channels between peers over UDP or relays.
//!
//! Peers are identified by long-term x25519 public keys. Before any asymmetric work is done on
//! behalf of a remote party, that party must prove it can receive traffic at its claimed network
//! identity by echoing a stateless [cookie::Cookie]. Peers then run a two-message
//! [handshake] (Noise `IK`, or the legacy box-based exchange when configured) to derive a pair of
//! directional transport keys. Once the peer proves possession of those keys by sending a valid
//! data packet, the connection is established and carries two kinds of traffic:
//!
//! - _lossless_ packets, sequenced through a pair of [array::PacketArray]s, acknowledged by
//!   run-length encoded [request] packets and paced by [congestion] control,
//! - _lossy_ packets, delivered as they arrive (or not at all).
//!
//! # Design
//!
//! The crate does no I/O of its own. An [endpoint::Endpoint] is fed inbound datagrams
//! ([endpoint::Endpoint::handle_udp], [endpoint::Endpoint::handle_relay]) and driven by a
//! periodic [endpoint::Endpoint::tick] that returns the next time it needs to run. Outbound
//! packets leave through a caller-supplied [Substrate] and received data is surfaced through a
//! caller-supplied [Handler].
//!
//! Every entry point takes `now`, a monotonic timestamp in milliseconds.
//!
//! # Wire Format
//!
//! Every datagram starts with a single type byte:
//!
//! | Type | Value | Length |
//! |------|-------|--------|
//! | Cookie request | 24 | 145 |
//! | Cookie response | 25 | 161 |
//! | Handshake (Noise initiator) | 26 | 409 |
//! | Handshake (Noise responder) | 26 | 361 |
//! | Handshake (legacy) | 26 | 385 |
//! | Data | 27 | variable, at most 1400 |

#![doc(
    html_logo_url = "https://commonware.xyz/imgs/rustdoc_logo.svg",
    html_favicon_url = "https://commonware.xyz/favicon.ico"
)]

pub mod array;
pub mod config;
pub mod congestion;
pub mod connection;
pub mod cookie;
pub mod crypto;
pub mod endpoint;
pub mod handshake;
pub mod metrics;
pub mod mocks;
pub mod packet;
pub mod request;
pub mod table;

pub use config::Config;
pub use connection::Status;
pub use endpoint::Endpoint;
pub use handshake::HandshakeKind;
pub use table::{ConnectionId, RelayId};

use bytes::Bytes;
use commonware_codec::Error as CodecError;
use crypto::{PublicKey, SharedKey};
use std::net::SocketAddr;
use thiserror::Error;

/// Errors that can occur when interacting with the connection layer.
#[derive(Error, Debug)]
pub enum Error {
    // Cookie errors
    #[error("cookie expired")]
    CookieExpired,
    #[error("cookie timestamp in the future")]
    CookieFromFuture,
    #[error("cookie request number mismatch")]
    CookieNumberMismatch,

    // Handshake errors
    #[error("cookie hash mismatch")]
    CookieHashMismatch,
    #[error("wrong peer")]
    WrongPeer,
    #[error("shared secret was not contributory")]
    SharedSecretNotContributory,
    #[error("HKDF expansion failed")]
    HKDFExpansion,
    #[error("unexpected handshake in state {0:?}")]
    UnexpectedHandshake(Status),

    // Encryption errors
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("nonce overflow")]
    NonceOverflow,

    // Packet errors
    #[error("invalid packet id: {0}")]
    InvalidPacketId(u8),
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("empty payload")]
    EmptyPayload,
    #[error("malformed request packet")]
    MalformedRequest,
    #[error("sequence number out of window: {0}")]
    OutOfWindow(u32),
    #[error("sequence number already occupied: {0}")]
    Occupied(u32),

    // Connection errors
    #[error("cannot connect to self")]
    ConnectSelf,
    #[error("connection already exists")]
    AlreadyConnected,
    #[error("too many connections")]
    TooManyConnections,
    #[error("unknown connection")]
    UnknownConnection,
    #[error("connection not established")]
    NotEstablished,
    #[error("send queue full")]
    SendQueueFull,
    #[error("congestion budget exhausted")]
    Congested,
    #[error("peer rejected")]
    PeerRejected,
    #[error("no route to peer")]
    NoRoute,
    #[error("send failed")]
    SendFailed,

    // Codec errors
    #[error("unable to decode: {0}")]
    UnableToDecode(CodecError),
}

impl From<CodecError> for Error {
    fn from(value: CodecError) -> Self {
        Self::UnableToDecode(value)
    }
}

/// The network below the connection layer.
///
/// Implementations are expected to be non-blocking: a send that cannot be completed immediately
/// should fail rather than wait.
pub trait Substrate: Send + Sync {
    /// Our current DHT public key.
    fn dht_public_key(&self) -> PublicKey;

    /// The shared key between our DHT secret key and `peer`.
    ///
    /// Only used to protect cookie requests and responses.
    fn dht_shared_key(&self, peer: &PublicKey) -> Result<SharedKey, Error>;

    /// Send a datagram directly to `addr`.
    fn send_udp(&self, addr: SocketAddr, packet: &[u8]) -> Result<(), Error>;

    /// Send a packet through the relay connection `relay`.
    fn send_relay(&self, relay: RelayId, packet: &[u8]) -> Result<(), Error>;
}

/// The layer above the connection layer.
///
/// Callbacks are invoked on the stack of the call that produced them (a packet handler or
/// [Endpoint::tick]) after all connection locks have been released, so they may call back into
/// the [Endpoint]. They should not block.
pub trait Handler: Send + Sync {
    /// Returns true if an inbound handshake from `identity` should be answered.
    ///
    /// This can be used to implement block-lists or allow-lists.
    fn allows_peer(&self, _identity: &PublicKey) -> bool {
        true
    }

    /// The connection became established (`true`) or was torn down (`false`).
    fn connection_status(&self, id: ConnectionId, established: bool);

    /// A lossless packet was delivered, in order.
    fn lossless(&self, id: ConnectionId, data: Bytes);

    /// A lossy packet was received.
    fn lossy(&self, id: ConnectionId, data: Bytes);

    /// The peer completed a handshake with a DHT key other than the one we expected.
    fn dht_key_changed(&self, _id: ConnectionId, _dht: PublicKey) {}
}
