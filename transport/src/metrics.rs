//! Metrics for an [crate::Endpoint].

use crate::packet::PacketType;
use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

/// The type of a datagram, as given by its first byte.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Kind {
    CookieRequest,
    CookieResponse,
    Handshake,
    Data,
    /// Empty or carrying a type byte we do not handle.
    Unknown,
}

impl From<Option<PacketType>> for Kind {
    fn from(value: Option<PacketType>) -> Self {
        match value {
            Some(PacketType::CookieRequest) => Self::CookieRequest,
            Some(PacketType::CookieResponse) => Self::CookieResponse,
            Some(PacketType::Handshake) => Self::Handshake,
            Some(PacketType::Data) => Self::Data,
            None => Self::Unknown,
        }
    }
}

/// Metric label for a datagram.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Packet {
    pub kind: Kind,
}

impl Packet {
    pub fn new(kind: impl Into<Kind>) -> Self {
        Self { kind: kind.into() }
    }
}

/// Metrics for the [crate::Endpoint].
#[derive(Default)]
pub struct Metrics {
    /// Number of datagrams received, by type.
    pub received: Family<Packet, Counter>,

    /// Number of datagrams dropped (malformed, forged, stale or unexpected), by type.
    pub dropped: Family<Packet, Counter>,

    /// Number of datagrams handed to the substrate, by type.
    pub sent: Family<Packet, Counter>,

    /// Number of cookies minted in answer to cookie requests.
    pub cookies_issued: Counter,

    /// Number of handshakes that produced transport keys.
    pub handshakes: Counter,

    /// Number of connections that became established.
    pub established: Counter,

    /// Number of lossless packets sent again after the peer requested them.
    pub retransmissions: Counter,

    /// Number of connections killed (locally, by the peer or after too many tries).
    pub kills: Counter,

    /// Number of connections currently held.
    pub connections: Gauge,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given registry.
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "received",
            "Number of datagrams received by type",
            metrics.received.clone(),
        );
        registry.register(
            "dropped",
            "Number of datagrams dropped by type",
            metrics.dropped.clone(),
        );
        registry.register(
            "sent",
            "Number of datagrams handed to the substrate by type",
            metrics.sent.clone(),
        );
        registry.register(
            "cookies_issued",
            "Number of cookies minted in answer to cookie requests",
            metrics.cookies_issued.clone(),
        );
        registry.register(
            "handshakes",
            "Number of handshakes that produced transport keys",
            metrics.handshakes.clone(),
        );
        registry.register(
            "established",
            "Number of connections that became established",
            metrics.established.clone(),
        );
        registry.register(
            "retransmissions",
            "Number of lossless packets sent again after the peer requested them",
            metrics.retransmissions.clone(),
        );
        registry.register(
            "kills",
            "Number of connections killed",
            metrics.kills.clone(),
        );
        registry.register(
            "connections",
            "Number of connections currently held",
            metrics.connections.clone(),
        );
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn test_encode() {
        let mut registry = Registry::default();
        let metrics = Metrics::init(&mut registry);
        metrics
            .received
            .get_or_create(&Packet::new(Some(PacketType::Data)))
            .inc();
        metrics.dropped.get_or_create(&Packet::new(None)).inc();
        metrics.connections.set(3);

        let mut buffer = String::new();
        encode(&mut buffer, &registry).unwrap();
        assert!(buffer.contains("received_total{kind=\"Data\"} 1"));
        assert!(buffer.contains("dropped_total{kind=\"Unknown\"} 1"));
        assert!(buffer.contains("connections 3"));
    }
}
