use crate::handshake::HandshakeKind;
use std::time::Duration;

/// Configuration for an [crate::Endpoint].
///
/// # Warning
///
/// Both ends of a connection must agree on `handshake`. It is recommended to synchronize the
/// timing parameters as well: a peer that retries much faster than its counterparts gives up on
/// connections they would still complete.
#[derive(Clone, Debug)]
pub struct Config {
    /// Which handshake to run (and accept).
    pub handshake: HandshakeKind,

    /// Maximum age of a cookie we minted before it is rejected.
    ///
    /// Cookie timestamps have a resolution of one second.
    pub cookie_timeout: Duration,

    /// Interval at which cookie requests and handshakes are resent while a connection is being
    /// set up. Also the interval between request packets on a quiet connection.
    pub send_packet_interval: Duration,

    /// Number of times a cookie request or handshake is sent before the connection is killed.
    pub max_send_packet_tries: u32,

    /// How long after the last datagram received from a peer's address we keep sending to it
    /// directly instead of through the relay.
    pub udp_direct_timeout: Duration,

    /// Capacity of the send and receive arrays of every connection.
    ///
    /// Must be a power of two no larger than 2^31.
    pub packet_buffer_size: usize,

    /// Round-trip time assumed before any has been measured.
    pub initial_rtt: Duration,

    /// Maximum number of connections held at once (in any state).
    pub max_connections: usize,
}

impl Config {
    /// Generates a configuration with reasonable defaults for usage in production.
    pub fn recommended(handshake: HandshakeKind) -> Self {
        Self {
            handshake,

            cookie_timeout: Duration::from_secs(15),
            send_packet_interval: Duration::from_secs(1),
            max_send_packet_tries: 8,
            udp_direct_timeout: Duration::from_secs(8),
            packet_buffer_size: 32_768,
            initial_rtt: Duration::from_secs(1),
            max_connections: 1_024,
        }
    }

    /// Generates a configuration that gives up on unresponsive peers quickly. This
    /// can be useful when running local demos.
    ///
    /// # Warning
    ///
    /// It is not recommended to use this configuration in production.
    pub fn local(handshake: HandshakeKind) -> Self {
        Self {
            handshake,

            cookie_timeout: Duration::from_secs(15),
            send_packet_interval: Duration::from_millis(250),
            max_send_packet_tries: 8,
            udp_direct_timeout: Duration::from_secs(2),
            packet_buffer_size: 4_096,
            initial_rtt: Duration::from_millis(100),
            max_connections: 64,
        }
    }

    #[cfg(test)]
    pub fn test(handshake: HandshakeKind) -> Self {
        Self {
            handshake,

            cookie_timeout: Duration::from_secs(15),
            send_packet_interval: Duration::from_secs(1),
            max_send_packet_tries: 8,
            udp_direct_timeout: Duration::from_secs(8),
            packet_buffer_size: 256,
            initial_rtt: Duration::from_secs(1),
            max_connections: 8,
        }
    }
}
