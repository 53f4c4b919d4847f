//! Handshakes that turn a cookie into a pair of transport keys.
//!
//! Both kinds exchange one message in each direction. Every message is wrapped in a cookie the
//! receiver minted earlier and carries a [Payload] with:
//!
//! - the base nonce the sender will use for data packets,
//! - the SHA-512 of the outer cookie (binding the encrypted part to the cookie it arrived with),
//! - a fresh cookie minted by the sender for the receiver to wrap its reply in.
//!
//! [HandshakeKind::NoiseIK] runs the Noise `IK` pattern (see [noise]). [HandshakeKind::Legacy]
//! boxes the payload under the static keys and exchanges session keys (see [legacy]). An
//! endpoint speaks exactly one kind.

use crate::{
    cookie::{Cookie, CookieContents, CookieKey},
    crypto::{constant_time_eq, sha512, Nonce, PublicKey, SharedKey, NONCE_SIZE, SHA512_SIZE},
    Error,
};
use bytes::{Buf, BufMut};
use commonware_codec::{Error as CodecError, FixedSize, Read, ReadExt, Write};
use x25519_dalek::StaticSecret;

pub mod legacy;
pub mod noise;

/// Which handshake an endpoint runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HandshakeKind {
    /// Box-based exchange of session keys. No forward secrecy for the handshake itself.
    Legacy,

    /// Noise `IK` with x25519, ChaCha20-Poly1305 and SHA-512.
    #[default]
    NoiseIK,
}

/// The plaintext carried by every handshake message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Payload {
    /// Base nonce for data packets sent by the author of the message.
    pub base_nonce: Nonce,

    /// SHA-512 of the cookie wrapping the message.
    pub cookie_hash: [u8; SHA512_SIZE],

    /// A cookie for the receiver to wrap its reply in.
    pub other_cookie: Cookie,
}

impl Payload {
    /// Build the payload for a message wrapped in `outer`.
    pub fn new(base_nonce: Nonce, outer: &Cookie, other_cookie: Cookie) -> Self {
        Self {
            base_nonce,
            cookie_hash: sha512(outer.as_bytes()),
            other_cookie,
        }
    }

    /// Check the payload was written for a message wrapped in `outer`.
    pub fn verify(&self, outer: &Cookie) -> Result<(), Error> {
        if !constant_time_eq(&self.cookie_hash, &sha512(outer.as_bytes())) {
            return Err(Error::CookieHashMismatch);
        }
        Ok(())
    }
}

impl Write for Payload {
    fn write(&self, buf: &mut impl BufMut) {
        self.base_nonce.as_bytes().write(buf);
        self.cookie_hash.write(buf);
        self.other_cookie.write(buf);
    }
}

impl Read for Payload {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let base_nonce = Nonce::from_bytes(<[u8; NONCE_SIZE]>::read(buf)?);
        let cookie_hash = <[u8; SHA512_SIZE]>::read(buf)?;
        let other_cookie = Cookie::read(buf)?;
        Ok(Self {
            base_nonce,
            cookie_hash,
            other_cookie,
        })
    }
}

impl FixedSize for Payload {
    const SIZE: usize = NONCE_SIZE + SHA512_SIZE + Cookie::SIZE;
}

/// What a valid handshake message tells us about its author.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    /// Long-term identity key, as bound by the outer cookie.
    pub identity: PublicKey,

    /// DHT key, as bound by the outer cookie.
    pub dht: PublicKey,

    /// Base nonce of the data packets the peer will send.
    pub base_nonce: Nonce,

    /// The cookie our reply must be wrapped in.
    pub other_cookie: Cookie,
}

impl Peer {
    fn new(contents: CookieContents, payload: Payload) -> Self {
        Self {
            identity: contents.identity,
            dht: contents.dht,
            base_nonce: payload.base_nonce,
            other_cookie: payload.other_cookie,
        }
    }
}

/// Directional keys for data packets.
#[derive(Debug)]
pub struct TransportKeys {
    /// Key for packets we send.
    pub send: SharedKey,

    /// Key for packets we receive.
    pub recv: SharedKey,
}

/// Handshake state held by the side that sent the first message.
pub enum Handshake {
    /// Waiting for the Noise reply.
    Noise(noise::Initiator),

    /// Waiting for the peer's session key.
    Legacy {
        /// Our session secret, advertised in the message we sent.
        session: StaticSecret,
    },
}

/// Open the cookie wrapping an inbound message and check the payload refers to it.
fn open_outer(
    cookie_key: &CookieKey,
    now: u64,
    outer: &Cookie,
    payload: &Payload,
) -> Result<CookieContents, Error> {
    let contents = cookie_key.open(outer, now)?;
    payload.verify(outer)?;
    Ok(contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use commonware_codec::{DecodeExt, Encode};
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_payload() {
        assert_eq!(Payload::SIZE, 200);

        let mut rng = StdRng::seed_from_u64(0);
        let key = CookieKey::new(&mut rng, 15);
        let contents = CookieContents {
            identity: *KeyPair::from_seed(0).public(),
            dht: *KeyPair::from_seed(1).public(),
        };
        let outer = key.create(&mut rng, 0, &contents).unwrap();
        let other = key.create(&mut rng, 0, &contents).unwrap();

        let payload = Payload::new(Nonce::random(&mut rng), &outer, other);
        let decoded = Payload::decode(payload.encode()).unwrap();
        assert_eq!(decoded, payload);
        decoded.verify(&outer).unwrap();
        assert!(matches!(
            decoded.verify(&other),
            Err(Error::CookieHashMismatch)
        ));

        assert_eq!(open_outer(&key, 0, &outer, &payload).unwrap(), contents);
        assert!(open_outer(&key, 0, &other, &payload).is_err());
    }
}
