//! The box-based handshake.
//!
//! Each side boxes its [Payload] and a fresh session public key to the other's static key. The
//! transport key is the shared key of the two session keys, used in both directions (the two
//! directions never share a nonce since each side picks its own base nonce).
//!
//! ```text
//! [26][cookie 112][nonce 24][box(base_nonce 24 || session 32 || cookie_hash 64 || cookie 112)]
//! ```

use super::{Payload, Peer, TransportKeys};
use crate::{
    cookie::{Cookie, CookieKey},
    crypto::{
        KeyPair, Nonce, PublicKey, SharedKey, MAC_SIZE, NONCE_SIZE, PUBLIC_KEY_SIZE, SHA512_SIZE,
    },
    packet::PacketType,
    Error,
};
use bytes::{Buf, BufMut};
use commonware_codec::{Error as CodecError, FixedSize, Read, ReadExt, Write};
use rand::{CryptoRng, Rng};
use x25519_dalek::StaticSecret;

/// Size of the boxed plaintext.
const PLAIN_SIZE: usize = Payload::SIZE + PUBLIC_KEY_SIZE;

/// Size of the boxed ciphertext.
const CIPHERTEXT_SIZE: usize = PLAIN_SIZE + MAC_SIZE;

/// Size of a handshake message.
pub const MESSAGE_SIZE: usize = 1 + Cookie::SIZE + NONCE_SIZE + CIPHERTEXT_SIZE;

/// A handshake message. Both directions use the same format.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub cookie: Cookie,
    nonce: Nonce,
    ciphertext: [u8; CIPHERTEXT_SIZE],
}

impl Write for Message {
    fn write(&self, buf: &mut impl BufMut) {
        PacketType::Handshake.write(buf);
        self.cookie.write(buf);
        self.nonce.as_bytes().write(buf);
        self.ciphertext.write(buf);
    }
}

impl Read for Message {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        PacketType::expect(buf, PacketType::Handshake, "legacy::Message")?;
        Ok(Self {
            cookie: Cookie::read(buf)?,
            nonce: Nonce::from_bytes(<[u8; NONCE_SIZE]>::read(buf)?),
            ciphertext: <[u8; CIPHERTEXT_SIZE]>::read(buf)?,
        })
    }
}

impl FixedSize for Message {
    const SIZE: usize = MESSAGE_SIZE;
}

/// Box `payload` and `session` to `peer`, wrapped in `cookie` (minted by the peer).
pub fn create<R: Rng + CryptoRng>(
    rng: &mut R,
    own: &KeyPair,
    peer: &PublicKey,
    cookie: Cookie,
    session: &PublicKey,
    payload: &Payload,
) -> Result<Message, Error> {
    let mut plain = Vec::with_capacity(PLAIN_SIZE);
    payload.base_nonce.as_bytes().write(&mut plain);
    session.as_bytes().write(&mut plain);
    payload.cookie_hash.write(&mut plain);
    payload.other_cookie.write(&mut plain);

    let nonce = Nonce::random(rng);
    let ciphertext = SharedKey::derive(own.secret(), peer)?.encrypt(&nonce, &plain)?;
    let ciphertext = ciphertext
        .as_slice()
        .try_into()
        .map_err(|_| Error::EncryptionFailed)?;
    Ok(Message {
        cookie,
        nonce,
        ciphertext,
    })
}

/// Open a handshake message, returning its author and their session key.
///
/// `now` is in seconds. If `expected` is set, the cookie must have been minted for that identity.
pub fn read(
    own: &KeyPair,
    cookie_key: &CookieKey,
    now: u64,
    message: &Message,
    expected: Option<&PublicKey>,
) -> Result<(Peer, PublicKey), Error> {
    let contents = cookie_key.open(&message.cookie, now)?;
    if let Some(expected) = expected {
        if *expected != contents.identity {
            return Err(Error::WrongPeer);
        }
    }

    let plain = SharedKey::derive(own.secret(), &contents.identity)?
        .decrypt(&message.nonce, &message.ciphertext)?;
    let mut buf = plain.as_slice();
    let base_nonce = Nonce::from_bytes(<[u8; NONCE_SIZE]>::read(&mut buf)?);
    let session = PublicKey::from(<[u8; PUBLIC_KEY_SIZE]>::read(&mut buf)?);
    let cookie_hash = <[u8; SHA512_SIZE]>::read(&mut buf)?;
    let other_cookie = Cookie::read(&mut buf)?;
    let payload = Payload {
        base_nonce,
        cookie_hash,
        other_cookie,
    };
    payload.verify(&message.cookie)?;
    Ok((Peer::new(contents, payload), session))
}

/// Derive the transport keys from our session secret and the peer's session key.
pub fn transport_keys(session: &StaticSecret, peer: &PublicKey) -> Result<TransportKeys, Error> {
    let key = SharedKey::derive(session, peer)?;
    Ok(TransportKeys {
        send: key.clone(),
        recv: key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cookie::CookieContents;
    use commonware_codec::{DecodeExt, Encode};
    use rand::{rngs::StdRng, SeedableRng};

    const NOW: u64 = 1_000;

    fn cookie(rng: &mut StdRng, key: &CookieKey, identity: &KeyPair, dht: &KeyPair) -> Cookie {
        key.create(
            rng,
            NOW,
            &CookieContents {
                identity: *identity.public(),
                dht: *dht.public(),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_size() {
        assert_eq!(MESSAGE_SIZE, 385);
    }

    #[test]
    fn test_handshake() {
        let mut rng = StdRng::seed_from_u64(0);
        let alice = KeyPair::from_seed(0);
        let alice_dht = KeyPair::from_seed(10);
        let alice_cookies = CookieKey::new(&mut rng, 15);
        let bob = KeyPair::from_seed(1);
        let bob_dht = KeyPair::from_seed(11);
        let bob_cookies = CookieKey::new(&mut rng, 15);

        // Alice sends her session key inside a cookie Bob minted for her
        let alice_session = StaticSecret::random_from_rng(&mut rng);
        let outer = cookie(&mut rng, &bob_cookies, &alice, &alice_dht);
        let other = cookie(&mut rng, &alice_cookies, &bob, &bob_dht);
        let payload = Payload::new(Nonce::random(&mut rng), &outer, other);
        let message = create(
            &mut rng,
            &alice,
            bob.public(),
            outer,
            &PublicKey::from(&alice_session),
            &payload,
        )
        .unwrap();
        let encoded = message.encode();
        assert_eq!(encoded.len(), MESSAGE_SIZE);

        // Bob reads it without knowing who it is from
        let message = Message::decode(encoded).unwrap();
        let (peer, alice_session_public) =
            read(&bob, &bob_cookies, NOW, &message, None).unwrap();
        assert_eq!(peer.identity, *alice.public());
        assert_eq!(peer.dht, *alice_dht.public());
        assert_eq!(peer.base_nonce, payload.base_nonce);

        // Bob replies in the cookie Alice gave him
        let bob_session = StaticSecret::random_from_rng(&mut rng);
        let reply_payload = Payload::new(
            Nonce::random(&mut rng),
            &peer.other_cookie,
            cookie(&mut rng, &bob_cookies, &alice, &alice_dht),
        );
        let reply = create(
            &mut rng,
            &bob,
            alice.public(),
            peer.other_cookie,
            &PublicKey::from(&bob_session),
            &reply_payload,
        )
        .unwrap();
        let bob_keys = transport_keys(&bob_session, &alice_session_public).unwrap();

        // Alice reads the reply, expecting Bob
        let (peer, bob_session_public) =
            read(&alice, &alice_cookies, NOW, &reply, Some(bob.public())).unwrap();
        assert_eq!(peer.identity, *bob.public());
        let alice_keys = transport_keys(&alice_session, &bob_session_public).unwrap();

        assert_eq!(alice_keys.send, bob_keys.recv);
        assert_eq!(alice_keys.recv, bob_keys.send);

        // Not from the expected peer
        let carol = KeyPair::from_seed(2);
        assert!(matches!(
            read(&alice, &alice_cookies, NOW, &reply, Some(carol.public())),
            Err(Error::WrongPeer)
        ));
    }

    #[test]
    fn test_tamper() {
        let mut rng = StdRng::seed_from_u64(0);
        let alice = KeyPair::from_seed(0);
        let alice_dht = KeyPair::from_seed(10);
        let bob = KeyPair::from_seed(1);
        let bob_cookies = CookieKey::new(&mut rng, 15);

        let session = StaticSecret::random_from_rng(&mut rng);
        let outer = cookie(&mut rng, &bob_cookies, &alice, &alice_dht);
        let other = cookie(&mut rng, &bob_cookies, &bob, &alice_dht);
        let payload = Payload::new(Nonce::random(&mut rng), &outer, other);
        let message = create(
            &mut rng,
            &alice,
            bob.public(),
            outer,
            &PublicKey::from(&session),
            &payload,
        )
        .unwrap();
        let encoded = message.encode().to_vec();

        let offsets = [
            1,
            Cookie::SIZE,
            1 + Cookie::SIZE,
            1 + Cookie::SIZE + NONCE_SIZE,
            MESSAGE_SIZE - 1,
        ];
        for offset in offsets {
            let mut tampered = encoded.clone();
            tampered[offset] ^= 1;
            let message = Message::decode(tampered.as_slice()).unwrap();
            assert!(
                read(&bob, &bob_cookies, NOW, &message, None).is_err(),
                "offset {offset}"
            );
        }

        // A payload hashed for another cookie is rejected
        let swapped = cookie(&mut rng, &bob_cookies, &alice, &alice_dht);
        let message = create(
            &mut rng,
            &alice,
            bob.public(),
            swapped,
            &PublicKey::from(&session),
            &payload,
        )
        .unwrap();
        assert!(matches!(
            read(&bob, &bob_cookies, NOW, &message, None),
            Err(Error::CookieHashMismatch)
        ));
    }
}
