//! Noise `IK` handshake (`Noise_IK_25519_ChaChaPoly_SHA512`).
//!
//! ```text
//! <- s
//! ...
//! -> e, es, s, ss
//! <- e, ee, se
//! ```
//!
//! The initiator knows the responder's static key in advance (it dialed it). The first message
//! carries the initiator's static key encrypted, so only the intended responder learns who is
//! connecting. Each message ends with an encrypted [Payload].
//!
//! Wire format (the cookie is the one the receiver minted):
//!
//! ```text
//! initiation: [26][cookie 112][e 32][enc(s) 48][enc(payload) 216]
//! response:   [26][cookie 112][e 32][enc(payload) 216]
//! ```

use super::{open_outer, Payload, Peer, TransportKeys};
use crate::{
    cookie::{Cookie, CookieKey},
    crypto::{KeyPair, PublicKey, SharedKey, MAC_SIZE, PUBLIC_KEY_SIZE, SHARED_KEY_SIZE},
    packet::PacketType,
    Error,
};
use bytes::{Buf, BufMut};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload as AeadPayload},
    ChaCha20Poly1305, Key, Nonce as AeadNonce,
};
use commonware_codec::{
    DecodeExt, Encode, EncodeSize, Error as CodecError, FixedSize, Read, ReadExt, Write,
};
use hkdf::Hkdf;
use rand::{CryptoRng, Rng};
use sha2::{Digest, Sha512};
use x25519_dalek::StaticSecret;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Protocol name, zero-padded to the hash length to seed the transcript.
const PROTOCOL_NAME: &[u8] = b"Noise_IK_25519_ChaChaPoly_SHA512";

/// Length of the hash (and chaining key).
const HASH_LEN: usize = 64;

/// Size of the encrypted static key.
const ENCRYPTED_STATIC_SIZE: usize = PUBLIC_KEY_SIZE + MAC_SIZE;

/// Size of the encrypted payload.
const ENCRYPTED_PAYLOAD_SIZE: usize = Payload::SIZE + MAC_SIZE;

/// Size of the first message.
pub const INITIATION_SIZE: usize =
    1 + Cookie::SIZE + PUBLIC_KEY_SIZE + ENCRYPTED_STATIC_SIZE + ENCRYPTED_PAYLOAD_SIZE;

/// Size of the second message.
pub const RESPONSE_SIZE: usize = 1 + Cookie::SIZE + PUBLIC_KEY_SIZE + ENCRYPTED_PAYLOAD_SIZE;

/// The chaining key, transcript hash and current cipher key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct SymmetricState {
    ck: [u8; HASH_LEN],
    h: [u8; HASH_LEN],
    k: Option<[u8; SHARED_KEY_SIZE]>,
    n: u64,
}

impl SymmetricState {
    /// Initialize for `IK`, mixing in the responder's static key.
    fn new(responder: &PublicKey) -> Self {
        let mut h = [0u8; HASH_LEN];
        h[..PROTOCOL_NAME.len()].copy_from_slice(PROTOCOL_NAME);
        let mut state = Self {
            ck: h,
            h,
            k: None,
            n: 0,
        };

        // Empty prologue
        state.mix_hash(&[]);
        state.mix_hash(responder.as_bytes());
        state
    }

    fn mix_hash(&mut self, data: &[u8]) {
        let mut hasher = Sha512::new();
        hasher.update(self.h);
        hasher.update(data);
        self.h.copy_from_slice(&hasher.finalize());
    }

    /// Derive two outputs from the chaining key and `ikm`.
    fn hkdf(&self, ikm: &[u8]) -> Result<[u8; 2 * HASH_LEN], Error> {
        let mut okm = [0u8; 2 * HASH_LEN];
        Hkdf::<Sha512>::new(Some(&self.ck[..]), ikm)
            .expand(&[], &mut okm)
            .map_err(|_| Error::HKDFExpansion)?;
        Ok(okm)
    }

    fn mix_key(&mut self, ikm: &[u8]) -> Result<(), Error> {
        let mut okm = self.hkdf(ikm)?;
        self.ck.copy_from_slice(&okm[..HASH_LEN]);
        let mut k = [0u8; SHARED_KEY_SIZE];
        k.copy_from_slice(&okm[HASH_LEN..HASH_LEN + SHARED_KEY_SIZE]);
        self.k = Some(k);
        self.n = 0;
        okm.zeroize();
        Ok(())
    }

    /// Mix in the result of a Diffie-Hellman exchange.
    fn mix_dh(&mut self, secret: &StaticSecret, public: &PublicKey) -> Result<(), Error> {
        let shared = secret.diffie_hellman(public);
        if !shared.was_contributory() {
            return Err(Error::SharedSecretNotContributory);
        }
        self.mix_key(shared.as_bytes())
    }

    fn cipher(&self) -> Result<(ChaCha20Poly1305, AeadNonce), Error> {
        let k = self.k.as_ref().ok_or(Error::EncryptionFailed)?;
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&self.n.to_le_bytes());
        Ok((
            ChaCha20Poly1305::new(Key::from_slice(k)),
            *AeadNonce::from_slice(&nonce),
        ))
    }

    fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let (cipher, nonce) = self.cipher()?;
        let ciphertext = cipher
            .encrypt(
                &nonce,
                AeadPayload {
                    msg: plaintext,
                    aad: &self.h,
                },
            )
            .map_err(|_| Error::EncryptionFailed)?;
        self.n = self.n.checked_add(1).ok_or(Error::NonceOverflow)?;
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        let (cipher, nonce) = self.cipher()?;
        let plaintext = cipher
            .decrypt(
                &nonce,
                AeadPayload {
                    msg: ciphertext,
                    aad: &self.h,
                },
            )
            .map_err(|_| Error::DecryptionFailed)?;
        self.n = self.n.checked_add(1).ok_or(Error::NonceOverflow)?;
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    /// Derive the two transport keys. The first is used by the initiator to send.
    fn split(self) -> Result<(SharedKey, SharedKey), Error> {
        let mut okm = self.hkdf(&[])?;
        let mut k1 = [0u8; SHARED_KEY_SIZE];
        let mut k2 = [0u8; SHARED_KEY_SIZE];
        k1.copy_from_slice(&okm[..SHARED_KEY_SIZE]);
        k2.copy_from_slice(&okm[HASH_LEN..HASH_LEN + SHARED_KEY_SIZE]);
        okm.zeroize();
        Ok((SharedKey::from_bytes(k1), SharedKey::from_bytes(k2)))
    }
}

/// The first handshake message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Initiation {
    pub cookie: Cookie,
    pub ephemeral: PublicKey,
    encrypted_static: [u8; ENCRYPTED_STATIC_SIZE],
    encrypted_payload: [u8; ENCRYPTED_PAYLOAD_SIZE],
}

impl Write for Initiation {
    fn write(&self, buf: &mut impl BufMut) {
        PacketType::Handshake.write(buf);
        self.cookie.write(buf);
        self.ephemeral.as_bytes().write(buf);
        self.encrypted_static.write(buf);
        self.encrypted_payload.write(buf);
    }
}

impl Read for Initiation {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        PacketType::expect(buf, PacketType::Handshake, "noise::Initiation")?;
        Ok(Self {
            cookie: Cookie::read(buf)?,
            ephemeral: PublicKey::from(<[u8; PUBLIC_KEY_SIZE]>::read(buf)?),
            encrypted_static: <[u8; ENCRYPTED_STATIC_SIZE]>::read(buf)?,
            encrypted_payload: <[u8; ENCRYPTED_PAYLOAD_SIZE]>::read(buf)?,
        })
    }
}

impl FixedSize for Initiation {
    const SIZE: usize = INITIATION_SIZE;
}

/// The second handshake message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub cookie: Cookie,
    pub ephemeral: PublicKey,
    encrypted_payload: [u8; ENCRYPTED_PAYLOAD_SIZE],
}

impl Write for Response {
    fn write(&self, buf: &mut impl BufMut) {
        PacketType::Handshake.write(buf);
        self.cookie.write(buf);
        self.ephemeral.as_bytes().write(buf);
        self.encrypted_payload.write(buf);
    }
}

impl Read for Response {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        PacketType::expect(buf, PacketType::Handshake, "noise::Response")?;
        Ok(Self {
            cookie: Cookie::read(buf)?,
            ephemeral: PublicKey::from(<[u8; PUBLIC_KEY_SIZE]>::read(buf)?),
            encrypted_payload: <[u8; ENCRYPTED_PAYLOAD_SIZE]>::read(buf)?,
        })
    }
}

impl FixedSize for Response {
    const SIZE: usize = RESPONSE_SIZE;
}

/// Either Noise message, told apart by length.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Initiation(Initiation),
    Response(Response),
}

impl Write for Message {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Message::Initiation(m) => m.write(buf),
            Message::Response(m) => m.write(buf),
        }
    }
}

impl EncodeSize for Message {
    fn encode_size(&self) -> usize {
        match self {
            Message::Initiation(_) => INITIATION_SIZE,
            Message::Response(_) => RESPONSE_SIZE,
        }
    }
}

impl Read for Message {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        match buf.remaining() {
            INITIATION_SIZE => Ok(Message::Initiation(Initiation::read(buf)?)),
            RESPONSE_SIZE => Ok(Message::Response(Response::read(buf)?)),
            len => Err(CodecError::InvalidLength(len)),
        }
    }
}

/// An initiator waiting for the response.
pub struct Initiator {
    state: SymmetricState,
    ephemeral: StaticSecret,
    responder: PublicKey,
}

impl Initiator {
    /// Write the first message to `responder`, wrapped in `cookie` (minted by the responder).
    pub fn new<R: Rng + CryptoRng>(
        rng: &mut R,
        own: &KeyPair,
        responder: &PublicKey,
        cookie: Cookie,
        payload: &Payload,
    ) -> Result<(Self, Initiation), Error> {
        let mut state = SymmetricState::new(responder);

        // e
        let ephemeral = StaticSecret::random_from_rng(&mut *rng);
        let ephemeral_public = PublicKey::from(&ephemeral);
        state.mix_hash(ephemeral_public.as_bytes());

        // es
        state.mix_dh(&ephemeral, responder)?;

        // s
        let encrypted_static = state.encrypt_and_hash(own.public().as_bytes())?;

        // ss
        state.mix_dh(own.secret(), responder)?;

        let encrypted_payload = state.encrypt_and_hash(&payload.encode())?;

        let message = Initiation {
            cookie,
            ephemeral: ephemeral_public,
            encrypted_static: fixed(&encrypted_static)?,
            encrypted_payload: fixed(&encrypted_payload)?,
        };
        Ok((
            Self {
                state,
                ephemeral,
                responder: *responder,
            },
            message,
        ))
    }

    /// The static key this initiator dialed.
    pub fn responder(&self) -> &PublicKey {
        &self.responder
    }

    /// Read the response and derive the transport keys.
    ///
    /// `now` is in seconds. The response cookie must have been minted by `cookie_key` for the
    /// responder we dialed. A response that fails to verify leaves the initiator untouched.
    pub fn finish(
        &self,
        own: &KeyPair,
        cookie_key: &CookieKey,
        now: u64,
        response: &Response,
    ) -> Result<(Peer, TransportKeys), Error> {
        let mut state = self.state.clone();

        // e
        state.mix_hash(response.ephemeral.as_bytes());

        // ee
        state.mix_dh(&self.ephemeral, &response.ephemeral)?;

        // se: the initiator's static with the responder's ephemeral
        state.mix_dh(own.secret(), &response.ephemeral)?;

        let plain = state.decrypt_and_hash(&response.encrypted_payload)?;
        let payload = Payload::decode(plain.as_slice())?;
        let contents = open_outer(cookie_key, now, &response.cookie, &payload)?;
        if contents.identity != self.responder {
            return Err(Error::WrongPeer);
        }

        let (send, recv) = state.split()?;
        Ok((Peer::new(contents, payload), TransportKeys { send, recv }))
    }
}

/// A responder that has read a valid first message but not yet replied.
pub struct Responder {
    state: SymmetricState,
    initiator_ephemeral: PublicKey,
    initiator: PublicKey,
}

impl Responder {
    /// Read the first message.
    ///
    /// `now` is in seconds. The outer cookie must have been minted by `cookie_key` for the same
    /// static key the initiator proves ownership of.
    pub fn read(
        own: &KeyPair,
        cookie_key: &CookieKey,
        now: u64,
        initiation: &Initiation,
    ) -> Result<(Self, Peer), Error> {
        // Reject before any asymmetric work if the cookie is not ours
        let contents = cookie_key.open(&initiation.cookie, now)?;

        let mut state = SymmetricState::new(own.public());

        // e
        state.mix_hash(initiation.ephemeral.as_bytes());

        // es
        state.mix_dh(own.secret(), &initiation.ephemeral)?;

        // s
        let initiator = state.decrypt_and_hash(&initiation.encrypted_static)?;
        let initiator = PublicKey::from(fixed::<PUBLIC_KEY_SIZE>(&initiator)?);

        // ss
        state.mix_dh(own.secret(), &initiator)?;

        let plain = state.decrypt_and_hash(&initiation.encrypted_payload)?;
        let payload = Payload::decode(plain.as_slice())?;
        payload.verify(&initiation.cookie)?;
        if contents.identity != initiator {
            return Err(Error::WrongPeer);
        }

        Ok((
            Self {
                state,
                initiator_ephemeral: initiation.ephemeral,
                initiator,
            },
            Peer::new(contents, payload),
        ))
    }

    /// The static key of the initiator.
    pub fn initiator(&self) -> &PublicKey {
        &self.initiator
    }

    /// Write the response, wrapped in `cookie` (minted by the initiator), and derive the
    /// transport keys.
    pub fn respond<R: Rng + CryptoRng>(
        mut self,
        rng: &mut R,
        cookie: Cookie,
        payload: &Payload,
    ) -> Result<(Response, TransportKeys), Error> {
        // e
        let ephemeral = StaticSecret::random_from_rng(&mut *rng);
        let ephemeral_public = PublicKey::from(&ephemeral);
        self.state.mix_hash(ephemeral_public.as_bytes());

        // ee
        self.state.mix_dh(&ephemeral, &self.initiator_ephemeral)?;

        // se: the initiator's static with our ephemeral
        self.state.mix_dh(&ephemeral, &self.initiator)?;

        let encrypted_payload = self.state.encrypt_and_hash(&payload.encode())?;
        let response = Response {
            cookie,
            ephemeral: ephemeral_public,
            encrypted_payload: fixed(&encrypted_payload)?,
        };

        let (recv, send) = self.state.split()?;
        Ok((response, TransportKeys { send, recv }))
    }
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N], Error> {
    bytes
        .try_into()
        .map_err(|_| Error::UnableToDecode(CodecError::InvalidLength(bytes.len())))
}
