//! Stateless cookies and the request/response exchange that hands them out.
//!
//! A cookie is an opaque token minted under a secret only its creator knows. It binds the
//! requester's identity key and DHT key to a creation time, so a handshake carrying a valid cookie
//! proves the sender could receive packets sent to that DHT key recently. Nothing is stored
//! between the request and the handshake.
//!
//! The request and response are encrypted under the key shared by the two DHT key pairs, not the
//! identity keys: the requester does not yet know whether the responder is who it claims to be.

use crate::{
    crypto::{Nonce, PublicKey, SharedKey, MAC_SIZE, NONCE_SIZE, PUBLIC_KEY_SIZE},
    packet::PacketType,
    Error,
};
use bytes::{Buf, BufMut};
use commonware_codec::{Error as CodecError, FixedSize, Read, ReadExt, Write};
use rand::{CryptoRng, Rng};

/// Default number of seconds a cookie stays valid.
pub const COOKIE_TIMEOUT: u64 = 15;

/// Size of the plaintext sealed inside a cookie.
const COOKIE_PLAIN_SIZE: usize = u64::SIZE + 2 * PUBLIC_KEY_SIZE;

/// Size of the cookie ciphertext (including the authentication tag).
const COOKIE_CIPHERTEXT_SIZE: usize = COOKIE_PLAIN_SIZE + MAC_SIZE;

/// Size of a cookie on the wire.
pub const COOKIE_SIZE: usize = NONCE_SIZE + COOKIE_CIPHERTEXT_SIZE;

/// Size of the plaintext of a cookie request.
const REQUEST_PLAIN_SIZE: usize = 2 * PUBLIC_KEY_SIZE + u64::SIZE;

/// Size of a cookie request on the wire.
pub const COOKIE_REQUEST_SIZE: usize =
    1 + PUBLIC_KEY_SIZE + NONCE_SIZE + REQUEST_PLAIN_SIZE + MAC_SIZE;

/// Size of the plaintext of a cookie response.
const RESPONSE_PLAIN_SIZE: usize = COOKIE_SIZE + u64::SIZE;

/// Size of a cookie response on the wire.
pub const COOKIE_RESPONSE_SIZE: usize = 1 + NONCE_SIZE + RESPONSE_PLAIN_SIZE + MAC_SIZE;

/// An encrypted cookie.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Cookie([u8; COOKIE_SIZE]);

impl Cookie {
    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; COOKIE_SIZE] {
        &self.0
    }

    /// Interpret raw bytes as a cookie.
    pub fn from_bytes(bytes: [u8; COOKIE_SIZE]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for Cookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Cookie(..)")
    }
}

impl Write for Cookie {
    fn write(&self, buf: &mut impl BufMut) {
        self.0.write(buf);
    }
}

impl Read for Cookie {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self(<[u8; COOKIE_SIZE]>::read(buf)?))
    }
}

impl FixedSize for Cookie {
    const SIZE: usize = COOKIE_SIZE;
}

/// The keys a cookie binds together.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CookieContents {
    /// Long-term identity key of the cookie holder.
    pub identity: PublicKey,

    /// DHT key the cookie was requested from.
    pub dht: PublicKey,
}

/// The secret used to mint and open cookies.
pub struct CookieKey {
    secret: SharedKey,
    timeout: u64,
}

impl CookieKey {
    /// Create a key with a fresh random secret.
    pub fn new<R: Rng + CryptoRng>(rng: &mut R, timeout: u64) -> Self {
        Self {
            secret: SharedKey::random(rng),
            timeout,
        }
    }

    /// Mint a cookie for `contents` at `now` (seconds).
    pub fn create<R: Rng + CryptoRng>(
        &self,
        rng: &mut R,
        now: u64,
        contents: &CookieContents,
    ) -> Result<Cookie, Error> {
        let mut plain = Vec::with_capacity(COOKIE_PLAIN_SIZE);
        plain.put_u64(now);
        plain.put_slice(contents.identity.as_bytes());
        plain.put_slice(contents.dht.as_bytes());

        let nonce = Nonce::random(rng);
        let ciphertext = self.secret.encrypt(&nonce, &plain)?;

        let mut cookie = [0u8; COOKIE_SIZE];
        cookie[..NONCE_SIZE].copy_from_slice(nonce.as_bytes());
        cookie[NONCE_SIZE..].copy_from_slice(&ciphertext);
        Ok(Cookie(cookie))
    }

    /// Open a cookie minted by this key, checking it is neither expired nor from the future.
    pub fn open(&self, cookie: &Cookie, now: u64) -> Result<CookieContents, Error> {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&cookie.0[..NONCE_SIZE]);
        let plain = self
            .secret
            .decrypt(&Nonce::from_bytes(nonce), &cookie.0[NONCE_SIZE..])?;

        let mut buf = plain.as_slice();
        let timestamp = u64::read(&mut buf)?;
        if timestamp > now {
            return Err(Error::CookieFromFuture);
        }
        if timestamp.saturating_add(self.timeout) < now {
            return Err(Error::CookieExpired);
        }
        let identity = PublicKey::from(<[u8; PUBLIC_KEY_SIZE]>::read(&mut buf)?);
        let dht = PublicKey::from(<[u8; PUBLIC_KEY_SIZE]>::read(&mut buf)?);
        Ok(CookieContents { identity, dht })
    }
}

/// A request for a cookie.
///
/// `[24][requester dht 32][nonce 24][enc(identity 32 || zero 32 || number 8)]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CookieRequest {
    /// DHT key of the requester, used by the responder to derive the shared key.
    pub dht: PublicKey,
    nonce: Nonce,
    ciphertext: [u8; REQUEST_PLAIN_SIZE + MAC_SIZE],
}

/// The decrypted contents of a [CookieRequest].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestPlain {
    /// Identity key the requester wants the cookie bound to.
    pub identity: PublicKey,

    /// Request number echoed in the response.
    pub number: u64,
}

impl Write for CookieRequest {
    fn write(&self, buf: &mut impl BufMut) {
        PacketType::CookieRequest.write(buf);
        self.dht.as_bytes().write(buf);
        self.nonce.as_bytes().write(buf);
        self.ciphertext.write(buf);
    }
}

impl Read for CookieRequest {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        PacketType::expect(buf, PacketType::CookieRequest, "cookie::CookieRequest")?;
        let dht = PublicKey::from(<[u8; PUBLIC_KEY_SIZE]>::read(buf)?);
        let nonce = Nonce::from_bytes(<[u8; NONCE_SIZE]>::read(buf)?);
        let ciphertext = <[u8; REQUEST_PLAIN_SIZE + MAC_SIZE]>::read(buf)?;
        Ok(Self {
            dht,
            nonce,
            ciphertext,
        })
    }
}

impl FixedSize for CookieRequest {
    const SIZE: usize = COOKIE_REQUEST_SIZE;
}

/// A cookie sent in reply to a [CookieRequest].
///
/// `[25][nonce 24][enc(cookie 112 || number 8)]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CookieResponse {
    nonce: Nonce,
    ciphertext: [u8; RESPONSE_PLAIN_SIZE + MAC_SIZE],
}

impl Write for CookieResponse {
    fn write(&self, buf: &mut impl BufMut) {
        PacketType::CookieResponse.write(buf);
        self.nonce.as_bytes().write(buf);
        self.ciphertext.write(buf);
    }
}

impl Read for CookieResponse {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        PacketType::expect(buf, PacketType::CookieResponse, "cookie::CookieResponse")?;
        let nonce = Nonce::from_bytes(<[u8; NONCE_SIZE]>::read(buf)?);
        let ciphertext = <[u8; RESPONSE_PLAIN_SIZE + MAC_SIZE]>::read(buf)?;
        Ok(Self { nonce, ciphertext })
    }
}

impl FixedSize for CookieResponse {
    const SIZE: usize = COOKIE_RESPONSE_SIZE;
}

/// Build a cookie request asking for a cookie bound to `identity` and `own_dht`.
///
/// `shared` is the key between `own_dht` and the responder's DHT key.
pub fn create_cookie_request<R: Rng + CryptoRng>(
    rng: &mut R,
    identity: &PublicKey,
    own_dht: &PublicKey,
    shared: &SharedKey,
    number: u64,
) -> Result<CookieRequest, Error> {
    let mut plain = Vec::with_capacity(REQUEST_PLAIN_SIZE);
    plain.put_slice(identity.as_bytes());
    plain.put_bytes(0, PUBLIC_KEY_SIZE);
    plain.put_u64(number);

    let nonce = Nonce::random(rng);
    let ciphertext = shared.encrypt(&nonce, &plain)?;
    let mut fixed = [0u8; REQUEST_PLAIN_SIZE + MAC_SIZE];
    fixed.copy_from_slice(&ciphertext);
    Ok(CookieRequest {
        dht: *own_dht,
        nonce,
        ciphertext: fixed,
    })
}

/// Decrypt a cookie request.
pub fn handle_cookie_request(
    request: &CookieRequest,
    shared: &SharedKey,
) -> Result<RequestPlain, Error> {
    let plain = shared.decrypt(&request.nonce, &request.ciphertext)?;
    let mut buf = plain.as_slice();
    let identity = PublicKey::from(<[u8; PUBLIC_KEY_SIZE]>::read(&mut buf)?);
    buf.advance(PUBLIC_KEY_SIZE);
    let number = u64::read(&mut buf)?;
    Ok(RequestPlain { identity, number })
}

/// Mint a cookie for the requester and seal it in a response.
pub fn create_cookie_response<R: Rng + CryptoRng>(
    rng: &mut R,
    key: &CookieKey,
    now: u64,
    plain: &RequestPlain,
    requester_dht: &PublicKey,
    shared: &SharedKey,
) -> Result<CookieResponse, Error> {
    let cookie = key.create(
        rng,
        now,
        &CookieContents {
            identity: plain.identity,
            dht: *requester_dht,
        },
    )?;

    let mut inner = Vec::with_capacity(RESPONSE_PLAIN_SIZE);
    inner.put_slice(cookie.as_bytes());
    inner.put_u64(plain.number);

    let nonce = Nonce::random(rng);
    let ciphertext = shared.encrypt(&nonce, &inner)?;
    let mut fixed = [0u8; RESPONSE_PLAIN_SIZE + MAC_SIZE];
    fixed.copy_from_slice(&ciphertext);
    Ok(CookieResponse {
        nonce,
        ciphertext: fixed,
    })
}

/// Open a cookie response, checking it answers request `expected_number`.
pub fn handle_cookie_response(
    response: &CookieResponse,
    shared: &SharedKey,
    expected_number: u64,
) -> Result<Cookie, Error> {
    let plain = shared.decrypt(&response.nonce, &response.ciphertext)?;
    let mut buf = plain.as_slice();
    let cookie = Cookie::read(&mut buf)?;
    let number = u64::read(&mut buf)?;
    if number != expected_number {
        return Err(Error::CookieNumberMismatch);
    }
    Ok(cookie)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use commonware_codec::{DecodeExt, Encode};
    use rand::{rngs::StdRng, SeedableRng};
    use test_case::test_case;

    fn contents() -> CookieContents {
        CookieContents {
            identity: *KeyPair::from_seed(0).public(),
            dht: *KeyPair::from_seed(1).public(),
        }
    }

    #[test]
    fn test_sizes() {
        assert_eq!(COOKIE_SIZE, 112);
        assert_eq!(COOKIE_REQUEST_SIZE, 145);
        assert_eq!(COOKIE_RESPONSE_SIZE, 161);
    }

    #[test]
    fn test_cookie_round_trip() {
        let mut rng = StdRng::seed_from_u64(0);
        let key = CookieKey::new(&mut rng, COOKIE_TIMEOUT);
        let cookie = key.create(&mut rng, 1_000, &contents()).unwrap();
        assert_eq!(key.open(&cookie, 1_000).unwrap(), contents());
    }

    #[test]
    fn test_cookie_wrong_secret() {
        let mut rng = StdRng::seed_from_u64(0);
        let key = CookieKey::new(&mut rng, COOKIE_TIMEOUT);
        let other = CookieKey::new(&mut rng, COOKIE_TIMEOUT);
        let cookie = key.create(&mut rng, 1_000, &contents()).unwrap();
        assert!(matches!(
            other.open(&cookie, 1_000),
            Err(Error::DecryptionFailed)
        ));
    }

    #[test_case(0, true; "fresh")]
    #[test_case(COOKIE_TIMEOUT - 1, true; "just before timeout")]
    #[test_case(COOKIE_TIMEOUT, true; "at timeout")]
    #[test_case(COOKIE_TIMEOUT + 1, false; "just after timeout")]
    #[test_case(10 * COOKIE_TIMEOUT, false; "long after timeout")]
    fn test_cookie_ttl(age: u64, accepted: bool) {
        let mut rng = StdRng::seed_from_u64(0);
        let key = CookieKey::new(&mut rng, COOKIE_TIMEOUT);
        let created = 1_000;
        let cookie = key.create(&mut rng, created, &contents()).unwrap();
        let result = key.open(&cookie, created + age);
        if accepted {
            assert!(result.is_ok());
        } else {
            assert!(matches!(result, Err(Error::CookieExpired)));
        }
    }

    #[test]
    fn test_cookie_from_future() {
        let mut rng = StdRng::seed_from_u64(0);
        let key = CookieKey::new(&mut rng, COOKIE_TIMEOUT);
        let cookie = key.create(&mut rng, 1_000, &contents()).unwrap();
        assert!(matches!(
            key.open(&cookie, 999),
            Err(Error::CookieFromFuture)
        ));
    }

    #[test]
    fn test_cookie_tampered() {
        let mut rng = StdRng::seed_from_u64(0);
        let key = CookieKey::new(&mut rng, COOKIE_TIMEOUT);
        let cookie = key.create(&mut rng, 1_000, &contents()).unwrap();
        for i in [0, NONCE_SIZE, COOKIE_SIZE - 1] {
            let mut bytes = *cookie.as_bytes();
            bytes[i] ^= 1;
            assert!(key.open(&Cookie::from_bytes(bytes), 1_000).is_err());
        }
    }

    #[test]
    fn test_request_response() {
        let mut rng = StdRng::seed_from_u64(0);
        let identity = KeyPair::from_seed(0);
        let requester_dht = KeyPair::from_seed(1);
        let responder_dht = KeyPair::from_seed(2);
        let requester_shared =
            SharedKey::derive(requester_dht.secret(), responder_dht.public()).unwrap();
        let responder_shared =
            SharedKey::derive(responder_dht.secret(), requester_dht.public()).unwrap();
        let key = CookieKey::new(&mut rng, COOKIE_TIMEOUT);

        // Requester asks for a cookie
        let request = create_cookie_request(
            &mut rng,
            identity.public(),
            requester_dht.public(),
            &requester_shared,
            7,
        )
        .unwrap();
        let encoded = request.encode();
        assert_eq!(encoded.len(), COOKIE_REQUEST_SIZE);
        assert_eq!(encoded[0], 24);

        // Responder answers
        let request = CookieRequest::decode(encoded).unwrap();
        assert_eq!(request.dht, *requester_dht.public());
        let plain = handle_cookie_request(&request, &responder_shared).unwrap();
        assert_eq!(plain.identity, *identity.public());
        assert_eq!(plain.number, 7);
        let response = create_cookie_response(
            &mut rng,
            &key,
            500,
            &plain,
            &request.dht,
            &responder_shared,
        )
        .unwrap();
        let encoded = response.encode();
        assert_eq!(encoded.len(), COOKIE_RESPONSE_SIZE);
        assert_eq!(encoded[0], 25);

        // Requester opens the response
        let response = CookieResponse::decode(encoded).unwrap();
        let cookie = handle_cookie_response(&response, &requester_shared, 7).unwrap();
        let opened = key.open(&cookie, 500).unwrap();
        assert_eq!(opened.identity, *identity.public());
        assert_eq!(opened.dht, *requester_dht.public());

        // A stale request number is rejected
        assert!(matches!(
            handle_cookie_response(&response, &requester_shared, 8),
            Err(Error::CookieNumberMismatch)
        ));
    }

    #[test]
    fn test_request_wrong_length() {
        let mut rng = StdRng::seed_from_u64(0);
        let dht = KeyPair::from_seed(1);
        let shared = SharedKey::random(&mut rng);
        let request =
            create_cookie_request(&mut rng, dht.public(), dht.public(), &shared, 1).unwrap();
        let encoded = request.encode();

        // Too short
        assert!(CookieRequest::decode(&encoded[..COOKIE_REQUEST_SIZE - 1]).is_err());

        // Too long
        let mut long = encoded.to_vec();
        long.push(0);
        assert!(matches!(
            CookieRequest::decode(long.as_slice()),
            Err(CodecError::ExtraData(1))
        ));

        // Wrong type
        let mut wrong = encoded.to_vec();
        wrong[0] = 25;
        assert!(CookieRequest::decode(wrong.as_slice()).is_err());
    }
}
