//! Key pairs, nonces and the box-style symmetric cipher shared by every packet type.
//!
//! Anything encrypted outside of the Noise handshake uses XChaCha20-Poly1305 keyed by a
//! [SharedKey]. A [SharedKey] is either random (cookie secrets), derived from an x25519 exchange
//! with HKDF-SHA512 (cookie request/response, legacy handshake, legacy session), or produced by
//! the Noise split.

use crate::Error;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::{rngs::StdRng, CryptoRng, Rng, SeedableRng};
use sha2::{Digest, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub use x25519_dalek::{PublicKey, StaticSecret};

/// Size of an x25519 public key.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of a symmetric key.
pub const SHARED_KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce.
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag.
pub const MAC_SIZE: usize = 16;

/// Size of a SHA-512 digest.
pub const SHA512_SIZE: usize = 64;

/// Info string for keys derived from a static x25519 exchange.
const BOX_INFO: &[u8] = b"peerwire/box/v1";

/// A long-term (or session) x25519 key pair.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh key pair.
    pub fn generate<R: Rng + CryptoRng>(rng: &mut R) -> Self {
        Self::from_secret(StaticSecret::random_from_rng(rng))
    }

    /// Wrap an existing secret key.
    pub fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Deterministically derive a key pair from `seed`.
    ///
    /// # Warning
    ///
    /// This is intended for tests and benchmarks only.
    pub fn from_seed(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        Self::generate(&mut rng)
    }

    /// The public half.
    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// The secret half.
    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

/// A 32-byte symmetric key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedKey([u8; SHARED_KEY_SIZE]);

impl SharedKey {
    /// Derive the key shared between `secret` and `public`.
    ///
    /// Both sides of the exchange derive the same key. Low-order public keys are rejected.
    pub fn derive(secret: &StaticSecret, public: &PublicKey) -> Result<Self, Error> {
        let shared = secret.diffie_hellman(public);
        if !shared.was_contributory() {
            return Err(Error::SharedSecretNotContributory);
        }
        let prk = Hkdf::<Sha512>::new(None, shared.as_bytes());
        let mut key = [0u8; SHARED_KEY_SIZE];
        prk.expand(BOX_INFO, &mut key)
            .map_err(|_| Error::HKDFExpansion)?;
        Ok(Self(key))
    }

    /// Generate a random key.
    pub fn random<R: Rng + CryptoRng>(rng: &mut R) -> Self {
        let mut key = [0u8; SHARED_KEY_SIZE];
        rng.fill_bytes(&mut key);
        Self(key)
    }

    /// Wrap raw key material.
    pub fn from_bytes(key: [u8; SHARED_KEY_SIZE]) -> Self {
        Self(key)
    }

    /// Encrypt `plaintext` under `nonce`. The output is `MAC_SIZE` bytes longer than the input.
    pub fn encrypt(&self, nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        XChaCha20Poly1305::new(Key::from_slice(&self.0))
            .encrypt(XNonce::from_slice(&nonce.0), plaintext)
            .map_err(|_| Error::EncryptionFailed)
    }

    /// Decrypt and authenticate `ciphertext` under `nonce`.
    pub fn decrypt(&self, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        XChaCha20Poly1305::new(Key::from_slice(&self.0))
            .decrypt(XNonce::from_slice(&nonce.0), ciphertext)
            .map_err(|_| Error::DecryptionFailed)
    }
}

impl PartialEq for SharedKey {
    fn eq(&self, other: &Self) -> bool {
        constant_time_eq(&self.0, &other.0)
    }
}

impl Eq for SharedKey {}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedKey(..)")
    }
}

/// A 24-byte nonce treated as a big-endian counter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// A uniformly random nonce.
    pub fn random<R: Rng + CryptoRng>(rng: &mut R) -> Self {
        let mut nonce = [0u8; NONCE_SIZE];
        rng.fill_bytes(&mut nonce);
        Self(nonce)
    }

    /// Wrap raw bytes.
    pub fn from_bytes(nonce: [u8; NONCE_SIZE]) -> Self {
        Self(nonce)
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    /// Add one to the counter (wrapping).
    pub fn increment(&mut self) {
        self.increment_by(1);
    }

    /// Add `n` to the counter (wrapping).
    pub fn increment_by(&mut self, n: u32) {
        let mut carry = n as u64;
        for byte in self.0.iter_mut().rev() {
            if carry == 0 {
                break;
            }
            let sum = *byte as u64 + (carry & 0xff);
            *byte = sum as u8;
            carry = (carry >> 8) + (sum >> 8);
        }
    }

    /// The two least-significant bytes of the counter.
    pub fn low_bits(&self) -> u16 {
        u16::from_be_bytes([self.0[NONCE_SIZE - 2], self.0[NONCE_SIZE - 1]])
    }
}

/// SHA-512 of `data`.
pub fn sha512(data: &[u8]) -> [u8; SHA512_SIZE] {
    let mut out = [0u8; SHA512_SIZE];
    out.copy_from_slice(&Sha512::digest(data));
    out
}

/// Compare two byte strings without short-circuiting on the first difference.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Encrypt `plaintext` to `peer` using our static `secret` (a "box").
pub fn encrypt_data(
    peer: &PublicKey,
    secret: &StaticSecret,
    nonce: &Nonce,
    plaintext: &[u8],
) -> Result<Vec<u8>, Error> {
    SharedKey::derive(secret, peer)?.encrypt(nonce, plaintext)
}

/// Open a box produced by [encrypt_data] on the other side.
pub fn decrypt_data(
    peer: &PublicKey,
    secret: &StaticSecret,
    nonce: &Nonce,
    ciphertext: &[u8],
) -> Result<Vec<u8>, Error> {
    SharedKey::derive(secret, peer)?.decrypt(nonce, ciphertext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_key_symmetric() {
        let alice = KeyPair::from_seed(0);
        let bob = KeyPair::from_seed(1);

        let ab = SharedKey::derive(alice.secret(), bob.public()).unwrap();
        let ba = SharedKey::derive(bob.secret(), alice.public()).unwrap();
        assert_eq!(ab, ba);

        // A third party derives something else
        let carol = KeyPair::from_seed(2);
        let cb = SharedKey::derive(carol.secret(), bob.public()).unwrap();
        assert_ne!(ab, cb);
    }

    #[test]
    fn test_shared_key_rejects_low_order_point() {
        let alice = KeyPair::from_seed(0);
        let identity = PublicKey::from([0u8; PUBLIC_KEY_SIZE]);
        let result = SharedKey::derive(alice.secret(), &identity);
        assert!(matches!(result, Err(Error::SharedSecretNotContributory)));
    }

    #[test]
    fn test_box() {
        let mut rng = StdRng::seed_from_u64(0);
        let alice = KeyPair::from_seed(0);
        let bob = KeyPair::from_seed(1);
        let nonce = Nonce::random(&mut rng);

        let ciphertext = encrypt_data(bob.public(), alice.secret(), &nonce, b"hello").unwrap();
        assert_eq!(ciphertext.len(), 5 + MAC_SIZE);
        let plaintext = decrypt_data(alice.public(), bob.secret(), &nonce, &ciphertext).unwrap();
        assert_eq!(plaintext, b"hello");

        // Wrong nonce
        let mut other = nonce;
        other.increment();
        let result = decrypt_data(alice.public(), bob.secret(), &other, &ciphertext);
        assert!(matches!(result, Err(Error::DecryptionFailed)));
    }

    #[test]
    fn test_nonce_increment_carries() {
        let mut bytes = [0u8; NONCE_SIZE];
        bytes[NONCE_SIZE - 1] = 0xff;
        bytes[NONCE_SIZE - 2] = 0xff;
        let mut nonce = Nonce::from_bytes(bytes);
        nonce.increment();

        let mut expected = [0u8; NONCE_SIZE];
        expected[NONCE_SIZE - 3] = 1;
        assert_eq!(nonce.as_bytes(), &expected);
        assert_eq!(nonce.low_bits(), 0);
    }

    #[test]
    fn test_nonce_increment_by() {
        let mut nonce = Nonce::default();
        nonce.increment_by(0x0001_0203);
        assert_eq!(&nonce.as_bytes()[NONCE_SIZE - 3..], &[1, 2, 3]);
        assert_eq!(nonce.low_bits(), 0x0203);

        // Wraps around the full width
        let mut nonce = Nonce::from_bytes([0xff; NONCE_SIZE]);
        nonce.increment_by(2);
        let mut expected = [0u8; NONCE_SIZE];
        expected[NONCE_SIZE - 1] = 1;
        assert_eq!(nonce.as_bytes(), &expected);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
