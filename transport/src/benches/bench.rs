use criterion::criterion_main;
use peerwire_transport::{
    cookie::{Cookie, CookieContents, CookieKey},
    crypto::{KeyPair, Nonce},
    handshake::Payload,
};
use rand::{rngs::StdRng, SeedableRng};

mod handshake;
mod packet;

/// Seconds at which every cookie is minted and opened.
const NOW: u64 = 1_000;

/// A cookie minted by `key` for `identity`.
fn cookie(rng: &mut StdRng, key: &CookieKey, identity: &KeyPair) -> Cookie {
    key.create(
        rng,
        NOW,
        &CookieContents {
            identity: *identity.public(),
            dht: *KeyPair::from_seed(100).public(),
        },
    )
    .unwrap()
}

/// The payload of a message wrapped in `outer`.
fn payload(rng: &mut StdRng, outer: &Cookie, other: Cookie) -> Payload {
    Payload::new(Nonce::random(rng), outer, other)
}

fn rng() -> StdRng {
    StdRng::seed_from_u64(0)
}

criterion_main!(handshake::benches, packet::benches);
