use super::{cookie, payload, rng, NOW};
use criterion::{criterion_group, Criterion};
use peerwire_transport::{cookie::CookieKey, crypto::KeyPair, handshake::noise};

fn bench_noise(c: &mut Criterion) {
    let mut rng = rng();
    let initiator = KeyPair::from_seed(0);
    let initiator_cookies = CookieKey::new(&mut rng, 15);
    let responder = KeyPair::from_seed(1);
    let responder_cookies = CookieKey::new(&mut rng, 15);

    c.bench_function(&format!("{}/noise", module_path!()), |b| {
        b.iter(|| {
            let outer = cookie(&mut rng, &responder_cookies, &initiator);
            let reply = cookie(&mut rng, &initiator_cookies, &responder);
            let sent = payload(&mut rng, &outer, reply);
            let (state, initiation) =
                noise::Initiator::new(&mut rng, &initiator, responder.public(), outer, &sent)
                    .unwrap();

            let (answer, peer) =
                noise::Responder::read(&responder, &responder_cookies, NOW, &initiation).unwrap();
            let other = cookie(&mut rng, &responder_cookies, &initiator);
            let answered = payload(&mut rng, &peer.other_cookie, other);
            let (response, _) = answer.respond(&mut rng, reply, &answered).unwrap();
            state
                .finish(&initiator, &initiator_cookies, NOW, &response)
                .unwrap()
        })
    });
}

criterion_group!(benches, bench_noise);
