use criterion::{criterion_group, BatchSize, Criterion};
use peerwire_transport::{
    crypto::{Nonce, SharedKey},
    packet::{self, MAX_DATA_SIZE},
};

fn bench_seal_open(c: &mut Criterion) {
    let mut rng = super::rng();
    let key = SharedKey::random(&mut rng);
    let nonce = Nonce::random(&mut rng);
    for n in [16, 256, MAX_DATA_SIZE] {
        let mut data = vec![0u8; n];
        data[0] = 16;
        c.bench_function(&format!("{}/seal/n={}", module_path!(), n), |b| {
            b.iter(|| packet::seal(&mut rng, &key, &nonce, 0, 0, &data).unwrap())
        });
        c.bench_function(&format!("{}/open/n={}", module_path!(), n), |b| {
            b.iter_batched(
                || packet::seal(&mut rng, &key, &nonce, 0, 0, &data).unwrap(),
                |sealed| packet::open(&key, &nonce, &sealed).unwrap(),
                BatchSize::SmallInput,
            )
        });
    }
}

criterion_group!(benches, bench_seal_open);
