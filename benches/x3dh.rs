use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand_core::OsRng;
use signal_session::keys::{IdentityKeyPair, KeyPair};
use signal_session::registration::{generate_pre_keys, generate_signed_pre_key};
use signal_session::x3dh::{initiate, respond, PreKeyBundle, ResponderKeys};

struct Bob {
    identity: IdentityKeyPair,
    signed: KeyPair,
    one_time: KeyPair,
}

impl Bob {
    fn new() -> Self {
        Self {
            identity: IdentityKeyPair::generate(&mut OsRng),
            signed: KeyPair::generate(&mut OsRng),
            one_time: KeyPair::generate(&mut OsRng),
        }
    }

    fn bundle(&self) -> PreKeyBundle {
        PreKeyBundle {
            registration_id: 1,
            device_id: 1,
            pre_key: Some((1, *self.one_time.public_key())),
            signed_pre_key_id: 1,
            signed_pre_key: *self.signed.public_key(),
            signed_pre_key_signature: self
                .identity
                .sign(&mut OsRng, &self.signed.public_key().serialize()),
            identity_key: *self.identity.public_key(),
        }
    }

    fn keys(&self) -> ResponderKeys<'_> {
        ResponderKeys {
            identity: &self.identity,
            signed_pre_key: &self.signed,
            one_time_pre_key: Some(&self.one_time),
        }
    }
}

fn bench_key_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_generation");

    group.bench_function("identity_keypair", |b| {
        b.iter(|| black_box(IdentityKeyPair::generate(&mut OsRng)));
    });

    group.bench_function("signed_pre_key", |b| {
        let identity = IdentityKeyPair::generate(&mut OsRng);
        b.iter(|| black_box(generate_signed_pre_key(&mut OsRng, &identity, 1)));
    });

    group.finish();
}

fn bench_x3dh_handshake(c: &mut Criterion) {
    let mut group = c.benchmark_group("x3dh_handshake");

    let alice_identity = IdentityKeyPair::generate(&mut OsRng);
    let bob = Bob::new();
    let bundle = bob.bundle();

    group.bench_function("initiate", |b| {
        b.iter(|| black_box(initiate(&mut OsRng, &alice_identity, &bundle).unwrap()));
    });

    group.bench_function("respond", |b| {
        let init = initiate(&mut OsRng, &alice_identity, &bundle).unwrap();
        let keys = bob.keys();
        b.iter(|| black_box(respond(&keys, alice_identity.public_key(), &init.base_key).unwrap()));
    });

    group.bench_function("full_handshake", |b| {
        b.iter(|| {
            let alice = IdentityKeyPair::generate(&mut OsRng);
            let bob = Bob::new();

            let init = initiate(&mut OsRng, &alice, &bob.bundle()).unwrap();
            let response = respond(&bob.keys(), alice.public_key(), &init.base_key).unwrap();

            black_box((init, response))
        });
    });

    group.finish();
}

fn bench_signature_verification(c: &mut Criterion) {
    let mut group = c.benchmark_group("signature_verification");

    let bundle = Bob::new().bundle();
    group.bench_function("verify_bundle_signature", |b| {
        b.iter(|| black_box(bundle.verify_signature().unwrap()));
    });

    group.finish();
}

fn bench_pre_key_batches(c: &mut Criterion) {
    let mut group = c.benchmark_group("pre_key_generation");

    for count in [10, 50, 100, 500, 1000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| black_box(generate_pre_keys(&mut OsRng, 0, count)));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_key_generation,
    bench_x3dh_handshake,
    bench_signature_verification,
    bench_pre_key_batches
);

criterion_main!(benches);
