//! Criterion benchmarks for Kestrel crypto: seed-to-master, path derivation, signing, verification.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use kestrel_core::DerivationPath;
use kestrel_crypto::{sha256, sign, verify, ExtendedPrivateKey, Seed};

fn seed() -> Seed {
    Seed::from_bytes(&[0x5a; 32]).unwrap()
}

fn bench_master(c: &mut Criterion) {
    let seed = seed();
    let mut g = c.benchmark_group("master");
    g.throughput(Throughput::Elements(1));
    g.bench_function("from_seed", |b| {
        b.iter(|| black_box(ExtendedPrivateKey::from_seed(&seed)).unwrap());
    });
    g.finish();
}

fn bench_derive(c: &mut Criterion) {
    let master = ExtendedPrivateKey::from_seed(&seed()).unwrap();
    let full: DerivationPath = "m/84'/0'/0'/0/5".parse().unwrap();
    let account = master.derive_path(&"m/84'/0'/0'".parse().unwrap()).unwrap();
    let xpub = account.to_extended_public();
    let relative: DerivationPath = "m/0/5".parse().unwrap();

    let mut g = c.benchmark_group("derive");
    g.throughput(Throughput::Elements(1));
    g.bench_function("private_bip84_address", |b| {
        b.iter(|| black_box(master.derive_path(&full)).unwrap());
    });
    g.bench_function("public_from_account_xpub", |b| {
        b.iter(|| black_box(xpub.derive_path(&relative)).unwrap());
    });
    g.finish();
}

fn bench_sign_verify(c: &mut Criterion) {
    let key = ExtendedPrivateKey::from_seed(&seed()).unwrap();
    let hash = sha256(b"kestrel bench");
    let sig = sign(&key, &hash).unwrap();

    let mut g = c.benchmark_group("ecdsa");
    g.throughput(Throughput::Elements(1));
    g.bench_function("sign_rfc6979", |b| {
        b.iter(|| black_box(sign(&key, &hash)).unwrap());
    });
    g.bench_function("verify", |b| {
        b.iter(|| black_box(verify(key.public_key(), &hash, &sig)));
    });
    g.finish();
}

criterion_group!(benches, bench_master, bench_derive, bench_sign_verify);
criterion_main!(benches);
