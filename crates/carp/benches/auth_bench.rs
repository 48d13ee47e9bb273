use carp::{Advertisement, AuthEngine, verify_checksum};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::net::{IpAddr, Ipv4Addr};

fn addresses(count: u8) -> Vec<IpAddr> {
    (1..=count)
        .map(|n| IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)))
        .collect()
}

fn auth_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("auth");

    for count in [1u8, 8, 64] {
        let addrs = addresses(count);
        group.bench_with_input(BenchmarkId::new("prepare", count), &addrs, |b, addrs| {
            b.iter(|| black_box(AuthEngine::prepare(b"secret", 1, addrs.iter())))
        });
    }

    // Per-packet cost only depends on the counter once the engine is prepared
    let engine = AuthEngine::prepare(b"secret", 1, addresses(8).iter());
    group.bench_function("generate", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter = counter.wrapping_add(1);
            black_box(engine.generate(counter))
        })
    });

    let digest = engine.generate(42);
    group.bench_function("verify", |b| {
        b.iter(|| black_box(engine.verify(black_box(42), &digest)))
    });

    group.finish();
}

fn codec_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    let advert = Advertisement::new(1, 1, 100, 0x0102_0304_0506_0708, [0xab; 20]);
    let wire = advert.encode();

    group.bench_function("encode", |b| b.iter(|| black_box(advert.encode())));
    group.bench_function("decode", |b| {
        b.iter(|| black_box(Advertisement::decode(black_box(&wire))))
    });
    group.bench_function("verify_checksum", |b| {
        b.iter(|| black_box(verify_checksum(black_box(&wire))))
    });

    group.finish();
}

criterion_group!(benches, auth_benchmark, codec_benchmark);
criterion_main!(benches);
