//! Benchmark telegram framing.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use z3k_link::protocol::{checksum, Body, Telegram, TelegramCodec};

fn file_write() -> Telegram {
    Telegram::new(Body::FileWrite {
        handle: 3,
        offset: 4200,
        data: Bytes::from(vec![0xA5; 100]),
    })
    .with_addresses(0, 42)
}

fn bench_checksum(c: &mut Criterion) {
    let frame = vec![0x5Au8; 108];
    c.bench_function("checksum_108_bytes", |b| b.iter(|| checksum(black_box(&frame))));
}

fn bench_encode(c: &mut Criterion) {
    let codec = TelegramCodec::new();
    let telegram = file_write();
    c.bench_function("encode_file_write", |b| {
        b.iter(|| codec.encode_telegram(black_box(&telegram)).unwrap())
    });
}

fn bench_decode(c: &mut Criterion) {
    let codec = TelegramCodec::new();
    let bytes = codec.encode_telegram(&file_write()).unwrap();
    c.bench_function("decode_file_write", |b| {
        b.iter(|| codec.decode_datagram(black_box(&bytes)).unwrap())
    });
}

criterion_group!(benches, bench_checksum, bench_encode, bench_decode);
criterion_main!(benches);
