use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use ipbus_protocol::{
    ByteOrder, Operation, Packet, PacketHeader, Request,
    link::{LinkDecoder, encode_frame},
};

fn block_write(words: u32) -> Request {
    Request::new(
        1,
        Operation::Write {
            address: 0x1000_0000,
            data: (0..words).map(|i| 0x5050_50bc ^ i).collect(),
        },
    )
}

fn packet_encoding(c: &mut Criterion) {
    let packet = Packet::new(
        PacketHeader::control(0),
        (0..16).map(|_| block_write(255).to_frame()).collect(),
    );
    let mut encoded = Vec::new();
    packet.encode(ByteOrder::Big, &mut encoded);

    c.bench_function("encode packet", |b| {
        b.iter(|| {
            let mut out = Vec::with_capacity(encoded.len());
            black_box(&packet).encode(ByteOrder::Big, &mut out);
            out
        })
    });
    c.bench_function("decode packet", |b| {
        b.iter(|| Packet::decode(black_box(&encoded)))
    });
}

fn link_encoding(c: &mut Criterion) {
    let frame = block_write(255).to_frame();
    let mut encoded = Vec::new();
    encode_frame(&frame, &mut encoded);

    c.bench_function("encode link frame", |b| {
        b.iter(|| {
            let mut out = Vec::with_capacity(encoded.len());
            encode_frame(black_box(&frame), &mut out);
            out
        })
    });
    c.bench_function("decode link frame", |b| {
        b.iter(|| LinkDecoder::default().decode(black_box(&encoded)))
    });
}

criterion_group!(benches, packet_encoding, link_encoding);
criterion_main!(benches);
