#![allow(clippy::unwrap_used, clippy::expect_used)] // Bench code: unwrap/expect are acceptable

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use iax2::ie::InfoElement;
use iax2::{Frame, FullFrame, IaxIeList, Subclass};

fn sample_new_frame() -> FullFrame {
    FullFrame {
        src_call: 100,
        dst_call: 200,
        retransmit: false,
        timestamp: 12_345,
        o_seq_no: 3,
        i_seq_no: 4,
        subclass: Subclass::New,
        ies: IaxIeList::new()
            .with(InfoElement::Version(2))
            .with(InfoElement::Username("alice".into()))
            .with(InfoElement::CallingNumber("1000".into()))
            .with(InfoElement::CalledNumber("2000".into()))
            .with(InfoElement::Capability(0x1c))
            .with(InfoElement::Format(0x04)),
        payload: Vec::new(),
    }
}

fn bench_full_frame_encode(c: &mut Criterion) {
    let frame = sample_new_frame();
    c.bench_function("full_frame_encode", |b| {
        b.iter(|| black_box(frame.encode()));
    });
}

fn bench_full_frame_decode(c: &mut Criterion) {
    let bytes = sample_new_frame().encode();
    c.bench_function("full_frame_decode", |b| {
        b.iter(|| black_box(FullFrame::decode(&bytes).expect("well-formed")));
    });
}

fn bench_mini_frame_round_trip(c: &mut Criterion) {
    let frame = iax2::MiniFrame {
        src_call: 55,
        timestamp16: 4_200,
        payload: vec![0u8; 160],
    };
    c.bench_function("mini_frame_round_trip", |b| {
        b.iter(|| {
            let bytes = frame.encode();
            black_box(Frame::decode(&bytes).expect("well-formed"))
        });
    });
}

criterion_group!(
    benches,
    bench_full_frame_encode,
    bench_full_frame_decode,
    bench_mini_frame_round_trip
);
criterion_main!(benches);
