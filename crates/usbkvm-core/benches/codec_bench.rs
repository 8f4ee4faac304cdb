//! Criterion benchmarks for the hot codec paths.
//!
//! The keyboard report builder runs once per keystroke and the reply
//! accumulator once per serial read; both should stay comfortably in the
//! tens-of-nanoseconds range.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use usbkvm_core::protocol::codec;
use usbkvm_core::ReplyAccumulator;

fn bench_keyboard_report(c: &mut Criterion) {
    let slots = [0x04u8, 0x05, 0x06, 0x00, 0x00, 0x00];
    c.bench_function("keyboard_report", |b| {
        b.iter(|| codec::keyboard_report(black_box(0x02), black_box(&slots)))
    });
}

fn bench_mouse_absolute(c: &mut Criterion) {
    c.bench_function("mouse_absolute", |b| {
        b.iter(|| codec::mouse_absolute(black_box(0x01), black_box(0x8000), black_box(0x4000)))
    });
}

fn bench_reply_decode(c: &mut Criterion) {
    // A success reply for the keyboard command with a one-byte payload.
    let mut frame = vec![0x57u8, 0xAB, 0x00, 0x82, 0x01, 0x00];
    frame.push(codec::checksum(&frame));

    c.bench_function("reply_decode", |b| {
        b.iter(|| {
            let mut acc = ReplyAccumulator::new();
            acc.extend(black_box(&frame));
            acc.try_decode(black_box(0x02)).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_keyboard_report,
    bench_mouse_absolute,
    bench_reply_decode
);
criterion_main!(benches);
