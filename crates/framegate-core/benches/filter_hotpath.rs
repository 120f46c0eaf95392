//! Per-packet admission cost.
//!
//! Measures:
//! - AdmissionFilter::decide() on pre-classified packets, passing and dropping
//! - EthernetRtpClassifier::classify() on a raw frame
//! - classify + decide together, as a packet hook would run them
//!
//! Run with: cargo bench --package framegate-core

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::net::Ipv4Addr;
use std::sync::Arc;

use framegate_core::classify::{
    frame, EthernetRtpClassifier, FlowMatch, PacketClassifier, PacketMeta, Protocol,
};
use framegate_core::filter::AdmissionFilter;
use framegate_core::state::{AdmissionState, SharedAdmissionState};

const DST: Ipv4Addr = Ipv4Addr::new(192, 168, 21, 104);
const PORT: u16 = 54343;

fn classifier() -> EthernetRtpClassifier {
    EthernetRtpClassifier::new(FlowMatch {
        protocol: Protocol::Udp,
        dst_addr: Some(DST),
        dst_port: PORT,
    })
}

fn bench_decide(c: &mut Criterion) {
    let mut group = c.benchmark_group("filter_decide");
    group.throughput(Throughput::Elements(1));

    let state = Arc::new(SharedAdmissionState::new(u64::MAX));
    let filter = AdmissionFilter::new(state.clone());
    let mid = PacketMeta::target(1200, false);
    let boundary = PacketMeta::target(1200, true);
    let mut i = 0u32;
    group.bench_function("passing", |b| {
        b.iter(|| {
            i = i.wrapping_add(1);
            let pkt = if i % 10 == 0 { &boundary } else { &mid };
            black_box(filter.decide(black_box(pkt)))
        })
    });

    let state = Arc::new(SharedAdmissionState::new(0));
    let filter = AdmissionFilter::new(state.clone());
    state.set_drop_in_progress(true);
    state.add_window_bytes(1_000_000);
    group.bench_function("dropping", |b| {
        b.iter(|| black_box(filter.decide(black_box(&boundary))))
    });

    let bypass = PacketMeta::bypass(1200);
    group.bench_function("bypass", |b| {
        b.iter(|| black_box(filter.decide(black_box(&bypass))))
    });

    group.finish();
}

fn bench_classify(c: &mut Criterion) {
    let mut group = c.benchmark_group("classify");
    group.throughput(Throughput::Elements(1));

    let classifier = classifier();
    let ours = frame::udp_rtp(DST, PORT, true, 1200);
    let theirs = frame::udp_rtp(DST, PORT + 1, false, 1200);

    group.bench_function("target_flow", |b| {
        b.iter(|| black_box(classifier.classify(black_box(&ours))))
    });
    group.bench_function("other_flow", |b| {
        b.iter(|| black_box(classifier.classify(black_box(&theirs))))
    });
    group.finish();
}

fn bench_admit(c: &mut Criterion) {
    let mut group = c.benchmark_group("admit");
    group.throughput(Throughput::Elements(1));

    let classifier = classifier();
    let filter = AdmissionFilter::new(Arc::new(SharedAdmissionState::new(u64::MAX)));
    let packet = frame::udp_rtp(DST, PORT, false, 1200);
    group.bench_function("classify_and_decide", |b| {
        b.iter(|| black_box(filter.admit(&classifier, black_box(&packet))))
    });
    group.finish();
}

criterion_group!(benches, bench_decide, bench_classify, bench_admit);
criterion_main!(benches);
