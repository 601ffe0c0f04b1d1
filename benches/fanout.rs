//! Fan-out and download framing benchmarks

use bytes::{Bytes, BytesMut};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use notchnet_core::core::device::{DeviceCommand, DeviceLink, SimulatedDevice};
use notchnet_core::core::download::DownloadFrameCodec;
use notchnet_core::core::fanout::{FanOutExecutor, FanOutRequest};
use notchnet_core::{DeviceAddress, DownloadFrame};
use std::hint::black_box;
use std::sync::Arc;
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;

fn requests(devices: &[Arc<SimulatedDevice>]) -> Vec<FanOutRequest> {
    devices
        .iter()
        .map(|d| FanOutRequest {
            address: d.address(),
            link: d.clone(),
            command: DeviceCommand::Connect,
        })
        .collect()
}

fn fanout_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    let executor = FanOutExecutor::default();
    let token = CancellationToken::new();

    let mut group = c.benchmark_group("fanout");
    for size in [1usize, 8, 64] {
        let devices: Vec<Arc<SimulatedDevice>> = (0..size)
            .map(|i| SimulatedDevice::standard(format!("B0:00:{i:02X}")))
            .collect();

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("connect", size), &devices, |b, devices| {
            b.to_async(&runtime).iter(|| async {
                let report = executor.execute(requests(devices), &token).await;
                black_box(report.is_ok())
            })
        });
    }
    group.finish();
}

fn framing_benchmark(c: &mut Criterion) {
    let payload = Bytes::from((0..512).map(|i| (i % 256) as u8).collect::<Vec<u8>>());

    let mut group = c.benchmark_group("download_frame");
    group.throughput(Throughput::Bytes(payload.len() as u64));

    group.bench_function("encode", |b| {
        b.iter(|| {
            let mut buf = BytesMut::new();
            DownloadFrameCodec
                .encode(
                    DownloadFrame {
                        address: DeviceAddress::new("C0:FF:EE:00:00:01"),
                        slot_index: 3,
                        payload: black_box(payload.clone()),
                    },
                    &mut buf,
                )
                .expect("encode");
            black_box(buf)
        })
    });

    group.finish();
}

criterion_group!(benches, fanout_benchmark, framing_benchmark);
criterion_main!(benches);
