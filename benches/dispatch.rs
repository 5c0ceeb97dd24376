use bagstream::models::{BagState, WorkstationConfig};
use bagstream::services::{AcquisitionHandler, AcquisitionMode, DispatchService, PassthroughCodec};
use bagstream::IngestContext;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;
use tokio::sync::watch;

const SLICES: usize = 64;

fn bench_config(workers: usize) -> WorkstationConfig {
    let mut config = WorkstationConfig {
        slice_width: 256,
        slice_height: 64,
        worker_count: workers,
        dispatch_interval_ms: 1,
        ..WorkstationConfig::default()
    };
    config.pool_sizes.default = 4;
    config
}

fn drain_throughput(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();

    let mut group = c.benchmark_group("decode_bag");
    for workers in [1usize, 2, 4] {
        let config = bench_config(workers);
        group.throughput(Throughput::Bytes((config.slice_bytes() * SLICES) as u64));

        let ctx = IngestContext::new(config, Arc::new(PassthroughCodec)).unwrap();
        let dispatcher = DispatchService::start(ctx.clone()).unwrap();
        let producer = AcquisitionHandler::new(
            ctx.clone(),
            AcquisitionMode::Push,
            dispatcher.pending_signal(),
        );
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let sweeper = runtime.block_on(async { dispatcher.spawn_loop(cancel_rx) });
        let payload = vec![0x5au8; ctx.config.slice_bytes()];

        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, _| {
            b.iter(|| {
                let bag = producer
                    .ingest_bag("BENCH", 256, 64, vec![payload.clone(); SLICES])
                    .unwrap();
                runtime.block_on(async {
                    while bag.state() != BagState::ReadyToRender {
                        tokio::task::yield_now().await;
                    }
                });
                bag.mark_rendering().unwrap();
                bag.dispose().unwrap();
                black_box(bag.slot())
            })
        });

        let _ = cancel_tx.send(true);
        runtime.block_on(sweeper).unwrap();
        dispatcher.shutdown();
        ctx.destroy();
    }
    group.finish();
}

criterion_group!(benches, drain_throughput);
criterion_main!(benches);
