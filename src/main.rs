//! bagstream - bag ingestion and slice decompression core
//!
//! Main entry point for the standalone ingestion runner.
//!
//! # Overview
//!
//! Without a scanner attached, the binary drives the pipeline with synthetic
//! bags so throughput and pool behaviour can be observed end to end:
//! - Logging infrastructure (file rotation + console output)
//! - Workstation configuration ([`ConfigManager`])
//! - Tokio runtime hosting the dispatch loop, the producer and the consumer
//! - A fixed set of `bag-decoder-N` threads owned by the dispatch service
//!
//! # Execution Flow
//!
//! 1. Load `config/workstation.yaml` (defaults if missing)
//! 2. Initialize logging -> logs/bagstream.<date>
//! 3. Build the [`IngestContext`] with the passthrough codec
//! 4. Start the dispatch service and its sweep loop
//! 5. Feed `BAGS` synthetic bags (first CLI argument, default 8) and render each
//!    one as it becomes ready
//! 6. On completion or Ctrl-C: stop the sweep, wait for workers, join threads,
//!    release the pool and log a metrics summary

use anyhow::{Context, Result};
use bagstream::models::BagError;
use bagstream::services::{
    AcquisitionHandler, AcquisitionMode, DispatchService, PassthroughCodec, RenderConsumer,
};
use bagstream::{APP_NAME, ConfigManager, IngestContext, VERSION};
use camino::Utf8Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const DEFAULT_BAG_COUNT: usize = 8;
const SLICES_PER_BAG: usize = 16;
const METRICS_INTERVAL: Duration = Duration::from_secs(10);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    let bag_count = match std::env::args().nth(1) {
        Some(arg) => arg
            .parse::<usize>()
            .with_context(|| format!("Invalid bag count: {}", arg))?,
        None => DEFAULT_BAG_COUNT,
    };

    let config_manager = ConfigManager::new("config")?;
    let config = config_manager.load_workstation_config()?;

    let _guard = bagstream::logging::setup_logging_with_console(
        Utf8Path::new("logs"),
        APP_NAME,
        config.debug_mode,
        true,
    )?;

    tracing::info!("Starting {} v{}", APP_NAME, VERSION);
    tracing::info!("Using config from {}", config_manager.workstation_config_path());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .thread_name("bagstream-rt")
        .build()?;

    let ctx = IngestContext::new(config, Arc::new(PassthroughCodec))?;
    let dispatcher = DispatchService::start(ctx.clone())?;

    let result = runtime.block_on(run(ctx.clone(), Arc::clone(&dispatcher), bag_count));

    // Joins decoder threads; must not run on a runtime thread
    dispatcher.shutdown();
    runtime.shutdown_timeout(Duration::from_secs(5));
    ctx.destroy();

    tracing::info!("Shutdown complete");
    result
}

async fn run(ctx: IngestContext, dispatcher: Arc<DispatchService>, bag_count: usize) -> Result<()> {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let sweeper = dispatcher.spawn_loop(cancel_rx);

    let producer = {
        let handler = AcquisitionHandler::new(
            ctx.clone(),
            AcquisitionMode::Push,
            dispatcher.pending_signal(),
        );
        let ctx = ctx.clone();
        tokio::spawn(async move { feed_synthetic_bags(&ctx, &handler, bag_count).await })
    };

    let consumer = RenderConsumer::new(&ctx);
    let mut events = ctx.events.subscribe();
    let mut metrics_tick = tokio::time::interval(METRICS_INTERVAL);
    let mut rendered = 0;

    while rendered < bag_count {
        tokio::select! {
            bag = consumer.wait_next_bag(&mut events) => {
                let Some(bag) = bag? else {
                    tracing::warn!("Event bus closed before all bags were rendered");
                    break;
                };
                let checksum = bag.read_volume(|voxels| {
                    voxels.iter().fold(0u64, |acc, &b| acc.wrapping_add(u64::from(b)))
                });
                rendered += 1;
                tracing::info!(
                    "Rendered {}/{}: bag {} from slot {} (checksum {:#x})",
                    rendered,
                    bag_count,
                    bag.bag_id(),
                    bag.slot(),
                    checksum
                );
            }
            _ = metrics_tick.tick() => ctx.metrics.log_periodic(),
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("Interrupted, stopping ingestion");
                break;
            }
        }
    }
    consumer.finish()?;

    producer.abort();
    let _ = cancel_tx.send(true);
    sweeper.await.context("Dispatch loop task failed")?;

    if tokio::time::timeout(DRAIN_TIMEOUT, dispatcher.wait_idle())
        .await
        .is_err()
    {
        tracing::warn!(
            "{} decoder(s) still busy after {:?}",
            dispatcher.busy_workers(),
            DRAIN_TIMEOUT
        );
    }

    Ok(())
}

/// Push `bag_count` bags of `SLICES_PER_BAG` slices through `handler`, waiting
/// for a slot whenever the pool is full.
async fn feed_synthetic_bags(ctx: &IngestContext, handler: &AcquisitionHandler, bag_count: usize) {
    let width = ctx.config.slice_width;
    let height = ctx.config.slice_height;
    let slice_bytes = ctx.config.slice_bytes();

    for n in 0..bag_count {
        let bag_id = format!("SYN-{:05}", n);
        let slot = loop {
            match handler.claim_slot(&bag_id, width, height, SLICES_PER_BAG) {
                Ok(slot) => break slot,
                Err(BagError::NoFreeSlot) => {
                    tokio::time::sleep(ctx.config.dispatch_interval()).await;
                }
                Err(e) => {
                    tracing::error!("Producer stopped: {}", e);
                    return;
                }
            }
        };

        for index in 0..SLICES_PER_BAG {
            let payload = vec![(n + index) as u8; slice_bytes];
            if let Err(e) = handler.enqueue_slice(slot, index, payload) {
                handler.abort(slot, &e.to_string());
                break;
            }
            // Slices trickle in from the detector
            tokio::task::yield_now().await;
        }
    }
    tracing::info!("Producer finished after {} bags", bag_count);
}
