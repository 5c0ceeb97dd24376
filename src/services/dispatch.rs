//! Bounded-concurrency dispatch of slice decompression.
//!
//! The [`DispatchService`] owns `W` decompression worker threads and an admission
//! semaphore with `W` permits. Each sweep walks the pool in slot order and, for
//! every bag in CONSTRUCTION with an unreserved queued slice, takes one permit and
//! hands one slice to an idle worker.
//!
//! Taking a permit is the sweep's only blocking point. When all workers are busy
//! the sweep stalls until one finishes, which throttles ingestion to what the
//! workers can decode.
//!
//! A stuck codec call keeps its worker and permit indefinitely; there is no
//! per-slice timeout, so effective concurrency drops to `W - 1` until it returns.

use crate::context::IngestContext;
use crate::metrics::Metrics;
use crate::models::{BagHandle, BagState, TaskKind};
use crate::services::worker::{DecompressionWorker, WorkerHandle, WorkerTask};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, watch};
use tokio::time::MissedTickBehavior;

/// Errors raised by the dispatch service
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("dispatch service is shutting down")]
    ShuttingDown,

    #[error("failed to spawn decompression worker {id}: {source}")]
    WorkerSpawn {
        id: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("no idle decompression worker available")]
    NoIdleWorker,

    #[error("decompression worker {0} has stopped")]
    WorkerStopped(usize),

    #[error("slot {0} has no pending slice to decompress")]
    NothingToDo(usize),
}

/// Admission permit held for the lifetime of one dispatched task.
///
/// Dropping it returns the permit to the semaphore and counts the release, so a
/// permit cannot leak whichever way the task ends.
pub(crate) struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
    metrics: Arc<Metrics>,
}

impl AdmissionPermit {
    fn new(permit: OwnedSemaphorePermit, metrics: Arc<Metrics>) -> Self {
        metrics.record_permit_acquired();
        Self {
            _permit: permit,
            metrics,
        }
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.metrics.record_permit_released();
    }
}

/// Fixed worker pool plus admission control for slice decompression.
///
/// # Usage
///
/// ```ignore
/// let service = DispatchService::start(ctx.clone())?;
/// let (cancel_tx, cancel_rx) = watch::channel(false);
/// let sweeper = service.spawn_loop(cancel_rx);
///
/// // ... producers call service.notify_pending() after enqueueing slices ...
///
/// cancel_tx.send(true)?;
/// sweeper.await?;
/// service.shutdown();
/// ```
pub struct DispatchService {
    ctx: IngestContext,
    admission: Arc<Semaphore>,
    workers: Box<[WorkerHandle]>,
    cursor: AtomicUsize,
    pending: Arc<Notify>,
    accepting: AtomicBool,
}

impl DispatchService {
    /// Spawn `worker_count` decompression threads and open admission.
    ///
    /// Threads already started are stopped again if a later one fails to spawn.
    pub fn start(ctx: IngestContext) -> Result<Arc<Self>, DispatchError> {
        let worker_count = ctx.config.worker_count;
        let mut workers = Vec::with_capacity(worker_count);

        for id in 0..worker_count {
            match WorkerHandle::spawn(DecompressionWorker::new(id, &ctx)) {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    tracing::error!("Failed to start decompression workers: {}", e);
                    for worker in &workers {
                        worker.shutdown();
                    }
                    return Err(e);
                }
            }
        }

        tracing::info!(
            "Dispatch service started with {} workers over {} slots",
            worker_count,
            ctx.pool.slot_count()
        );

        Ok(Arc::new(Self {
            admission: Arc::new(Semaphore::new(worker_count)),
            workers: workers.into_boxed_slice(),
            cursor: AtomicUsize::new(0),
            pending: Arc::new(Notify::new()),
            accepting: AtomicBool::new(true),
            ctx,
        }))
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Permits not currently held by a dispatched task
    pub fn available_permits(&self) -> usize {
        self.admission.available_permits()
    }

    /// Workers currently holding a task
    pub fn busy_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.is_assigned()).count()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Wake the sweep loop because new slices were queued
    pub fn notify_pending(&self) {
        self.pending.notify_one();
    }

    /// Signal producers use to wake the sweep loop without holding the service
    pub fn pending_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.pending)
    }

    /// Run one sweep over the pool.
    ///
    /// Dispatches at most one slice per bag, visiting slots in index order. Blocks
    /// while all workers are busy.
    ///
    /// # Returns
    /// The number of tasks handed to workers
    pub async fn drain_queue(&self) -> Result<usize, DispatchError> {
        if !self.is_accepting() {
            return Err(DispatchError::ShuttingDown);
        }

        let mut dispatched = 0;
        for index in 0..self.ctx.pool.slot_count() {
            let Some(bag) = self.ctx.pool.get_by_index(index) else {
                continue;
            };
            if bag.state() != BagState::Construction || !bag.has_unreserved_work() {
                continue;
            }

            let permit = self.acquire_permit().await?;

            // Re-check under the bag lock; the bag may have changed while we waited
            let Some(generation) = bag.try_reserve() else {
                continue;
            };
            self.hand_off(bag, generation, TaskKind::Decompression, permit)?;
            dispatched += 1;
        }

        Ok(dispatched)
    }

    /// Dispatch a single task of `kind` for `bag` outside the regular sweep.
    pub async fn submit(&self, bag: BagHandle, kind: TaskKind) -> Result<(), DispatchError> {
        if !self.is_accepting() {
            return Err(DispatchError::ShuttingDown);
        }

        let permit = self.acquire_permit().await?;
        let generation = match kind {
            TaskKind::Decompression => bag
                .try_reserve()
                .ok_or(DispatchError::NothingToDo(bag.slot()))?,
            TaskKind::Compression => bag.generation(),
        };
        self.hand_off(bag, generation, kind, permit)
    }

    /// Wait until every dispatched task has finished.
    pub async fn wait_idle(&self) -> Result<(), DispatchError> {
        let _all = self
            .admission
            .acquire_many(self.workers.len() as u32)
            .await
            .map_err(|_| DispatchError::ShuttingDown)?;
        Ok(())
    }

    /// Sweep on every pending-work signal and dispatch tick until `cancel` turns
    /// true or its sender goes away.
    ///
    /// Cancellation also interrupts a sweep parked on admission, so a hung codec
    /// holding every permit cannot keep the loop alive.
    pub async fn run(self: Arc<Self>, mut cancel: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.ctx.config.dispatch_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!("Dispatch loop running");
        'outer: loop {
            tokio::select! {
                changed = cancel.changed() => {
                    if is_cancelled(changed, &cancel) {
                        break;
                    }
                }
                _ = self.pending.notified() => {}
                _ = ticker.tick() => {}
            }

            // Keep sweeping while sweeps find work
            loop {
                let sweep = tokio::select! {
                    biased;
                    changed = cancel.changed() => {
                        if is_cancelled(changed, &cancel) {
                            tracing::debug!("Sweep interrupted by cancellation");
                            break 'outer;
                        }
                        continue;
                    }
                    sweep = self.drain_queue() => sweep,
                };

                match sweep {
                    Ok(0) => break,
                    Ok(count) => {
                        tracing::trace!("Dispatch sweep handed out {} tasks", count);
                        tokio::task::yield_now().await;
                    }
                    Err(DispatchError::ShuttingDown) => {
                        tracing::info!("Dispatch loop stopped by shutdown");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!("Dispatch sweep failed: {}", e);
                        break;
                    }
                }
            }
        }
        tracing::info!("Dispatch loop cancelled");
    }

    /// Start [`run`](Self::run) on the current tokio runtime
    pub fn spawn_loop(self: &Arc<Self>, cancel: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(cancel))
    }

    /// Stop dispatching, let each worker finish its current task, then join the
    /// worker threads. Safe to call more than once.
    pub fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Shutting down dispatch service");

        // Wakes any sweep blocked on admission
        self.admission.close();
        for worker in self.workers.iter() {
            worker.shutdown();
        }

        tracing::info!(
            "Dispatch service stopped ({} permits outstanding)",
            self.ctx.metrics.permits_outstanding()
        );
    }

    async fn acquire_permit(&self) -> Result<AdmissionPermit, DispatchError> {
        let permit = Arc::clone(&self.admission)
            .acquire_owned()
            .await
            .map_err(|_| DispatchError::ShuttingDown)?;
        Ok(AdmissionPermit::new(permit, Arc::clone(&self.ctx.metrics)))
    }

    /// Pick the next idle worker in round-robin order.
    ///
    /// A caller holding a permit always finds one: workers clear their busy flag
    /// before releasing their own permit.
    fn select_worker(&self) -> Option<&WorkerHandle> {
        let count = self.workers.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % count;
        (0..count)
            .map(|offset| &self.workers[(start + offset) % count])
            .find(|worker| worker.try_assign())
    }

    fn hand_off(
        &self,
        bag: BagHandle,
        generation: u64,
        kind: TaskKind,
        permit: AdmissionPermit,
    ) -> Result<(), DispatchError> {
        let Some(worker) = self.select_worker() else {
            if kind == TaskKind::Decompression {
                bag.cancel_reservation(generation);
            }
            return Err(DispatchError::NoIdleWorker);
        };

        let slot = bag.slot();
        let task = WorkerTask {
            bag,
            generation,
            kind,
            permit,
        };
        if let Err(task) = worker.send(task) {
            if kind == TaskKind::Decompression {
                task.bag.cancel_reservation(generation);
            }
            return Err(DispatchError::WorkerStopped(worker.id()));
        }

        self.ctx.metrics.record_dispatch();
        tracing::debug!(
            "Dispatched {} of slot {} to worker {}",
            kind,
            slot,
            worker.id()
        );
        Ok(())
    }
}

impl Drop for DispatchService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn is_cancelled(
    changed: Result<(), watch::error::RecvError>,
    cancel: &watch::Receiver<bool>,
) -> bool {
    changed.is_err() || *cancel.borrow()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BagDimensions, SliceBuffer, WorkstationConfig};
    use crate::services::codec::PassthroughCodec;

    fn context(workers: usize, slots: usize) -> IngestContext {
        let mut config = WorkstationConfig {
            slice_width: 2,
            slice_height: 1,
            worker_count: workers,
            ..WorkstationConfig::default()
        };
        config.pool_sizes.default = slots;
        IngestContext::new(config, Arc::new(PassthroughCodec)).unwrap()
    }

    #[test]
    fn test_start_spawns_workers() {
        let ctx = context(3, 2);
        let service = DispatchService::start(ctx).unwrap();

        assert_eq!(service.worker_count(), 3);
        assert_eq!(service.available_permits(), 3);
        assert_eq!(service.busy_workers(), 0);
        service.shutdown();
    }

    #[test]
    fn test_select_worker_round_robin() {
        let ctx = context(3, 1);
        let service = DispatchService::start(ctx).unwrap();

        let first = service.select_worker().unwrap().id();
        let second = service.select_worker().unwrap().id();
        let third = service.select_worker().unwrap().id();
        assert_eq!((first, second, third), (0, 1, 2));

        // Every worker is now marked busy
        assert!(service.select_worker().is_none());
        service.shutdown();
    }

    #[test]
    fn test_wait_idle_without_tasks() {
        let ctx = context(2, 1);
        let service = DispatchService::start(ctx).unwrap();

        tokio_test::assert_ok!(tokio_test::block_on(service.wait_idle()));
        // Quiescing gives every permit back
        assert_eq!(service.available_permits(), 2);
        service.shutdown();
    }

    #[tokio::test]
    async fn test_drain_skips_bags_without_work() {
        let ctx = context(1, 2);
        ctx.pool
            .claim_slot("IDLE", BagDimensions::new(2, 1, 1))
            .unwrap();
        let service = DispatchService::start(ctx).unwrap();

        assert_eq!(service.drain_queue().await.unwrap(), 0);
        assert_eq!(service.available_permits(), 1);
        service.shutdown();
    }

    #[tokio::test]
    async fn test_drain_after_shutdown_is_rejected() {
        let ctx = context(1, 1);
        let service = DispatchService::start(ctx).unwrap();
        service.shutdown();

        assert!(matches!(
            service.drain_queue().await,
            Err(DispatchError::ShuttingDown)
        ));
        assert!(!service.is_accepting());
    }

    #[tokio::test]
    async fn test_submit_compression_completes() {
        let ctx = context(1, 1);
        let bag = ctx
            .pool
            .claim_slot("BAG-1", BagDimensions::new(2, 1, 1))
            .unwrap();
        bag.enqueue_slice(SliceBuffer::new(0, vec![7; 4])).unwrap();
        let service = DispatchService::start(ctx.clone()).unwrap();

        service.submit(bag.clone(), TaskKind::Compression).await.unwrap();
        service.wait_idle().await.unwrap();

        // Compression leaves the queue untouched
        assert_eq!(bag.pending_slices(), 1);
        assert_eq!(ctx.metrics.permits_outstanding(), 0);
        service.shutdown();
    }

    #[tokio::test]
    async fn test_submit_decompression_without_work() {
        let ctx = context(1, 1);
        let bag = ctx.pool.get_by_index(0).unwrap();
        let service = DispatchService::start(ctx.clone()).unwrap();

        let err = service
            .submit(bag, TaskKind::Decompression)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NothingToDo(0)));
        assert_eq!(service.available_permits(), 1);
        assert_eq!(ctx.metrics.permits_outstanding(), 0);
        service.shutdown();
    }
}
