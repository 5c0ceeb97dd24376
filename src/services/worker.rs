//! Decompression workers.
//!
//! Each [`DecompressionWorker`] lives on one dedicated OS thread for its whole
//! life. The dispatcher queues [`WorkerTask`]s onto that thread through a
//! single-slot channel, so a worker never runs more than one decode at a time
//! and the worker count is the hard concurrency ceiling.

use crate::context::IngestContext;
use crate::metrics::Metrics;
use crate::models::{
    BagError, BagHandle, BagRecord, DecodeFailurePolicy, SliceCompletion, SliceOutcome, TaskKind,
};
use crate::services::codec::SliceCodec;
use crate::services::dispatch::{AdmissionPermit, DispatchError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;
use tokio::sync::mpsc;

/// One unit of work queued onto a worker thread.
///
/// The admission permit travels with the task and is released when the worker
/// drops it after finishing, whatever the outcome.
pub struct WorkerTask {
    pub bag: BagHandle,
    pub generation: u64,
    pub kind: TaskKind,
    pub(crate) permit: AdmissionPermit,
}

/// What a single task invocation did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// A slice was taken off the queue and its result recorded
    Processed {
        slot: usize,
        index: usize,
        decoded: bool,
        completion: SliceCompletion,
    },
    /// The bag had no queued slice left
    NoWork,
    /// The slot was re-claimed after the task was dispatched
    Stale,
    /// Compression tasks are accepted but not implemented yet
    Skipped,
}

/// Stateless-per-task slice decoder bound to one worker thread.
///
/// The only state kept between tasks is a scratch buffer sized to one slice at
/// the configured resolution, allocated once when the worker is created.
pub struct DecompressionWorker {
    id: usize,
    codec: Arc<dyn SliceCodec>,
    metrics: Arc<Metrics>,
    policy: DecodeFailurePolicy,
    scratch: Vec<u8>,
}

impl DecompressionWorker {
    pub fn new(id: usize, ctx: &IngestContext) -> Self {
        Self {
            id,
            codec: Arc::clone(&ctx.codec),
            metrics: Arc::clone(&ctx.metrics),
            policy: ctx.config.decode_failure_policy,
            scratch: vec![0; ctx.config.slice_bytes()],
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Run one task against `bag`.
    pub fn execute(&mut self, bag: &BagRecord, generation: u64, kind: TaskKind) -> TaskOutcome {
        match kind {
            TaskKind::Decompression => self.decompress(bag, generation),
            TaskKind::Compression => {
                tracing::debug!(
                    "Worker {}: compression requested for slot {}, nothing to do",
                    self.id,
                    bag.slot()
                );
                TaskOutcome::Skipped
            }
        }
    }

    /// Decode the oldest queued slice of `bag` into its volume.
    ///
    /// The bag lock is held only to dequeue and to record the result, never
    /// across the codec call.
    fn decompress(&mut self, bag: &BagRecord, generation: u64) -> TaskOutcome {
        let slot = bag.slot();
        let slice = match bag.take_next_slice(generation) {
            Ok(Some(slice)) => slice,
            Ok(None) => {
                tracing::debug!("Worker {}: slot {} has no pending slice", self.id, slot);
                return TaskOutcome::NoWork;
            }
            Err(e) => {
                tracing::warn!("Worker {}: dropping task: {}", self.id, e);
                self.metrics.record_stale_task();
                return TaskOutcome::Stale;
            }
        };

        let index = slice.index();
        let start = Instant::now();
        let result = self.codec.decode(&mut self.scratch, slice.payload());
        drop(slice);

        let outcome = match result {
            Ok(written) => {
                self.metrics.record_slice_decoded(start.elapsed());
                SliceOutcome::Decoded(&self.scratch[..written.min(self.scratch.len())])
            }
            Err(e) => {
                tracing::warn!(
                    "Worker {}: slice {} of slot {} failed to decode: {}",
                    self.id,
                    index,
                    slot,
                    e
                );
                self.metrics.record_slice_failed();
                SliceOutcome::Failed { code: e.code() }
            }
        };
        let decoded = matches!(outcome, SliceOutcome::Decoded(_));

        let completion = match bag.complete_slice(generation, index, outcome, self.policy) {
            Ok(completion) => completion,
            Err(e @ BagError::StaleGeneration { .. }) => {
                tracing::warn!("Worker {}: discarding decoded slice: {}", self.id, e);
                self.metrics.record_stale_task();
                return TaskOutcome::Stale;
            }
            Err(e) => {
                bag.fail(&e.to_string());
                SliceCompletion::BagFailed
            }
        };

        match completion {
            SliceCompletion::Completed => self.metrics.record_bag_ready(),
            SliceCompletion::BagFailed => self.metrics.record_bag_failed(),
            SliceCompletion::InProgress { processed, total } => {
                tracing::debug!(
                    "Worker {}: slot {} slice {} done ({}/{})",
                    self.id,
                    slot,
                    index,
                    processed,
                    total
                );
            }
            SliceCompletion::Discarded => {}
        }

        TaskOutcome::Processed {
            slot,
            index,
            decoded,
            completion,
        }
    }
}

/// Dispatcher-side handle to a worker thread.
pub(crate) struct WorkerHandle {
    id: usize,
    // set by the dispatcher on hand-off, cleared by the worker before its permit drops
    assigned: Arc<AtomicBool>,
    tx: Mutex<Option<mpsc::Sender<WorkerTask>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    /// Move `worker` onto a new named thread and start its task loop
    pub(crate) fn spawn(worker: DecompressionWorker) -> Result<Self, DispatchError> {
        let id = worker.id();
        let (tx, mut rx) = mpsc::channel::<WorkerTask>(1);
        let assigned = Arc::new(AtomicBool::new(false));
        let assigned_flag = Arc::clone(&assigned);

        let thread = std::thread::Builder::new()
            .name(format!("bag-decoder-{}", id))
            .spawn(move || {
                tracing::debug!("Decompression worker {} started", id);
                let mut worker = worker;

                while let Some(task) = rx.blocking_recv() {
                    let WorkerTask {
                        bag,
                        generation,
                        kind,
                        permit,
                    } = task;
                    worker.execute(&bag, generation, kind);
                    assigned_flag.store(false, Ordering::Release);
                    drop(permit);
                }

                // Worker object goes before its thread finishes
                drop(worker);
                tracing::debug!("Decompression worker {} stopped", id);
            })
            .map_err(|source| DispatchError::WorkerSpawn { id, source })?;

        Ok(Self {
            id,
            assigned,
            tx: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// Mark the worker busy if it holds no task
    pub(crate) fn try_assign(&self) -> bool {
        self.assigned
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn is_assigned(&self) -> bool {
        self.assigned.load(Ordering::Acquire)
    }

    /// Queue `task` on the worker thread.
    ///
    /// Gives the task back when the worker has stopped.
    pub(crate) fn send(&self, task: WorkerTask) -> Result<(), WorkerTask> {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            self.assigned.store(false, Ordering::Release);
            return Err(task);
        };
        tx.try_send(task).map_err(|e| {
            self.assigned.store(false, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(task) | mpsc::error::TrySendError::Closed(task) => {
                    task
                }
            }
        })
    }

    /// Close the task channel and join the thread after its last task
    pub(crate) fn shutdown(&self) {
        self.tx.lock().take();
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                tracing::error!("Decompression worker {} panicked", self.id);
            }
        }
    }
}
