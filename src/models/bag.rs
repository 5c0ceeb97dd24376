use crate::events::{BagEvent, EventBus};
use crate::models::config::{BYTES_PER_SAMPLE, DecodeFailurePolicy};
use crate::models::slice::SliceBuffer;
use bitflags::bitflags;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;
use thiserror::Error;

/// Lifecycle state of a bag slot.
///
/// ```text
/// EMPTY -> INITIALISED -> CONSTRUCTION -> READYTORENDER -> RENDERING -> DISPOSED
///   ^                                                                      |
///   +------------------------------ reset ---------------------------------+
/// any state -> ERROR -> reset -> EMPTY
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BagState {
    Empty,
    Initialised,
    Construction,
    ReadyToRender,
    Rendering,
    Disposed,
    Error,
}

impl BagState {
    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(self, next: BagState) -> bool {
        use BagState::*;
        matches!(
            (self, next),
            (_, Error)
                | (Empty, Initialised)
                | (Initialised, Construction)
                | (Construction, Construction)
                | (Construction, ReadyToRender)
                | (ReadyToRender, Rendering)
                | (Rendering, Disposed)
                | (Disposed, Empty)
                | (Error, Empty)
        )
    }

    /// A producer may claim a slot in this state
    pub fn is_reusable(self) -> bool {
        BagStateMask::REUSABLE.matches(self)
    }

    pub fn mask(self) -> BagStateMask {
        match self {
            BagState::Empty => BagStateMask::EMPTY,
            BagState::Initialised => BagStateMask::INITIALISED,
            BagState::Construction => BagStateMask::CONSTRUCTION,
            BagState::ReadyToRender => BagStateMask::READY_TO_RENDER,
            BagState::Rendering => BagStateMask::RENDERING,
            BagState::Disposed => BagStateMask::DISPOSED,
            BagState::Error => BagStateMask::ERROR,
        }
    }
}

impl fmt::Display for BagState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BagState::Empty => "EMPTY",
            BagState::Initialised => "INITIALISED",
            BagState::Construction => "CONSTRUCTION",
            BagState::ReadyToRender => "READYTORENDER",
            BagState::Rendering => "RENDERING",
            BagState::Disposed => "DISPOSED",
            BagState::Error => "ERROR",
        };
        write!(f, "{}", name)
    }
}

bitflags! {
    /// Set of bag states used for pool lookups.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BagStateMask: u8 {
        const EMPTY = 1;
        const INITIALISED = 1 << 1;
        const CONSTRUCTION = 1 << 2;
        const READY_TO_RENDER = 1 << 3;
        const RENDERING = 1 << 4;
        const DISPOSED = 1 << 5;
        const ERROR = 1 << 6;

        /// States a producer may claim
        const REUSABLE = Self::EMPTY.bits() | Self::DISPOSED.bits() | Self::ERROR.bits();
    }
}

impl BagStateMask {
    pub fn matches(self, state: BagState) -> bool {
        self.intersects(state.mask())
    }
}

impl From<BagState> for BagStateMask {
    fn from(state: BagState) -> Self {
        state.mask()
    }
}

/// Geometry of a bag's volume, fixed when the slot is claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BagDimensions {
    pub width: usize,
    pub height: usize,
    pub slices: usize,
}

impl BagDimensions {
    pub fn new(width: usize, height: usize, slices: usize) -> Self {
        Self {
            width,
            height,
            slices,
        }
    }

    /// Decoded size of one slice in bytes
    pub fn slice_bytes(&self) -> usize {
        self.width
            .saturating_mul(self.height)
            .saturating_mul(BYTES_PER_SAMPLE)
    }

    /// Decoded size of the whole volume, `None` when it overflows
    pub fn volume_bytes(&self) -> Option<usize> {
        self.width
            .checked_mul(self.height)?
            .checked_mul(BYTES_PER_SAMPLE)?
            .checked_mul(self.slices)
    }
}

/// Errors raised by bag slot operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BagError {
    #[error("slot {slot}: cannot move from {from} to {to}")]
    InvalidTransition {
        slot: usize,
        from: BagState,
        to: BagState,
    },

    #[error("slot {slot}: bag in state {state} does not accept slices")]
    NotAcceptingSlices { slot: usize, state: BagState },

    #[error("slot {slot}: slice index {index} outside 0..{total}")]
    SliceIndexOutOfRange {
        slot: usize,
        index: usize,
        total: usize,
    },

    #[error("slot {slot}: slice {index} was already received")]
    DuplicateSlice { slot: usize, index: usize },

    #[error("invalid bag dimensions {0:?}")]
    InvalidDimensions(BagDimensions),

    #[error("bag {bag_id}: {slice_bytes} byte slices exceed the {limit} byte decode buffer")]
    ResolutionMismatch {
        bag_id: String,
        slice_bytes: usize,
        limit: usize,
    },

    #[error("slot {slot}: task generation {task} does not match bag generation {current}")]
    StaleGeneration {
        slot: usize,
        task: u64,
        current: u64,
    },

    #[error("slot {slot}: failed to allocate {bytes} byte volume")]
    VolumeAllocation { slot: usize, bytes: usize },

    #[error("no free bag slot available")]
    NoFreeSlot,

    #[error("slot {0} is out of range")]
    SlotOutOfRange(usize),
}

/// Result of decoding one slice, as handed back by a worker.
#[derive(Debug, Clone, Copy)]
pub enum SliceOutcome<'a> {
    /// Decoded 16-bit samples for the slice
    Decoded(&'a [u8]),
    /// The codec returned a non-zero status
    Failed { code: i32 },
}

/// What happened to the bag after a slice was completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceCompletion {
    /// More slices are outstanding
    InProgress { processed: usize, total: usize },
    /// This slice completed the bag, now READYTORENDER
    Completed,
    /// The failure policy moved the bag to ERROR
    BagFailed,
    /// The bag left CONSTRUCTION while the slice was decoding
    Discarded,
}

/// Point-in-time copy of a slot's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BagSnapshot {
    pub slot: usize,
    pub state: BagState,
    pub generation: u64,
    pub bag_id: String,
    pub dimensions: Option<BagDimensions>,
    pub pending_slices: usize,
    pub slices_processed: usize,
    pub slices_dropped: usize,
    pub ready_time: Option<Instant>,
}

#[derive(Debug)]
struct BagInner {
    state: BagState,
    generation: u64,
    bag_id: String,
    dimensions: Option<BagDimensions>,
    slice_queue: VecDeque<SliceBuffer>,
    received: Vec<bool>,
    // slices promised to dispatched tasks that have not dequeued yet
    reserved: usize,
    volume: Vec<u8>,
    slices_processed: usize,
    slices_dropped: usize,
    ready_time: Option<Instant>,
}

impl BagInner {
    fn new() -> Self {
        Self {
            state: BagState::Empty,
            generation: 0,
            bag_id: String::new(),
            dimensions: None,
            slice_queue: VecDeque::new(),
            received: Vec::new(),
            reserved: 0,
            volume: Vec::new(),
            slices_processed: 0,
            slices_dropped: 0,
            ready_time: None,
        }
    }

    fn total_slices(&self) -> usize {
        self.dimensions.map(|d| d.slices).unwrap_or(0)
    }

    fn transition(&mut self, slot: usize, next: BagState) -> Result<BagState, BagError> {
        let from = self.state;
        if !from.can_transition_to(next) {
            return Err(BagError::InvalidTransition {
                slot,
                from,
                to: next,
            });
        }
        self.state = next;
        Ok(from)
    }

    /// Forget the previous bag but keep allocated capacity for the next one
    fn clear(&mut self) {
        self.bag_id.clear();
        self.dimensions = None;
        self.slice_queue.clear();
        self.received.clear();
        self.reserved = 0;
        self.slices_processed = 0;
        self.slices_dropped = 0;
        self.ready_time = None;
    }
}

/// One slot of the bag pool.
///
/// All bookkeeping for the slot sits behind a single per-bag lock, so independent
/// bags are processed in parallel while the slice queue, the processed counter and
/// the state always change together.
///
/// Each claim bumps the slot's generation. Work dispatched for an earlier
/// generation is rejected with [`BagError::StaleGeneration`] instead of writing
/// into the bag that now occupies the slot.
#[derive(Debug)]
pub struct BagRecord {
    slot: usize,
    events: EventBus,
    inner: Mutex<BagInner>,
}

/// Shared handle to a pool slot
pub type BagHandle = std::sync::Arc<BagRecord>;

impl BagRecord {
    pub fn new(slot: usize, events: EventBus) -> Self {
        Self {
            slot,
            events,
            inner: Mutex::new(BagInner::new()),
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn state(&self) -> BagState {
        self.inner.lock().state
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    pub fn ready_time(&self) -> Option<Instant> {
        self.inner.lock().ready_time
    }

    /// Ready timestamp, only while the bag is waiting in READYTORENDER
    pub fn ready_since(&self) -> Option<Instant> {
        let inner = self.inner.lock();
        match inner.state {
            BagState::ReadyToRender => inner.ready_time,
            _ => None,
        }
    }

    pub fn bag_id(&self) -> String {
        self.inner.lock().bag_id.clone()
    }

    pub fn dimensions(&self) -> Option<BagDimensions> {
        self.inner.lock().dimensions
    }

    pub fn slices_processed(&self) -> usize {
        self.inner.lock().slices_processed
    }

    pub fn pending_slices(&self) -> usize {
        self.inner.lock().slice_queue.len()
    }

    pub fn snapshot(&self) -> BagSnapshot {
        let inner = self.inner.lock();
        BagSnapshot {
            slot: self.slot,
            state: inner.state,
            generation: inner.generation,
            bag_id: inner.bag_id.clone(),
            dimensions: inner.dimensions,
            pending_slices: inner.slice_queue.len(),
            slices_processed: inner.slices_processed,
            slices_dropped: inner.slices_dropped,
            ready_time: inner.ready_time,
        }
    }

    /// Borrow the decoded volume under the bag lock.
    ///
    /// Slices are laid out back to back in slice-index order.
    pub fn read_volume<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        let inner = self.inner.lock();
        f(&inner.volume)
    }

    /// Claim the slot for a new bag.
    ///
    /// A DISPOSED or ERROR slot is reset to EMPTY first. The volume is sized for
    /// every slice up front so workers can write slices in any order.
    ///
    /// # Returns
    /// The generation assigned to the new bag
    pub fn claim(&self, bag_id: &str, dimensions: BagDimensions) -> Result<u64, BagError> {
        let mut inner = self.inner.lock();

        if !inner.state.is_reusable() {
            return Err(BagError::InvalidTransition {
                slot: self.slot,
                from: inner.state,
                to: BagState::Initialised,
            });
        }

        let volume_bytes = match dimensions.volume_bytes() {
            Some(bytes) if bytes > 0 => bytes,
            _ => return Err(BagError::InvalidDimensions(dimensions)),
        };

        if inner.state != BagState::Empty {
            inner.transition(self.slot, BagState::Empty)?;
            self.events.publish(BagEvent::Reset { slot: self.slot });
        }
        inner.clear();

        inner.volume.clear();
        if inner.volume.try_reserve_exact(volume_bytes).is_err() {
            inner.state = BagState::Error;
            tracing::error!(
                "Slot {}: failed to allocate {} bytes for bag {}",
                self.slot,
                volume_bytes,
                bag_id
            );
            self.events.publish(BagEvent::Failed {
                slot: self.slot,
                reason: "volume allocation failed".to_string(),
            });
            return Err(BagError::VolumeAllocation {
                slot: self.slot,
                bytes: volume_bytes,
            });
        }
        inner.volume.resize(volume_bytes, 0);
        inner.received.resize(dimensions.slices, false);

        inner.transition(self.slot, BagState::Initialised)?;
        inner.generation += 1;
        inner.bag_id.push_str(bag_id);
        inner.dimensions = Some(dimensions);

        tracing::debug!(
            "Slot {} claimed for bag {} ({}x{}x{}, generation {})",
            self.slot,
            bag_id,
            dimensions.width,
            dimensions.height,
            dimensions.slices,
            inner.generation
        );
        self.events.publish(BagEvent::Claimed {
            slot: self.slot,
            bag_id: bag_id.to_string(),
            total_slices: dimensions.slices,
        });

        Ok(inner.generation)
    }

    /// Queue one compressed slice; the first slice moves the bag to CONSTRUCTION.
    pub fn enqueue_slice(&self, slice: SliceBuffer) -> Result<(), BagError> {
        let mut inner = self.inner.lock();

        if !matches!(inner.state, BagState::Initialised | BagState::Construction) {
            return Err(BagError::NotAcceptingSlices {
                slot: self.slot,
                state: inner.state,
            });
        }

        let index = slice.index();
        let total = inner.total_slices();
        if index >= total {
            return Err(BagError::SliceIndexOutOfRange {
                slot: self.slot,
                index,
                total,
            });
        }
        if inner.received[index] {
            return Err(BagError::DuplicateSlice {
                slot: self.slot,
                index,
            });
        }

        inner.received[index] = true;
        inner.slice_queue.push_back(slice);

        if inner.transition(self.slot, BagState::Construction)? == BagState::Initialised {
            self.events
                .publish(BagEvent::ConstructionStarted { slot: self.slot });
        }

        Ok(())
    }

    /// Whether the bag has queued slices not yet promised to a dispatched task
    pub fn has_unreserved_work(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == BagState::Construction && inner.slice_queue.len() > inner.reserved
    }

    /// Promise one queued slice to a task about to be dispatched.
    ///
    /// Returns the generation the task must present when dequeuing.
    pub(crate) fn try_reserve(&self) -> Option<u64> {
        let mut inner = self.inner.lock();
        if inner.state == BagState::Construction && inner.slice_queue.len() > inner.reserved {
            inner.reserved += 1;
            Some(inner.generation)
        } else {
            None
        }
    }

    /// Give back a reservation whose task never reached a worker
    pub(crate) fn cancel_reservation(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation == generation {
            inner.reserved = inner.reserved.saturating_sub(1);
        }
    }

    /// Dequeue the oldest pending slice for a task issued at `generation`.
    pub(crate) fn take_next_slice(&self, generation: u64) -> Result<Option<SliceBuffer>, BagError> {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return Err(BagError::StaleGeneration {
                slot: self.slot,
                task: generation,
                current: inner.generation,
            });
        }

        inner.reserved = inner.reserved.saturating_sub(1);
        if inner.state != BagState::Construction {
            return Ok(None);
        }
        Ok(inner.slice_queue.pop_front())
    }

    /// Record the outcome of one slice and advance the state machine.
    ///
    /// Decoded bytes land at `index * slice_bytes` in the volume, so slices may
    /// complete in any order. The bag becomes READYTORENDER exactly once, when the
    /// last outstanding slice is processed.
    pub(crate) fn complete_slice(
        &self,
        generation: u64,
        index: usize,
        outcome: SliceOutcome<'_>,
        policy: DecodeFailurePolicy,
    ) -> Result<SliceCompletion, BagError> {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return Err(BagError::StaleGeneration {
                slot: self.slot,
                task: generation,
                current: inner.generation,
            });
        }
        if inner.state != BagState::Construction {
            return Ok(SliceCompletion::Discarded);
        }

        let Some(dimensions) = inner.dimensions else {
            return Ok(SliceCompletion::Discarded);
        };
        if index >= dimensions.slices {
            return Err(BagError::SliceIndexOutOfRange {
                slot: self.slot,
                index,
                total: dimensions.slices,
            });
        }

        match outcome {
            SliceOutcome::Decoded(bytes) => {
                let stride = dimensions.slice_bytes();
                let offset = index * stride;
                let len = bytes.len().min(stride);
                if bytes.len() != stride {
                    tracing::warn!(
                        "Slot {}: slice {} decoded to {} bytes, expected {}",
                        self.slot,
                        index,
                        bytes.len(),
                        stride
                    );
                }
                inner.volume[offset..offset + len].copy_from_slice(&bytes[..len]);
                inner.slices_processed += 1;
                self.events.publish(BagEvent::SliceDecoded {
                    slot: self.slot,
                    index,
                });
            }
            SliceOutcome::Failed { code } => match policy {
                DecodeFailurePolicy::DropSlice => {
                    inner.slices_processed += 1;
                    inner.slices_dropped += 1;
                    self.events.publish(BagEvent::SliceDropped {
                        slot: self.slot,
                        index,
                        code,
                    });
                }
                DecodeFailurePolicy::FailBag => {
                    inner.transition(self.slot, BagState::Error)?;
                    inner.slice_queue.clear();
                    inner.reserved = 0;
                    self.events.publish(BagEvent::Failed {
                        slot: self.slot,
                        reason: format!("slice {} failed to decode (status {})", index, code),
                    });
                    return Ok(SliceCompletion::BagFailed);
                }
            },
        }

        let total = dimensions.slices;
        debug_assert!(inner.slices_processed <= total);
        if inner.slices_processed == total {
            inner.transition(self.slot, BagState::ReadyToRender)?;
            inner.ready_time = Some(Instant::now());
            tracing::info!(
                "Bag {} in slot {} ready to render ({} slices, {} dropped)",
                inner.bag_id,
                self.slot,
                total,
                inner.slices_dropped
            );
            self.events.publish(BagEvent::ReadyToRender {
                slot: self.slot,
                bag_id: inner.bag_id.clone(),
            });
            Ok(SliceCompletion::Completed)
        } else {
            Ok(SliceCompletion::InProgress {
                processed: inner.slices_processed,
                total,
            })
        }
    }

    /// READYTORENDER -> RENDERING
    pub fn mark_rendering(&self) -> Result<(), BagError> {
        let mut inner = self.inner.lock();
        inner.transition(self.slot, BagState::Rendering)?;
        self.events.publish(BagEvent::Rendering { slot: self.slot });
        Ok(())
    }

    /// RENDERING -> DISPOSED; the slot becomes claimable again
    pub fn dispose(&self) -> Result<(), BagError> {
        let mut inner = self.inner.lock();
        inner.transition(self.slot, BagState::Disposed)?;
        inner.slice_queue.clear();
        inner.reserved = 0;
        self.events.publish(BagEvent::Disposed { slot: self.slot });
        Ok(())
    }

    /// Move the bag to ERROR from any state.
    ///
    /// # Returns
    /// The state the bag was in before failing
    pub fn fail(&self, reason: &str) -> BagState {
        let mut inner = self.inner.lock();
        let previous = inner.state;
        inner.state = BagState::Error;
        inner.slice_queue.clear();
        inner.reserved = 0;
        tracing::error!(
            "Bag {} in slot {} failed in state {}: {}",
            inner.bag_id,
            self.slot,
            previous,
            reason
        );
        self.events.publish(BagEvent::Failed {
            slot: self.slot,
            reason: reason.to_string(),
        });
        previous
    }

    /// DISPOSED/ERROR -> EMPTY. Resetting an already empty slot is a no-op.
    pub fn reset(&self) -> Result<(), BagError> {
        let mut inner = self.inner.lock();
        if inner.state == BagState::Empty {
            return Ok(());
        }
        inner.transition(self.slot, BagState::Empty)?;
        inner.clear();
        self.events.publish(BagEvent::Reset { slot: self.slot });
        Ok(())
    }

    /// Return the slot to EMPTY and free its buffers, invalidating in-flight work.
    pub(crate) fn release(&self) {
        let mut inner = self.inner.lock();
        inner.clear();
        inner.state = BagState::Empty;
        inner.generation += 1;
        inner.volume = Vec::new();
        inner.slice_queue = VecDeque::new();
        inner.received = Vec::new();
    }
}
