//! Fixed-capacity pool of bag slots.
//!
//! The pool pre-allocates `N` [`BagRecord`] slots once and reuses them for the
//! lifetime of the process. Slots are never freed individually: a producer
//! recycles a slot by claiming one found in EMPTY, DISPOSED or ERROR.
//!
//! Lookups are linear scans over the slots. Each slot is locked on its own while
//! it is inspected, so scans run concurrently with producers and workers mutating
//! other bags. `N` is small (single digits to low tens), which keeps scans cheap.

use crate::events::EventBus;
use crate::models::{
    BagDimensions, BagError, BagHandle, BagRecord, BagState, BagStateMask, SliceBuffer,
};
use std::sync::Arc;

#[derive(Debug)]
pub struct BagPool {
    slots: Box<[BagHandle]>,
    max_slice_bytes: usize,
}

impl BagPool {
    /// Allocate `slot_count` empty slots publishing on `events`.
    ///
    /// `max_slice_bytes` is the decode buffer each worker holds; bags whose
    /// slices decode to more than that are refused at claim time.
    pub fn new(slot_count: usize, max_slice_bytes: usize, events: EventBus) -> Self {
        let slots = (0..slot_count)
            .map(|slot| Arc::new(BagRecord::new(slot, events.clone())))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        tracing::info!("Bag pool allocated with {} slots", slot_count);
        Self {
            slots,
            max_slice_bytes,
        }
    }

    /// Largest decoded slice a claimed bag may carry
    pub fn max_slice_bytes(&self) -> usize {
        self.max_slice_bytes
    }

    /// Number of slots (N)
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots, as reported to the render layer
    pub fn pool_size(&self) -> usize {
        self.slot_count()
    }

    /// Bounds-checked slot access.
    ///
    /// Negative or too large indices yield `None`.
    pub fn get_by_index<I>(&self, index: I) -> Option<BagHandle>
    where
        I: TryInto<usize>,
    {
        let index = index.try_into().ok()?;
        self.slots.get(index).cloned()
    }

    /// Find a slot whose state is in `mask`.
    ///
    /// Returns the first match in slot order, except for a mask of exactly
    /// READYTORENDER: then every ready bag is considered and the one with the
    /// oldest ready time wins (lowest slot index on ties), so the renderer gets
    /// bags in the order they finished.
    pub fn get_by_state(&self, mask: impl Into<BagStateMask>) -> Option<BagHandle> {
        let mask = mask.into();
        if mask == BagStateMask::READY_TO_RENDER {
            return self.oldest_ready();
        }

        self.slots
            .iter()
            .find(|slot| mask.matches(slot.state()))
            .cloned()
    }

    fn oldest_ready(&self) -> Option<BagHandle> {
        let mut oldest: Option<(std::time::Instant, &BagHandle)> = None;
        for slot in self.slots.iter() {
            let Some(ready_time) = slot.ready_since() else {
                continue;
            };
            match oldest {
                Some((best, _)) if best <= ready_time => {}
                _ => oldest = Some((ready_time, slot)),
            }
        }
        oldest.map(|(_, slot)| Arc::clone(slot))
    }

    /// True when every slot is EMPTY
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|slot| slot.state() == BagState::Empty)
    }

    /// True when at least one slot is EMPTY
    pub fn has_empty_slot(&self) -> bool {
        self.slots.iter().any(|slot| slot.state() == BagState::Empty)
    }

    /// Number of slots currently in any state of `mask`
    pub fn count(&self, mask: impl Into<BagStateMask>) -> usize {
        let mask = mask.into();
        self.slots
            .iter()
            .filter(|slot| mask.matches(slot.state()))
            .count()
    }

    pub fn states(&self) -> Vec<BagState> {
        self.slots.iter().map(|slot| slot.state()).collect()
    }

    /// Claim the first reusable slot for a new bag.
    ///
    /// A slot that another producer wins between the scan and the claim is
    /// skipped and the scan continues.
    pub fn claim_slot(
        &self,
        bag_id: &str,
        dimensions: BagDimensions,
    ) -> Result<BagHandle, BagError> {
        let slice_bytes = dimensions.slice_bytes();
        if slice_bytes > self.max_slice_bytes {
            tracing::warn!(
                "Refusing bag {}: {}x{} slices need {} bytes, decode buffer holds {}",
                bag_id,
                dimensions.width,
                dimensions.height,
                slice_bytes,
                self.max_slice_bytes
            );
            return Err(BagError::ResolutionMismatch {
                bag_id: bag_id.to_string(),
                slice_bytes,
                limit: self.max_slice_bytes,
            });
        }

        for slot in self.slots.iter() {
            if !slot.state().is_reusable() {
                continue;
            }
            match slot.claim(bag_id, dimensions) {
                Ok(_) => return Ok(Arc::clone(slot)),
                Err(BagError::InvalidTransition { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        tracing::warn!(
            "No free slot for bag {} ({} slots busy)",
            bag_id,
            self.slot_count()
        );
        Err(BagError::NoFreeSlot)
    }

    /// Queue a compressed slice on the bag in `slot`
    pub fn enqueue_slice(&self, slot: usize, index: usize, payload: Vec<u8>) -> Result<(), BagError> {
        self.slot_or_err(slot)?
            .enqueue_slice(SliceBuffer::new(index, payload))
    }

    /// Oldest bag waiting in READYTORENDER
    pub fn get_ready_bag(&self) -> Option<BagHandle> {
        self.get_by_state(BagStateMask::READY_TO_RENDER)
    }

    pub fn mark_rendering(&self, slot: usize) -> Result<(), BagError> {
        self.slot_or_err(slot)?.mark_rendering()
    }

    pub fn dispose(&self, slot: usize) -> Result<(), BagError> {
        self.slot_or_err(slot)?.dispose()
    }

    /// Return every slot to EMPTY and free its buffers.
    ///
    /// Tasks still holding a slot handle see a new generation and are discarded.
    pub fn destroy(&self) {
        for slot in self.slots.iter() {
            slot.release();
        }
        tracing::info!("Bag pool released {} slots", self.slot_count());
    }

    /// Iterate over all slots in index order
    pub fn iter(&self) -> impl Iterator<Item = &BagHandle> {
        self.slots.iter()
    }

    fn slot_or_err(&self, slot: usize) -> Result<&BagHandle, BagError> {
        self.slots.get(slot).ok_or(BagError::SlotOutOfRange(slot))
    }
}
