//! Producer side of the ingestion core.
//!
//! An [`AcquisitionHandler`] sits between the network transport and the bag
//! pool. It claims a slot when bag metadata arrives, queues each compressed
//! slice as it is received and wakes the dispatcher so decoding starts without
//! waiting for the next dispatch tick.

use crate::context::IngestContext;
use crate::models::{BagDimensions, BagError, BagHandle};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Notify;

/// How the transport delivers bags to the workstation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcquisitionMode {
    /// The workstation requests bags from the scanner
    Pull,
    /// The scanner streams bags as they are scanned
    #[default]
    Push,
}

impl fmt::Display for AcquisitionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquisitionMode::Pull => write!(f, "pull"),
            AcquisitionMode::Push => write!(f, "push"),
        }
    }
}

pub struct AcquisitionHandler {
    ctx: IngestContext,
    mode: AcquisitionMode,
    pending: Arc<Notify>,
}

impl AcquisitionHandler {
    /// Create a producer that wakes `pending` whenever slices are queued.
    ///
    /// Pass [`DispatchService::pending_signal`](crate::services::DispatchService::pending_signal)
    /// to feed a running dispatcher.
    pub fn new(ctx: IngestContext, mode: AcquisitionMode, pending: Arc<Notify>) -> Self {
        tracing::debug!("Acquisition handler created in {} mode", mode);
        Self { ctx, mode, pending }
    }

    pub fn mode(&self) -> AcquisitionMode {
        self.mode
    }

    /// Claim a free slot for a newly announced bag.
    ///
    /// # Returns
    /// The slot index the transport uses for the bag's slices
    pub fn claim_slot(
        &self,
        bag_id: &str,
        width: usize,
        height: usize,
        slice_count: usize,
    ) -> Result<usize, BagError> {
        let bag = self.claim(bag_id, BagDimensions::new(width, height, slice_count))?;
        Ok(bag.slot())
    }

    /// Queue one compressed slice on the bag in `slot` and wake the dispatcher
    pub fn enqueue_slice(&self, slot: usize, index: usize, bytes: Vec<u8>) -> Result<(), BagError> {
        if let Err(e) = self.ctx.pool.enqueue_slice(slot, index, bytes) {
            tracing::warn!("Rejected slice {} for slot {}: {}", index, slot, e);
            return Err(e);
        }
        self.ctx.metrics.record_slice_enqueued();
        self.pending.notify_one();
        Ok(())
    }

    /// Claim a slot and queue every slice of a bag that arrived in one piece.
    ///
    /// Slices are indexed in iteration order. The bag is failed if any slice is
    /// rejected, so its slot does not stay in CONSTRUCTION forever.
    pub fn ingest_bag<I>(
        &self,
        bag_id: &str,
        width: usize,
        height: usize,
        slices: I,
    ) -> Result<BagHandle, BagError>
    where
        I: IntoIterator<Item = Vec<u8>>,
        I::IntoIter: ExactSizeIterator,
    {
        let slices = slices.into_iter();
        let bag = self.claim(bag_id, BagDimensions::new(width, height, slices.len()))?;

        for (index, payload) in slices.enumerate() {
            if let Err(e) = self.enqueue_slice(bag.slot(), index, payload) {
                self.abort(bag.slot(), &e.to_string());
                return Err(e);
            }
        }
        Ok(bag)
    }

    /// Fail the bag in `slot` after a transport error
    pub fn abort(&self, slot: usize, reason: &str) {
        if let Some(bag) = self.ctx.pool.get_by_index(slot) {
            bag.fail(reason);
            self.ctx.metrics.record_bag_failed();
        }
    }

    fn claim(&self, bag_id: &str, dimensions: BagDimensions) -> Result<BagHandle, BagError> {
        match self.ctx.pool.claim_slot(bag_id, dimensions) {
            Ok(bag) => {
                self.ctx.metrics.record_bag_claimed();
                tracing::info!(
                    "Acquired bag {} into slot {} ({} slices)",
                    bag_id,
                    bag.slot(),
                    dimensions.slices
                );
                Ok(bag)
            }
            Err(e) => {
                if matches!(e, BagError::VolumeAllocation { .. }) {
                    self.ctx.metrics.record_bag_failed();
                }
                tracing::warn!("Could not acquire bag {}: {}", bag_id, e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BagState, WorkstationConfig};
    use crate::services::codec::PassthroughCodec;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn handler(slots: usize) -> (IngestContext, AcquisitionHandler, Arc<Notify>) {
        let mut config = WorkstationConfig::default();
        config.pool_sizes.default = slots;
        let ctx = IngestContext::new(config, Arc::new(PassthroughCodec)).unwrap();
        let pending = Arc::new(Notify::new());
        let handler = AcquisitionHandler::new(ctx.clone(), AcquisitionMode::Push, Arc::clone(&pending));
        (ctx, handler, pending)
    }

    #[test]
    fn test_claim_slot_returns_index() {
        let (ctx, handler, _) = handler(2);

        assert_eq!(handler.claim_slot("BAG-1", 4, 4, 3).unwrap(), 0);
        assert_eq!(handler.claim_slot("BAG-2", 4, 4, 3).unwrap(), 1);
        assert_eq!(
            handler.claim_slot("BAG-3", 4, 4, 3).unwrap_err(),
            BagError::NoFreeSlot
        );
        assert_eq!(ctx.metrics.bags_claimed.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_claim_rejects_empty_bag() {
        let (ctx, handler, _) = handler(1);

        let err = handler.claim_slot("BAG-1", 4, 4, 0).unwrap_err();
        assert!(matches!(err, BagError::InvalidDimensions(_)));
        assert!(ctx.pool.is_empty());
    }

    #[test]
    fn test_claim_rejects_resolution_above_configured() {
        let (ctx, handler, _) = handler(1);

        let err = handler.claim_slot("BAG-1", 1024, 512, 4).unwrap_err();
        assert!(matches!(err, BagError::ResolutionMismatch { limit, .. } if limit == 512 * 512 * 2));
        assert!(ctx.pool.is_empty());
        assert_eq!(ctx.metrics.bags_claimed.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_enqueue_wakes_dispatcher() {
        let (ctx, handler, pending) = handler(1);
        let slot = handler.claim_slot("BAG-1", 4, 4, 2).unwrap();

        handler.enqueue_slice(slot, 0, vec![1; 10]).unwrap();

        tokio::time::timeout(Duration::from_secs(1), pending.notified())
            .await
            .expect("enqueue should notify pending work");
        assert_eq!(ctx.pool.states()[slot], BagState::Construction);
        assert_eq!(ctx.metrics.slices_enqueued.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_enqueue_rejects_unknown_slot() {
        let (_, handler, _) = handler(1);
        assert_eq!(
            handler.enqueue_slice(5, 0, vec![1]).unwrap_err(),
            BagError::SlotOutOfRange(5)
        );
    }

    #[test]
    fn test_ingest_bag_queues_every_slice() {
        let (ctx, handler, _) = handler(1);

        let bag = handler
            .ingest_bag("BAG-1", 4, 4, vec![vec![1; 8], vec![2; 8], vec![3; 8]])
            .unwrap();

        assert_eq!(bag.pending_slices(), 3);
        assert_eq!(bag.state(), BagState::Construction);
        assert_eq!(ctx.metrics.slices_enqueued.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_abort_fails_bag_and_frees_slot() {
        let (ctx, handler, _) = handler(1);
        let slot = handler.claim_slot("BAG-1", 4, 4, 2).unwrap();

        handler.abort(slot, "connection reset");

        assert_eq!(ctx.pool.states()[slot], BagState::Error);
        assert_eq!(ctx.metrics.bags_failed.load(Ordering::Relaxed), 1);
        // ERROR slots are reclaimable
        assert_eq!(handler.claim_slot("BAG-2", 4, 4, 1).unwrap(), slot);
    }
}
