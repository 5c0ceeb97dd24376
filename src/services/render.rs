//! Consumer side of the ingestion core.
//!
//! The render layer displays one bag at a time. [`RenderConsumer`] keeps track of
//! the bag on screen and always disposes it before taking the next one, so at
//! most one slot is ever in RENDERING.

use crate::context::IngestContext;
use crate::events::BagEvent;
use crate::metrics::Metrics;
use crate::models::{BagError, BagHandle, BagState};
use crate::pool::BagPool;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};

pub struct RenderConsumer {
    pool: Arc<BagPool>,
    metrics: Arc<Metrics>,
    current: Mutex<Option<BagHandle>>,
}

impl RenderConsumer {
    pub fn new(ctx: &IngestContext) -> Self {
        Self {
            pool: Arc::clone(&ctx.pool),
            metrics: Arc::clone(&ctx.metrics),
            current: Mutex::new(None),
        }
    }

    /// Bag currently on screen
    pub fn current(&self) -> Option<BagHandle> {
        self.current.lock().clone()
    }

    /// Dispose the bag on screen, then start rendering the oldest ready bag.
    ///
    /// Returns `None` when no bag is ready.
    pub fn next_bag(&self) -> Result<Option<BagHandle>, BagError> {
        let mut current = self.current.lock();
        self.dispose_current(&mut current)?;
        self.take_oldest_ready(&mut current)
    }

    /// Like [`next_bag`](Self::next_bag), but waits on `events` until a bag
    /// becomes ready.
    ///
    /// Returns `None` once the event bus has closed.
    pub async fn wait_next_bag(
        &self,
        events: &mut broadcast::Receiver<BagEvent>,
    ) -> Result<Option<BagHandle>, BagError> {
        self.finish()?;
        loop {
            {
                let mut current = self.current.lock();
                if let Some(bag) = self.take_oldest_ready(&mut current)? {
                    return Ok(Some(bag));
                }
            }

            match events.recv().await {
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Render consumer skipped {} bag events", skipped);
                }
                Err(RecvError::Closed) => return Ok(None),
            }
        }
    }

    /// Dispose the bag on screen, if any.
    ///
    /// # Returns
    /// The slot that was released
    pub fn finish(&self) -> Result<Option<usize>, BagError> {
        let mut current = self.current.lock();
        self.dispose_current(&mut current)
    }

    fn dispose_current(&self, current: &mut Option<BagHandle>) -> Result<Option<usize>, BagError> {
        let Some(bag) = current.take() else {
            return Ok(None);
        };

        let slot = bag.slot();
        match bag.state() {
            BagState::Rendering => {
                bag.dispose()?;
                self.metrics.record_bag_disposed();
                tracing::debug!("Disposed rendered bag in slot {}", slot);
            }
            // Failed or torn down while on screen; nothing left to hand back
            state => {
                tracing::warn!("Bag in slot {} left rendering as {}", slot, state);
            }
        }
        Ok(Some(slot))
    }

    fn take_oldest_ready(&self, current: &mut Option<BagHandle>) -> Result<Option<BagHandle>, BagError> {
        let Some(bag) = self.pool.get_ready_bag() else {
            return Ok(None);
        };
        bag.mark_rendering()?;
        tracing::info!("Rendering bag {} from slot {}", bag.bag_id(), bag.slot());
        *current = Some(Arc::clone(&bag));
        Ok(Some(bag))
    }
}

impl std::fmt::Debug for RenderConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderConsumer")
            .field("current", &self.current.lock().as_ref().map(|b| b.slot()))
            .finish()
    }
}
