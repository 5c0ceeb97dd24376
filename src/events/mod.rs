// Bag lifecycle events
//
// Every state transition of a bag slot is published on a broadcast channel so the
// render layer, metrics and tests can react without polling the pool.

use tokio::sync::broadcast;

/// Lifecycle events emitted by bag slots
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BagEvent {
    /// A producer claimed a slot for a new bag
    Claimed {
        slot: usize,
        bag_id: String,
        total_slices: usize,
    },

    /// The first compressed slice arrived
    ConstructionStarted { slot: usize },

    /// A slice was decoded and written into the volume
    SliceDecoded { slot: usize, index: usize },

    /// The codec rejected a slice and it was left zero-filled
    SliceDropped { slot: usize, index: usize, code: i32 },

    /// All slices are processed; the bag can be displayed
    ReadyToRender { slot: usize, bag_id: String },

    Rendering { slot: usize },

    Disposed { slot: usize },

    /// The bag hit an unrecoverable error
    Failed { slot: usize, reason: String },

    /// The slot was returned to the empty state
    Reset { slot: usize },
}

impl BagEvent {
    /// Slot the event refers to
    pub fn slot(&self) -> usize {
        match self {
            BagEvent::Claimed { slot, .. }
            | BagEvent::ConstructionStarted { slot }
            | BagEvent::SliceDecoded { slot, .. }
            | BagEvent::SliceDropped { slot, .. }
            | BagEvent::ReadyToRender { slot, .. }
            | BagEvent::Rendering { slot }
            | BagEvent::Disposed { slot }
            | BagEvent::Failed { slot, .. }
            | BagEvent::Reset { slot } => *slot,
        }
    }
}

/// Cloneable publisher for [`BagEvent`]s.
///
/// Multiple subscribers can listen simultaneously. Publishing never blocks and
/// silently drops events when nobody is subscribed.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<BagEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per lagging subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: BagEvent) {
        tracing::trace!("bag event: {:?}", event);
        // It's OK if no one is listening
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BagEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
