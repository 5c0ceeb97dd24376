//! Services module - the moving parts of the ingestion pipeline.
//!
//! The bag pool and its records are passive data. The services here move bags
//! through their lifecycle:
//!
//! - [`AcquisitionHandler`]: Producer. Claims a slot per incoming bag and queues
//!   its compressed slices
//! - [`DispatchService`]: Sweeps the pool and hands one slice at a time to an idle
//!   worker, bounded by an admission semaphore with one permit per worker
//! - [`DecompressionWorker`]: Decodes a slice through the [`SliceCodec`] and writes
//!   it into the bag's volume on a dedicated thread
//! - [`RenderConsumer`]: Takes the oldest ready bag for display and disposes it
//!   afterwards
//!
//! # Usage Example
//!
//! ```ignore
//! use bagstream::services::{AcquisitionHandler, AcquisitionMode, DispatchService, RenderConsumer};
//!
//! let dispatcher = DispatchService::start(ctx.clone())?;
//! let sweeper = dispatcher.spawn_loop(cancel_rx);
//!
//! let producer = AcquisitionHandler::new(ctx.clone(), AcquisitionMode::Push, dispatcher.pending_signal());
//! let slot = producer.claim_slot("BAG-0001", 512, 512, 300)?;
//! producer.enqueue_slice(slot, 0, compressed)?;
//!
//! let consumer = RenderConsumer::new(&ctx);
//! if let Some(bag) = consumer.next_bag()? {
//!     bag.read_volume(|voxels| upload(voxels));
//! }
//! ```

pub mod acquisition;
pub mod codec;
pub mod dispatch;
pub mod render;
pub mod worker;

pub use acquisition::{AcquisitionHandler, AcquisitionMode};
pub use codec::{CodecError, PassthroughCodec, SliceCodec};
pub use dispatch::{DispatchError, DispatchService};
pub use render::RenderConsumer;
pub use worker::{DecompressionWorker, TaskOutcome, WorkerTask};
