//! Data models for the bag ingestion core.
//!
//! - [`BagRecord`]: One pool slot holding an in-flight bag, its compressed slice
//!   queue, the pre-sized decoded volume and the lifecycle [`BagState`]
//! - [`SliceBuffer`]: A compressed slice queued on a bag
//! - [`WorkstationConfig`]: Slice resolution, worker count and role-dependent
//!   pool sizes loaded from `workstation.yaml`
//!
//! # Architecture Note
//!
//! Bag slots are shared between producers, decompression workers and the render
//! consumer as [`BagHandle`]s (`Arc<BagRecord>`). Every mutation goes through
//! `BagRecord` methods, which hold the per-bag lock and enforce the state machine.

pub mod bag;
pub mod config;
pub mod slice;

pub use bag::{
    BagDimensions, BagError, BagHandle, BagRecord, BagSnapshot, BagState, BagStateMask,
    SliceCompletion, SliceOutcome,
};
pub use config::{
    BYTES_PER_SAMPLE, ConfigError, DecodeFailurePolicy, PoolSizes, WorkstationConfig,
    WorkstationRole,
};
pub use slice::{SliceBuffer, TaskKind};
