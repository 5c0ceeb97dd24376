//! Integration tests for the bag pool and the bag lifecycle
//!
//! These tests verify:
//! - Slot lookup bounds
//! - Oldest-first delivery of ready bags
//! - Pool capacity under arbitrary claim/dispose sequences
//! - Slot reuse and pool teardown

use bagstream::models::{
    BagDimensions, BagError, BagState, BagStateMask, TaskKind, WorkstationConfig,
};
use bagstream::services::{DecompressionWorker, PassthroughCodec};
use bagstream::{BagHandle, IngestContext};
use proptest::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn context(slots: usize) -> IngestContext {
    let mut config = WorkstationConfig {
        slice_width: 4,
        slice_height: 1,
        worker_count: 1,
        ..WorkstationConfig::default()
    };
    config.pool_sizes.default = slots;
    IngestContext::new(config, Arc::new(PassthroughCodec)).unwrap()
}

/// Queue and decode every slice of `bag` on the calling thread
fn decode_all(ctx: &IngestContext, bag: &BagHandle, slices: usize) {
    for index in 0..slices {
        ctx.pool
            .enqueue_slice(bag.slot(), index, vec![index as u8 + 1; 8])
            .unwrap();
    }
    let mut worker = DecompressionWorker::new(0, ctx);
    for _ in 0..slices {
        worker.execute(bag, bag.generation(), TaskKind::Decompression);
    }
}

fn ready_bag(ctx: &IngestContext, bag_id: &str) -> BagHandle {
    let bag = ctx
        .pool
        .claim_slot(bag_id, BagDimensions::new(4, 1, 2))
        .unwrap();
    decode_all(ctx, &bag, 2);
    assert_eq!(bag.state(), BagState::ReadyToRender);
    bag
}

#[test]
fn test_get_by_index_out_of_range() {
    let ctx = context(2);

    assert!(ctx.pool.get_by_index(-1).is_none());
    assert!(ctx.pool.get_by_index(2).is_none());
    assert!(ctx.pool.get_by_index(0).is_some());
    assert!(ctx.pool.get_by_index(1).is_some());
}

#[test]
fn test_get_ready_on_all_empty_pool() {
    let ctx = context(3);

    assert!(ctx.pool.is_empty());
    assert!(ctx.pool.get_by_state(BagStateMask::READY_TO_RENDER).is_none());
    assert!(ctx.pool.get_ready_bag().is_none());
}

#[test]
fn test_ready_bags_delivered_oldest_first() {
    let ctx = context(3);

    // Slot 0 becomes ready last
    let late = ctx
        .pool
        .claim_slot("LATE", BagDimensions::new(4, 1, 1))
        .unwrap();
    let a = ready_bag(&ctx, "A");
    thread::sleep(Duration::from_millis(2));
    let b = ready_bag(&ctx, "B");
    thread::sleep(Duration::from_millis(2));
    decode_all(&ctx, &late, 1);

    assert!(a.ready_since().unwrap() < b.ready_since().unwrap());
    assert_eq!(ctx.pool.get_ready_bag().unwrap().slot(), a.slot());

    ctx.pool.mark_rendering(a.slot()).unwrap();
    assert_eq!(ctx.pool.get_ready_bag().unwrap().slot(), b.slot());

    ctx.pool.mark_rendering(b.slot()).unwrap();
    assert_eq!(ctx.pool.get_ready_bag().unwrap().slot(), late.slot());
}

#[test]
fn test_full_lifecycle_and_slot_reuse() {
    let ctx = context(1);
    let bag = ready_bag(&ctx, "FIRST");
    let first_generation = bag.generation();

    bag.read_volume(|v| assert_eq!(v, &[1, 1, 1, 1, 1, 1, 1, 1, 2, 2, 2, 2, 2, 2, 2, 2]));
    assert_eq!(
        ctx.pool.claim_slot("BLOCKED", BagDimensions::new(4, 1, 1)).unwrap_err(),
        BagError::NoFreeSlot
    );

    ctx.pool.mark_rendering(bag.slot()).unwrap();
    ctx.pool.dispose(bag.slot()).unwrap();
    assert_eq!(bag.state(), BagState::Disposed);

    let again = ctx
        .pool
        .claim_slot("SECOND", BagDimensions::new(4, 1, 3))
        .unwrap();
    assert_eq!(again.slot(), bag.slot());
    assert!(again.generation() > first_generation);
    assert_eq!(again.slices_processed(), 0);
    again.read_volume(|v| assert!(v.iter().all(|&b| b == 0)));
}

#[test]
fn test_oversized_bag_refused_before_decoding() {
    let ctx = context(2);

    // 16-byte slices against an 8-byte decode buffer
    let err = ctx
        .pool
        .claim_slot("BIG", BagDimensions::new(4, 2, 2))
        .unwrap_err();
    assert!(matches!(
        err,
        BagError::ResolutionMismatch { slice_bytes: 16, limit: 8, .. }
    ));
    assert!(ctx.pool.is_empty());
    assert!(ctx.pool.get_ready_bag().is_none());

    // A matching bag on the same pool decodes into a full volume
    let bag = ready_bag(&ctx, "FITS");
    bag.read_volume(|v| assert!(v.iter().all(|&b| b != 0)));
}

#[test]
fn test_consumer_ops_reject_wrong_state() {
    let ctx = context(1);
    let bag = ctx
        .pool
        .claim_slot("A", BagDimensions::new(4, 1, 2))
        .unwrap();

    assert!(matches!(
        ctx.pool.mark_rendering(bag.slot()),
        Err(BagError::InvalidTransition { .. })
    ));
    assert!(matches!(
        ctx.pool.dispose(bag.slot()),
        Err(BagError::InvalidTransition { .. })
    ));
    assert_eq!(ctx.pool.dispose(9), Err(BagError::SlotOutOfRange(9)));
}

#[test]
fn test_destroy_releases_every_slot() {
    let ctx = context(3);
    ready_bag(&ctx, "A");
    ctx.pool
        .claim_slot("B", BagDimensions::new(4, 1, 2))
        .unwrap();

    ctx.pool.destroy();

    assert!(ctx.pool.is_empty());
    assert_eq!(ctx.pool.count(BagStateMask::EMPTY), 3);
    for bag in ctx.pool.iter() {
        bag.read_volume(|v| assert!(v.is_empty()));
    }
}

#[derive(Debug, Clone)]
enum PoolOp {
    Claim,
    Complete(usize),
    Render,
    Dispose(usize),
    Fail(usize),
    Reset(usize),
}

fn pool_op() -> impl Strategy<Value = PoolOp> {
    prop_oneof![
        3 => Just(PoolOp::Claim),
        2 => (0usize..6).prop_map(PoolOp::Complete),
        1 => Just(PoolOp::Render),
        2 => (0usize..6).prop_map(PoolOp::Dispose),
        1 => (0usize..6).prop_map(PoolOp::Fail),
        1 => (0usize..6).prop_map(PoolOp::Reset),
    ]
}

/// Slot states the pool should hold, tracked from the operations alone
struct PoolModel {
    states: Vec<BagState>,
}

impl PoolModel {
    fn new(slots: usize) -> Self {
        Self {
            states: vec![BagState::Empty; slots],
        }
    }

    fn first_reusable(&self) -> Option<usize> {
        self.states.iter().position(|state| {
            matches!(
                state,
                BagState::Empty | BagState::Disposed | BagState::Error
            )
        })
    }

    fn occupied(&self) -> usize {
        self.states
            .iter()
            .filter(|&&state| state != BagState::Empty)
            .count()
    }

    fn state(&self, slot: usize) -> Option<BagState> {
        self.states.get(slot).copied()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_pool_matches_slot_model(
        slots in 1usize..5,
        ops in prop::collection::vec(pool_op(), 1..48),
    ) {
        let ctx = context(slots);
        let mut model = PoolModel::new(slots);

        for (n, op) in ops.into_iter().enumerate() {
            match op {
                PoolOp::Claim => {
                    let result = ctx
                        .pool
                        .claim_slot(&format!("BAG-{}", n), BagDimensions::new(4, 1, 1));
                    match model.first_reusable() {
                        Some(expected) => {
                            prop_assert_eq!(result.map(|bag| bag.slot()), Ok(expected));
                            model.states[expected] = BagState::Initialised;
                        }
                        None => prop_assert_eq!(result.map(|bag| bag.slot()), Err(BagError::NoFreeSlot)),
                    }
                }
                PoolOp::Complete(slot) => {
                    if model.state(slot) == Some(BagState::Initialised) {
                        let bag = ctx.pool.get_by_index(slot).unwrap();
                        decode_all(&ctx, &bag, 1);
                        model.states[slot] = BagState::ReadyToRender;
                    }
                }
                PoolOp::Render => {
                    let rendering = model.states.contains(&BagState::Rendering);
                    let ready = model.states.contains(&BagState::ReadyToRender);
                    if !rendering && ready {
                        let bag = ctx.pool.get_ready_bag().unwrap();
                        prop_assert_eq!(model.state(bag.slot()), Some(BagState::ReadyToRender));
                        ctx.pool.mark_rendering(bag.slot()).unwrap();
                        model.states[bag.slot()] = BagState::Rendering;
                    }
                }
                PoolOp::Dispose(slot) => {
                    let result = ctx.pool.dispose(slot);
                    if model.state(slot) == Some(BagState::Rendering) {
                        prop_assert!(result.is_ok());
                        model.states[slot] = BagState::Disposed;
                    } else {
                        prop_assert!(result.is_err());
                    }
                }
                PoolOp::Fail(slot) => {
                    if let Some(bag) = ctx.pool.get_by_index(slot) {
                        bag.fail("property test");
                        model.states[slot] = BagState::Error;
                    }
                }
                PoolOp::Reset(slot) => {
                    if let Some(bag) = ctx.pool.get_by_index(slot) {
                        let result = bag.reset();
                        match model.states[slot] {
                            BagState::Empty => prop_assert!(result.is_ok()),
                            BagState::Disposed | BagState::Error => {
                                prop_assert!(result.is_ok());
                                model.states[slot] = BagState::Empty;
                            }
                            _ => prop_assert!(result.is_err()),
                        }
                    }
                }
            }

            prop_assert_eq!(ctx.pool.states(), model.states.clone());
            prop_assert_eq!(ctx.pool.count(!BagStateMask::EMPTY), model.occupied());
            prop_assert!(model.occupied() <= slots);
            prop_assert!(ctx.pool.count(BagStateMask::RENDERING) <= 1);
        }
    }
}
