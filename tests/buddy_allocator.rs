//! Buddy allocator invariants and regressions
//!
//! Ported from the memory-allocator suite the runtime grew up with:
//! bounds behavior, mask/list agreement, buddy merging, contiguity,
//! out-of-order frees, and a replay property driving random matched
//! alloc/free sequences back to the pristine state.

use proptest::prelude::*;
use taskr::data::MemoryHint;
use taskr::error::Error;
use taskr::gpu::BuddyAllocator;

const MIN_SIZE: usize = 4;
const MAX_SIZE: usize = 256;
const MIN_ORDER: usize = 2;
const MAX_ORDER: usize = 8;

fn unified_alloc() -> BuddyAllocator {
    BuddyAllocator::new((MIN_SIZE, MAX_SIZE), (MIN_SIZE, MAX_SIZE), (MIN_SIZE, MAX_SIZE)).unwrap()
}

fn assert_pristine(alloc: &BuddyAllocator, class: MemoryHint) {
    assert_eq!(alloc.free_mask(class).unwrap(), 1 << MAX_ORDER);
    assert_eq!(alloc.free_list_len(class, MAX_ORDER).unwrap(), 1);
    for order in 0..MAX_ORDER {
        assert_eq!(alloc.free_list_len(class, order).unwrap(), 0);
    }
}

fn assert_mask_matches_lists(alloc: &BuddyAllocator, class: MemoryHint) {
    let mask = alloc.free_mask(class).unwrap();
    for order in 0..64 {
        let bit = (mask >> order) & 1 == 1;
        let occupied = alloc.free_list_len(class, order).unwrap() > 0;
        assert_eq!(bit, occupied, "mask/list disagreement at order {order}");
    }
}

// ****************************
// Bounds
// ****************************

#[test]
fn alloc_below_min_rounds_up() {
    let mut alloc = unified_alloc();
    let offset = alloc.allocate(MIN_SIZE / 2, MemoryHint::Unified).unwrap();
    assert_eq!(offset, 0);

    // The min-order block was carved out: one free block at every order
    // from min to max-1.
    assert_eq!(
        alloc.free_mask(MemoryHint::Unified).unwrap(),
        (MAX_SIZE - MIN_SIZE) as u64
    );
    assert_eq!(alloc.free_list_len(MemoryHint::Unified, MIN_ORDER).unwrap(), 1);
}

#[test]
fn alloc_above_max_is_out_of_memory() {
    let mut alloc = unified_alloc();
    assert!(matches!(
        alloc.allocate(MAX_SIZE + 1, MemoryHint::Unified),
        Err(Error::OutOfMemory { .. })
    ));
}

#[test]
fn exhaustion_is_out_of_memory() {
    let mut alloc = unified_alloc();
    alloc.allocate(MAX_SIZE, MemoryHint::Unified).unwrap();
    assert!(matches!(
        alloc.allocate(MIN_SIZE, MemoryHint::Unified),
        Err(Error::OutOfMemory { .. })
    ));
}

#[test]
fn unconfigured_classes_fail_while_others_work() {
    let mut alloc = BuddyAllocator::new((MIN_SIZE, MAX_SIZE), (0, 0), (MIN_SIZE, MAX_SIZE)).unwrap();

    let devloc = alloc.allocate(64, MemoryHint::DeviceLocal).unwrap();
    let hostvis = alloc.allocate(64, MemoryHint::HostVisible).unwrap();
    assert!(matches!(
        alloc.allocate(64, MemoryHint::Unified),
        Err(Error::InvalidMemoryClass { .. })
    ));

    alloc.free(64, devloc, MemoryHint::DeviceLocal).unwrap();
    alloc.free(64, hostvis, MemoryHint::HostVisible).unwrap();
    assert_pristine(&alloc, MemoryHint::DeviceLocal);
    assert_pristine(&alloc, MemoryHint::HostVisible);
}

// ****************************
// Basic alloc and free
// ****************************

#[test]
fn full_alloc_free_min() {
    let mut alloc = unified_alloc();
    let offset = alloc.allocate(MIN_SIZE, MemoryHint::Unified).unwrap();
    assert_eq!(
        alloc.free_mask(MemoryHint::Unified).unwrap(),
        (MAX_SIZE - MIN_SIZE) as u64
    );
    for order in MIN_ORDER..MAX_ORDER {
        assert_eq!(alloc.free_list_len(MemoryHint::Unified, order).unwrap(), 1);
    }

    alloc.free(MIN_SIZE, offset, MemoryHint::Unified).unwrap();
    assert_pristine(&alloc, MemoryHint::Unified);
}

#[test]
fn classes_are_independent() {
    let mut alloc = unified_alloc();
    let a = alloc.allocate(32, MemoryHint::Unified).unwrap();
    let b = alloc.allocate(32, MemoryHint::DeviceLocal).unwrap();
    assert_eq!(a, b);
    assert_pristine(&alloc, MemoryHint::HostVisible);

    alloc.free(32, a, MemoryHint::Unified).unwrap();
    assert_pristine(&alloc, MemoryHint::Unified);
    // The device-local block is still out.
    assert_ne!(
        alloc.free_mask(MemoryHint::DeviceLocal).unwrap(),
        1 << MAX_ORDER
    );
}

// ****************************
// Buddy behavior
// ****************************

#[test]
fn middle_buddies_merge_on_second_free() {
    let middle_order = MIN_ORDER + (MAX_ORDER - MIN_ORDER) / 2;
    let middle_size = 1 << middle_order;

    let mut alloc = unified_alloc();
    let block = alloc.allocate(middle_size, MemoryHint::Unified).unwrap();
    for order in (middle_order + 1)..MAX_ORDER {
        assert_eq!(alloc.free_list_len(MemoryHint::Unified, order).unwrap(), 1);
    }

    let buddy = alloc.allocate(middle_size, MemoryHint::Unified).unwrap();
    for order in (MIN_ORDER + 1..=middle_order).rev() {
        assert_eq!(alloc.free_list_len(MemoryHint::Unified, order).unwrap(), 0);
    }

    alloc.free(middle_size, block, MemoryHint::Unified).unwrap();
    alloc.free(middle_size, buddy, MemoryHint::Unified).unwrap();
    assert_pristine(&alloc, MemoryHint::Unified);
}

#[test]
fn same_size_allocations_are_contiguous() {
    let middle_order = MIN_ORDER + (MAX_ORDER - MIN_ORDER) / 2;
    let middle_size = 1 << middle_order;

    let mut alloc = unified_alloc();
    let block = alloc.allocate(middle_size, MemoryHint::Unified).unwrap();
    let buddy = alloc.allocate(middle_size, MemoryHint::Unified).unwrap();
    assert_eq!(buddy, block + middle_size);

    let outlier = alloc.allocate(middle_size, MemoryHint::Unified).unwrap();
    assert_eq!(outlier, buddy + middle_size);
    assert_eq!(
        alloc
            .free_list_len(MemoryHint::Unified, middle_order + 1)
            .unwrap(),
        0
    );

    alloc.free(middle_size, block, MemoryHint::Unified).unwrap();
    alloc.free(middle_size, outlier, MemoryHint::Unified).unwrap();
    alloc.free(middle_size, buddy, MemoryHint::Unified).unwrap();
    assert_pristine(&alloc, MemoryHint::Unified);
}

#[test]
fn sixteen_byte_regression() {
    // alloc(16) x3 lands at 0, 16, 32; freeing 0, 32, 16 restores the
    // pristine slab.
    let mut alloc = unified_alloc();
    assert_eq!(alloc.allocate(16, MemoryHint::Unified).unwrap(), 0);
    assert_eq!(alloc.allocate(16, MemoryHint::Unified).unwrap(), 16);
    assert_eq!(alloc.allocate(16, MemoryHint::Unified).unwrap(), 32);

    alloc.free(16, 0, MemoryHint::Unified).unwrap();
    alloc.free(16, 32, MemoryHint::Unified).unwrap();
    alloc.free(16, 16, MemoryHint::Unified).unwrap();

    assert_eq!(alloc.free_mask(MemoryHint::Unified).unwrap(), 1 << MAX_ORDER);
    assert_eq!(alloc.free_list_len(MemoryHint::Unified, MAX_ORDER).unwrap(), 1);
}

// ****************************
// Out-of-order frees
// ****************************

#[test]
fn out_of_order_frees_merge_correctly() {
    let mut alloc = unified_alloc();
    let a = alloc.allocate(MIN_SIZE, MemoryHint::Unified).unwrap();
    let b = alloc.allocate(MIN_SIZE, MemoryHint::Unified).unwrap();
    let c = alloc.allocate(MIN_SIZE, MemoryHint::Unified).unwrap();
    let d = alloc.allocate(MIN_SIZE, MemoryHint::Unified).unwrap();
    assert_eq!(alloc.free_list_len(MemoryHint::Unified, MIN_ORDER).unwrap(), 0);

    alloc.free(MIN_SIZE, c, MemoryHint::Unified).unwrap();
    assert_eq!(alloc.free_list_len(MemoryHint::Unified, MIN_ORDER).unwrap(), 1);
    let c = alloc.allocate(MIN_SIZE, MemoryHint::Unified).unwrap();
    assert_eq!(c, MIN_SIZE * 2);

    alloc.free(MIN_SIZE, b, MemoryHint::Unified).unwrap();
    assert_eq!(alloc.free_list_len(MemoryHint::Unified, MIN_ORDER).unwrap(), 1);

    alloc.free(MIN_SIZE, d, MemoryHint::Unified).unwrap();
    assert_eq!(alloc.free_list_len(MemoryHint::Unified, MIN_ORDER).unwrap(), 2);

    alloc.free(MIN_SIZE, a, MemoryHint::Unified).unwrap();
    assert_eq!(alloc.free_list_len(MemoryHint::Unified, MIN_ORDER).unwrap(), 1);

    alloc.free(MIN_SIZE, c, MemoryHint::Unified).unwrap();
    assert_eq!(alloc.free_list_len(MemoryHint::Unified, MIN_ORDER).unwrap(), 0);
    assert_pristine(&alloc, MemoryHint::Unified);
}

// ****************************
// Double free
// ****************************

#[test]
fn double_free_is_detected() {
    let mut alloc = unified_alloc();
    let p = alloc.allocate(64, MemoryHint::Unified).unwrap();
    alloc.free(64, p, MemoryHint::Unified).unwrap();
    assert!(matches!(
        alloc.free(64, p, MemoryHint::Unified),
        Err(Error::DoubleFree { .. })
    ));
}

#[test]
fn double_free_before_merge_is_detected() {
    let mut alloc = unified_alloc();
    let block = alloc.allocate(32, MemoryHint::Unified).unwrap();
    let _buddy = alloc.allocate(32, MemoryHint::Unified).unwrap();
    alloc.free(32, block, MemoryHint::Unified).unwrap();
    assert!(matches!(
        alloc.free(32, block, MemoryHint::Unified),
        Err(Error::DoubleFree { .. })
    ));
}

// ****************************
// Replay property
// ****************************

proptest! {
    /// Any interleaving of matched allocs and frees replays back to the
    /// pristine state, and the mask mirrors the lists at every step.
    #[test]
    fn matched_sequences_restore_initial_state(
        sizes in proptest::collection::vec(1usize..=MAX_SIZE, 1..24),
        free_order in proptest::collection::vec(any::<prop::sample::Index>(), 0..24),
    ) {
        let mut alloc = unified_alloc();
        let mut live: Vec<(usize, usize)> = Vec::new();

        for &size in &sizes {
            match alloc.allocate(size, MemoryHint::Unified) {
                Ok(offset) => live.push((size, offset)),
                Err(Error::OutOfMemory { .. }) => {
                    // Slab pressure; drop one live block and move on.
                    if let Some((sz, off)) = live.pop() {
                        alloc.free(sz, off, MemoryHint::Unified).unwrap();
                    }
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
            assert_mask_matches_lists(&alloc, MemoryHint::Unified);
        }

        // Free everything in the generated order.
        for index in free_order {
            if live.is_empty() {
                break;
            }
            let (size, offset) = live.remove(index.index(live.len()));
            alloc.free(size, offset, MemoryHint::Unified).unwrap();
            assert_mask_matches_lists(&alloc, MemoryHint::Unified);
        }
        for (size, offset) in live.drain(..) {
            alloc.free(size, offset, MemoryHint::Unified).unwrap();
        }

        assert_pristine(&alloc, MemoryHint::Unified);
    }
}
