//! Per-class buddy allocator over fixed slabs
//!
//! Each memory class gets one power-of-two slab, initially a single free
//! block of maximum order. Allocation pops from the lowest sufficient
//! order (splitting downward, keeping the left half), freeing merges a
//! block with its XOR-buddy as long as the buddy is free. A 64-bit mask
//! mirrors which orders currently hold free blocks: bit `k` is set iff
//! `free_lists[k]` is non-empty.

use crate::data::MemoryHint;
use crate::error::{Error, Result};
use std::collections::HashMap;

/// Round up to the next power-of-two exponent
fn ceil_log2(x: usize) -> usize {
    if x <= 1 {
        0
    } else {
        (usize::BITS - (x - 1).leading_zeros()) as usize
    }
}

struct BuddyClass {
    min_order: usize,
    max_order: usize,
    free_mask: u64,
    /// Per-order free offsets; allocation pops the most recently freed
    free_lists: Vec<Vec<usize>>,
    /// Per-order offset → position in `free_lists`, for O(1) removal
    free_index: Vec<HashMap<usize, usize>>,
}

impl BuddyClass {
    fn new(min_size: usize, max_size: usize) -> Result<Self> {
        let min_order = ceil_log2(min_size);
        let max_order = ceil_log2(max_size);
        if max_order >= 64 || min_order > max_order {
            return Err(Error::Internal(format!(
                "invalid buddy bounds: min {min_size}, max {max_size}"
            )));
        }

        let mut free_lists = vec![Vec::new(); max_order + 1];
        let mut free_index = vec![HashMap::new(); max_order + 1];
        free_lists[max_order].push(0);
        free_index[max_order].insert(0, 0);

        Ok(Self {
            min_order,
            max_order,
            free_mask: 1u64 << max_order,
            free_lists,
            free_index,
        })
    }

    fn allocate(&mut self, mem_size: usize, class: MemoryHint) -> Result<usize> {
        let order = ceil_log2(mem_size).max(self.min_order);
        if order > self.max_order {
            return Err(Error::out_of_memory(mem_size, class));
        }

        // Restrict the mask to orders >= order.
        let search_mask = self.free_mask & !((1u64 << order) - 1);
        if search_mask == 0 {
            return Err(Error::out_of_memory(mem_size, class));
        }

        let found_order = search_mask.trailing_zeros() as usize;
        let offset = self.free_lists[found_order]
            .pop()
            .expect("free mask bit implies a non-empty list");
        self.free_index[found_order].remove(&offset);
        if self.free_lists[found_order].is_empty() {
            self.free_mask &= !(1u64 << found_order);
        }

        // Split downward; the left half stays with the caller.
        for split_order in (order..found_order).rev() {
            let right = offset + (1usize << split_order);
            self.free_lists[split_order].push(right);
            self.free_index[split_order].insert(right, self.free_lists[split_order].len() - 1);
            self.free_mask |= 1u64 << split_order;
        }

        Ok(offset)
    }

    fn free(&mut self, mem_size: usize, offset: usize, class: MemoryHint) -> Result<()> {
        let mut order = ceil_log2(mem_size).max(self.min_order);
        let mut addr = offset;

        // A double free may have merged upward already, so check every
        // enclosing aligned block, not just this order.
        for k in order..=self.max_order {
            let ancestor = addr & !((1usize << k) - 1);
            if self.free_index[k].contains_key(&ancestor) {
                return Err(Error::DoubleFree { offset, class });
            }
        }

        while order < self.max_order {
            let buddy = addr ^ (1usize << order);
            let Some(&buddy_pos) = self.free_index[order].get(&buddy) else {
                break;
            };

            // Swap-pop the buddy out of its free list.
            let last = *self.free_lists[order]
                .last()
                .expect("indexed offset implies a non-empty list");
            self.free_lists[order][buddy_pos] = last;
            self.free_index[order].insert(last, buddy_pos);
            self.free_lists[order].pop();
            self.free_index[order].remove(&buddy);

            if self.free_lists[order].is_empty() {
                self.free_mask &= !(1u64 << order);
            }

            addr = addr.min(buddy);
            order += 1;
        }

        self.free_lists[order].push(addr);
        self.free_index[order].insert(addr, self.free_lists[order].len() - 1);
        self.free_mask |= 1u64 << order;
        Ok(())
    }
}

/// Buddy allocator with one independent sub-allocator per memory class
///
/// Classes constructed with zero bounds are absent; using them fails
/// with [`Error::InvalidMemoryClass`].
pub struct BuddyAllocator {
    classes: [Option<BuddyClass>; 3],
}

fn class_index(class: MemoryHint) -> usize {
    match class {
        MemoryHint::DeviceLocal => 0,
        MemoryHint::Unified => 1,
        MemoryHint::HostVisible => 2,
    }
}

impl BuddyAllocator {
    /// Build the per-class allocators from `(min_size, max_size)` bounds
    ///
    /// A class with `max_size == 0` is left unconfigured.
    pub fn new(
        device_local: (usize, usize),
        unified: (usize, usize),
        host_visible: (usize, usize),
    ) -> Result<Self> {
        let build = |(min, max): (usize, usize)| -> Result<Option<BuddyClass>> {
            if max == 0 {
                Ok(None)
            } else {
                BuddyClass::new(min, max).map(Some)
            }
        };
        Ok(Self {
            classes: [build(device_local)?, build(unified)?, build(host_visible)?],
        })
    }

    fn class(&self, class: MemoryHint) -> Result<&BuddyClass> {
        self.classes[class_index(class)]
            .as_ref()
            .ok_or(Error::InvalidMemoryClass { class })
    }

    fn class_mut(&mut self, class: MemoryHint) -> Result<&mut BuddyClass> {
        self.classes[class_index(class)]
            .as_mut()
            .ok_or(Error::InvalidMemoryClass { class })
    }

    /// Whether the class was configured with non-zero bounds
    pub fn has_class(&self, class: MemoryHint) -> bool {
        self.classes[class_index(class)].is_some()
    }

    /// Allocate a block for `mem_size` bytes; returns its slab offset
    ///
    /// Requests below the minimum block size round up to `min_order`;
    /// requests above the slab fail with [`Error::OutOfMemory`].
    pub fn allocate(&mut self, mem_size: usize, class: MemoryHint) -> Result<usize> {
        let result = self.class_mut(class)?.allocate(mem_size, class);
        if result.is_err() {
            tracing::warn!(mem_size, ?class, "buddy allocation failed");
        }
        result
    }

    /// Return a block to the allocator, merging buddies as far as possible
    ///
    /// `mem_size` must be the size passed to the matching
    /// [`BuddyAllocator::allocate`]. Freeing an already-free block fails
    /// with [`Error::DoubleFree`].
    pub fn free(&mut self, mem_size: usize, offset: usize, class: MemoryHint) -> Result<()> {
        self.class_mut(class)?.free(mem_size, offset, class)
    }

    /// Total slab size for a class in bytes
    pub fn slab_size(&self, class: MemoryHint) -> Result<usize> {
        Ok(1usize << self.class(class)?.max_order)
    }

    /// Minimum block order of a class
    pub fn min_order(&self, class: MemoryHint) -> Result<usize> {
        Ok(self.class(class)?.min_order)
    }

    /// Maximum block order of a class
    pub fn max_order(&self, class: MemoryHint) -> Result<usize> {
        Ok(self.class(class)?.max_order)
    }

    /// The free-orders bitmask of a class
    pub fn free_mask(&self, class: MemoryHint) -> Result<u64> {
        Ok(self.class(class)?.free_mask)
    }

    /// Number of free blocks at `order`
    pub fn free_list_len(&self, class: MemoryHint, order: usize) -> Result<usize> {
        let c = self.class(class)?;
        Ok(c.free_lists.get(order).map_or(0, Vec::len))
    }
}
