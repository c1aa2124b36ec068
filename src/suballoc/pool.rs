#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;
use std::ops::{Index, IndexMut};

/// List terminator / "no block". Never a valid slot index.
pub(crate) const NIL: u32 = u32::MAX;

/// One contiguous range of the managed span, threaded onto two intrusive
/// doubly-linked lists at once: its size-class free-list (`bin_prev` /
/// `bin_next`) and the address-ordered chain (`mem_prev` / `mem_next`).
///
/// `bin_prev` is overloaded:
/// ```text
///   head of a bin list:  HEAD_BITS | bin      (tag in the top nibble)
///   mid-list:            slot index of the previous block in the bin
///   allocated:           NIL (as is bin_next)
/// ```
/// Plain `Copy` data so callers can work on a local snapshot while the
/// lists are being rewired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BlockRecord {
    pub offset: u32,
    pub size: u32,
    pub bin_prev: u32,
    pub bin_next: u32,
    pub mem_prev: u32,
    pub mem_next: u32,
}

impl BlockRecord {
    pub(crate) const VACANT: BlockRecord = BlockRecord {
        offset: 0,
        size: 0,
        bin_prev: NIL,
        bin_next: NIL,
        mem_prev: NIL,
        mem_next: NIL,
    };

    /// An allocated range sits on no bin free-list; both bin links are `NIL`.
    /// A free block always carries at least the head marker in `bin_prev`.
    #[inline]
    #[must_use]
    pub fn is_used(&self) -> bool {
        self.bin_prev == NIL && self.bin_next == NIL
    }
}

/// Fixed-capacity pool of block records with a LIFO stack of vacant slot
/// indices. Acquire and release are O(1); a released index is the first
/// handed out again, so churn keeps reusing the same hot records.
///
/// Debug builds track slot liveness in a bitset and abort on a
/// double-release or a release of a slot that was never acquired.
pub(crate) struct BlockPool {
    records: Box<[BlockRecord]>,
    free_ids: Box<[u32]>,
    /// Next vacant entry in `free_ids`; everything below it is live.
    free_offset: u32,
    #[cfg(debug_assertions)]
    live: FixedBitSet,
}

impl BlockPool {
    pub fn with_capacity(capacity: u32) -> Self {
        Self {
            records: vec![BlockRecord::VACANT; capacity as usize].into_boxed_slice(),
            free_ids: (0..capacity).collect::<Vec<u32>>().into_boxed_slice(),
            free_offset: 0,
            #[cfg(debug_assertions)]
            live: FixedBitSet::with_capacity(capacity as usize),
        }
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.records.len() as u32
    }

    #[inline]
    #[must_use]
    pub fn live_count(&self) -> u32 {
        self.free_offset
    }

    /// Pop a vacant slot, or `None` when the pool is saturated.
    #[inline]
    pub fn acquire(&mut self) -> Option<u32> {
        if self.free_offset as usize == self.free_ids.len() {
            return None;
        }
        let idx = self.free_ids[self.free_offset as usize];
        self.free_offset += 1;
        #[cfg(debug_assertions)]
        {
            debug_assert!(
                !self.live.contains(idx as usize),
                "block slot {idx} handed out while still live",
            );
            self.live.insert(idx as usize);
        }
        Some(idx)
    }

    /// Push a slot back. The record keeps its contents; callers that need
    /// them after release must read before the slot is reused.
    #[inline]
    pub fn release(&mut self, idx: u32) {
        #[cfg(debug_assertions)]
        {
            debug_assert!(
                self.live.contains(idx as usize),
                "released block slot {idx} that is not live",
            );
            self.live.set(idx as usize, false);
        }
        self.free_offset -= 1;
        self.free_ids[self.free_offset as usize] = idx;
    }
}

impl Index<u32> for BlockPool {
    type Output = BlockRecord;

    #[inline]
    fn index(&self, idx: u32) -> &BlockRecord {
        &self.records[idx as usize]
    }
}

impl IndexMut<u32> for BlockPool {
    #[inline]
    fn index_mut(&mut self, idx: u32) -> &mut BlockRecord {
        &mut self.records[idx as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_acquire_until_saturated() {
        let mut pool = BlockPool::with_capacity(4);
        for expected in 0..4 {
            assert_eq!(pool.acquire(), Some(expected));
        }
        assert_eq!(pool.acquire(), None);
        assert_eq!(pool.live_count(), 4);
    }

    #[test]
    fn test_pool_release_is_lifo() {
        // Free order: 2, 0, 1 → reacquire order: 1, 0, 2.
        let mut pool = BlockPool::with_capacity(4);
        for _ in 0..4 {
            pool.acquire();
        }
        pool.release(2);
        pool.release(0);
        pool.release(1);

        assert_eq!(pool.acquire(), Some(1));
        assert_eq!(pool.acquire(), Some(0));
        assert_eq!(pool.acquire(), Some(2));
        assert_eq!(pool.acquire(), None);
    }

    #[test]
    fn test_pool_records_survive_release() {
        let mut pool = BlockPool::with_capacity(2);
        let idx = pool.acquire().unwrap();
        pool[idx].offset = 640;
        pool[idx].size = 480;
        pool.release(idx);
        // The slot is vacant but its record is still readable until reuse.
        assert_eq!(pool[idx].offset, 640);
        assert_eq!(pool[idx].size, 480);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "not live")]
    fn test_pool_double_release_aborts() {
        let mut pool = BlockPool::with_capacity(2);
        let idx = pool.acquire().unwrap();
        pool.release(idx);
        pool.release(idx);
    }
}
