use super::bins::{self, BinMap, BIN_COUNT};
use super::pool::{BlockPool, BlockRecord, NIL};
use std::fmt;

/// Default block-record pool capacity (128K records).
///
/// Worst-case pool usage is one record per contiguous used or free run, so
/// this bounds how fragmented the span can get before `alloc` starts
/// reporting [`SuballocError::OutOfBlockSlots`]. Memory cost is 24 bytes
/// per record plus 4 bytes per free-stack entry.
pub const DEFAULT_MAX_BLOCKS: u32 = 128 * 1024;

/// Tag stored in the top nibble of `bin_prev` to mark a bin-list head.
/// A single bit would do; the whole nibble is spare because slot indices
/// stay below [`MAX_POOL_CAPACITY`], and it keeps the tag visually loud
/// in a debugger.
pub(crate) const HEAD_BITS: u32 = 0xf000_0000;

/// Low bits of `bin_prev` when [`HEAD_BITS`] is set: the bin index.
pub(crate) const HEAD_MASK: u32 = 0x0fff_ffff;

/// Largest admissible pool capacity. Indices must stay clear of the
/// [`HEAD_BITS`] nibble and of [`NIL`].
const MAX_POOL_CAPACITY: u32 = HEAD_MASK + 1;

/// Failure modes of [`Suballocator::alloc`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuballocError {
    /// No free range is large enough for the request (or the request was
    /// zero bytes). Recoverable: free something and retry.
    OutOfMemory,
    /// Every block record is in use, so a split cannot file its remainder.
    /// Recoverable only by freeing; avoidable by configuring a larger pool
    /// via [`Suballocator::with_max_blocks`].
    OutOfBlockSlots,
}

impl fmt::Display for SuballocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuballocError::OutOfMemory => {
                write!(f, "no free range large enough for the request")
            }
            SuballocError::OutOfBlockSlots => {
                write!(f, "block record pool exhausted; configure a larger pool")
            }
        }
    }
}

impl std::error::Error for SuballocError {}

/// Receipt for an allocated range: where it starts, how long it is, and
/// the record slot that [`Suballocator::free`] needs to reclaim it.
///
/// Plain copyable data. The allocator keeps no reference to it; freeing
/// the same receipt twice, or a receipt from another allocator, is a logic
/// error. Debug builds abort on it; release builds leave the allocator
/// state unspecified (but still memory-safe, all access is bounds-checked
/// index arithmetic).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Allocation {
    /// Start of the range within the managed span.
    pub offset: u32,
    /// Length of the range in bytes.
    pub size: u32,
    pub(crate) block: u32,
}

/// Point-in-time counters for a [`Suballocator`]. All O(1) reads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SuballocStats {
    pub total_bytes: u32,
    pub free_bytes: u32,
    pub used_bytes: u32,
    /// Outstanding allocations (ranges handed out and not yet freed).
    pub live_allocations: u32,
    /// Block records currently live (one per contiguous used or free run).
    pub block_slots_used: u32,
    pub block_slots_capacity: u32,
}

/// Byte-range suballocator over a single contiguous span of up to 2³²−1
/// bytes that it does not own: it deals purely in offsets and sizes and
/// never touches memory. Typical use is carving a GPU heap or a
/// pre-mapped arena into non-overlapping sub-ranges.
///
/// Free ranges are filed into 256 segregated size classes indexed by a
/// two-level bitmap, so `alloc` finds the best-fitting class in a couple
/// of bit scans and pops its list head: O(1), no searching. Every range,
/// used or free, also sits on an address-ordered chain; `free` merges the
/// released range with free neighbours on that chain so fragmentation
/// heals as fast as it appears.
///
/// Single-threaded by design: every mutator takes `&mut self`, callers
/// add their own locking if they need it.
pub struct Suballocator {
    total_size: u32,
    pool: BlockPool,
    bins: BinMap,
    /// First block of each bin's free-list, or `NIL`.
    bin_heads: [u32; BIN_COUNT],
    /// Block with `offset == 0`; anchor of the address-ordered chain.
    head_block: u32,
    free_bytes: u32,
    live_allocs: u32,
}

impl Suballocator {
    /// Suballocator over `total_size` bytes with the default record pool.
    ///
    /// # Panics
    ///
    /// Panics if `total_size` is zero.
    #[must_use]
    pub fn new(total_size: u32) -> Self {
        Self::with_max_blocks(total_size, DEFAULT_MAX_BLOCKS)
    }

    /// Suballocator with an explicit record pool capacity.
    ///
    /// One record is live per contiguous used or free run of the span, so
    /// `max_blocks` bounds the fragmentation the allocator can represent;
    /// size it generously (see [`DEFAULT_MAX_BLOCKS`]).
    ///
    /// # Panics
    ///
    /// Panics if `total_size` is zero, or if `max_blocks` is zero or
    /// exceeds the 2²⁸ slot indices the record encoding can address.
    #[must_use]
    pub fn with_max_blocks(total_size: u32, max_blocks: u32) -> Self {
        assert!(total_size > 0, "cannot manage a zero-byte span");
        assert!(max_blocks > 0, "block record pool needs at least one slot");
        assert!(
            max_blocks <= MAX_POOL_CAPACITY,
            "pool capacity {max_blocks} exceeds the {MAX_POOL_CAPACITY} addressable slots",
        );

        let mut heap = Self {
            total_size,
            pool: BlockPool::with_capacity(max_blocks),
            bins: BinMap::new(),
            bin_heads: [NIL; BIN_COUNT],
            head_block: NIL,
            free_bytes: total_size,
            live_allocs: 0,
        };
        heap.insert_free_block(0, total_size, NIL, NIL)
            .expect("fresh pool has at least one slot");
        heap
    }

    #[inline]
    #[must_use]
    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    #[must_use]
    pub fn stats(&self) -> SuballocStats {
        SuballocStats {
            total_bytes: self.total_size,
            free_bytes: self.free_bytes,
            used_bytes: self.total_size - self.free_bytes,
            live_allocations: self.live_allocs,
            block_slots_used: self.pool.live_count(),
            block_slots_capacity: self.pool.capacity(),
        }
    }

    /// Carve `size` bytes out of the span.
    ///
    /// Probes the request's own size class first, in case its head block
    /// already fits (an exact-fit free block files exactly there), then
    /// falls back to the smallest class guaranteed to fit. Either way it
    /// pops a list head and files any remainder back as a smaller free
    /// range. The returned offset is whatever the chosen block started
    /// at; no alignment is promised beyond the size-class quantisation.
    ///
    /// # Errors
    ///
    /// [`SuballocError::OutOfMemory`] when `size` is zero or no free range
    /// can satisfy it; [`SuballocError::OutOfBlockSlots`] when a split
    /// cannot file its remainder. A failed call leaves the allocator
    /// exactly as it was.
    pub fn alloc(&mut self, size: u32) -> Result<Allocation, SuballocError> {
        if size == 0 {
            return Err(SuballocError::OutOfMemory);
        }
        // The round-up search below would skip the request's own class,
        // whose head can still be big enough: an exact-fit block files
        // exactly there. One head probe keeps that case O(1).
        let floor = bins::size_bin(size);
        let floor_head = self.bin_heads[floor as usize];
        let bin = if floor_head != NIL && self.pool[floor_head].size >= size {
            floor
        } else {
            self.bins
                .find_at_or_above(bins::request_bin(size))
                .ok_or(SuballocError::OutOfMemory)?
        };

        let idx = self.bin_heads[bin as usize];
        debug_assert_ne!(idx, NIL, "resident bin {bin} has no list head");
        let old = self.pool[idx];
        debug_assert!(old.size >= size, "bin {bin} produced an undersized block");

        // Pop the head; the next block, if any, inherits the head marker.
        self.bin_heads[bin as usize] = old.bin_next;
        if old.bin_next != NIL {
            self.pool[old.bin_next].bin_prev = HEAD_BITS | bin;
        } else {
            self.bins.mark_empty(bin);
        }
        {
            let rec = &mut self.pool[idx];
            rec.bin_prev = NIL;
            rec.bin_next = NIL;
        }

        let remaining = old.size - size;
        if remaining > 0 {
            if let Err(e) = self.insert_free_block(old.offset + size, remaining, idx, old.mem_next)
            {
                // No slot for the remainder. The popped block was the head
                // of `bin`, so pushing it back to the front restores the
                // exact prior state.
                self.push_bin_head(bin, idx);
                return Err(e);
            }
        }
        self.pool[idx].size = size;
        self.free_bytes -= size;
        self.live_allocs += 1;
        Ok(Allocation {
            offset: old.offset,
            size,
            block: idx,
        })
    }

    /// Return a range to the span, merging it with free neighbours on the
    /// address chain so adjacent free ranges always appear as one block.
    ///
    /// The record slot is released before the merge, so the LIFO pool can
    /// hand a just-released slot straight back for the merged block and
    /// steady churn keeps touching the same few records.
    pub fn free(&mut self, allocation: Allocation) {
        let idx = allocation.block;
        let mut merged = self.pool[idx];
        debug_assert!(merged.is_used(), "freed a range that is not allocated");
        let freed_bytes = merged.size;
        self.pool.release(idx);

        if merged.mem_prev != NIL {
            let prev = self.pool[merged.mem_prev];
            if !prev.is_used() {
                merged.offset = prev.offset;
                merged.size += prev.size;
                self.unlink_from_bin(merged.mem_prev);
                self.pool.release(merged.mem_prev);
                merged.mem_prev = prev.mem_prev;
            }
        }
        if merged.mem_next != NIL {
            let next = self.pool[merged.mem_next];
            if !next.is_used() {
                merged.size += next.size;
                self.unlink_from_bin(merged.mem_next);
                self.pool.release(merged.mem_next);
                merged.mem_next = next.mem_next;
            }
        }

        // At least one slot was released above, so this acquire cannot fail.
        self.insert_free_block(merged.offset, merged.size, merged.mem_prev, merged.mem_next)
            .expect("block pool drained during free");

        self.free_bytes += freed_bytes;
        self.live_allocs -= 1;
    }

    /// Iterate every block, used and free, in address order.
    ///
    /// Yields snapshots; the borrow on `self` keeps them from being held
    /// across `alloc`/`free`.
    #[must_use]
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            heap: self,
            next: self.head_block,
        }
    }

    /// Acquire a slot, file the range into its size class, and splice it
    /// into the address chain between `mem_prev` and `mem_next`.
    fn insert_free_block(
        &mut self,
        offset: u32,
        size: u32,
        mem_prev: u32,
        mem_next: u32,
    ) -> Result<u32, SuballocError> {
        let idx = self.pool.acquire().ok_or(SuballocError::OutOfBlockSlots)?;
        {
            let rec = &mut self.pool[idx];
            rec.offset = offset;
            rec.size = size;
            rec.mem_prev = mem_prev;
            rec.mem_next = mem_next;
        }
        self.push_bin_head(bins::size_bin(size), idx);

        if mem_prev != NIL {
            self.pool[mem_prev].mem_next = idx;
        }
        if mem_next != NIL {
            self.pool[mem_next].mem_prev = idx;
        }
        if offset == 0 {
            self.head_block = idx;
        }
        Ok(idx)
    }

    /// Front-insert a block onto `bin`'s list and mark the bin resident.
    fn push_bin_head(&mut self, bin: u32, idx: u32) {
        let old_head = self.bin_heads[bin as usize];
        {
            let rec = &mut self.pool[idx];
            rec.bin_prev = HEAD_BITS | bin;
            rec.bin_next = old_head;
        }
        if old_head != NIL {
            self.pool[old_head].bin_prev = idx;
        }
        self.bin_heads[bin as usize] = idx;
        self.bins.mark_resident(bin);
    }

    /// Unlink a free block from its bin list. Does not release the slot;
    /// the caller decides what happens to the record.
    fn unlink_from_bin(&mut self, idx: u32) {
        let BlockRecord {
            bin_prev, bin_next, ..
        } = self.pool[idx];

        if bin_prev & HEAD_BITS == 0 {
            // Mid-list: bin_prev is a real predecessor.
            self.pool[bin_prev].bin_next = bin_next;
            if bin_next != NIL {
                self.pool[bin_next].bin_prev = bin_prev;
            }
            return;
        }

        // List head: the marker (and with it the bin index) migrates to
        // the successor, or the bin goes empty.
        let bin = bin_prev & HEAD_MASK;
        self.bin_heads[bin as usize] = bin_next;
        if bin_next != NIL {
            self.pool[bin_next].bin_prev = bin_prev;
        } else {
            self.bins.mark_empty(bin);
        }
    }
}

/// Address-ordered iterator over the blocks of a [`Suballocator`].
pub struct Blocks<'a> {
    heap: &'a Suballocator,
    next: u32,
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        if self.next == NIL {
            return None;
        }
        let rec = self.heap.pool[self.next];
        self.next = rec.mem_next;
        Some(BlockInfo {
            offset: rec.offset,
            size: rec.size,
            used: rec.is_used(),
        })
    }
}

/// Snapshot of one block, as yielded by [`Suballocator::blocks`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    pub offset: u32,
    pub size: u32,
    used: bool,
}

impl BlockInfo {
    /// Whether this block is currently allocated (as opposed to free).
    #[inline]
    #[must_use]
    pub fn is_used(&self) -> bool {
        self.used
    }
}

#[cfg(test)]
impl Suballocator {
    /// Full-structure audit for tests: walks every bin list and the whole
    /// address chain and asserts the cross-structure invariants (span
    /// coverage and contiguity, maximal coalescing, bitmap/head agreement,
    /// list wiring, the head-marker encoding, the counters).
    pub(crate) fn assert_integrity(&self) {
        use super::bins::TOP_BIN_COUNT;
        use std::collections::HashSet;

        let mut on_bin_list: HashSet<u32> = HashSet::new();
        for bin in 0..BIN_COUNT as u32 {
            let head = self.bin_heads[bin as usize];
            let resident = self.bins.bottom[(bin >> 3) as usize] & (1 << (bin & 7)) != 0;
            assert_eq!(
                resident,
                head != NIL,
                "bitmap and list head disagree for bin {bin}",
            );
            if head == NIL {
                continue;
            }
            assert_eq!(
                self.pool[head].bin_prev,
                HEAD_BITS | bin,
                "head of bin {bin} lacks its marker",
            );
            let mut cur = head;
            let mut steps = 0u32;
            loop {
                assert!(
                    on_bin_list.insert(cur),
                    "block {cur} appears on more than one bin list",
                );
                assert_eq!(
                    bins::size_bin(self.pool[cur].size),
                    bin,
                    "block {cur} filed in the wrong bin",
                );
                let next = self.pool[cur].bin_next;
                if next == NIL {
                    break;
                }
                assert_eq!(
                    self.pool[next].bin_prev, cur,
                    "bin {bin} back-link broken at block {next}",
                );
                cur = next;
                steps += 1;
                assert!(steps <= self.pool.capacity(), "bin {bin} list does not terminate");
            }
        }
        for t in 0..TOP_BIN_COUNT {
            assert_eq!(
                self.bins.top & (1u32 << t) != 0,
                self.bins.bottom[t] != 0,
                "top bitmap disagrees with tier {t}",
            );
        }

        let mut cur = self.head_block;
        let mut expected_offset = 0u64;
        let mut free_sum = 0u64;
        let mut used_count = 0u32;
        let mut chain_len = 0u32;
        let mut prev = NIL;
        let mut prev_free = false;
        while cur != NIL {
            let rec = self.pool[cur];
            assert_eq!(
                u64::from(rec.offset),
                expected_offset,
                "address chain is not contiguous at block {cur}",
            );
            assert!(rec.size > 0, "zero-sized block {cur} on the address chain");
            assert_eq!(rec.mem_prev, prev, "address back-link broken at block {cur}");

            let free = !rec.is_used();
            assert!(
                !(free && prev_free),
                "adjacent free blocks survived coalescing at block {cur}",
            );
            assert_eq!(
                free,
                on_bin_list.contains(&cur),
                "used predicate disagrees with bin-list membership for block {cur}",
            );
            if free {
                free_sum += u64::from(rec.size);
            } else {
                used_count += 1;
            }
            expected_offset += u64::from(rec.size);
            prev = cur;
            prev_free = free;
            cur = rec.mem_next;
            chain_len += 1;
            assert!(
                chain_len <= self.pool.capacity(),
                "address chain does not terminate",
            );
        }
        assert_eq!(
            expected_offset,
            u64::from(self.total_size),
            "address chain does not cover the span",
        );
        assert_eq!(free_sum, u64::from(self.free_bytes), "free-byte counter out of sync");
        assert_eq!(used_count, self.live_allocs, "live-allocation counter out of sync");
        assert_eq!(
            chain_len,
            self.pool.live_count(),
            "pool live count disagrees with the address chain",
        );
        assert_eq!(
            on_bin_list.len() as u32,
            chain_len - used_count,
            "a bin list holds a block that is not on the address chain",
        );
    }
}
