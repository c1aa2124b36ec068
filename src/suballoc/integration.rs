#[cfg(test)]
mod tests {
    use crate::suballoc::ranges::{Allocation, SuballocError, Suballocator};
    use quickcheck::{Arbitrary, Gen, QuickCheck};

    /// Deterministic xorshift so a stress failure reproduces byte-for-byte.
    struct XorShift64(u64);

    impl XorShift64 {
        fn next(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }

        fn below(&mut self, n: u64) -> u64 {
            self.next() % n
        }
    }

    #[test]
    fn test_stress_churn_keeps_invariants() {
        // Shape of the workload: fill a slot table, then repeatedly free
        // and re-allocate half of it with random 256-quantised sizes,
        // auditing the full structure after every operation.
        const ROUNDS: usize = 32;
        const SLOTS: usize = 400;

        let mut rng = XorShift64(0x9e37_79b9_7f4a_7c15);
        let mut heap = Suballocator::new(u32::MAX);
        let mut live: Vec<Option<Allocation>> = Vec::with_capacity(SLOTS);

        for _ in 0..SLOTS {
            let size = 256 * (1 + rng.below(65536) as u32);
            live.push(heap.alloc(size).ok());
        }
        heap.assert_integrity();

        for round in 0..ROUNDS {
            for i in ((round % 2)..SLOTS).step_by(2) {
                if let Some(a) = live[i].take() {
                    heap.free(a);
                    heap.assert_integrity();
                }
            }
            for i in ((round % 2)..SLOTS).step_by(2) {
                let size = 256 * (1 + rng.below(65536) as u32);
                match heap.alloc(size) {
                    Ok(a) => live[i] = Some(a),
                    Err(e) => {
                        // The record pool is far larger than the slot
                        // table, so the only way to fail here is capacity.
                        assert_eq!(e, SuballocError::OutOfMemory);
                        live[i] = None;
                    }
                }
                heap.assert_integrity();
            }
        }

        // Drain everything; the span must heal back into one free block.
        for slot in live.iter_mut() {
            if let Some(a) = slot.take() {
                heap.free(a);
            }
        }
        heap.assert_integrity();
        assert_eq!(heap.blocks().count(), 1);
        let stats = heap.stats();
        assert_eq!(stats.free_bytes, heap.total_size());
        assert_eq!(stats.live_allocations, 0);
        assert_eq!(stats.block_slots_used, 1);
    }

    #[test]
    fn test_full_drain_matches_fresh_state() {
        let mut heap = Suballocator::new(1 << 24);
        let fresh = heap.stats();

        // Interleave so the frees hit head, middle, and tail positions of
        // their bin lists and every coalescing case fires at least once.
        let mut held = Vec::new();
        for i in 1..40u32 {
            held.push(heap.alloc(i * 192).unwrap());
        }
        for i in (0..held.len()).rev().step_by(3) {
            heap.free(held.swap_remove(i));
            heap.assert_integrity();
        }
        for i in 1..10u32 {
            held.push(heap.alloc(i * 4096 + 7).unwrap());
        }
        while let Some(a) = held.pop() {
            heap.free(a);
            heap.assert_integrity();
        }

        assert_eq!(heap.stats(), fresh);
        let only: Vec<_> = heap.blocks().collect();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].offset, 0);
        assert_eq!(only[0].size, 1 << 24);
        assert!(!only[0].is_used());
    }

    #[test]
    fn test_pool_exhaustion_and_recovery() {
        // Eight records: seven used runs plus the shrinking tail fills the
        // pool; the next splitting alloc must fail without side effects.
        let mut heap = Suballocator::with_max_blocks(1 << 16, 8);
        let mut held = Vec::new();
        for _ in 0..7 {
            held.push(heap.alloc(256).unwrap());
        }
        heap.assert_integrity();
        assert_eq!(heap.stats().block_slots_used, 8);

        let before = heap.stats();
        assert_eq!(heap.alloc(256), Err(SuballocError::OutOfBlockSlots));
        heap.assert_integrity();
        assert_eq!(heap.stats(), before);

        // Freeing any run hands its record back; splitting works again.
        heap.free(held.pop().unwrap());
        heap.assert_integrity();
        held.push(heap.alloc(256).unwrap());
        heap.assert_integrity();

        for a in held.drain(..) {
            heap.free(a);
        }
        heap.assert_integrity();
        assert_eq!(heap.stats().block_slots_used, 1);
    }

    #[derive(Clone, Debug)]
    enum HeapOp {
        Alloc { size: u32 },
        Free { index: usize },
    }

    impl Arbitrary for HeapOp {
        fn arbitrary(g: &mut Gen) -> Self {
            if bool::arbitrary(g) {
                // Spread sizes across the size-class range instead of
                // uniformly, so small and huge bins both see traffic.
                let exp = u32::arbitrary(g) % 21;
                HeapOp::Alloc {
                    size: 1 + u32::arbitrary(g) % (1u32 << exp),
                }
            } else {
                HeapOp::Free {
                    index: usize::arbitrary(g),
                }
            }
        }
    }

    #[test]
    fn test_random_op_sequences_stay_consistent() {
        fn prop(ops: Vec<HeapOp>) -> bool {
            let mut heap = Suballocator::with_max_blocks(1 << 26, 4096);
            let mut live: Vec<Allocation> = Vec::new();

            for op in ops {
                match op {
                    HeapOp::Alloc { size } => {
                        if let Ok(a) = heap.alloc(size) {
                            live.push(a);
                        }
                    }
                    HeapOp::Free { index } => {
                        if live.is_empty() {
                            continue;
                        }
                        let a = live.swap_remove(index % live.len());
                        heap.free(a);
                    }
                }
                heap.assert_integrity();
            }

            for a in live.drain(..) {
                heap.free(a);
            }
            heap.assert_integrity();
            heap.blocks().count() == 1 && heap.stats().free_bytes == heap.total_size()
        }

        QuickCheck::new().quickcheck(prop as fn(Vec<HeapOp>) -> bool);
    }
}
