use crate::{DevicePtr, HeapError, HeapResult};
use std::collections::{BTreeMap, HashMap};

/// Occupancy snapshot of a [`Heap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    pub total: u64,
    pub used: u64,
    pub largest_free: u64,
    pub live_allocations: usize,
}

/// First-fit allocator over a range of device addresses.
///
/// The heap never touches memory; it only hands out addresses. Freed blocks are coalesced with
/// their neighbours.
#[derive(Debug, Clone)]
pub struct Heap {
    base: DevicePtr,
    size: u64,
    align: u64,
    /// start -> length, non-overlapping, never adjacent.
    free: BTreeMap<DevicePtr, u64>,
    live: HashMap<DevicePtr, u64>,
}

impl Heap {
    pub fn new(base: DevicePtr, size: u64, align: u64) -> HeapResult<Self> {
        if align == 0 || !align.is_power_of_two() {
            return Err(HeapError::BadAlignment { align });
        }
        // Trim the managed range so every block starts and ends aligned.
        let start = align_up(base, align).unwrap_or(u64::MAX);
        let end = base.saturating_add(size) & !(align - 1);
        let mut free = BTreeMap::new();
        if end > start {
            free.insert(start, end - start);
        }
        Ok(Self {
            base: start,
            size: end.saturating_sub(start),
            align,
            free,
            live: HashMap::new(),
        })
    }

    pub fn base(&self) -> DevicePtr {
        self.base
    }

    pub fn align(&self) -> u64 {
        self.align
    }

    pub fn alloc(&mut self, len: u64) -> HeapResult<DevicePtr> {
        if len == 0 {
            return Err(HeapError::ZeroSize);
        }
        let rounded = align_up(len, self.align).ok_or(HeapError::OutOfMemory {
            requested: len,
            largest_free: self.largest_free(),
        })?;
        let found = self
            .free
            .iter()
            .find(|(_, &block)| block >= rounded)
            .map(|(&start, &block)| (start, block));
        let Some((start, block)) = found else {
            return Err(HeapError::OutOfMemory {
                requested: len,
                largest_free: self.largest_free(),
            });
        };
        self.free.remove(&start);
        if block > rounded {
            self.free.insert(start + rounded, block - rounded);
        }
        self.live.insert(start, rounded);
        tracing::trace!(addr = start, len, "heap alloc");
        Ok(start)
    }

    pub fn free(&mut self, addr: DevicePtr) -> HeapResult<()> {
        let len = self
            .live
            .remove(&addr)
            .ok_or(HeapError::UnknownAllocation { addr })?;
        let mut start = addr;
        let mut block = len;

        if let Some((&prev_start, &prev_len)) = self.free.range(..addr).next_back() {
            if prev_start + prev_len == addr {
                self.free.remove(&prev_start);
                start = prev_start;
                block += prev_len;
            }
        }
        if let Some(&next_len) = self.free.get(&(addr + len)) {
            self.free.remove(&(addr + len));
            block += next_len;
        }
        self.free.insert(start, block);
        tracing::trace!(addr, len, "heap free");
        Ok(())
    }

    /// Rounded size of the live allocation starting at `addr`.
    pub fn allocation_size(&self, addr: DevicePtr) -> Option<u64> {
        self.live.get(&addr).copied()
    }

    pub fn largest_free(&self) -> u64 {
        self.free.values().copied().max().unwrap_or(0)
    }

    pub fn stats(&self) -> HeapStats {
        let free: u64 = self.free.values().sum();
        HeapStats {
            total: self.size,
            used: self.size - free,
            largest_free: self.largest_free(),
            live_allocations: self.live.len(),
        }
    }
}

fn align_up(v: u64, align: u64) -> Option<u64> {
    v.checked_add(align - 1).map(|x| x & !(align - 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let mut heap = Heap::new(0x8000_0000, 4096, 128).unwrap();
        let a = heap.alloc(1).unwrap();
        let b = heap.alloc(200).unwrap();
        assert_eq!(a % 128, 0);
        assert_eq!(b % 128, 0);
        assert_eq!(b, a + 128);
        assert_eq!(heap.allocation_size(b), Some(256));
    }

    #[test]
    fn freed_blocks_are_reused_and_coalesced() {
        let mut heap = Heap::new(0, 1024, 128).unwrap();
        let a = heap.alloc(128).unwrap();
        let b = heap.alloc(128).unwrap();
        let c = heap.alloc(128).unwrap();
        heap.free(a).unwrap();
        heap.free(b).unwrap();
        assert_eq!(heap.alloc(256).unwrap(), a);
        heap.free(c).unwrap();
        assert_eq!(heap.stats().live_allocations, 1);
    }

    #[test]
    fn exhaustion_reports_largest_free_block() {
        let mut heap = Heap::new(0, 512, 128).unwrap();
        heap.alloc(384).unwrap();
        assert_eq!(
            heap.alloc(256),
            Err(HeapError::OutOfMemory {
                requested: 256,
                largest_free: 128
            })
        );
    }

    #[test]
    fn misuse_is_reported() {
        let mut heap = Heap::new(0, 512, 128).unwrap();
        assert_eq!(heap.alloc(0), Err(HeapError::ZeroSize));
        assert_eq!(heap.free(0), Err(HeapError::UnknownAllocation { addr: 0 }));
        assert!(matches!(
            Heap::new(0, 512, 3),
            Err(HeapError::BadAlignment { align: 3 })
        ));
    }

    proptest! {
        #[test]
        fn freeing_everything_restores_one_block(sizes in proptest::collection::vec(1u64..700, 1..24)) {
            let mut heap = Heap::new(0x1000, 1 << 16, 128).unwrap();
            let total = heap.stats().total;
            let mut addrs = Vec::new();
            for len in sizes {
                if let Ok(addr) = heap.alloc(len) {
                    addrs.push(addr);
                }
            }
            // Free in an interleaved order to exercise both coalescing directions.
            let (evens, odds): (Vec<_>, Vec<_>) =
                addrs.iter().enumerate().partition(|(i, _)| i % 2 == 0);
            for (_, addr) in evens.into_iter().chain(odds) {
                heap.free(*addr).unwrap();
            }
            prop_assert_eq!(heap.stats().used, 0);
            prop_assert_eq!(heap.largest_free(), total);
        }
    }
}
