// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Region allocator for the shared mapping.
//!
//! Ring buffers and their cursor words are carved out of one shared region.
//! The co-processor addresses them by region-relative offset ("peer
//! reference"), so the allocator is also the translator between local
//! pointers and peer references.

use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::error::RegionError;
use crate::shm::SharedMemoryRegion;

/// Granularity of the block allocator in bytes.
pub const BLOCK_SIZE: usize = 64;

/// Allocator interface the ring buffers consume.
///
/// `alloc` returns `None` when the region is exhausted or the request is
/// malformed; nothing here panics.
pub trait SharedAllocator: Send + Sync {
    /// Allocate `size` bytes aligned to `align` (a power of two).
    fn alloc(&self, size: usize, align: usize) -> Option<NonNull<u8>>;

    /// Return an allocation. Unknown pointers are logged and ignored.
    fn free(&self, ptr: NonNull<u8>);

    /// Region-relative offset the peer uses to find `ptr`.
    fn to_peer_ref(&self, ptr: NonNull<u8>) -> Option<u32>;

    /// Local address of a peer reference.
    fn from_peer_ref(&self, peer_ref: u32) -> Option<NonNull<u8>>;
}

/// Bookkeeping for one live allocation.
#[derive(Debug, Clone, Copy)]
struct Allocation {
    first_block: usize,
    num_blocks: usize,
}

#[derive(Debug)]
struct BlockMap {
    in_use: Vec<bool>,
    /// Keyed by the aligned offset handed to the caller.
    allocations: HashMap<usize, Allocation>,
    free_bytes: usize,
}

impl BlockMap {
    /// Best-fit search: the shortest free run that still holds `num_blocks`.
    fn find_run(&self, num_blocks: usize) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        let mut index = 0;

        while index < self.in_use.len() {
            if self.in_use[index] {
                index += 1;
                continue;
            }
            let start = index;
            while index < self.in_use.len() && !self.in_use[index] {
                index += 1;
            }
            let run = index - start;
            if run >= num_blocks && best.map_or(true, |(_, len)| run < len) {
                best = Some((start, run));
            }
        }

        best.map(|(start, _)| start)
    }
}

/// Block-granular allocator over a [`SharedMemoryRegion`].
pub struct BlockAllocator {
    region: SharedMemoryRegion,
    map: Mutex<BlockMap>,
}

impl BlockAllocator {
    /// Take ownership of `region` and manage it in [`BLOCK_SIZE`] blocks.
    pub fn new(region: SharedMemoryRegion) -> Self {
        let num_blocks = region.size() / BLOCK_SIZE;

        tracing::info!(
            size = region.size(),
            blocks = num_blocks,
            block_size = BLOCK_SIZE,
            "Region allocator ready"
        );

        Self {
            map: Mutex::new(BlockMap {
                in_use: vec![false; num_blocks],
                allocations: HashMap::new(),
                free_bytes: num_blocks * BLOCK_SIZE,
            }),
            region,
        }
    }

    /// Map an anonymous region of `size` bytes and manage it.
    pub fn anonymous(size: usize) -> Result<Self, RegionError> {
        Ok(Self::new(SharedMemoryRegion::anonymous(size)?))
    }

    /// Bytes a single allocation of `size` at `align` occupies.
    pub const fn footprint(size: usize, align: usize) -> usize {
        let slack = if align > BLOCK_SIZE { align - BLOCK_SIZE } else { 0 };
        (size + slack).div_ceil(BLOCK_SIZE) * BLOCK_SIZE
    }

    /// Bytes still available for allocation.
    pub fn free_bytes(&self) -> usize {
        self.map.lock().free_bytes
    }

    /// Number of live allocations.
    pub fn live_allocations(&self) -> usize {
        self.map.lock().allocations.len()
    }

    pub fn region(&self) -> &SharedMemoryRegion {
        &self.region
    }

    fn offset_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        if !self.region.contains(ptr.as_ptr()) {
            return None;
        }
        Some(ptr.as_ptr() as usize - self.region.as_ptr() as usize)
    }

    /// Checked variant of [`SharedAllocator::alloc`] reporting why it failed.
    pub fn try_alloc(&self, size: usize, align: usize) -> Result<NonNull<u8>, RegionError> {
        if size == 0 || !align.is_power_of_two() {
            tracing::error!(size, align, "Failed size/alignment check");
            return Err(RegionError::InvalidRequest { size, align });
        }

        let footprint = Self::footprint(size, align);
        let num_blocks = footprint / BLOCK_SIZE;
        let mut map = self.map.lock();

        if footprint > map.free_bytes {
            tracing::info!(size, free = map.free_bytes, "Not enough shared memory");
            return Err(RegionError::OutOfMemory { requested: size });
        }

        let first_block = map.find_run(num_blocks).ok_or_else(|| {
            tracing::info!(size, free = map.free_bytes, "No contiguous run large enough");
            RegionError::OutOfMemory { requested: size }
        })?;

        let base = self.region.as_ptr() as usize;
        let block_addr = base + first_block * BLOCK_SIZE;
        let aligned_addr = (block_addr + align - 1) & !(align - 1);
        let offset = aligned_addr - base;

        for used in &mut map.in_use[first_block..first_block + num_blocks] {
            *used = true;
        }
        map.free_bytes -= footprint;
        map.allocations.insert(
            offset,
            Allocation {
                first_block,
                num_blocks,
            },
        );

        tracing::trace!(size, align, offset, "Shared allocation");

        // SAFETY: offset lies inside the mapping, which is non-null
        Ok(unsafe { NonNull::new_unchecked(self.region.as_ptr().add(offset)) })
    }
}

impl fmt::Debug for BlockAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let map = self.map.lock();
        f.debug_struct("BlockAllocator")
            .field("size", &self.region.size())
            .field("free_bytes", &map.free_bytes)
            .field("live_allocations", &map.allocations.len())
            .finish()
    }
}

impl SharedAllocator for BlockAllocator {
    fn alloc(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        self.try_alloc(size, align).ok()
    }

    fn free(&self, ptr: NonNull<u8>) {
        let Some(offset) = self.offset_of(ptr) else {
            tracing::error!(ptr = ?ptr, "Free of pointer outside the shared region");
            return;
        };

        let mut map = self.map.lock();
        let Some(allocation) = map.allocations.remove(&offset) else {
            tracing::error!(offset, "Free of unknown allocation");
            return;
        };

        let range = allocation.first_block..allocation.first_block + allocation.num_blocks;
        for used in &mut map.in_use[range] {
            *used = false;
        }
        map.free_bytes += allocation.num_blocks * BLOCK_SIZE;

        tracing::trace!(offset, "Shared free");
    }

    fn to_peer_ref(&self, ptr: NonNull<u8>) -> Option<u32> {
        self.offset_of(ptr).and_then(|offset| u32::try_from(offset).ok())
    }

    fn from_peer_ref(&self, peer_ref: u32) -> Option<NonNull<u8>> {
        let offset = peer_ref as usize;
        if offset >= self.region.size() {
            return None;
        }
        // SAFETY: offset is inside the mapping
        NonNull::new(unsafe { self.region.as_ptr().add(offset) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> BlockAllocator {
        BlockAllocator::anonymous(4096).unwrap()
    }

    #[test]
    fn test_alloc_and_free_restores_space() {
        let ram = allocator();
        let before = ram.free_bytes();

        let ptr = ram.alloc(100, 4).unwrap();
        assert_eq!(ram.free_bytes(), before - 128);
        assert_eq!(ram.live_allocations(), 1);

        ram.free(ptr);
        assert_eq!(ram.free_bytes(), before);
        assert_eq!(ram.live_allocations(), 0);
    }

    #[test]
    fn test_rejects_bad_requests() {
        let ram = allocator();
        assert!(ram.alloc(0, 4).is_none());
        assert!(ram.alloc(16, 3).is_none());
        assert!(matches!(
            ram.try_alloc(8192, 4),
            Err(RegionError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn test_alignment_honoured() {
        let ram = allocator();
        let _pad = ram.alloc(1, 4).unwrap();
        let ptr = ram.alloc(32, 256).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 256, 0);
    }

    #[test]
    fn test_best_fit_reuses_smallest_hole() {
        let ram = allocator();
        let a = ram.alloc(64, 4).unwrap();
        let _b = ram.alloc(64, 4).unwrap();
        let c = ram.alloc(256, 4).unwrap();
        let _d = ram.alloc(64, 4).unwrap();

        ram.free(c);
        ram.free(a);

        // The single-block hole left by `a` beats the four-block hole of `c`.
        let e = ram.alloc(10, 4).unwrap();
        assert_eq!(e, a);
    }

    #[test]
    fn test_peer_ref_round_trip() {
        let ram = allocator();
        let ptr = ram.alloc(64, 4).unwrap();
        let peer_ref = ram.to_peer_ref(ptr).unwrap();
        assert_eq!(ram.from_peer_ref(peer_ref), Some(ptr));
        assert!(ram.from_peer_ref(4096).is_none());
    }

    #[test]
    fn test_exhaustion_then_reuse() {
        let ram = allocator();
        let blocks: Vec<_> = (0..64).map(|_| ram.alloc(64, 4).unwrap()).collect();
        assert!(ram.alloc(1, 4).is_none());

        ram.free(blocks[10]);
        assert_eq!(ram.alloc(1, 4), Some(blocks[10]));
    }
}
