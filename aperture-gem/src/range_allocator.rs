// SPDX-FileCopyrightText: 2025 aperture contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Range allocator over the linear device aperture.
//!
//! Free space is kept as a `BTreeMap` of holes keyed by start offset, so the
//! search walks holes in address order and returns the lowest one that can
//! hold an aligned block. Released blocks are merged with adjacent holes.
//! The allocator never evicts; callers make room and retry.

use std::collections::BTreeMap;

use aperture_common::{is_page_aligned, round_up, GemError, Result};

/// A free hole returned by [`RangeAllocator::search_free`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRegion {
    pub start: u64,
    pub size: u64,
}

/// An allocated aperture range. Owned by exactly one bound object; handing it
/// back to [`RangeAllocator::release`] consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct Block {
    start: u64,
    size: u64,
}

impl Block {
    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn end(&self) -> u64 {
        self.start + self.size
    }
}

/// Allocator for `[base, base + size)`.
#[derive(Debug)]
pub struct RangeAllocator {
    size: u64,
    /// Holes keyed by start offset, value = length.
    free: BTreeMap<u64, u64>,
    /// Live blocks keyed by start offset, value = length.
    allocated: BTreeMap<u64, u64>,
    used: u64,
}

impl RangeAllocator {
    /// Set up the address range. Both ends must be page-aligned and non-empty.
    pub fn new(base: u64, size: u64) -> Result<Self> {
        let end = base
            .checked_add(size)
            .ok_or_else(|| GemError::Config(format!("aperture 0x{base:X}+0x{size:X} overflows")))?;
        if base >= end || !is_page_aligned(base) || !is_page_aligned(end) {
            return Err(GemError::Config(format!(
                "aperture [0x{base:X}..0x{end:X}) must be non-empty and page-aligned"
            )));
        }

        let mut free = BTreeMap::new();
        free.insert(base, size);

        Ok(Self {
            size,
            free,
            allocated: BTreeMap::new(),
            used: 0,
        })
    }

    /// Lowest-address hole that can hold `size` bytes at `alignment`.
    /// The hole is not removed.
    pub fn search_free(&self, size: u64, alignment: u64) -> Option<FreeRegion> {
        if size == 0 {
            return None;
        }
        let alignment = alignment.max(1);
        self.free
            .iter()
            .find(|(&start, &len)| {
                let aligned = round_up(start, alignment);
                aligned
                    .checked_add(size)
                    .is_some_and(|block_end| block_end <= start + len)
            })
            .map(|(&start, &len)| FreeRegion { start, size: len })
    }

    /// Carve an aligned block out of `region`. Returns `None` if the region is
    /// no longer a free hole or cannot hold the block.
    pub fn acquire(&mut self, region: FreeRegion, size: u64, alignment: u64) -> Option<Block> {
        if size == 0 || self.free.get(&region.start) != Some(&region.size) {
            return None;
        }
        let alignment = alignment.max(1);
        let start = round_up(region.start, alignment);
        let end = start.checked_add(size)?;
        let region_end = region.start + region.size;
        if end > region_end {
            return None;
        }

        self.free.remove(&region.start);
        if start > region.start {
            self.free.insert(region.start, start - region.start);
        }
        if region_end > end {
            self.free.insert(end, region_end - end);
        }

        self.allocated.insert(start, size);
        self.used += size;
        Some(Block { start, size })
    }

    /// Search and acquire in one step.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Option<Block> {
        let region = self.search_free(size, alignment)?;
        self.acquire(region, size, alignment)
    }

    /// Return a block to the free pool, merging with neighboring holes.
    ///
    /// # Panics
    ///
    /// If the block is not currently allocated from this allocator.
    pub fn release(&mut self, block: Block) {
        match self.allocated.remove(&block.start) {
            Some(len) if len == block.size => {}
            other => panic!(
                "aperture block [0x{:X}..0x{:X}) released but allocator holds {:?}",
                block.start,
                block.end(),
                other
            ),
        }
        self.used -= block.size;

        let mut start = block.start;
        let mut len = block.size;

        if let Some((&prev_start, &prev_len)) = self.free.range(..start).next_back() {
            if prev_start + prev_len == start {
                self.free.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.free.remove(&(start + len)) {
            len += next_len;
        }

        self.free.insert(start, len);
    }

    pub fn total(&self) -> u64 {
        self.size
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn free_bytes(&self) -> u64 {
        self.size - self.used
    }

    /// Number of holes in the free pool.
    pub fn hole_count(&self) -> usize {
        self.free.len()
    }

    /// True when nothing is allocated.
    pub fn is_clean(&self) -> bool {
        self.allocated.is_empty()
    }
}
