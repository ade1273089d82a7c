//! # Fast Bitmap Allocator
//!
//! Small, short-lived kernel buffers carved from one fixed region in 8-byte
//! blocks. One bit per block, `1` meaning in use; bit `b` of word `w` is
//! block `32 * w + b`.
//!
//! Frees are not checked: whatever range the caller names is cleared.

use crate::error::AllocError;
use crate::frame_alloc::{AllocFlags, PageFrames, PageId};
use core::ptr::NonNull;
use kernel_info::memory::{FAST_ALLOC_BITMAP_WORDS, FAST_ALLOC_BLOCK_SIZE};
use kernel_memory_addresses::{VirtualAddress, pages_for};
use kernel_vmem::PhysMapper;
use log::{debug, info, trace};

/// Counters reported by [`FastAllocator::stats`].
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct FastStats {
    pub alloc_calls: usize,
    pub free_calls: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
}

/// Mask of the `n` lowest bits.
#[inline]
const fn low_mask(n: usize) -> u32 {
    if n >= 32 { u32::MAX } else { (1 << n) - 1 }
}

/// First-fit bitmap allocator over `WORDS * 32` blocks.
pub struct FastAllocator<const WORDS: usize = FAST_ALLOC_BITMAP_WORDS> {
    base: VirtualAddress,
    bitmap: [u32; WORDS],
    allocs: usize,
    frees: usize,
}

impl<const WORDS: usize> FastAllocator<WORDS> {
    pub const BLOCK_SIZE: usize = FAST_ALLOC_BLOCK_SIZE;
    pub const BLOCKS: usize = WORDS * 32;
    pub const AREA_SIZE: usize = Self::BLOCKS * Self::BLOCK_SIZE;

    /// An empty bitmap over the region starting at `base`.
    ///
    /// The region itself is never touched; the caller owns it for
    /// [`AREA_SIZE`](Self::AREA_SIZE) bytes.
    #[must_use]
    pub const fn new(base: VirtualAddress) -> Self {
        Self {
            base,
            bitmap: [0; WORDS],
            allocs: 0,
            frees: 0,
        }
    }

    /// Reserve the region as one contiguous run from `frames`.
    ///
    /// # Errors
    /// [`AllocError::OutOfMemory`] if no long enough run is free.
    pub fn reserve<M: PhysMapper + Copy>(
        frames: &PageFrames<M>,
    ) -> Result<(Self, PageId), AllocError> {
        let pages = pages_for(Self::AREA_SIZE as u64) as usize;
        let run = frames.allocate(pages, AllocFlags::CONTIGUOUS)?;
        let Some(base) = frames.virt(run) else {
            frames.free(run)?;
            return Err(AllocError::InvalidRange("fast region is not kernel mapped"));
        };
        info!(
            "fast alloc: {} bytes in {}-byte blocks at {base}",
            Self::AREA_SIZE,
            Self::BLOCK_SIZE
        );
        Ok((Self::new(base), run))
    }

    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    #[must_use]
    pub const fn bitmap(&self) -> &[u32; WORDS] {
        &self.bitmap
    }

    const fn blocks_for(size: usize) -> usize {
        size.div_ceil(Self::BLOCK_SIZE)
    }

    /// First block of `n` consecutive clear bits.
    fn find_clear_run(&self, n: usize) -> Option<usize> {
        if n > Self::BLOCKS {
            return None;
        }
        let mask = low_mask(n);
        // Clear bits at the top of the previous word(s), and where they began.
        let mut carry = 0;
        let mut carry_start = 0;

        for (w, &word) in self.bitmap.iter().enumerate() {
            let clear = !word;
            if clear == u32::MAX {
                if carry == 0 {
                    carry_start = w * 32;
                }
                carry += 32;
                if carry >= n {
                    return Some(carry_start);
                }
                continue;
            }

            if carry > 0 && carry + clear.trailing_ones() as usize >= n {
                return Some(carry_start);
            }
            if n <= 32 {
                if let Some(b) = (0..=32 - n).find(|&b| (clear >> b) & mask == mask) {
                    return Some(w * 32 + b);
                }
            }

            carry = clear.leading_ones() as usize;
            carry_start = w * 32 + 32 - carry;
        }
        None
    }

    fn set_range(&mut self, first: usize, n: usize, used: bool) {
        for block in first..first + n {
            let bit = 1 << (block % 32);
            if used {
                self.bitmap[block / 32] |= bit;
            } else {
                self.bitmap[block / 32] &= !bit;
            }
        }
    }

    /// Allocate `size` bytes rounded up to whole blocks.
    ///
    /// # Errors
    /// - [`AllocError::InvalidRange`] for `size == 0`.
    /// - [`AllocError::OutOfMemory`] if no run of clear blocks is long
    ///   enough, regardless of how many blocks are free in total.
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            return Err(AllocError::InvalidRange("zero-size fast allocation"));
        }
        self.allocs += 1;
        let n = Self::blocks_for(size);
        let Some(first) = self.find_clear_run(n) else {
            debug!("fast alloc: no run of {n} blocks");
            return Err(AllocError::OutOfMemory);
        };
        self.set_range(first, n, true);
        trace!("fast alloc: {n} block(s) at {first}");
        let va = self.base + (first * Self::BLOCK_SIZE) as u64;
        NonNull::new(va.as_mut_ptr()).ok_or(AllocError::InvalidRange("fast region at null"))
    }

    /// Clear the blocks covering `[ptr, ptr + size)`.
    ///
    /// # Errors
    /// [`AllocError::InvalidRange`] if the range is empty, not block aligned,
    /// or leaves the region.
    pub fn free(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), AllocError> {
        let va = VirtualAddress::from_nonnull(ptr);
        let offset = (va >= self.base)
            .then(|| (va - self.base) as usize)
            .filter(|&off| off < Self::AREA_SIZE && off % Self::BLOCK_SIZE == 0)
            .ok_or(AllocError::InvalidRange("pointer outside the fast region"))?;
        let first = offset / Self::BLOCK_SIZE;
        let n = Self::blocks_for(size);
        if n == 0 || first + n > Self::BLOCKS {
            return Err(AllocError::InvalidRange("range outside the fast region"));
        }
        self.set_range(first, n, false);
        self.frees += 1;
        trace!("fast free: {n} block(s) at {first}");
        Ok(())
    }

    #[must_use]
    pub fn stats(&self) -> FastStats {
        let used_blocks: usize = self.bitmap.iter().map(|w| w.count_ones() as usize).sum();
        let used_bytes = used_blocks * Self::BLOCK_SIZE;
        FastStats {
            alloc_calls: self.allocs,
            free_calls: self.frees,
            used_bytes,
            free_bytes: Self::AREA_SIZE - used_bytes,
        }
    }

    pub fn log_stats(&self) {
        let s = self.stats();
        info!(
            "fast alloc: used={} B free={} B allocs={} frees={}",
            s.used_bytes, s.free_bytes, s.alloc_calls, s.free_calls
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Small = FastAllocator<2>;
    const BASE: u64 = 0xffff_c000_0010_0000;

    fn block(a: &Small, p: NonNull<u8>) -> usize {
        (VirtualAddress::from_nonnull(p) - a.base()) as usize / 8
    }

    #[test]
    fn rounds_up_to_blocks() {
        let mut a = Small::new(VirtualAddress::new(BASE));
        let p = a.alloc(1).unwrap();
        let q = a.alloc(9).unwrap();
        assert_eq!(block(&a, p), 0);
        assert_eq!(block(&a, q), 1);
        assert_eq!(a.bitmap(), &[0b111, 0]);
        assert_eq!(a.stats().used_bytes, 24);
    }

    #[test]
    fn runs_cross_word_boundaries() {
        let mut a = Small::new(VirtualAddress::new(BASE));
        let head = a.alloc(30 * 8).unwrap();
        let p = a.alloc(4 * 8).unwrap();
        assert_eq!(block(&a, p), 30);
        assert_eq!(a.bitmap(), &[u32::MAX, 0b11]);
        a.free(head, 30 * 8).unwrap();
        // 30 clear blocks before the run at 30..34, 30 after it.
        let q = a.alloc(30 * 8).unwrap();
        assert_eq!(block(&a, q), 0);
        let r = a.alloc(30 * 8).unwrap();
        assert_eq!(block(&a, r), 34);
    }

    #[test]
    fn fragmentation_is_out_of_memory() {
        let mut a = Small::new(VirtualAddress::new(BASE));
        let ptrs: Vec<_> = (0..64).map(|_| a.alloc(8).unwrap()).collect();
        for p in ptrs.iter().step_by(2) {
            a.free(*p, 8).unwrap();
        }
        assert_eq!(a.stats().free_bytes, 32 * 8);
        assert_eq!(a.alloc(16), Err(AllocError::OutOfMemory));
        assert!(a.alloc(8).is_ok());
    }

    #[test]
    fn whole_region_and_beyond() {
        let mut a = Small::new(VirtualAddress::new(BASE));
        assert_eq!(a.alloc(Small::AREA_SIZE + 1), Err(AllocError::OutOfMemory));
        let p = a.alloc(Small::AREA_SIZE).unwrap();
        assert_eq!(a.bitmap(), &[u32::MAX; 2]);
        a.free(p, Small::AREA_SIZE).unwrap();
        assert_eq!(a.bitmap(), &[0; 2]);
    }

    #[test]
    fn free_checks_bounds_only() {
        let mut a = Small::new(VirtualAddress::new(BASE));
        let outside = NonNull::new((BASE + Small::AREA_SIZE as u64) as *mut u8).unwrap();
        assert!(matches!(a.free(outside, 8), Err(AllocError::InvalidRange(_))));
        let skewed = NonNull::new((BASE + 3) as *mut u8).unwrap();
        assert!(matches!(a.free(skewed, 8), Err(AllocError::InvalidRange(_))));
        // Clearing blocks nobody allocated is accepted.
        let p = NonNull::new(BASE as *mut u8).unwrap();
        assert_eq!(a.free(p, 64), Ok(()));
        assert_eq!(a.stats().free_calls, 1);
    }

    #[test]
    fn zero_size_is_rejected() {
        let mut a = Small::new(VirtualAddress::new(BASE));
        assert!(matches!(a.alloc(0), Err(AllocError::InvalidRange(_))));
    }
}
