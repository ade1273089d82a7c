//! Host-side stand-in for physical RAM.
//!
//! [`SimulatedRam`] owns a page-aligned heap buffer and pretends it lives at
//! physical address `origin`. Its [`PhysMapper`] impl is a fixed offset, the
//! same shape as the kernel's direct map, so the allocators and page-table
//! code run unchanged in unit tests.

use crate::PhysMapper;
use alloc::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use kernel_info::memory_map::{MemoryKind, MemoryRegion};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};

/// Zero-initialized, page-aligned memory posing as a physical range.
pub struct SimulatedRam {
    base: *mut u8,
    layout: Layout,
    origin: PhysicalAddress,
}

// SAFETY: the buffer is owned exclusively; callers synchronize access the
// same way they would for real RAM.
unsafe impl Send for SimulatedRam {}
unsafe impl Sync for SimulatedRam {}

impl SimulatedRam {
    /// `frames` pages of RAM starting at physical address `origin`.
    ///
    /// # Panics
    /// If `frames` is zero, `origin` is not page aligned, or the host is out
    /// of memory.
    #[must_use]
    pub fn new(origin: PhysicalAddress, frames: usize) -> Self {
        assert!(frames > 0, "simulated RAM needs at least one frame");
        assert!(origin.is_page_aligned(), "origin {origin} is not page aligned");
        #[allow(clippy::cast_possible_truncation)]
        let Ok(layout) = Layout::from_size_align(frames * PAGE_SIZE as usize, PAGE_SIZE as usize)
        else {
            panic!("{frames} frames do not fit the host address space");
        };
        // SAFETY: non-zero size.
        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            handle_alloc_error(layout);
        }
        Self {
            base,
            layout,
            origin,
        }
    }

    #[must_use]
    pub const fn origin(&self) -> PhysicalAddress {
        self.origin
    }

    /// One past the last simulated physical byte.
    #[must_use]
    pub fn end(&self) -> PhysicalAddress {
        self.origin + self.layout.size() as u64
    }

    #[must_use]
    pub fn frames(&self) -> usize {
        self.layout.size() / PAGE_SIZE as usize
    }

    #[must_use]
    pub fn contains(&self, pa: PhysicalAddress) -> bool {
        pa >= self.origin && pa < self.end()
    }

    /// The whole buffer as a single available memory-map entry.
    #[must_use]
    pub fn memory_map(&self) -> MemoryRegion {
        MemoryRegion::new(self.origin.as_u64(), self.end().as_u64(), MemoryKind::Available)
    }

    /// Read back `len` bytes at `pa`.
    ///
    /// # Panics
    /// If the range leaves the simulated RAM.
    #[must_use]
    pub fn bytes(&self, pa: PhysicalAddress, len: usize) -> &[u8] {
        let off = self.offset(pa);
        assert!(off + len <= self.layout.size(), "{pa}+{len:#x} out of range");
        // SAFETY: bounds checked above; the buffer lives as long as `self`.
        unsafe { core::slice::from_raw_parts(self.base.add(off), len) }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn offset(&self, pa: PhysicalAddress) -> usize {
        debug_assert!(self.contains(pa), "{pa} outside simulated RAM");
        (pa - self.origin) as usize
    }
}

impl PhysMapper for SimulatedRam {
    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        // SAFETY: stays inside the allocation for addresses we own.
        VirtualAddress::from_ptr(unsafe { self.base.add(self.offset(pa)) })
    }
}

impl Drop for SimulatedRam {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this layout.
        unsafe { dealloc(self.base, self.layout) }
    }
}
