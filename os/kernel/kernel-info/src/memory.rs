//! # Memory Layout
//!
//! Compile-time layout of the kernel virtual address space for both supported
//! widths. The page-table geometries in `kernel-vmem` pick one of the
//! [`MemoryLayout`] constants; runtime tunables start from these values.

pub use kernel_memory_addresses::{PAGE_SHIFT, PAGE_SIZE};

/// End of userspace VA range on 64-bit targets (exclusive).
pub const USERSPACE_END: u64 = 0x0000_8000_0000_0000;

/// Higher Half Direct Map (HHDM) base on 64-bit targets.
/// Physical address `pa` is visible to the kernel at `HHDM_BASE + pa`.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Where the kernel executes on 64-bit targets.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Start of the device mapping window on 64-bit targets.
pub const KERNEL_MMIO_START: u64 = 0xffff_c900_0000_0000;

/// End of the device mapping window on 64-bit targets (exclusive).
pub const KERNEL_MMIO_END: u64 = KERNEL_MMIO_START + 64 * 1024 * 1024;

/// Kernel/user split on 32-bit targets (the classic 3G/1G split).
pub const KERNEL_PAGE_OFFSET_32: u64 = 0xC000_0000;

/// Device mapping window on 32-bit targets, just below the top 8 MiB.
pub const KERNEL_MMIO_START_32: u64 = 0xF800_0000;

/// End of the 32-bit device mapping window (exclusive).
pub const KERNEL_MMIO_END_32: u64 = 0xFF80_0000;

/// Size of the fast bitmap allocator's region.
pub const FAST_ALLOC_AREA_SIZE: usize = 64 * 1024;

/// Granularity of the fast bitmap allocator.
pub const FAST_ALLOC_BLOCK_SIZE: usize = 8;

/// Bitmap words needed to track [`FAST_ALLOC_AREA_SIZE`].
pub const FAST_ALLOC_BITMAP_WORDS: usize = FAST_ALLOC_AREA_SIZE / FAST_ALLOC_BLOCK_SIZE / 32;

/// Physical memory below this address is never handed to the page allocator.
pub const LOW_MEMORY_END: u64 = 0x0010_0000;

/// Virtual layout of one address-space width.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryLayout {
    /// First address that belongs to the kernel half.
    pub kernel_base: u64,
    /// Where physical memory is direct-mapped.
    pub direct_map_base: u64,
    /// Device mapping window `[mmio_start, mmio_end)`.
    pub mmio_start: u64,
    pub mmio_end: u64,
}

impl MemoryLayout {
    /// Whether `va` lies in the user half.
    #[inline]
    #[must_use]
    pub const fn is_user(&self, va: u64) -> bool {
        va < self.kernel_base
    }
}

/// 64-bit (4-level) layout.
pub const LAYOUT_64: MemoryLayout = MemoryLayout {
    kernel_base: 0xffff_8000_0000_0000,
    direct_map_base: HHDM_BASE,
    mmio_start: KERNEL_MMIO_START,
    mmio_end: KERNEL_MMIO_END,
};

/// 32-bit (legacy and PAE) layout.
pub const LAYOUT_32: MemoryLayout = MemoryLayout {
    kernel_base: KERNEL_PAGE_OFFSET_32,
    direct_map_base: KERNEL_PAGE_OFFSET_32,
    mmio_start: KERNEL_MMIO_START_32,
    mmio_end: KERNEL_MMIO_END_32,
};

const _: () = {
    assert!(HHDM_BASE >= LAYOUT_64.kernel_base);
    assert!(USERSPACE_END <= LAYOUT_64.kernel_base);
    assert!(KERNEL_BASE > HHDM_BASE);
    assert!(KERNEL_MMIO_START > HHDM_BASE && KERNEL_MMIO_END < KERNEL_BASE);
    assert!(KERNEL_MMIO_START_32 > KERNEL_PAGE_OFFSET_32);
    assert!(KERNEL_MMIO_START.is_multiple_of(PAGE_SIZE));
    assert!(KERNEL_MMIO_END_32.is_multiple_of(PAGE_SIZE));
    assert!(FAST_ALLOC_AREA_SIZE.is_multiple_of(PAGE_SIZE as usize));
    assert!(FAST_ALLOC_AREA_SIZE.is_multiple_of(FAST_ALLOC_BLOCK_SIZE * 32));
};
