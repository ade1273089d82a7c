//! # HHDM-based PhysMapper for Kernel Virtual Memory
//!
//! With a higher-half direct map every physical address `pa` is visible at
//! `base + pa`. Page tables, slab arenas and copy-on-write copies are all
//! reached this way once the kernel runs on its own tables.
//!
//! ## Example
//! ```rust
//! use kernel_alloc::phys_mapper::HhdmPhysMapper;
//! use kernel_vmem::{PhysMapper, PhysicalAddress};
//! let mapper = HhdmPhysMapper::default();
//! let va = mapper.phys_to_virt(PhysicalAddress::new(0x1234_0000));
//! assert_eq!(va.as_u64(), kernel_vmem::info::HHDM_BASE + 0x1234_0000);
//! ```

use kernel_info::memory::HHDM_BASE;
use kernel_vmem::{PhysMapper, PhysicalAddress, VirtualAddress};

/// [`PhysMapper`] for a direct map at a fixed offset.
///
/// # Safety
/// The direct map must be present and cover every physical range the
/// allocators hand out before this mapper is used to dereference anything.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HhdmPhysMapper {
    base: u64,
}

impl HhdmPhysMapper {
    /// Direct map starting at `base` (32-bit kernels use their page offset).
    #[must_use]
    pub const fn new(base: u64) -> Self {
        Self { base }
    }

    #[must_use]
    pub const fn base(&self) -> u64 {
        self.base
    }
}

impl Default for HhdmPhysMapper {
    fn default() -> Self {
        Self::new(HHDM_BASE)
    }
}

impl PhysMapper for HhdmPhysMapper {
    #[inline]
    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(self.base + pa.as_u64())
    }
}
