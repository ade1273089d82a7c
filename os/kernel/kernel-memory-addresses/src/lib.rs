//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for the raw addresses the memory subsystem passes
//! around. The types are zero-cost newtypes over `u64` so the same code serves
//! 32-bit (legacy and PAE) and 64-bit page tables; the page-table geometry
//! decides how many of the bits are meaningful.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A machine bus address (RAM or MMIO). |
//! | [`VirtualAddress`] | An address as seen through a page table. |
//! | [`PageFrameNumber`] | A physical address shifted right by [`PAGE_SHIFT`]. |
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x0010_2042);
//! assert_eq!(pa.page_base().as_u64(), 0x0010_2000);
//! assert_eq!(pa.page_offset(), 0x42);
//! assert_eq!(pa.frame_number(), PageFrameNumber::new(0x102));
//! assert_eq!(pa.frame_number().base(), pa.page_base());
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod frame_number;
mod physical_address;
mod virtual_address;

pub use crate::frame_number::PageFrameNumber;
pub use crate::physical_address::PhysicalAddress;
pub use crate::virtual_address::VirtualAddress;

/// Size of the base page in bytes. Every table geometry shares it.
pub const PAGE_SIZE: u64 = 4096;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: u32 = 12;

/// Mask selecting the in-page offset bits.
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0, 4096), 0);
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(8191, 4096), 4096);
/// assert_eq!(align_down(0x12345, 16), 0x12340);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two and `x + a - 1` must not overflow.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(0, 4096), 0);
/// assert_eq!(align_up(1, 4096), 4096);
/// assert_eq!(align_up(4096, 4096), 4096);
/// assert_eq!(align_up(0x12345, 16), 0x12350);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}

/// Number of pages needed to hold `bytes`.
///
/// ```rust
/// # use kernel_memory_addresses::pages_for;
/// assert_eq!(pages_for(0), 0);
/// assert_eq!(pages_for(1), 1);
/// assert_eq!(pages_for(8192), 2);
/// assert_eq!(pages_for(8193), 3);
/// ```
#[inline]
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}

/// Whether `x` is a multiple of [`PAGE_SIZE`].
#[inline(always)]
#[must_use]
pub const fn is_page_aligned(x: u64) -> bool {
    x & PAGE_MASK == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_and_physical_do_not_mix_but_share_helpers() {
        let va = VirtualAddress::new(0xC010_2ABC);
        let pa = PhysicalAddress::new(0x0010_2ABC);
        assert_eq!(va.page_offset(), pa.page_offset());
        assert_eq!(va.page_base().as_u64(), 0xC010_2000);
        assert!(!va.is_page_aligned());
        assert!(va.page_base().is_page_aligned());
    }

    #[test]
    fn frame_numbers_round_trip() {
        let pfn = PageFrameNumber::new(0x1234);
        assert_eq!(pfn.base(), PhysicalAddress::new(0x123_4000));
        assert_eq!(PhysicalAddress::new(0x123_4FFF).frame_number(), pfn);
        assert_eq!(pfn + 1, PageFrameNumber::new(0x1235));
    }

    #[test]
    fn address_arithmetic() {
        let va = VirtualAddress::new(0x1000);
        assert_eq!((va + PAGE_SIZE).as_u64(), 0x2000);
        assert_eq!(VirtualAddress::new(0x3000) - va, 0x2000);
        assert_eq!(
            PhysicalAddress::new(0x5000) - PhysicalAddress::new(0x1000),
            0x4000
        );
    }
}
