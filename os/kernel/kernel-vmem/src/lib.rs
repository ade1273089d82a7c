//! # Virtual Memory Support
//!
//! Page-table management for x86 in all three paging formats the kernel
//! supports, written once against a [`TableGeometry`].
//!
//! ## What you get
//! - [`AddressSpace`]: one page-table tree; map, translate, unmap, walk
//!   leaves, reclaim empty tables, share the kernel half between roots.
//! - [`TableGeometry`] implementations [`Legacy32`], [`Pae32`] and
//!   [`LongMode64`].
//! - [`PageTableFlags`] and the typed [`Entry`]; [`LeafProtection`] to turn
//!   "user, writable, no-exec" into bits for the selected format.
//! - [`CachePolicy`]/[`CacheEncoding`] for memory types via PAT or PCD/PWT.
//! - The [`FrameAlloc`] and [`PhysMapper`] seams the tree uses to obtain
//!   table frames and to touch them.
//! - With the `sim` feature (always on in unit tests): [`sim::SimulatedRam`].
//!
//! ## Virtual Address → Physical Address Walk
//!
//! ```text
//!  Legacy32     | 31‒22 PD | 21‒12 PT | 11‒0 offset |
//!  Pae32        | 31‒30 PDPT | 29‒21 PD | 20‒12 PT | 11‒0 offset |
//!  LongMode64   | 47‒39 PML4 | 38‒30 PDPT | 29‒21 PD | 20‒12 PT | 11‒0 offset |
//! ```
//!
//! Each field indexes one table; every non-leaf entry names the frame of the
//! next table, the leaf entry names the 4 KiB page. Writable, user and
//! execute permissions are intersected along the path, so intermediate
//! entries are created permissive and the leaf carries the real policy.
//!
//! The kernel half (everything at or above [`MemoryLayout::kernel_base`]) is
//! reached through root slots that every address space copies from the
//! kernel's template root, so kernel mappings below those slots are visible
//! everywhere.
//!
//! [`MemoryLayout::kernel_base`]: kernel_info::memory::MemoryLayout

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

extern crate alloc;

pub mod address_space;
pub mod cache;
pub mod flags;
pub mod geometry;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod tlb;

pub use crate::address_space::{AddressSpace, LeafAction, PageTableError};
pub use crate::cache::{CacheEncoding, CachePolicy, PatMsr};
pub use crate::flags::{Entry, LeafProtection, PageTableFlags};
pub use crate::geometry::{Legacy32, LongMode64, NativeGeometry, Pae32, TableGeometry};
pub use kernel_memory_addresses::{
    PAGE_SIZE, PhysicalAddress, VirtualAddress, align_down, align_up, pages_for,
};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

/// Source of **physical** 4 KiB frames for page tables.
///
/// Returned frames must be page aligned. The tree zeroes new tables itself.
pub trait FrameAlloc {
    /// Allocate one frame, `None` on out-of-memory.
    fn alloc_4k(&mut self) -> Option<PhysicalAddress>;

    /// Give back a frame obtained from [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&mut self, pa: PhysicalAddress);
}

impl<A: FrameAlloc + ?Sized> FrameAlloc for &mut A {
    #[inline]
    fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
        (**self).alloc_4k()
    }

    #[inline]
    fn free_4k(&mut self, pa: PhysicalAddress) {
        (**self).free_4k(pa);
    }
}

/// Converts physical addresses to usable virtual ones in the current address
/// space (identity map in early boot, the direct map afterwards).
///
/// The direct map covers every frame the allocators hand out, so the
/// translation is infallible for those.
pub trait PhysMapper {
    /// Where `pa` is visible right now.
    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress;

    /// View the bytes at `pa` as a `T`.
    ///
    /// # Safety
    /// - `pa` must be mapped writable and suitably aligned for `T`.
    /// - The bytes must be a valid `T` and nothing else may alias them for
    ///   `'a`.
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { &mut *self.phys_to_virt(pa).as_mut_ptr::<T>() }
    }
}

impl<M: PhysMapper + ?Sized> PhysMapper for &M {
    #[inline]
    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        (**self).phys_to_virt(pa)
    }
}
