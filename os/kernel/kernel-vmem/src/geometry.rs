//! # Table geometry
//!
//! Everything that differs between x86 paging formats, expressed as
//! associated constants so the walker in [`address_space`](crate::address_space)
//! is written once.
//!
//! | Geometry | Levels | Entries per level | Entry width | NX |
//! |----------|--------|-------------------|-------------|----|
//! | [`Legacy32`] | 2 | 1024 / 1024 | 4 bytes | no |
//! | [`Pae32`] | 3 | 4 / 512 / 512 | 8 bytes | yes |
//! | [`LongMode64`] | 4 | 512 each | 8 bytes | yes |
//!
//! Level `0` is always the root (PGD); level [`TableGeometry::LEAF`] holds the
//! PTEs that map 4 KiB pages. Huge pages are not used.

use crate::flags::PageTableFlags;
use core::fmt::Debug;
use core::ops::Range;
use kernel_info::memory::{LAYOUT_32, LAYOUT_64, MemoryLayout};
use kernel_memory_addresses::{PAGE_SHIFT, VirtualAddress};

/// Shape of one paging format.
pub trait TableGeometry: Copy + Clone + Debug + Default + Send + Sync + 'static {
    /// Human readable name for logs.
    const NAME: &'static str;

    /// Index bits consumed per level, root first.
    const INDEX_BITS: &'static [u32];

    /// Number of levels including the root.
    const LEVELS: usize = Self::INDEX_BITS.len();

    /// Level holding the 4 KiB leaf entries.
    const LEAF: usize = Self::LEVELS - 1;

    /// Entry width in bytes (4 or 8).
    const ENTRY_BYTES: usize;

    /// Bits of an entry that carry the physical frame address.
    const ADDRESS_MASK: u64;

    /// Whether bit 63 (execute disable) exists.
    const HAS_NX: bool;

    /// Virtual layout (kernel split, direct map, device window).
    const LAYOUT: MemoryLayout;

    /// Number of significant virtual address bits.
    const VA_BITS: u32;

    /// Right shift that turns a virtual address into the index at `level`.
    #[inline]
    #[must_use]
    fn shift(level: usize) -> u32 {
        PAGE_SHIFT + Self::INDEX_BITS[level + 1..].iter().sum::<u32>()
    }

    /// Number of entries in a table at `level`.
    #[inline]
    #[must_use]
    fn entries(level: usize) -> usize {
        1 << Self::INDEX_BITS[level]
    }

    /// Bytes of virtual address space covered by one entry at `level`.
    #[inline]
    #[must_use]
    fn span(level: usize) -> u64 {
        1 << Self::shift(level)
    }

    /// Index into the table at `level` for `va`.
    #[inline]
    #[must_use]
    fn index(va: VirtualAddress, level: usize) -> usize {
        let mask = (1u64 << Self::INDEX_BITS[level]) - 1;
        #[allow(clippy::cast_possible_truncation)]
        let idx = ((va.as_u64() >> Self::shift(level)) & mask) as usize;
        idx
    }

    /// Flags every intermediate entry at `level` carries.
    ///
    /// Permissions are intersected along the walk, so intermediate entries are
    /// as permissive as the leaves beneath them need.
    #[inline]
    #[must_use]
    fn nonleaf_flags(level: usize, user: bool) -> PageTableFlags {
        let _ = level;
        let mut f = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        if user {
            f |= PageTableFlags::USER;
        }
        f
    }

    /// Flag bits the hardware accepts in entries of this format.
    #[inline]
    #[must_use]
    fn supported_flags() -> PageTableFlags {
        if Self::HAS_NX {
            PageTableFlags::all()
        } else {
            PageTableFlags::all() - PageTableFlags::NO_EXECUTE
        }
    }

    /// Whether `va` is representable in this format.
    #[inline]
    #[must_use]
    fn is_canonical(va: VirtualAddress) -> bool {
        let v = va.as_u64();
        if Self::VA_BITS >= 64 {
            return true;
        }
        if Self::VA_BITS == 32 {
            return v >> 32 == 0;
        }
        // Sign extension of bit VA_BITS-1 into the upper bits.
        let upper = v >> (Self::VA_BITS - 1);
        upper == 0 || upper == (u64::MAX >> (Self::VA_BITS - 1))
    }

    /// Root slots that map the kernel half and are shared by every root.
    #[inline]
    #[must_use]
    fn kernel_root_slots() -> Range<usize> {
        Self::index(VirtualAddress::new(Self::LAYOUT.kernel_base), 0)..Self::entries(0)
    }
}

/// Classic 32-bit paging: page directory + page table, 4-byte entries.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Legacy32;

impl TableGeometry for Legacy32 {
    const NAME: &'static str = "x86 (2-level)";
    const INDEX_BITS: &'static [u32] = &[10, 10];
    const ENTRY_BYTES: usize = 4;
    const ADDRESS_MASK: u64 = 0xFFFF_F000;
    const HAS_NX: bool = false;
    const LAYOUT: MemoryLayout = LAYOUT_32;
    const VA_BITS: u32 = 32;
}

/// 32-bit PAE paging: PDPT (4 entries) + page directory + page table.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Pae32;

impl TableGeometry for Pae32 {
    const NAME: &'static str = "x86 PAE (3-level)";
    const INDEX_BITS: &'static [u32] = &[2, 9, 9];
    const ENTRY_BYTES: usize = 8;
    const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;
    const HAS_NX: bool = true;
    const LAYOUT: MemoryLayout = LAYOUT_32;
    const VA_BITS: u32 = 32;

    /// PDPTEs only accept the present and cache bits; RW/US are reserved.
    fn nonleaf_flags(level: usize, user: bool) -> PageTableFlags {
        if level == 0 {
            return PageTableFlags::PRESENT;
        }
        let mut f = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        if user {
            f |= PageTableFlags::USER;
        }
        f
    }
}

/// x86-64 4-level paging: PML4 → PDPT → PD → PT.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct LongMode64;

impl TableGeometry for LongMode64 {
    const NAME: &'static str = "x86-64 (4-level)";
    const INDEX_BITS: &'static [u32] = &[9, 9, 9, 9];
    const ENTRY_BYTES: usize = 8;
    const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;
    const HAS_NX: bool = true;
    const LAYOUT: MemoryLayout = LAYOUT_64;
    const VA_BITS: u32 = 48;
}

/// The geometry matching the build target's pointer width.
#[cfg(target_pointer_width = "64")]
pub type NativeGeometry = LongMode64;

/// The geometry matching the build target's pointer width.
#[cfg(not(target_pointer_width = "64"))]
pub type NativeGeometry = Pae32;
