//! # Entries and flags
//!
//! The low twelve bits of every x86 paging entry have the same meaning in all
//! formats, and bit 63 is execute-disable where the format is 8 bytes wide.
//! [`PageTableFlags`] names those bits once; [`Entry`] combines them with the
//! geometry's address mask.

use crate::cache::{CacheEncoding, CachePolicy};
use crate::geometry::TableGeometry;
use core::fmt;
use core::marker::PhantomData;
use kernel_memory_addresses::PhysicalAddress;

bitflags::bitflags! {
    /// Hardware flag bits of a paging entry.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct PageTableFlags: u64 {
        /// Entry is valid. When clear, every other bit is unspecified.
        const PRESENT = 1 << 0;

        /// Writes allowed (intersected along the walk).
        const WRITABLE = 1 << 1;

        /// Accessible from user mode (intersected along the walk).
        const USER = 1 << 2;

        /// Page write-through (PWT).
        const WRITE_THROUGH = 1 << 3;

        /// Page cache disable (PCD).
        const CACHE_DISABLE = 1 << 4;

        /// Set by the CPU on access.
        const ACCESSED = 1 << 5;

        /// Set by the CPU on write (leaf only).
        const DIRTY = 1 << 6;

        /// PAT index bit for 4 KiB leaves.
        const PAT = 1 << 7;

        /// Not flushed on root reload when global pages are enabled.
        const GLOBAL = 1 << 8;

        /// Software bit: leaf is shared copy-on-write and was made read-only
        /// for that reason.
        const COPY_ON_WRITE = 1 << 9;

        /// Execute disable (8-byte formats only).
        const NO_EXECUTE = 1 << 63;
    }
}

impl PageTableFlags {
    /// Bits that select the memory type.
    pub const CACHE_BITS: Self = Self::WRITE_THROUGH
        .union(Self::CACHE_DISABLE)
        .union(Self::PAT);
}

/// One paging entry of geometry `G`.
///
/// Stored widened to `u64`; [`Table`](crate::address_space) narrows it when
/// the format uses 4-byte entries.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Entry<G> {
    raw: u64,
    _g: PhantomData<G>,
}

impl<G: TableGeometry> Entry<G> {
    /// The all-zero, non-present entry.
    #[inline]
    #[must_use]
    pub const fn empty() -> Self {
        Self::from_raw(0)
    }

    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self {
            raw,
            _g: PhantomData,
        }
    }

    /// Encodes `pa | flags`, dropping bits the format does not have.
    #[inline]
    #[must_use]
    pub fn new(pa: PhysicalAddress, flags: PageTableFlags) -> Self {
        let flags = flags & G::supported_flags();
        Self::from_raw((pa.as_u64() & G::ADDRESS_MASK) | flags.bits())
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.raw
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.raw & PageTableFlags::PRESENT.bits() != 0
    }

    /// Frame address, only for present entries.
    #[inline]
    #[must_use]
    pub const fn address(self) -> Option<PhysicalAddress> {
        if self.is_present() {
            Some(PhysicalAddress::new(self.raw & G::ADDRESS_MASK))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.raw)
    }

    /// Same frame, new flags.
    #[inline]
    #[must_use]
    pub fn with_flags(self, flags: PageTableFlags) -> Self {
        let flags = flags & G::supported_flags();
        Self::from_raw((self.raw & G::ADDRESS_MASK) | flags.bits())
    }

    #[inline]
    #[must_use]
    pub fn is_writable(self) -> bool {
        self.flags().contains(PageTableFlags::WRITABLE)
    }
}

impl<G: TableGeometry> fmt::Debug for Entry<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address() {
            Some(pa) => write!(f, "Entry({pa} {:?})", self.flags()),
            None => f.write_str("Entry(not present)"),
        }
    }
}

/// What a leaf mapping should allow, independent of the paging format.
///
/// Built from a VMA's permissions; turned into hardware bits with
/// [`leaf_flags`](Self::leaf_flags).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LeafProtection {
    pub writable: bool,
    pub executable: bool,
    pub user: bool,
    pub global: bool,
    pub cache: CachePolicy,
}

impl LeafProtection {
    /// Read-only, non-executable, cacheable kernel data.
    pub const KERNEL_READ: Self = Self {
        writable: false,
        executable: false,
        user: false,
        global: true,
        cache: CachePolicy::WriteBack,
    };

    /// Writable kernel data.
    pub const KERNEL_DATA: Self = Self {
        writable: true,
        ..Self::KERNEL_READ
    };

    /// Writable, global device registers with the given memory type.
    #[must_use]
    pub const fn device(cache: CachePolicy) -> Self {
        Self {
            writable: true,
            executable: false,
            user: false,
            global: true,
            cache,
        }
    }

    /// Hardware flags for a present leaf.
    #[must_use]
    pub fn leaf_flags<G: TableGeometry>(self, encoding: CacheEncoding) -> PageTableFlags {
        let mut f = PageTableFlags::PRESENT | encoding.flags(self.cache);
        f.set(PageTableFlags::WRITABLE, self.writable);
        f.set(PageTableFlags::USER, self.user);
        f.set(PageTableFlags::GLOBAL, self.global);
        f.set(PageTableFlags::NO_EXECUTE, !self.executable && G::HAS_NX);
        f
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Legacy32, LongMode64, Pae32};

    #[test]
    fn entries_mask_addresses_per_format() {
        let pa = PhysicalAddress::new(0x0000_0012_3456_7000);
        let e = Entry::<LongMode64>::new(pa, PageTableFlags::PRESENT | PageTableFlags::NO_EXECUTE);
        assert_eq!(e.address(), Some(pa));
        assert!(e.flags().contains(PageTableFlags::NO_EXECUTE));

        let e = Entry::<Legacy32>::new(pa, PageTableFlags::PRESENT | PageTableFlags::NO_EXECUTE);
        assert_eq!(e.address(), Some(PhysicalAddress::new(0x3456_7000)));
        assert!(!e.flags().contains(PageTableFlags::NO_EXECUTE));
        assert!(e.raw() <= u64::from(u32::MAX));
    }

    #[test]
    fn non_present_entries_have_no_address() {
        let e = Entry::<Pae32>::from_raw(0xdead_b000);
        assert!(!e.is_present());
        assert_eq!(e.address(), None);
    }

    #[test]
    fn with_flags_keeps_the_frame() {
        let pa = PhysicalAddress::new(0x4000);
        let e = Entry::<LongMode64>::new(pa, PageTableFlags::PRESENT | PageTableFlags::WRITABLE);
        let ro = e.with_flags(e.flags() - PageTableFlags::WRITABLE);
        assert_eq!(ro.address(), Some(pa));
        assert!(!ro.is_writable());
    }

    #[test]
    fn protections_become_hardware_bits() {
        let enc = CacheEncoding::with_pat();
        let user_rw = LeafProtection {
            writable: true,
            executable: false,
            user: true,
            global: false,
            cache: CachePolicy::WriteBack,
        };
        let f = user_rw.leaf_flags::<LongMode64>(enc);
        assert_eq!(
            f,
            PageTableFlags::PRESENT
                | PageTableFlags::WRITABLE
                | PageTableFlags::USER
                | PageTableFlags::NO_EXECUTE
        );
        let f = user_rw.leaf_flags::<Legacy32>(enc);
        assert!(!f.contains(PageTableFlags::NO_EXECUTE));

        let mmio = LeafProtection::device(CachePolicy::Uncached).leaf_flags::<LongMode64>(enc);
        assert!(mmio.contains(PageTableFlags::CACHE_DISABLE | PageTableFlags::GLOBAL));
        assert!(!mmio.contains(PageTableFlags::USER));
    }
}
