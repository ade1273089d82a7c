//! # Cache policy encoding
//!
//! x86 selects a page's memory type through three entry bits (PAT, PCD, PWT)
//! that index the Page Attribute Table. The kernel programs the PAT once with
//! [`PatMsr::kernel_layout`]; afterwards [`CacheEncoding::flags`] picks the
//! slot for a requested [`CachePolicy`].
//!
//! | Index (PAT:PCD:PWT) | Type |
//! |---------------------|------|
//! | 0 | write-back |
//! | 1 | write-through |
//! | 2 | uncached |
//! | 3 | uncached-minus |
//! | 4 | write-combining |
//! | 5 | write-protect |
//! | 6 | uncached |
//! | 7 | uncached-minus |
//!
//! CPUs without PAT only understand PCD and PWT; write-combining and
//! write-protect degrade to cache-disabled there.

use crate::flags::PageTableFlags;
use bitfield_struct::bitfield;
use core::fmt;

/// Memory type requested for a mapping.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum CachePolicy {
    #[default]
    WriteBack,
    WriteThrough,
    WriteCombine,
    WriteProtect,
    Uncached,
    UncachedMinus,
}

impl CachePolicy {
    /// Architectural memory type encoding used in the PAT MSR.
    #[must_use]
    pub const fn memory_type(self) -> u8 {
        match self {
            Self::Uncached => 0x00,
            Self::WriteCombine => 0x01,
            Self::WriteThrough => 0x04,
            Self::WriteProtect => 0x05,
            Self::WriteBack => 0x06,
            Self::UncachedMinus => 0x07,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::WriteBack => "WB",
            Self::WriteThrough => "WT",
            Self::WriteCombine => "WC",
            Self::WriteProtect => "WP",
            Self::Uncached => "UC",
            Self::UncachedMinus => "UC-",
        }
    }
}

impl fmt::Display for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// `IA32_PAT` (MSR `0x277`): eight one-byte memory type slots.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PatMsr {
    pub pa0: u8,
    pub pa1: u8,
    pub pa2: u8,
    pub pa3: u8,
    pub pa4: u8,
    pub pa5: u8,
    pub pa6: u8,
    pub pa7: u8,
}

impl PatMsr {
    /// MSR number for `wrmsr`.
    pub const MSR: u32 = 0x277;

    /// Slot order this module's encoding assumes (see module table).
    pub const LAYOUT: [CachePolicy; 8] = [
        CachePolicy::WriteBack,
        CachePolicy::WriteThrough,
        CachePolicy::Uncached,
        CachePolicy::UncachedMinus,
        CachePolicy::WriteCombine,
        CachePolicy::WriteProtect,
        CachePolicy::Uncached,
        CachePolicy::UncachedMinus,
    ];

    /// The value bring-up code writes to the PAT MSR.
    #[must_use]
    pub const fn kernel_layout() -> Self {
        let l = Self::LAYOUT;
        Self::new()
            .with_pa0(l[0].memory_type())
            .with_pa1(l[1].memory_type())
            .with_pa2(l[2].memory_type())
            .with_pa3(l[3].memory_type())
            .with_pa4(l[4].memory_type())
            .with_pa5(l[5].memory_type())
            .with_pa6(l[6].memory_type())
            .with_pa7(l[7].memory_type())
    }
}

/// Turns a [`CachePolicy`] into entry bits for the current CPU.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CacheEncoding {
    pat: bool,
}

impl Default for CacheEncoding {
    fn default() -> Self {
        Self::with_pat()
    }
}

impl CacheEncoding {
    /// PAT programmed with [`PatMsr::kernel_layout`].
    #[must_use]
    pub const fn with_pat() -> Self {
        Self { pat: true }
    }

    /// Only PCD/PWT available.
    #[must_use]
    pub const fn without_pat() -> Self {
        Self { pat: false }
    }

    #[must_use]
    pub const fn has_pat(self) -> bool {
        self.pat
    }

    /// Entry bits selecting `policy`.
    #[must_use]
    pub const fn flags(self, policy: CachePolicy) -> PageTableFlags {
        use PageTableFlags as F;
        if self.pat {
            match policy {
                CachePolicy::WriteBack => F::empty(),
                CachePolicy::WriteThrough => F::WRITE_THROUGH,
                CachePolicy::Uncached => F::CACHE_DISABLE,
                CachePolicy::UncachedMinus => F::CACHE_DISABLE.union(F::WRITE_THROUGH),
                CachePolicy::WriteCombine => F::PAT,
                CachePolicy::WriteProtect => F::PAT.union(F::WRITE_THROUGH),
            }
        } else {
            match policy {
                CachePolicy::WriteBack => F::empty(),
                CachePolicy::WriteThrough => F::WRITE_THROUGH,
                CachePolicy::Uncached
                | CachePolicy::UncachedMinus
                | CachePolicy::WriteCombine
                | CachePolicy::WriteProtect => F::CACHE_DISABLE,
            }
        }
    }

    /// Memory type an entry with `flags` ends up with.
    #[must_use]
    pub fn policy_of(self, flags: PageTableFlags) -> CachePolicy {
        let pwt = flags.contains(PageTableFlags::WRITE_THROUGH);
        let pcd = flags.contains(PageTableFlags::CACHE_DISABLE);
        let pat = self.pat && flags.contains(PageTableFlags::PAT);
        let idx = usize::from(pat) << 2 | usize::from(pcd) << 1 | usize::from(pwt);
        if self.pat {
            PatMsr::LAYOUT[idx]
        } else {
            // Power-on PAT: WB, WT, UC-, UC repeated.
            match idx & 3 {
                0 => CachePolicy::WriteBack,
                1 => CachePolicy::WriteThrough,
                2 => CachePolicy::UncachedMinus,
                _ => CachePolicy::Uncached,
            }
        }
    }
}
