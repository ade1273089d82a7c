//! # Boot Memory Map
//!
//! The physical memory map as handed over by the firmware, reduced to ordered
//! `(start, end, kind)` ranges. Only [`MemoryKind::Available`] ranges seed the
//! page frame allocator.

use core::fmt;
use kernel_memory_addresses::PhysicalAddress;

/// What a physical range may be used for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemoryKind {
    /// Usable RAM.
    Available,
    /// Firmware-reserved.
    Reserved,
    /// ACPI tables; reclaimable once parsed.
    AcpiReclaimable,
    /// ACPI non-volatile storage.
    AcpiNvs,
    /// Defective RAM.
    Unusable,
    /// Device memory (MMIO, ROM shadow).
    Device,
}

impl MemoryKind {
    /// Decodes an E820 type field. Unknown types are treated as reserved.
    #[must_use]
    pub const fn from_e820(ty: u32) -> Self {
        match ty {
            1 => Self::Available,
            3 => Self::AcpiReclaimable,
            4 => Self::AcpiNvs,
            5 => Self::Unusable,
            _ => Self::Reserved,
        }
    }

    const fn tag(self) -> &'static str {
        match self {
            Self::Available => "AVL",
            Self::Reserved => "RES",
            Self::AcpiReclaimable => "ACPI",
            Self::AcpiNvs => "NVS",
            Self::Unusable => "BAD",
            Self::Device => "DEV",
        }
    }
}

/// One half-open physical range `[start, end)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: PhysicalAddress,
    pub end: PhysicalAddress,
    pub kind: MemoryKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(start: u64, end: u64, kind: MemoryKind) -> Self {
        Self {
            start: PhysicalAddress::new(start),
            end: PhysicalAddress::new(end),
            kind,
        }
    }

    /// Builds a region from an E820 `(base, length, type)` triple.
    #[must_use]
    pub const fn from_e820(base: u64, len: u64, ty: u32) -> Self {
        Self::new(base, base.saturating_add(len), MemoryKind::from_e820(ty))
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.as_u64().saturating_sub(self.start.as_u64())
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    #[must_use]
    pub const fn is_available(&self) -> bool {
        matches!(self.kind, MemoryKind::Available)
    }

    /// Whether `[start, end)` lies entirely inside this region.
    #[inline]
    #[must_use]
    pub const fn covers(&self, start: u64, end: u64) -> bool {
        self.start.as_u64() <= start && end <= self.end.as_u64()
    }
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#014x}-{:#014x} {:>4} ({} KiB)",
            self.start.as_u64(),
            self.end.as_u64(),
            self.kind.tag(),
            self.len() / 1024
        )
    }
}

/// Sorts the map by start address; firmware does not promise any order.
pub fn sort_regions(regions: &mut [MemoryRegion]) {
    regions.sort_unstable_by_key(|r| r.start);
}

/// One past the highest available byte, or `None` if nothing is available.
#[must_use]
pub fn available_end(regions: &[MemoryRegion]) -> Option<PhysicalAddress> {
    regions
        .iter()
        .filter(|r| r.is_available() && !r.is_empty())
        .map(|r| r.end)
        .max()
}

/// Lowest available byte, or `None` if nothing is available.
#[must_use]
pub fn available_start(regions: &[MemoryRegion]) -> Option<PhysicalAddress> {
    regions
        .iter()
        .filter(|r| r.is_available() && !r.is_empty())
        .map(|r| r.start)
        .min()
}

/// Total bytes in available ranges.
#[must_use]
pub fn available_bytes(regions: &[MemoryRegion]) -> u64 {
    regions
        .iter()
        .filter(|r| r.is_available())
        .map(MemoryRegion::len)
        .sum()
}
