//! Kernel virtual window for device registers.
//!
//! Space is handed out top-down and never reused. All intermediate tables
//! for the window exist from [`MmioWindow::init`] on, so every process root
//! that copies the kernel half sees later device mappings too.

use crate::error::AllocError;
use alloc::vec::Vec;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, pages_for};
use kernel_vmem::{
    AddressSpace, CacheEncoding, CachePolicy, FrameAlloc, LeafProtection, PhysMapper,
    TableGeometry, tlb,
};
use log::{debug, info};

/// One device mapping.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MmioRegion {
    pub name: &'static str,
    /// Page-aligned start of the mapping.
    pub virt: VirtualAddress,
    /// Mapped bytes, a whole number of pages.
    pub len: u64,
    /// Physical address mapped at `virt`.
    pub phys: PhysicalAddress,
    pub policy: CachePolicy,
}

/// Bump-down allocator over `[start, end)` of kernel virtual space.
#[derive(Debug)]
pub struct MmioWindow {
    start: VirtualAddress,
    end: VirtualAddress,
    next_top: VirtualAddress,
    regions: Vec<MmioRegion>,
}

impl MmioWindow {
    /// Reserve `[start, end)` in `kernel` and build its tables.
    ///
    /// # Errors
    /// - [`AllocError::InvalidRange`] for an empty or unaligned window.
    /// - [`AllocError::OutOfMemory`] if the tables cannot be allocated.
    pub fn init<G: TableGeometry, M: PhysMapper, A: FrameAlloc + ?Sized>(
        kernel: &AddressSpace<'_, G, M>,
        alloc: &mut A,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> Result<Self, AllocError> {
        if start >= end || !start.is_page_aligned() || !end.is_page_aligned() {
            return Err(AllocError::InvalidRange("malformed MMIO window"));
        }
        kernel.populate_tables(alloc, start, end, false)?;
        info!("mmio window {start}..{end} ({} KiB)", (end - start) / 1024);
        Ok(Self {
            start,
            end,
            next_top: end,
            regions: Vec::new(),
        })
    }

    /// Map `len` bytes of device memory at `pa` and return the address `pa`
    /// itself appears at.
    ///
    /// # Errors
    /// - [`AllocError::InvalidRange`] for `len == 0`.
    /// - [`AllocError::OutOfMemory`] when the window is exhausted.
    #[allow(clippy::too_many_arguments)]
    pub fn map<G: TableGeometry, M: PhysMapper, A: FrameAlloc + ?Sized>(
        &mut self,
        kernel: &AddressSpace<'_, G, M>,
        alloc: &mut A,
        encoding: CacheEncoding,
        pa: PhysicalAddress,
        len: u64,
        policy: CachePolicy,
        name: &'static str,
    ) -> Result<VirtualAddress, AllocError> {
        if len == 0 {
            return Err(AllocError::InvalidRange("empty MMIO mapping"));
        }
        let phys = pa.page_base();
        let bytes = pages_for(pa.page_offset() + len) * PAGE_SIZE;
        if bytes > self.remaining() {
            return Err(AllocError::OutOfMemory);
        }
        let virt = VirtualAddress::new(self.next_top.as_u64() - bytes);

        let flags = LeafProtection::device(policy).leaf_flags::<G>(encoding);
        for off in (0..bytes).step_by(PAGE_SIZE as usize) {
            if let Err(e) = kernel.ensure_mapped(alloc, virt + off, phys + off, flags) {
                for done in (0..off).step_by(PAGE_SIZE as usize) {
                    kernel.unmap(virt + done);
                }
                tlb::invalidate_range(virt, virt + off);
                return Err(e.into());
            }
        }
        tlb::invalidate_range(virt, virt + bytes);

        self.next_top = virt;
        self.regions.push(MmioRegion {
            name,
            virt,
            len: bytes,
            phys,
            policy,
        });
        debug!("mmio {name}: {phys} -> {virt} ({bytes:#x} bytes, {policy})");
        Ok(virt + pa.page_offset())
    }

    /// Unused bytes left in the window.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.next_top - self.start
    }

    #[must_use]
    pub const fn window(&self) -> (VirtualAddress, VirtualAddress) {
        (self.start, self.end)
    }

    #[must_use]
    pub fn regions(&self) -> &[MmioRegion] {
        &self.regions
    }

    pub fn log_regions(&self) {
        for r in &self.regions {
            info!(
                "mmio {:<16} {}..{} -> {} {}",
                r.name,
                r.virt,
                r.virt + r.len,
                r.phys,
                r.policy
            );
        }
    }
}
