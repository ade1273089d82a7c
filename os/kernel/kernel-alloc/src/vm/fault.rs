//! Page-fault resolution: demand paging and copy-on-write.

use super::area::{Backing, FsError, VmArea, VmFlags};
use super::ProcessMemory;
use crate::context::KernelMemory;
use crate::error::AllocError;
use crate::fatal;
use crate::frame_alloc::AllocFlags;
use crate::page_ref::{PageRef, Released};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_sync::IrqGuard;
use kernel_vmem::{AddressSpace, Entry, PageTableFlags, PhysMapper, TableGeometry, tlb};
use log::{debug, trace, warn};

/// Kind of access that faulted.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

impl Access {
    /// Area permission the access needs.
    #[must_use]
    pub const fn required(self) -> VmFlags {
        match self {
            Self::Read => VmFlags::READ,
            Self::Write => VmFlags::WRITE,
            Self::Execute => VmFlags::EXEC,
        }
    }
}

/// How a fault was resolved.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FaultResolution {
    /// A fresh zero page was mapped.
    MappedZero,
    /// A page was filled from the backing file.
    MappedFile,
    /// A shared copy-on-write page was copied for this space.
    CopiedOnWrite,
    /// This space was the last owner; the page became writable in place.
    ReusedExclusive,
    /// The leaf already allowed the access; only the TLB was stale.
    Spurious,
}

/// The fault cannot be resolved.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FaultError {
    #[error("segmentation fault at {addr}: {reason}")]
    Segmentation {
        addr: VirtualAddress,
        reason: &'static str,
    },
    #[error("out of memory")]
    OutOfMemory,
    /// The page tables cannot describe the faulting page.
    #[error("cannot map page: {0}")]
    Unmappable(&'static str),
    #[error("backing file: {0}")]
    Io(#[from] FsError),
}

impl From<AllocError> for FaultError {
    #[track_caller]
    fn from(e: AllocError) -> Self {
        match e {
            AllocError::Corruption(c) => fatal::corruption(c),
            AllocError::OutOfMemory => Self::OutOfMemory,
            AllocError::InvalidRange(why) => Self::Unmappable(why),
        }
    }
}

const fn segv(addr: VirtualAddress, reason: &'static str) -> FaultError {
    FaultError::Segmentation { addr, reason }
}

/// Page-fault error code pushed by x86 CPUs.
///
/// Reference: Intel SDM Vol. 3A, §4.7 "Page-Fault Exceptions".
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageFaultError {
    /// 0 = non-present page, 1 = protection violation.
    pub present: bool,
    /// The access was a write.
    pub write: bool,
    /// The access came from user mode.
    pub user: bool,
    /// A reserved bit was set in a paging entry.
    pub reserved_bit: bool,
    /// Instruction fetch.
    pub instruction_fetch: bool,
    /// Protection-key violation.
    pub protection_key: bool,
    /// Shadow-stack access.
    pub shadow_stack: bool,
    #[bits(57)]
    __: u64,
}

impl PageFaultError {
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if !self.present() {
            "non-present page"
        } else if self.reserved_bit() {
            "reserved bit set in a paging entry"
        } else if self.instruction_fetch() {
            if self.user() {
                "user instruction fetch from a protected page"
            } else {
                "kernel instruction fetch from a protected page"
            }
        } else if self.write() {
            "write to a protected page"
        } else {
            "read from a protected page"
        }
    }
}

impl From<PageFaultError> for Access {
    fn from(e: PageFaultError) -> Self {
        if e.instruction_fetch() {
            Self::Execute
        } else if e.write() {
            Self::Write
        } else {
            Self::Read
        }
    }
}

impl<G: TableGeometry> ProcessMemory<G> {
    /// Resolve a fault at `addr`.
    ///
    /// Interrupts may be enabled on entry; table and allocator updates run
    /// with them disabled. File reads happen before that.
    ///
    /// # Errors
    /// - [`FaultError::Segmentation`] if no area covers `addr`, the area
    ///   forbids `access`, or a read or execute hit a present page.
    /// - [`FaultError::OutOfMemory`] if no page could be allocated.
    /// - [`FaultError::Unmappable`] if the page tables reject the address.
    /// - [`FaultError::Io`] if the backing file failed.
    pub fn handle_fault<M: PhysMapper + Copy>(
        &mut self,
        kmem: &KernelMemory<G, M>,
        addr: VirtualAddress,
        access: Access,
    ) -> Result<FaultResolution, FaultError> {
        let area = self.find(addr).ok_or(segv(addr, "no mapping"))?;
        if !area.flags.contains(VmFlags::READ) {
            return Err(segv(addr, "area not readable"));
        }
        if !area.flags.contains(access.required()) {
            return Err(segv(
                addr,
                match access {
                    Access::Write => "area not writable",
                    _ => "area not executable",
                },
            ));
        }

        let page_va = addr.page_base();
        let aspace = kmem.address_space(self.root);
        trace!("fault {access:?} at {addr} in {area}");
        match aspace.leaf(page_va) {
            None => Self::populate(kmem, &aspace, area, page_va),
            Some(_) if access != Access::Write => Err(segv(addr, "protection violation")),
            Some(leaf) if leaf.is_writable() => {
                tlb::invalidate_page(page_va);
                Ok(FaultResolution::Spurious)
            }
            Some(leaf) if leaf.flags().contains(PageTableFlags::COPY_ON_WRITE) => {
                Self::break_cow(kmem, &aspace, area, page_va, leaf)
            }
            Some(_) => Err(segv(addr, "write to read-only page")),
        }
    }

    /// Map the first page at `page_va`: file contents or zeros.
    fn populate<M: PhysMapper + Copy>(
        kmem: &KernelMemory<G, M>,
        aspace: &AddressSpace<'_, G, M>,
        area: &VmArea,
        page_va: VirtualAddress,
    ) -> Result<FaultResolution, FaultError> {
        let frames = kmem.frames();
        let resolution = match &area.backing {
            Backing::Device { .. } => return Err(segv(page_va, "hole in device mapping")),
            Backing::Anonymous => FaultResolution::MappedZero,
            Backing::File(_) => FaultResolution::MappedFile,
        };
        let page = PageRef::allocate(frames, AllocFlags::ZEROED).inspect_err(|_| {
            warn!("out of memory on fault at {page_va}");
        })?;

        if let Backing::File(fb) = &area.backing {
            let into = page_va - area.start;
            let wanted = fb.len.saturating_sub(into).min(PAGE_SIZE);
            if wanted > 0 {
                let dst = kmem.mapper().phys_to_virt(page.phys());
                #[allow(clippy::cast_possible_truncation)]
                // SAFETY: the page is ours alone until it is mapped below.
                let buf = unsafe { core::slice::from_raw_parts_mut(dst.as_mut_ptr::<u8>(), wanted as usize) };
                let read = fb.file.read_at(fb.offset + into, buf)?;
                // Bytes past what was read stay zero from the allocation.
                if read < buf.len() {
                    buf[read..].fill(0);
                }
            }
        }

        let _irq = IrqGuard::new();
        let mut alloc = frames;
        aspace.ensure_mapped(&mut alloc, page_va, page.phys(), area.leaf_flags::<G>(kmem.encoding()))
            .map_err(AllocError::from)?;
        tlb::invalidate_page(page_va);
        trace!("{resolution:?} {} at {page_va}", page.phys());
        let _ = page.into_raw();
        Ok(resolution)
    }

    /// Resolve a write to a copy-on-write leaf.
    fn break_cow<M: PhysMapper + Copy>(
        kmem: &KernelMemory<G, M>,
        aspace: &AddressSpace<'_, G, M>,
        area: &VmArea,
        page_va: VirtualAddress,
        leaf: Entry<G>,
    ) -> Result<FaultResolution, FaultError> {
        let frames = kmem.frames();
        let Some(old) = leaf.address().and_then(|pa| frames.page_of(pa)) else {
            return Err(segv(page_va, "copy-on-write leaf without a managed page"));
        };
        let writable = area.leaf_flags::<G>(kmem.encoding());

        let _irq = IrqGuard::new();
        // SAFETY: the leaf holds one reference, which this handle now stands for.
        let shared = unsafe { PageRef::from_raw(frames, old) };
        if shared.is_exclusive() {
            aspace.update_leaf(page_va, |e| e.with_flags(writable));
            let _ = shared.into_raw();
            tlb::invalidate_page(page_va);
            debug!("cow at {page_va}: last owner, reused in place");
            return Ok(FaultResolution::ReusedExclusive);
        }

        let fresh = match PageRef::allocate(frames, AllocFlags::empty()) {
            Ok(p) => p,
            Err(e) => {
                let _ = shared.into_raw();
                warn!("out of memory breaking cow at {page_va}");
                return Err(e.into());
            }
        };
        let src = kmem.mapper().phys_to_virt(shared.phys());
        let dst = kmem.mapper().phys_to_virt(fresh.phys());
        // SAFETY: both pages are mapped by the direct map and distinct.
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_mut_ptr::<u8>(), dst.as_mut_ptr::<u8>(), PAGE_SIZE as usize);
        }
        let new_pa = fresh.phys();
        aspace.update_leaf(page_va, |_| Entry::new(new_pa, writable));
        let _ = fresh.into_raw();
        tlb::invalidate_page(page_va);

        match shared.release() {
            Released::StillShared(n) => debug!("cow at {page_va}: copied, {n} sharer(s) left"),
            Released::LastOwner => debug!("cow at {page_va}: copied, original freed"),
        }
        Ok(FaultResolution::CopiedOnWrite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_maps_to_access() {
        let read = PageFaultError::new().with_user(true);
        let write = PageFaultError::new().with_present(true).with_write(true);
        let fetch = PageFaultError::from_bits(0b1_0101);
        assert_eq!(Access::from(read), Access::Read);
        assert_eq!(Access::from(write), Access::Write);
        assert_eq!(Access::from(fetch), Access::Execute);
        assert_eq!(read.explain(), "non-present page");
        assert_eq!(write.explain(), "write to a protected page");
        assert_eq!(fetch.explain(), "user instruction fetch from a protected page");
    }

    #[test]
    fn fault_errors_read_well() {
        let e = segv(VirtualAddress::new(0x1000), "no mapping");
        assert_eq!(alloc::format!("{e}"), alloc::format!("segmentation fault at {}: no mapping", VirtualAddress::new(0x1000)));
        assert_eq!(FaultError::from(FsError::Io), FaultError::Io(FsError::Io));
        assert_eq!(FaultError::from(AllocError::OutOfMemory), FaultError::OutOfMemory);
        assert_eq!(
            FaultError::from(AllocError::InvalidRange("non-canonical address")),
            FaultError::Unmappable("non-canonical address")
        );
    }
}
