//! # Process address spaces
//!
//! A [`ProcessMemory`] pairs a page-table root with the ordered list of
//! [`VmArea`]s that say what may live below it. Pages are filled lazily by
//! [`ProcessMemory::handle_fault`]; [`ProcessMemory::fork`] shares private
//! pages copy-on-write.
//!
//! Every present user leaf that points at allocator-managed memory holds one
//! reference on its page. Device ([`Backing::Device`]) leaves hold none.

mod area;
mod fault;
mod fork;
mod list;

pub use area::{Backing, BackingFile, FileBacking, FsError, VmArea, VmFlags, VmKind};
pub use fault::{Access, FaultError, FaultResolution, PageFaultError};
pub use list::{VmaId, VmaList};

use crate::context::KernelMemory;
use crate::error::{AllocError, Corruption};
use crate::frame_alloc::PageFrames;
use crate::page_ref::PageRef;
use core::marker::PhantomData;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, align_up};
use kernel_sync::IrqGuard;
use kernel_vmem::{Entry, PageTableError, PageTableFlags, PhysMapper, TableGeometry, tlb};
use log::{debug, trace};

/// Failure of an address-space operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid range: {0}")]
    InvalidRange(&'static str),
    #[error("access to {0} not permitted")]
    AccessDenied(VirtualAddress),
    #[error("string at {0} is not terminated")]
    Unterminated(VirtualAddress),
    #[error("memory corruption: {0}")]
    Corruption(#[from] Corruption),
}

impl From<AllocError> for VmError {
    fn from(e: AllocError) -> Self {
        match e {
            AllocError::OutOfMemory => Self::OutOfMemory,
            AllocError::InvalidRange(why) => Self::InvalidRange(why),
            AllocError::Corruption(c) => Self::Corruption(c),
        }
    }
}

impl From<PageTableError> for VmError {
    fn from(e: PageTableError) -> Self {
        AllocError::from(e).into()
    }
}

/// Drop the page reference a user leaf holds.
fn release_leaf<G: TableGeometry, M: PhysMapper + Copy>(frames: &PageFrames<M>, entry: Entry<G>) {
    let Some(pa) = entry.address() else { return };
    match frames.page_of(pa) {
        // SAFETY: every managed user leaf owns one reference.
        Some(page) => drop(unsafe { PageRef::from_raw(frames, page) }),
        None => trace!("leaf {pa} is not allocator memory"),
    }
}

/// The user half of one process.
#[derive(Debug)]
pub struct ProcessMemory<G: TableGeometry> {
    root: PhysicalAddress,
    areas: VmaList,
    _g: PhantomData<G>,
}

impl<G: TableGeometry> ProcessMemory<G> {
    /// New address space sharing the kernel half, with `initial` areas
    /// (typically code, data and stack).
    ///
    /// # Errors
    /// - [`VmError::OutOfMemory`] if the root cannot be allocated.
    /// - [`VmError::InvalidRange`] for an overlapping or kernel-half area.
    pub fn create<M: PhysMapper + Copy>(
        kmem: &KernelMemory<G, M>,
        initial: impl IntoIterator<Item = VmArea>,
    ) -> Result<Self, VmError> {
        let root = {
            let _irq = IrqGuard::new();
            kernel_vmem::AddressSpace::<G, M>::clone_kernel_half(
                kmem.mapper(),
                &mut kmem.frames(),
                &kmem.kernel_space(),
            )?
            .root()
        };
        let mut this = Self {
            root,
            areas: VmaList::new(),
            _g: PhantomData,
        };
        for area in initial {
            if let Err(e) = this.map(kmem, area) {
                this.destroy(kmem);
                return Err(e);
            }
        }
        debug!("created address space {root} with {} area(s)", this.areas.len());
        Ok(this)
    }

    #[must_use]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    #[must_use]
    pub const fn areas(&self) -> &VmaList {
        &self.areas
    }

    /// The area containing `va`.
    #[must_use]
    pub fn find(&self, va: VirtualAddress) -> Option<&VmArea> {
        self.areas.find(va).and_then(|id| self.areas.get(id))
    }

    /// Add an area (`mmap`). Device areas are mapped immediately, everything
    /// else on first touch.
    ///
    /// # Errors
    /// - [`VmError::InvalidRange`] for an overlapping, unaligned or non-user
    ///   range, one crossing the non-canonical hole, or an IO flag that does
    ///   not match the backing.
    /// - [`VmError::OutOfMemory`] if a device page table cannot be allocated;
    ///   the area is not added then.
    pub fn map<M: PhysMapper + Copy>(
        &mut self,
        kmem: &KernelMemory<G, M>,
        area: VmArea,
    ) -> Result<VmaId, VmError> {
        if area.is_empty() {
            return Err(VmError::InvalidRange("area empty"));
        }
        let last = VirtualAddress::new(area.end.as_u64() - 1);
        if ![area.start, last].into_iter().all(|va| G::is_canonical(va) && G::LAYOUT.is_user(va.as_u64())) {
            return Err(VmError::InvalidRange("area outside user space"));
        }
        let device = match area.backing {
            Backing::Device { phys, .. } => Some(phys),
            _ => None,
        };
        let flags = area.leaf_flags::<G>(kmem.encoding());
        let (start, end) = (area.start, area.end);
        let id = self.areas.insert(area)?;

        if let Some(phys) = device {
            let _irq = IrqGuard::new();
            let aspace = kmem.address_space(self.root);
            let mut alloc = kmem.frames();
            for off in (0..end - start).step_by(PAGE_SIZE as usize) {
                if let Err(e) = aspace.ensure_mapped(&mut alloc, start + off, phys + off, flags) {
                    aspace.unmap_range(&mut alloc, start, end, |_, _| {});
                    self.areas.remove(id);
                    return Err(e.into());
                }
            }
            tlb::invalidate_range(start, end);
        }
        trace!("mapped area {id:?} {start}..{end}");
        Ok(id)
    }

    /// Round `[start, start + len)` out to whole pages.
    fn page_range(start: VirtualAddress, len: u64) -> Result<(VirtualAddress, VirtualAddress), VmError> {
        if !start.is_page_aligned() || len == 0 {
            return Err(VmError::InvalidRange("range empty or not page aligned"));
        }
        let end = start
            .checked_add(align_up(len, PAGE_SIZE))
            .ok_or(VmError::InvalidRange("range wraps"))?;
        Ok((start, end))
    }

    /// Make `start` and `end` area boundaries; returns the areas in between.
    fn isolate(&mut self, start: VirtualAddress, end: VirtualAddress) -> Result<alloc::vec::Vec<VmaId>, VmError> {
        let mut ids = self.areas.overlapping(start, end);
        if let Some(&first) = ids.first() {
            if self.areas.get(first).is_some_and(|a| a.start < start) {
                let upper = self.areas.split(first, start)?;
                ids[0] = upper;
            }
        }
        if let Some(&last) = ids.last() {
            if self.areas.get(last).is_some_and(|a| a.end > end) {
                self.areas.split(last, end)?;
            }
        }
        Ok(ids)
    }

    /// Drop every page of `area` and its now-empty tables.
    fn release_area<M: PhysMapper + Copy>(&self, kmem: &KernelMemory<G, M>, area: &VmArea) {
        let aspace = kmem.address_space(self.root);
        let frames = kmem.frames();
        let mut alloc = frames;
        let managed = !area.is_device();
        aspace.unmap_range(&mut alloc, area.start, area.end, |_, entry| {
            if managed {
                release_leaf(frames, entry);
            }
        });
        tlb::invalidate_range(area.start, area.end);
    }

    /// Remove `[start, start + len)` from the address space (`munmap`).
    /// Areas straddling the edges are trimmed; unmapped holes are fine.
    ///
    /// # Errors
    /// [`VmError::InvalidRange`] for an unaligned or empty range.
    pub fn unmap<M: PhysMapper + Copy>(
        &mut self,
        kmem: &KernelMemory<G, M>,
        start: VirtualAddress,
        len: u64,
    ) -> Result<(), VmError> {
        let (start, end) = Self::page_range(start, len)?;
        let _irq = IrqGuard::new();
        for id in self.isolate(start, end)? {
            if let Some(area) = self.areas.remove(id) {
                self.release_area(kmem, &area);
                trace!("unmapped area {area}");
            }
        }
        Ok(())
    }

    /// Change the permissions of `[start, start + len)` (`mprotect`).
    ///
    /// Only read, write and execute change; copy-on-write leaves stay
    /// read-only until their next write fault.
    ///
    /// # Errors
    /// [`VmError::InvalidRange`] if any page of the range has no area.
    pub fn protect<M: PhysMapper + Copy>(
        &mut self,
        kmem: &KernelMemory<G, M>,
        start: VirtualAddress,
        len: u64,
        flags: VmFlags,
    ) -> Result<(), VmError> {
        let (start, end) = Self::page_range(start, len)?;
        let mut cursor = start;
        for id in self.areas.overlapping(start, end) {
            match self.areas.get(id) {
                Some(a) if a.start <= cursor => cursor = a.end,
                _ => break,
            }
        }
        if cursor < end {
            return Err(VmError::InvalidRange("range not fully mapped"));
        }

        let _irq = IrqGuard::new();
        let aspace = kmem.address_space(self.root);
        let perms = VmFlags::READ | VmFlags::WRITE | VmFlags::EXEC;
        for id in self.isolate(start, end)? {
            let Some(area) = self.areas.get_mut(id) else { continue };
            area.flags = (area.flags - perms) | (flags & perms);
            let leaf = area.leaf_flags::<G>(kmem.encoding());
            aspace.protect_range(area.start, area.end, |_, e| {
                let mut f = leaf;
                if e.flags().contains(PageTableFlags::COPY_ON_WRITE) {
                    f = (f - PageTableFlags::WRITABLE) | PageTableFlags::COPY_ON_WRITE;
                }
                e.with_flags(f)
            });
        }
        tlb::invalidate_range(start, end);
        Ok(())
    }

    /// Check that user memory `[addr, addr + len)` may be accessed with
    /// `access`, for system-call arguments. The range may span adjacent
    /// areas.
    ///
    /// # Errors
    /// [`VmError::AccessDenied`] with the first offending address.
    pub fn verify(&self, addr: VirtualAddress, len: u64, access: Access) -> Result<(), VmError> {
        let Some(end) = addr.checked_add(len) else {
            return Err(VmError::AccessDenied(addr));
        };
        let mut cursor = addr;
        while cursor < end {
            let area = self.find(cursor).ok_or(VmError::AccessDenied(cursor))?;
            if !area.flags.contains(access.required()) {
                return Err(VmError::AccessDenied(cursor));
            }
            cursor = area.end;
        }
        Ok(())
    }

    /// Check a NUL-terminated user string at `addr`, for path and argument
    /// pointers passed to system calls. Returns its length without the
    /// terminator.
    ///
    /// At most `limit` bytes are scanned. Pages of the string that were
    /// never touched are faulted in for reading first.
    ///
    /// # Errors
    /// - [`VmError::AccessDenied`] with the first byte that lies outside
    ///   every area, in an area not allowing `access`, or cannot be paged in.
    /// - [`VmError::Unterminated`] if no NUL occurs within `limit` bytes.
    /// - [`VmError::OutOfMemory`] if paging in ran out of frames.
    pub fn verify_string<M: PhysMapper + Copy>(
        &mut self,
        kmem: &KernelMemory<G, M>,
        addr: VirtualAddress,
        limit: usize,
        access: Access,
    ) -> Result<usize, VmError> {
        let mut len = 0;
        let mut cursor = addr;
        while len < limit {
            let flags = self.find(cursor).map(|a| a.flags).ok_or(VmError::AccessDenied(cursor))?;
            if !flags.contains(access.required() | VmFlags::READ) {
                return Err(VmError::AccessDenied(cursor));
            }
            let pa = match kmem.address_space(self.root).translate(cursor) {
                Some(pa) => pa,
                None => {
                    self.handle_fault(kmem, cursor, Access::Read).map_err(|e| match e {
                        FaultError::OutOfMemory => VmError::OutOfMemory,
                        _ => VmError::AccessDenied(cursor),
                    })?;
                    kmem.address_space(self.root)
                        .translate(cursor)
                        .ok_or(VmError::AccessDenied(cursor))?
                }
            };

            #[allow(clippy::cast_possible_truncation)]
            let chunk = ((PAGE_SIZE - cursor.page_offset()) as usize).min(limit - len);
            let src = kmem.mapper().phys_to_virt(pa);
            // SAFETY: the rest of the page is mapped and outlives the borrow.
            let bytes = unsafe { core::slice::from_raw_parts(src.as_mut_ptr::<u8>().cast_const(), chunk) };
            if let Some(nul) = bytes.iter().position(|&b| b == 0) {
                return Ok(len + nul);
            }
            len += chunk;
            cursor = cursor.checked_add(chunk as u64).ok_or(VmError::AccessDenied(cursor))?;
        }
        Err(VmError::Unterminated(addr))
    }

    /// Drop every area and page but keep the root (`exec`).
    pub fn exec_reset<M: PhysMapper + Copy>(&mut self, kmem: &KernelMemory<G, M>) {
        let _irq = IrqGuard::new();
        for area in self.areas.drain() {
            self.release_area(kmem, &area);
        }
        debug!("address space {} reset", self.root);
    }

    /// Drop every area and page, then free all user tables and the root.
    pub fn destroy<M: PhysMapper + Copy>(mut self, kmem: &KernelMemory<G, M>) {
        self.exec_reset(kmem);
        let _irq = IrqGuard::new();
        kmem.address_space(self.root).destroy(&mut kmem.frames());
        debug!("address space {} destroyed", self.root);
    }

    pub fn log_areas(&self) {
        for (_, area) in self.areas.iter() {
            debug!("  {area}");
        }
    }
}
