//! # Address Space
//!
//! One page-table tree, generic over its [`TableGeometry`]. The walk,
//! allocate-if-missing and write-leaf algorithm exists exactly once here and
//! serves 2-, 3- and 4-level formats alike.
//!
//! ## Highlights
//!
//! - [`AddressSpace::ensure_mapped`] allocates missing intermediate tables
//!   (zeroed frames from the [`FrameAlloc`]) and writes the leaf.
//! - [`AddressSpace::translate`] walks read-only.
//! - [`AddressSpace::unmap`] clears one leaf; [`AddressSpace::unmap_range`]
//!   clears many and gives back intermediate tables that became empty.
//! - [`AddressSpace::try_for_each_leaf`] drives protection changes without
//!   exposing the tables themselves; [`AddressSpace::share_range_cow`] and
//!   [`AddressSpace::copy_range`] build a forked child.
//! - [`AddressSpace::clone_kernel_half`] creates a root whose kernel slots point
//!   at the same tables as a template root.
//!
//! ## Safety
//!
//! - Mutating an active tree needs TLB maintenance; see [`crate::tlb`].
//! - The [`PhysMapper`] must yield writable views of table frames.
//! - Tables reachable from the kernel slots are shared by every root and are
//!   never reclaimed here.

use crate::flags::{Entry, PageTableFlags};
use crate::geometry::TableGeometry;
use crate::{FrameAlloc, PhysMapper};
use core::marker::PhantomData;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, align_down};
use log::{debug, trace};

/// Failure while changing a page-table tree.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PageTableError {
    #[error("out of memory allocating a level {level} table")]
    OutOfMemory { level: usize },
    #[error("address {0:#x} is not page aligned")]
    Misaligned(u64),
    #[error("address {0:#x} is not representable by this table format")]
    NonCanonical(u64),
}

/// What [`AddressSpace::try_for_each_leaf`] does with a visited leaf.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LeafAction<G: TableGeometry> {
    Keep,
    Replace(Entry<G>),
    Clear,
}

/// View of one table frame.
struct Table<'a, G> {
    base: *mut u8,
    level: usize,
    _p: PhantomData<(&'a mut [u8], G)>,
}

impl<G: TableGeometry> Table<'_, G> {
    #[inline]
    fn len(&self) -> usize {
        G::entries(self.level)
    }

    #[inline]
    fn get(&self, idx: usize) -> Entry<G> {
        debug_assert!(idx < self.len());
        // SAFETY: idx is within the table and the frame is mapped for us.
        unsafe {
            if G::ENTRY_BYTES == 4 {
                Entry::from_raw(u64::from(self.base.cast::<u32>().add(idx).read_volatile()))
            } else {
                Entry::from_raw(self.base.cast::<u64>().add(idx).read_volatile())
            }
        }
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn set(&self, idx: usize, e: Entry<G>) {
        debug_assert!(idx < self.len());
        // SAFETY: see `get`.
        unsafe {
            if G::ENTRY_BYTES == 4 {
                self.base.cast::<u32>().add(idx).write_volatile(e.raw() as u32);
            } else {
                self.base.cast::<u64>().add(idx).write_volatile(e.raw());
            }
        }
    }

    fn zero(&self) {
        // SAFETY: the whole frame belongs to this table.
        unsafe { core::ptr::write_bytes(self.base, 0, PAGE_SIZE as usize) }
    }

    fn is_empty(&self) -> bool {
        (0..self.len()).all(|i| !self.get(i).is_present())
    }
}

/// Where a walk for one address stopped.
enum Walk<G> {
    /// Reached the leaf table; the entry may be non-present.
    Leaf {
        table: PhysicalAddress,
        index: usize,
        entry: Entry<G>,
    },
    /// The entry at `level` is not present, so nothing below it exists.
    Missing { level: usize },
}

/// Handle to a single, concrete page-table tree.
pub struct AddressSpace<'m, G: TableGeometry, M: PhysMapper> {
    root: PhysicalAddress,
    mapper: &'m M,
    _g: PhantomData<G>,
}

impl<'m, G: TableGeometry, M: PhysMapper> AddressSpace<'m, G, M> {
    /// Wrap an existing root table.
    #[inline]
    pub const fn from_root(mapper: &'m M, root: PhysicalAddress) -> Self {
        Self {
            root,
            mapper,
            _g: PhantomData,
        }
    }

    /// Allocate an empty root table.
    ///
    /// # Errors
    /// [`PageTableError::OutOfMemory`] if no frame is available.
    pub fn allocate<A: FrameAlloc + ?Sized>(
        mapper: &'m M,
        alloc: &mut A,
    ) -> Result<Self, PageTableError> {
        let root = alloc
            .alloc_4k()
            .ok_or(PageTableError::OutOfMemory { level: 0 })?;
        let aspace = Self::from_root(mapper, root);
        aspace.table(root, 0).zero();
        Ok(aspace)
    }

    /// Allocate a root whose kernel slots alias those of `kernel`.
    ///
    /// Kernel mappings added later below an already-present kernel slot are
    /// visible through every such root; new kernel root slots are not.
    ///
    /// # Errors
    /// [`PageTableError::OutOfMemory`] if no frame is available.
    pub fn clone_kernel_half<A: FrameAlloc + ?Sized>(
        mapper: &'m M,
        alloc: &mut A,
        kernel: &AddressSpace<'_, G, M>,
    ) -> Result<Self, PageTableError> {
        let aspace = Self::allocate(mapper, alloc)?;
        let src = kernel.table(kernel.root, 0);
        let dst = aspace.table(aspace.root, 0);
        for i in G::kernel_root_slots() {
            dst.set(i, src.get(i));
        }
        trace!("new {} root {} sharing kernel half", G::NAME, aspace.root);
        Ok(aspace)
    }

    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    #[inline]
    fn table(&self, pa: PhysicalAddress, level: usize) -> Table<'_, G> {
        Table {
            base: self.mapper.phys_to_virt(pa).as_mut_ptr(),
            level,
            _p: PhantomData,
        }
    }

    fn check(va: VirtualAddress) -> Result<(), PageTableError> {
        if !va.is_page_aligned() {
            return Err(PageTableError::Misaligned(va.as_u64()));
        }
        if !G::is_canonical(va) {
            return Err(PageTableError::NonCanonical(va.as_u64()));
        }
        Ok(())
    }

    fn walk(&self, va: VirtualAddress) -> Walk<G> {
        let mut table_pa = self.root;
        for level in 0..G::LEAF {
            let e = self.table(table_pa, level).get(G::index(va, level));
            match e.address() {
                Some(next) => table_pa = next,
                None => return Walk::Missing { level },
            }
        }
        let index = G::index(va, G::LEAF);
        Walk::Leaf {
            table: table_pa,
            index,
            entry: self.table(table_pa, G::LEAF).get(index),
        }
    }

    /// Walks down to the leaf table for `va`, creating missing levels.
    fn ensure_leaf_table<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        user: bool,
    ) -> Result<PhysicalAddress, PageTableError> {
        let mut table_pa = self.root;
        for level in 0..G::LEAF {
            let table = self.table(table_pa, level);
            let idx = G::index(va, level);
            let e = table.get(idx);
            let want = G::nonleaf_flags(level, user);
            table_pa = if let Some(next) = e.address() {
                if !e.flags().contains(want) {
                    table.set(idx, e.with_flags(e.flags() | want));
                }
                next
            } else {
                let frame = alloc
                    .alloc_4k()
                    .ok_or(PageTableError::OutOfMemory { level: level + 1 })?;
                self.table(frame, level + 1).zero();
                table.set(idx, Entry::new(frame, want));
                trace!("level {} table {frame} for {va}", level + 1);
                frame
            };
        }
        Ok(table_pa)
    }

    /// Map `va → pa` with `flags` (present is implied).
    ///
    /// Any existing leaf is overwritten; the caller owns whatever it pointed
    /// at.
    ///
    /// # Errors
    /// Misaligned or non-canonical `va`, or no frame for a missing table.
    pub fn ensure_mapped<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageTableFlags,
    ) -> Result<(), PageTableError> {
        if !pa.is_page_aligned() {
            return Err(PageTableError::Misaligned(pa.as_u64()));
        }
        self.set_leaf(alloc, va, Entry::new(pa, flags | PageTableFlags::PRESENT))
    }

    /// Install a prepared leaf entry verbatim.
    ///
    /// # Errors
    /// As [`ensure_mapped`](Self::ensure_mapped).
    pub fn set_leaf<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        entry: Entry<G>,
    ) -> Result<(), PageTableError> {
        Self::check(va)?;
        let user = entry.flags().contains(PageTableFlags::USER);
        let table_pa = self.ensure_leaf_table(alloc, va, user)?;
        self.table(table_pa, G::LEAF)
            .set(G::index(va, G::LEAF), entry);
        Ok(())
    }

    /// Pre-create every intermediate table covering `[start, end)` without
    /// mapping anything.
    ///
    /// # Errors
    /// No frame for a missing table.
    pub fn populate_tables<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &mut A,
        start: VirtualAddress,
        end: VirtualAddress,
        user: bool,
    ) -> Result<(), PageTableError> {
        Self::check(start)?;
        let step = G::span(G::LEAF - 1);
        let mut va = align_down(start.as_u64(), step);
        while va < end.as_u64() {
            self.ensure_leaf_table(alloc, VirtualAddress::new(va), user)?;
            match va.checked_add(step) {
                Some(next) => va = next,
                None => break,
            }
        }
        Ok(())
    }

    /// Translate `va` to the physical address it maps to, if any.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let leaf = self.leaf(va.page_base())?;
        leaf.address().map(|pa| pa + va.page_offset())
    }

    /// The present leaf entry mapping `va`.
    #[must_use]
    pub fn leaf(&self, va: VirtualAddress) -> Option<Entry<G>> {
        if !G::is_canonical(va) {
            return None;
        }
        match self.walk(va) {
            Walk::Leaf { entry, .. } if entry.is_present() => Some(entry),
            _ => None,
        }
    }

    /// Rewrite the present leaf for `va`. Returns `false` if unmapped.
    pub fn update_leaf(&self, va: VirtualAddress, f: impl FnOnce(Entry<G>) -> Entry<G>) -> bool {
        if !G::is_canonical(va) {
            return false;
        }
        match self.walk(va.page_base()) {
            Walk::Leaf {
                table,
                index,
                entry,
            } if entry.is_present() => {
                self.table(table, G::LEAF).set(index, f(entry));
                true
            }
            _ => false,
        }
    }

    /// Clear the leaf for `va` and return the frame it pointed at.
    ///
    /// Intermediate tables stay in place.
    pub fn unmap(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        if !G::is_canonical(va) {
            return None;
        }
        match self.walk(va.page_base()) {
            Walk::Leaf {
                table,
                index,
                entry,
            } if entry.is_present() => {
                self.table(table, G::LEAF).set(index, Entry::empty());
                entry.address()
            }
            _ => None,
        }
    }

    /// Visit every present leaf in `[start, end)` in ascending order.
    ///
    /// Absent subtrees are skipped whole. The closure decides per leaf whether
    /// to keep, replace or clear it; an error stops the walk immediately.
    ///
    /// # Errors
    /// Whatever `f` returns.
    pub fn try_for_each_leaf<E>(
        &self,
        start: VirtualAddress,
        end: VirtualAddress,
        mut f: impl FnMut(VirtualAddress, Entry<G>) -> Result<LeafAction<G>, E>,
    ) -> Result<(), E> {
        let mut va = start.page_base().as_u64();
        let end = end.as_u64();
        while va < end {
            let here = VirtualAddress::new(va);
            let step = if G::is_canonical(here) {
                match self.walk(here) {
                    Walk::Leaf {
                        table,
                        index,
                        entry,
                    } => {
                        if entry.is_present() {
                            match f(here, entry)? {
                                LeafAction::Keep => {}
                                LeafAction::Replace(e) => self.table(table, G::LEAF).set(index, e),
                                LeafAction::Clear => {
                                    self.table(table, G::LEAF).set(index, Entry::empty());
                                }
                            }
                        }
                        PAGE_SIZE
                    }
                    Walk::Missing { level } => {
                        let span = G::span(level);
                        align_down(va, span) + span - va
                    }
                }
            } else {
                // Jump over the non-canonical hole in one go.
                (1u64 << (G::VA_BITS - 1)).wrapping_neg().wrapping_sub(va)
            };
            match va.checked_add(step) {
                Some(next) if next > va => va = next,
                _ => break,
            }
        }
        Ok(())
    }

    /// Rewrite every present leaf in `[start, end)` with `f`.
    pub fn protect_range(
        &self,
        start: VirtualAddress,
        end: VirtualAddress,
        mut f: impl FnMut(VirtualAddress, Entry<G>) -> Entry<G>,
    ) {
        let _ = self.try_for_each_leaf(start, end, |va, e| {
            Ok::<_, core::convert::Infallible>(LeafAction::Replace(f(va, e)))
        });
    }

    /// Share every present leaf in `[start, end)` with `child` copy-on-write.
    ///
    /// Both sides end up read-only with [`PageTableFlags::COPY_ON_WRITE`]
    /// set; `on_shared` sees each frame once it is mapped in the child, so a
    /// reference count taken there always matches an installed entry.
    ///
    /// # Errors
    /// No frame for a table in `child`. Leaves shared so far stay shared.
    pub fn share_range_cow<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &mut A,
        child: &AddressSpace<'_, G, M>,
        start: VirtualAddress,
        end: VirtualAddress,
        mut on_shared: impl FnMut(VirtualAddress, PhysicalAddress),
    ) -> Result<(), PageTableError> {
        self.try_for_each_leaf(start, end, |va, e| {
            let cow = e.with_flags((e.flags() - PageTableFlags::WRITABLE) | PageTableFlags::COPY_ON_WRITE);
            child.set_leaf(alloc, va, cow)?;
            if let Some(pa) = cow.address() {
                on_shared(va, pa);
            }
            Ok(LeafAction::Replace(cow))
        })
    }

    /// Copy every present leaf in `[start, end)` into `child` unchanged.
    ///
    /// # Errors
    /// No frame for a table in `child`.
    pub fn copy_range<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &mut A,
        child: &AddressSpace<'_, G, M>,
        start: VirtualAddress,
        end: VirtualAddress,
        mut on_copied: impl FnMut(VirtualAddress, PhysicalAddress),
    ) -> Result<(), PageTableError> {
        self.try_for_each_leaf(start, end, |va, e| {
            child.set_leaf(alloc, va, e)?;
            if let Some(pa) = e.address() {
                on_copied(va, pa);
            }
            Ok(LeafAction::Keep)
        })
    }

    /// Clear every present leaf in `[start, end)`, reporting each to
    /// `on_leaf`, then free user-half intermediate tables that became empty.
    pub fn unmap_range<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &mut A,
        start: VirtualAddress,
        end: VirtualAddress,
        mut on_leaf: impl FnMut(VirtualAddress, Entry<G>),
    ) {
        let _ = self.try_for_each_leaf(start, end, |va, e| {
            on_leaf(va, e);
            Ok::<_, core::convert::Infallible>(LeafAction::Clear)
        });
        self.reclaim_tables(alloc, start, end);
    }

    /// Free intermediate tables overlapping `[start, end)` that hold no
    /// present entry. Kernel-half tables are shared between roots and are
    /// kept.
    pub fn reclaim_tables<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &mut A,
        start: VirtualAddress,
        end: VirtualAddress,
    ) {
        if !G::LAYOUT.is_user(start.as_u64()) {
            return;
        }
        let freed = self.reclaim_below(alloc, self.root, 0, 0, start.as_u64(), end.as_u64());
        if freed > 0 {
            debug!("reclaimed {freed} page table(s) in {start}..{end}");
        }
    }

    /// Post-order walk over the tables below `table_pa`; returns how many
    /// tables were freed.
    fn reclaim_below<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &mut A,
        table_pa: PhysicalAddress,
        level: usize,
        base: u64,
        start: u64,
        end: u64,
    ) -> usize {
        let table = self.table(table_pa, level);
        let span = G::span(level);
        let limit = if level == 0 {
            G::kernel_root_slots().start
        } else {
            table.len()
        };
        #[allow(clippy::cast_possible_truncation)]
        let first = (start.saturating_sub(base) / span) as usize;

        let mut freed = 0;
        for idx in first..limit {
            let child_base = base + idx as u64 * span;
            if child_base >= end {
                break;
            }
            let Some(child) = table.get(idx).address() else {
                continue;
            };
            if level + 1 < G::LEAF {
                freed += self.reclaim_below(alloc, child, level + 1, child_base, start, end);
            }
            if self.table(child, level + 1).is_empty() {
                table.set(idx, Entry::empty());
                alloc.free_4k(child);
                freed += 1;
            }
        }
        freed
    }

    /// Free every user-half table of this tree and the root itself.
    ///
    /// Leaf frames are not touched; unmap them first.
    pub fn destroy<A: FrameAlloc + ?Sized>(self, alloc: &mut A) {
        let root = self.table(self.root, 0);
        let kernel = G::kernel_root_slots();
        for i in 0..root.len() {
            if kernel.contains(&i) {
                continue;
            }
            if let Some(child) = root.get(i).address() {
                self.free_subtree(alloc, child, 1);
                root.set(i, Entry::empty());
            }
        }
        alloc.free_4k(self.root);
        trace!("destroyed {} root {}", G::NAME, self.root);
    }

    fn free_subtree<A: FrameAlloc + ?Sized>(&self, alloc: &mut A, table_pa: PhysicalAddress, level: usize) {
        if level < G::LEAF {
            let table = self.table(table_pa, level);
            for i in 0..table.len() {
                if let Some(child) = table.get(i).address() {
                    self.free_subtree(alloc, child, level + 1);
                }
            }
        }
        alloc.free_4k(table_pa);
    }

    /// Load this tree into the MMU.
    ///
    /// # Safety
    /// The tree must map the currently executing code and stack, and the
    /// paging mode must match `G`.
    #[cfg(all(target_os = "none", any(target_arch = "x86_64", target_arch = "x86")))]
    #[inline]
    pub unsafe fn activate(&self) {
        #[allow(clippy::cast_possible_truncation)]
        let root = self.root.as_u64() as usize;
        unsafe { core::arch::asm!("mov cr3, {}", in(reg) root, options(nostack, preserves_flags)) }
    }
}
