//! # Page Frame Allocator
//!
//! One [`Page`] record per physical frame between the lowest and highest
//! available address of the boot memory map, stored in an arena indexed by
//! frame number. Records are linked by `u32` index, never by pointer:
//!
//! ```text
//!            free list (circular, sentinel at index `len`)
//!   ┌──────────┐   ┌────┐   ┌────┐   ┌────┐
//!   │ sentinel │──►│ 17 │──►│ 3  │──►│ 42 │──► back to sentinel
//!   └──────────┘   └────┘   └────┘   └────┘
//!
//!            allocated run (circular, head carries the count)
//!   ┌──────────────┐   ┌────┐   ┌────┐
//!   │ head 8 (n=3) │──►│ 9  │──►│ 30 │──► back to head
//!   └──────────────┘   └────┘   └────┘
//! ```
//!
//! Every usable frame is either on the free list (reference count 0) or in
//! exactly one run (reference count ≥ 1). Reserved frames are in neither.
//!
//! [`PageFrames`] is the shared, interrupt-safe front end; the raw
//! [`PageFrameAllocator`] is `&mut self` throughout.

use crate::error::{AllocError, Corruption};
use crate::fatal;
use alloc::vec::Vec;
use core::ops::Range;
use kernel_info::memory_map::{MemoryRegion, available_end, available_start};
use kernel_memory_addresses::{
    PAGE_SIZE, PageFrameNumber, PhysicalAddress, VirtualAddress, align_up,
};
use kernel_sync::IrqSpinLock;
use kernel_vmem::{CachePolicy, FrameAlloc, PhysMapper};
use log::{debug, info, warn};

bitflags::bitflags! {
    /// Options for [`PageFrameAllocator::allocate`].
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
    pub struct AllocFlags: u32 {
        /// Physically consecutive frames.
        const CONTIGUOUS = 1 << 0;
        /// Record an uncached kernel mapping.
        const UNCACHED = 1 << 1;
        /// Do not record a kernel-virtual address.
        const NO_KERNEL_MAP = 1 << 2;
        /// Zero-fill every page.
        const ZEROED = 1 << 3;
    }
}

/// Handle to a page record; for runs, the run head.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(u32);

impl PageId {
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Outcome of dropping one reference.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// The count reached zero and the page is back on the free list.
    Freed,
    /// Other holders remain.
    Shared(u16),
    /// The count had saturated; the page stays allocated forever.
    Pinned,
}

/// Counters reported by [`PageFrameAllocator::stats`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub usable: usize,
    pub free: usize,
    pub allocated: usize,
    pub reserved: usize,
}

#[derive(Debug, Clone)]
struct Page {
    refcount: u16,
    /// Pages in the run; non-zero only on run heads.
    count: u32,
    virt: Option<VirtualAddress>,
    uncached: bool,
    reserved: bool,
    prev: u32,
    next: u32,
}

impl Page {
    const fn detached(index: u32) -> Self {
        Self {
            refcount: 0,
            count: 0,
            virt: None,
            uncached: false,
            reserved: true,
            prev: index,
            next: index,
        }
    }
}

/// Physical page frame allocator over one contiguous frame-number range.
pub struct PageFrameAllocator<M> {
    mapper: M,
    base: PageFrameNumber,
    /// `len` page records followed by the free-list sentinel.
    pages: Vec<Page>,
    len: u32,
    free: usize,
    usable: usize,
}

impl<M: PhysMapper + Copy> PageFrameAllocator<M> {
    /// Build the page records from the boot memory map.
    ///
    /// Frames fully inside an available region and outside every `reserved`
    /// range go on the free list in ascending physical order; everything else
    /// is reserved.
    ///
    /// # Errors
    /// [`AllocError::InvalidRange`] if the map has no available memory or
    /// spans more frames than the allocator can index.
    pub fn new(
        mapper: M,
        memory_map: &[MemoryRegion],
        reserved: &[Range<PhysicalAddress>],
    ) -> Result<Self, AllocError> {
        let (Some(lo), Some(hi)) = (available_start(memory_map), available_end(memory_map)) else {
            return Err(AllocError::InvalidRange("memory map has no available RAM"));
        };
        let base = PhysicalAddress::new(align_up(lo.as_u64(), PAGE_SIZE)).frame_number();
        let end = hi.frame_number();
        let len = u32::try_from(end.as_u64().saturating_sub(base.as_u64()))
            .ok()
            .filter(|&n| n < u32::MAX)
            .ok_or(AllocError::InvalidRange("too many page frames"))?;

        let mut pages: Vec<Page> = (0..=len).map(Page::detached).collect();
        pages[len as usize].reserved = false;
        let mut this = Self {
            mapper,
            base,
            pages,
            len,
            free: 0,
            usable: 0,
        };

        for i in 0..len {
            let pa = this.phys_of(i);
            let (start, stop) = (pa.as_u64(), pa.as_u64() + PAGE_SIZE);
            let in_ram = memory_map
                .iter()
                .any(|r| r.is_available() && r.covers(start, stop));
            let held = reserved
                .iter()
                .any(|r| r.start.as_u64() < stop && start < r.end.as_u64());
            if in_ram && !held {
                this.pages[i as usize].reserved = false;
                this.push_free_back(i);
                this.usable += 1;
            }
        }

        info!(
            "page frames: {} usable, {} reserved, records for {}..{}",
            this.usable,
            len as usize - this.usable,
            base.base(),
            end.base()
        );
        Ok(this)
    }

    #[inline]
    const fn sentinel(&self) -> u32 {
        self.len
    }

    #[inline]
    fn phys_of(&self, index: u32) -> PhysicalAddress {
        (self.base + u64::from(index)).base()
    }

    fn unlink(&mut self, i: u32) {
        let Page { prev, next, .. } = self.pages[i as usize];
        self.pages[prev as usize].next = next;
        self.pages[next as usize].prev = prev;
        let p = &mut self.pages[i as usize];
        p.prev = i;
        p.next = i;
    }

    /// Link `i` directly after `at`.
    fn link_after(&mut self, at: u32, i: u32) {
        let next = self.pages[at as usize].next;
        self.pages[i as usize].prev = at;
        self.pages[i as usize].next = next;
        self.pages[next as usize].prev = i;
        self.pages[at as usize].next = i;
    }

    fn push_free_front(&mut self, i: u32) {
        self.link_after(self.sentinel(), i);
        self.free += 1;
    }

    fn push_free_back(&mut self, i: u32) {
        let tail = self.pages[self.sentinel() as usize].prev;
        self.link_after(tail, i);
        self.free += 1;
    }

    fn is_free(&self, i: u32) -> bool {
        let p = &self.pages[i as usize];
        p.refcount == 0 && !p.reserved
    }

    fn checked(&self, page: PageId) -> Result<u32, AllocError> {
        if page.0 < self.len {
            Ok(page.0)
        } else {
            Err(AllocError::InvalidRange("page id out of range"))
        }
    }

    fn checked_head(&self, page: PageId) -> Result<u32, AllocError> {
        let i = self.checked(page)?;
        let p = &self.pages[i as usize];
        if p.refcount == 0 || p.count == 0 {
            return Err(AllocError::InvalidRange("not an allocated run head"));
        }
        Ok(i)
    }

    /// Allocate `count` pages as one run and return its head.
    ///
    /// # Errors
    /// - [`AllocError::InvalidRange`] for `count == 0`.
    /// - [`AllocError::OutOfMemory`] if too few pages are free, or for a
    ///   contiguous request, no long enough stretch exists.
    pub fn allocate(&mut self, count: usize, flags: AllocFlags) -> Result<PageId, AllocError> {
        if count == 0 {
            return Err(AllocError::InvalidRange("zero-page allocation"));
        }
        if count > self.free {
            return Err(AllocError::OutOfMemory);
        }
        #[allow(clippy::cast_possible_truncation)]
        let n = count as u32;

        let members: Vec<u32> = if flags.contains(AllocFlags::CONTIGUOUS) {
            let start = self.find_contiguous(n).ok_or(AllocError::OutOfMemory)?;
            (start..start + n).collect()
        } else {
            let mut cursor = self.sentinel();
            (0..n)
                .map(|_| {
                    cursor = self.pages[cursor as usize].next;
                    cursor
                })
                .collect()
        };

        let head = members[0];
        for &i in &members {
            self.unlink(i);
            self.free -= 1;
            let p = &mut self.pages[i as usize];
            p.refcount = 1;
            p.count = 0;
        }
        for w in members.windows(2) {
            let tail = self.pages[head as usize].prev;
            debug_assert_eq!(w[0], tail);
            self.link_after(tail, w[1]);
        }
        self.pages[head as usize].count = n;

        let policy = if flags.contains(AllocFlags::UNCACHED) {
            CachePolicy::Uncached
        } else {
            CachePolicy::WriteBack
        };
        for &i in &members {
            if !flags.contains(AllocFlags::NO_KERNEL_MAP) {
                self.kernel_map(PageId(i), policy);
            }
            if flags.contains(AllocFlags::ZEROED) {
                self.zero(i);
            }
        }

        debug!(
            "allocated {count} page(s) at {} ({flags:?})",
            self.phys_of(head)
        );
        Ok(PageId(head))
    }

    /// First index of `n` consecutive free records, in physical order.
    fn find_contiguous(&self, n: u32) -> Option<u32> {
        let mut run = 0;
        for i in 0..self.len {
            if self.is_free(i) {
                run += 1;
                if run == n {
                    return Some(i + 1 - n);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    fn zero(&self, i: u32) {
        let va = self.mapper.phys_to_virt(self.phys_of(i));
        // SAFETY: the page is allocated to the caller and the direct map
        // covers it.
        unsafe { core::ptr::write_bytes(va.as_mut_ptr::<u8>(), 0, PAGE_SIZE as usize) }
    }

    /// Cut `run` after its first `keep` pages; returns the head of the rest.
    ///
    /// # Errors
    /// [`AllocError::InvalidRange`] unless `0 < keep < run_len(run)`.
    pub fn split(&mut self, run: PageId, keep: usize) -> Result<PageId, AllocError> {
        let head = self.checked_head(run)?;
        let count = self.pages[head as usize].count as usize;
        if keep == 0 || keep >= count {
            return Err(AllocError::InvalidRange("split point outside the run"));
        }
        let mut rest = head;
        for _ in 0..keep {
            rest = self.pages[rest as usize].next;
        }
        let tail = self.pages[head as usize].prev;
        let keep_tail = self.pages[rest as usize].prev;

        self.pages[keep_tail as usize].next = head;
        self.pages[head as usize].prev = keep_tail;
        self.pages[tail as usize].next = rest;
        self.pages[rest as usize].prev = tail;

        #[allow(clippy::cast_possible_truncation)]
        let (kept, moved) = (keep as u32, (count - keep) as u32);
        self.pages[head as usize].count = kept;
        self.pages[rest as usize].count = moved;
        Ok(PageId(rest))
    }

    /// Append run `b` to run `a`; `b` stops being a head.
    ///
    /// # Errors
    /// [`AllocError::InvalidRange`] if either is not a run head or both are
    /// the same run.
    pub fn merge(&mut self, a: PageId, b: PageId) -> Result<(), AllocError> {
        let a = self.checked_head(a)?;
        let b = self.checked_head(b)?;
        if a == b {
            return Err(AllocError::InvalidRange("cannot merge a run with itself"));
        }
        let a_tail = self.pages[a as usize].prev;
        let b_tail = self.pages[b as usize].prev;
        self.pages[a_tail as usize].next = b;
        self.pages[b as usize].prev = a_tail;
        self.pages[b_tail as usize].next = a;
        self.pages[a as usize].prev = b_tail;

        let moved = core::mem::take(&mut self.pages[b as usize].count);
        self.pages[a as usize].count += moved;
        Ok(())
    }

    /// Drop one reference on every page of `run`.
    ///
    /// Pages that reach zero are kernel-unmapped and pushed to the front of
    /// the free list. Pages still referenced elsewhere are detached as
    /// single-page runs.
    ///
    /// # Errors
    /// - [`Corruption::RefcountUnderflow`] or [`Corruption::FreeReserved`] if
    ///   any page of the run is free or reserved; nothing is changed then.
    /// - [`AllocError::InvalidRange`] if `run` is not a run head.
    pub fn free(&mut self, run: PageId) -> Result<(), AllocError> {
        let head = self.checked(run)?;
        self.validate_put(head)?;
        let count = self.pages[head as usize].count;
        if count == 0 {
            return Err(AllocError::InvalidRange("not a run head"));
        }
        let mut cur = head;
        for _ in 0..count {
            self.validate_put(cur)?;
            cur = self.pages[cur as usize].next;
        }

        let mut cur = head;
        for _ in 0..count {
            let next = self.pages[cur as usize].next;
            self.unlink(cur);
            self.pages[cur as usize].count = 0;
            match self.drop_ref(cur) {
                PutOutcome::Freed => {}
                PutOutcome::Shared(_) | PutOutcome::Pinned => self.pages[cur as usize].count = 1,
            }
            cur = next;
        }
        debug!("freed run of {count} page(s) at {}", self.phys_of(head));
        Ok(())
    }

    fn validate_put(&self, i: u32) -> Result<(), Corruption> {
        let p = &self.pages[i as usize];
        let pa = self.phys_of(i);
        if p.reserved {
            Err(Corruption::FreeReserved { pa })
        } else if p.refcount == 0 {
            Err(Corruption::RefcountUnderflow { pa })
        } else {
            Ok(())
        }
    }

    /// Decrement a detached page's count, releasing it at zero.
    fn drop_ref(&mut self, i: u32) -> PutOutcome {
        let p = &mut self.pages[i as usize];
        if p.refcount == u16::MAX {
            return PutOutcome::Pinned;
        }
        p.refcount -= 1;
        if p.refcount > 0 {
            return PutOutcome::Shared(p.refcount);
        }
        p.virt = None;
        p.uncached = false;
        p.count = 0;
        self.push_free_front(i);
        PutOutcome::Freed
    }

    /// Take another reference on an allocated page.
    ///
    /// Saturates at `u16::MAX`, after which the page is pinned.
    ///
    /// # Errors
    /// [`Corruption::ReferenceToFreePage`] if the page is free or reserved.
    pub fn get(&mut self, page: PageId) -> Result<u16, AllocError> {
        let i = self.checked(page)?;
        let pa = self.phys_of(i);
        let p = &mut self.pages[i as usize];
        if p.refcount == 0 || p.reserved {
            return Err(Corruption::ReferenceToFreePage { pa }.into());
        }
        if p.refcount == u16::MAX - 1 {
            warn!("reference count of {pa} saturated; page pinned");
        }
        p.refcount = p.refcount.saturating_add(1);
        Ok(p.refcount)
    }

    /// Drop one reference on a single page.
    ///
    /// A page that reaches zero leaves its run first (the run shrinks by one)
    /// and returns to the free list.
    ///
    /// # Errors
    /// As [`free`](Self::free), for this one page.
    pub fn put(&mut self, page: PageId) -> Result<PutOutcome, AllocError> {
        let i = self.checked(page)?;
        self.validate_put(i)?;
        let p = &self.pages[i as usize];
        if p.refcount > 1 {
            return Ok(self.drop_ref(i));
        }
        self.detach_from_run(i);
        Ok(self.drop_ref(i))
    }

    fn detach_from_run(&mut self, i: u32) {
        let next = self.pages[i as usize].next;
        if next == i {
            return;
        }
        let count = self.pages[i as usize].count;
        if count > 0 {
            self.pages[next as usize].count = count - 1;
        } else {
            let mut head = self.pages[i as usize].prev;
            while self.pages[head as usize].count == 0 {
                head = self.pages[head as usize].prev;
            }
            self.pages[head as usize].count -= 1;
        }
        self.unlink(i);
        self.pages[i as usize].count = 1;
    }

    #[must_use]
    pub fn refcount(&self, page: PageId) -> u16 {
        self.pages.get(page.index()).map_or(0, |p| p.refcount)
    }

    /// Record that owns the frame containing `pa`.
    #[must_use]
    pub fn page_of(&self, pa: PhysicalAddress) -> Option<PageId> {
        let pfn = pa.frame_number().as_u64();
        let idx = pfn.checked_sub(self.base.as_u64())?;
        u32::try_from(idx)
            .ok()
            .filter(|&i| i < self.len)
            .map(PageId)
    }

    #[must_use]
    pub fn phys(&self, page: PageId) -> PhysicalAddress {
        self.phys_of(page.0)
    }

    /// Cached kernel-virtual address, if the page is kernel-mapped.
    #[must_use]
    pub fn virt(&self, page: PageId) -> Option<VirtualAddress> {
        self.pages.get(page.index()).and_then(|p| p.virt)
    }

    #[must_use]
    pub fn is_uncached(&self, page: PageId) -> bool {
        self.pages.get(page.index()).is_some_and(|p| p.uncached)
    }

    /// Number of pages in the run headed by `page` (0 if not a head).
    #[must_use]
    pub fn run_len(&self, page: PageId) -> usize {
        self.pages.get(page.index()).map_or(0, |p| p.count as usize)
    }

    /// Pages of the run headed by `head`, in link order.
    pub fn run_pages(&self, head: PageId) -> impl Iterator<Item = PageId> + '_ {
        let mut cur = head.0;
        (0..self.run_len(head)).map(move |_| {
            let this = cur;
            cur = self.pages[cur as usize].next;
            PageId(this)
        })
    }

    /// Record the kernel-virtual address of `page` under `policy`.
    pub fn kernel_map(&mut self, page: PageId, policy: CachePolicy) -> VirtualAddress {
        let va = self.mapper.phys_to_virt(self.phys_of(page.0));
        if let Some(p) = self.pages.get_mut(page.index()) {
            p.virt = Some(va);
            p.uncached = policy != CachePolicy::WriteBack;
        }
        va
    }

    pub fn kernel_unmap(&mut self, page: PageId) {
        if let Some(p) = self.pages.get_mut(page.index()) {
            p.virt = None;
            p.uncached = false;
        }
    }

    #[must_use]
    pub const fn free_count(&self) -> usize {
        self.free
    }

    #[must_use]
    pub fn stats(&self) -> FrameStats {
        FrameStats {
            usable: self.usable,
            free: self.free,
            allocated: self.usable - self.free,
            reserved: self.len as usize - self.usable,
        }
    }

    pub fn log_stats(&self) {
        let s = self.stats();
        info!(
            "pages: {} usable, {} free, {} allocated, {} reserved ({} KiB free)",
            s.usable,
            s.free,
            s.allocated,
            s.reserved,
            s.free as u64 * PAGE_SIZE / 1024
        );
    }

    #[must_use]
    pub const fn mapper(&self) -> M {
        self.mapper
    }
}

/// The shared page frame allocator: a [`PageFrameAllocator`] behind an
/// [`IrqSpinLock`]. Every method locks for its own duration only.
pub struct PageFrames<M> {
    inner: IrqSpinLock<PageFrameAllocator<M>>,
}

impl<M: PhysMapper + Copy> PageFrames<M> {
    #[must_use]
    pub const fn new(allocator: PageFrameAllocator<M>) -> Self {
        Self {
            inner: IrqSpinLock::new(allocator),
        }
    }

    /// Run `f` with the allocator locked.
    pub fn with<R>(&self, f: impl FnOnce(&mut PageFrameAllocator<M>) -> R) -> R {
        self.inner.with_lock(f)
    }

    /// See [`PageFrameAllocator::allocate`].
    ///
    /// # Errors
    /// As the unlocked variant.
    pub fn allocate(&self, count: usize, flags: AllocFlags) -> Result<PageId, AllocError> {
        self.with(|a| a.allocate(count, flags))
    }

    /// # Errors
    /// See [`PageFrameAllocator::split`].
    pub fn split(&self, run: PageId, keep: usize) -> Result<PageId, AllocError> {
        self.with(|a| a.split(run, keep))
    }

    /// # Errors
    /// See [`PageFrameAllocator::merge`].
    pub fn merge(&self, a: PageId, b: PageId) -> Result<(), AllocError> {
        self.with(|alloc| alloc.merge(a, b))
    }

    /// # Errors
    /// See [`PageFrameAllocator::free`].
    pub fn free(&self, run: PageId) -> Result<(), AllocError> {
        self.with(|a| a.free(run))
    }

    /// # Errors
    /// See [`PageFrameAllocator::get`].
    pub fn get(&self, page: PageId) -> Result<u16, AllocError> {
        self.with(|a| a.get(page))
    }

    /// # Errors
    /// See [`PageFrameAllocator::put`].
    pub fn put(&self, page: PageId) -> Result<PutOutcome, AllocError> {
        self.with(|a| a.put(page))
    }

    #[must_use]
    pub fn refcount(&self, page: PageId) -> u16 {
        self.with(|a| a.refcount(page))
    }

    #[must_use]
    pub fn page_of(&self, pa: PhysicalAddress) -> Option<PageId> {
        self.with(|a| a.page_of(pa))
    }

    #[must_use]
    pub fn phys(&self, page: PageId) -> PhysicalAddress {
        self.with(|a| a.phys(page))
    }

    #[must_use]
    pub fn virt(&self, page: PageId) -> Option<VirtualAddress> {
        self.with(|a| a.virt(page))
    }

    #[must_use]
    pub fn run_len(&self, page: PageId) -> usize {
        self.with(|a| a.run_len(page))
    }

    #[must_use]
    pub fn stats(&self) -> FrameStats {
        self.with(|a| a.stats())
    }

    pub fn log_stats(&self) {
        self.with(|a| a.log_stats());
    }

    #[must_use]
    pub fn mapper(&self) -> M {
        self.with(|a| a.mapper())
    }
}

/// Page-table frames come from the shared allocator: zeroed single pages.
///
/// Releasing a table frame is best-effort. The trait cannot report failure,
/// so a frame outside managed RAM or one that is not allocated is only
/// logged and stays where it is. Corruption still goes through
/// [`fatal::check`].
impl<M: PhysMapper + Copy> FrameAlloc for &PageFrames<M> {
    fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
        self.with(|a| {
            a.allocate(1, AllocFlags::ZEROED)
                .ok()
                .map(|page| a.phys(page))
        })
    }

    fn free_4k(&mut self, pa: PhysicalAddress) {
        let result = self.with(|a| match a.page_of(pa) {
            Some(page) => a.free(page),
            None => Err(AllocError::InvalidRange("table frame outside managed RAM")),
        });
        if let Err(e) = fatal::check(result) {
            warn!("could not free table frame {pa}: {e}");
        }
    }
}
