//! Counted handles to single allocated pages.
//!
//! A [`PageRef`] owns exactly one reference on its page: cloning takes
//! another, dropping gives one back. Copy-on-write resolution needs to know
//! whether the reference it drops was the last one, which
//! [`PageRef::release`] reports instead of hiding it in `Drop`.
//!
//! Page-table leaves hold references too, but as raw frame addresses;
//! [`PageRef::into_raw`] and [`PageRef::from_raw`] move a reference between
//! the two forms without touching the count.

use crate::error::{AllocError, Corruption};
use crate::fatal;
use crate::frame_alloc::{AllocFlags, PageFrames, PageId, PutOutcome};
use core::fmt;
use core::mem::ManuallyDrop;
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PhysMapper;

/// What became of the page when a [`PageRef`] was released.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Released {
    /// This was the last reference; the page is free again.
    LastOwner,
    /// Other references remain (count after the release).
    StillShared(u16),
}

/// One counted reference on one allocated page.
pub struct PageRef<'a, M: PhysMapper + Copy> {
    frames: &'a PageFrames<M>,
    page: PageId,
}

impl<'a, M: PhysMapper + Copy> PageRef<'a, M> {
    /// Allocate a fresh page; the new reference is the only one.
    ///
    /// # Errors
    /// [`AllocError::OutOfMemory`] if no page is free.
    pub fn allocate(frames: &'a PageFrames<M>, flags: AllocFlags) -> Result<Self, AllocError> {
        let page = frames.allocate(1, flags - AllocFlags::CONTIGUOUS)?;
        Ok(Self { frames, page })
    }

    /// Take an additional reference on an already allocated page.
    ///
    /// # Errors
    /// [`Corruption::ReferenceToFreePage`] if `page` is not allocated.
    pub fn acquire(frames: &'a PageFrames<M>, page: PageId) -> Result<Self, AllocError> {
        frames.get(page)?;
        Ok(Self { frames, page })
    }

    /// Adopt a reference previously given up with [`into_raw`](Self::into_raw).
    ///
    /// # Safety
    /// The caller must own one reference on `page` that nothing else will
    /// drop.
    #[must_use]
    pub const unsafe fn from_raw(frames: &'a PageFrames<M>, page: PageId) -> Self {
        Self { frames, page }
    }

    /// Give up the handle but keep the reference counted.
    #[must_use]
    pub fn into_raw(self) -> PageId {
        ManuallyDrop::new(self).page
    }

    #[must_use]
    pub const fn page(&self) -> PageId {
        self.page
    }

    #[must_use]
    pub fn phys(&self) -> PhysicalAddress {
        self.frames.phys(self.page)
    }

    #[must_use]
    pub fn refcount(&self) -> u16 {
        self.frames.refcount(self.page)
    }

    /// No other reference exists.
    #[must_use]
    pub fn is_exclusive(&self) -> bool {
        self.refcount() == 1
    }

    /// Drop this reference and report whether it was the last one.
    #[track_caller]
    pub fn release(self) -> Released {
        let this = ManuallyDrop::new(self);
        match this.frames.put(this.page) {
            Ok(PutOutcome::Freed) => Released::LastOwner,
            Ok(PutOutcome::Shared(n)) => Released::StillShared(n),
            Ok(PutOutcome::Pinned) => Released::StillShared(u16::MAX),
            Err(AllocError::Corruption(c)) => fatal::corruption(c),
            Err(_) => fatal::corruption(Corruption::RefcountUnderflow { pa: this.phys() }),
        }
    }
}

impl<M: PhysMapper + Copy> Clone for PageRef<'_, M> {
    #[track_caller]
    fn clone(&self) -> Self {
        if let Err(e) = fatal::check(self.frames.get(self.page)) {
            log::error!("cannot clone reference to {}: {e}", self.phys());
            fatal::corruption(Corruption::ReferenceToFreePage { pa: self.phys() });
        }
        Self {
            frames: self.frames,
            page: self.page,
        }
    }
}

impl<M: PhysMapper + Copy> Drop for PageRef<'_, M> {
    fn drop(&mut self) {
        if let Err(e) = fatal::check(self.frames.put(self.page)) {
            log::error!("dropping reference to {}: {e}", self.phys());
        }
    }
}

impl<M: PhysMapper + Copy> fmt::Debug for PageRef<'_, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageRef")
            .field("page", &self.page)
            .field("phys", &self.phys())
            .finish()
    }
}
