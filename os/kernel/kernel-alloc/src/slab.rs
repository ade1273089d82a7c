//! # Slab Allocator
//!
//! Fixed-size object pools, one per size class, each carved once from a
//! contiguous page run at init. Classes never grow.
//!
//! Every object carries an 8-byte header in front of the memory handed out:
//!
//! ```text
//! +----------------+----------------+---------------------------+
//! | guard (u32)    | next (u32)     |   payload (object size)   |
//! +----------------+----------------+---------------------------+
//! ^ slot                            ^ pointer returned by alloc
//! ```
//!
//! - `guard` is [`FREE_GUARD`] while the slot is on the free list and
//!   [`ALLOCATED_GUARD`] while it is handed out. Anything else means the
//!   header was overwritten.
//! - `next` is the free-list successor (slot index), meaningful only while
//!   free.
//!
//! Freed payloads are zeroed before they go back on the list.

use crate::error::{AllocError, Corruption};
use crate::frame_alloc::{AllocFlags, PageFrames, PageId};
use alloc::vec::Vec;
use core::ptr::NonNull;
use kernel_memory_addresses::{VirtualAddress, align_up, pages_for};
use kernel_vmem::PhysMapper;
use log::{debug, info, warn};

/// Guard value of an object on the free list.
pub const FREE_GUARD: u32 = 0x0253_2401;

/// Guard value of an allocated object.
pub const ALLOCATED_GUARD: u32 = 0;

const NO_SLOT: u32 = u32::MAX;

#[repr(C)]
struct ObjectHeader {
    guard: u32,
    next: u32,
}

const HEADER: usize = size_of::<ObjectHeader>();

/// One row of the size-class table.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SlabClassConfig {
    pub object_size: usize,
    pub count: usize,
}

impl SlabClassConfig {
    #[must_use]
    pub const fn new(object_size: usize, count: usize) -> Self {
        Self { object_size, count }
    }
}

/// The default kernel size classes (object size, object count).
pub const DEFAULT_SLAB_CLASSES: &[SlabClassConfig] = &[
    SlabClassConfig::new(16, 1024),
    SlabClassConfig::new(32, 512),
    SlabClassConfig::new(48, 512),
    SlabClassConfig::new(64, 512),
    SlabClassConfig::new(80, 512),
    SlabClassConfig::new(128, 512),
    SlabClassConfig::new(256, 256),
    SlabClassConfig::new(512, 64),
    SlabClassConfig::new(640, 64),
    SlabClassConfig::new(768, 64),
    SlabClassConfig::new(1024, 32),
    SlabClassConfig::new(2048, 16),
    SlabClassConfig::new(3072, 8),
    SlabClassConfig::new(4096, 8),
    SlabClassConfig::new(6144, 6),
    SlabClassConfig::new(8192, 4),
    SlabClassConfig::new(12288, 3),
    SlabClassConfig::new(16384, 2),
];

/// Usage of one size class.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SlabClassStats {
    pub object_size: usize,
    pub capacity: usize,
    pub in_use: usize,
}

struct SizeClass {
    object_size: usize,
    count: usize,
    stride: usize,
    run: PageId,
    base: VirtualAddress,
    free_head: u32,
    in_use: usize,
}

impl SizeClass {
    fn slot(&self, idx: u32) -> *mut ObjectHeader {
        (self.base + idx as u64 * self.stride as u64).as_mut_ptr()
    }

    fn payload(&self, idx: u32) -> VirtualAddress {
        self.base + (idx as usize * self.stride + HEADER) as u64
    }

    /// Slot index for a payload pointer, if it lies on an object boundary.
    fn index_of(&self, ptr: VirtualAddress) -> Option<u32> {
        let off = ptr.as_u64().checked_sub(self.base.as_u64() + HEADER as u64)?;
        #[allow(clippy::cast_possible_truncation)]
        let off = off as usize;
        if off % self.stride != 0 || off / self.stride >= self.count {
            return None;
        }
        u32::try_from(off / self.stride).ok()
    }
}

/// All size classes of the kernel slab.
pub struct SlabAllocator {
    classes: Vec<SizeClass>,
}

impl SlabAllocator {
    /// Carve one arena per row of `table` from `frames`.
    ///
    /// # Errors
    /// - [`AllocError::InvalidRange`] if the table is empty, not strictly
    ///   ascending, or has a zero size or count.
    /// - [`AllocError::OutOfMemory`] if an arena cannot be allocated; arenas
    ///   allocated so far are returned first.
    pub fn new<M: PhysMapper + Copy>(
        frames: &PageFrames<M>,
        table: &[SlabClassConfig],
    ) -> Result<Self, AllocError> {
        if table.is_empty()
            || table.iter().any(|c| c.object_size == 0 || c.count == 0)
            || table.windows(2).any(|w| w[0].object_size >= w[1].object_size)
            || table.iter().any(|c| u32::try_from(c.count).map_or(true, |n| n == NO_SLOT))
        {
            return Err(AllocError::InvalidRange("malformed slab class table"));
        }

        let mut this = Self {
            classes: Vec::with_capacity(table.len()),
        };
        for cfg in table {
            match Self::carve(frames, *cfg) {
                Ok(class) => this.classes.push(class),
                Err(e) => {
                    if let Err(t) = this.teardown(frames) {
                        warn!("slab: rollback after {e} left pages behind: {t}");
                    }
                    return Err(e);
                }
            }
        }
        info!(
            "slab: {} size classes, {}..={} bytes",
            table.len(),
            table[0].object_size,
            table[table.len() - 1].object_size
        );
        Ok(this)
    }

    fn carve<M: PhysMapper + Copy>(
        frames: &PageFrames<M>,
        cfg: SlabClassConfig,
    ) -> Result<SizeClass, AllocError> {
        let stride = align_up((HEADER + cfg.object_size) as u64, 8) as usize;
        let pages = pages_for((stride * cfg.count) as u64) as usize;
        let run = frames.allocate(pages, AllocFlags::CONTIGUOUS | AllocFlags::ZEROED)?;
        let Some(base) = frames.virt(run) else {
            frames.free(run)?;
            return Err(AllocError::InvalidRange("slab arena is not kernel mapped"));
        };

        #[allow(clippy::cast_possible_truncation)]
        let count = cfg.count as u32;
        let class = SizeClass {
            object_size: cfg.object_size,
            count: cfg.count,
            stride,
            run,
            base,
            free_head: 0,
            in_use: 0,
        };
        for i in 0..count {
            let next = if i + 1 < count { i + 1 } else { NO_SLOT };
            // SAFETY: the slot lies inside the arena just allocated.
            unsafe {
                class.slot(i).write(ObjectHeader {
                    guard: FREE_GUARD,
                    next,
                });
            }
        }
        debug!(
            "slab class {} bytes: {} objects in {pages} page(s)",
            cfg.object_size, cfg.count
        );
        Ok(class)
    }

    fn class_for(&self, size: usize) -> Result<usize, AllocError> {
        if size == 0 {
            return Err(AllocError::InvalidRange("zero-size slab request"));
        }
        self.classes
            .iter()
            .position(|c| c.object_size >= size)
            .ok_or(AllocError::InvalidRange("larger than the largest slab class"))
    }

    /// Hand out one object of at least `size` bytes.
    ///
    /// # Errors
    /// - [`AllocError::InvalidRange`] for `size == 0` or beyond the largest
    ///   class.
    /// - [`AllocError::OutOfMemory`] if the matching class is exhausted.
    /// - [`Corruption::GuardMismatch`] if the next free object's header was
    ///   overwritten.
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let i = self.class_for(size)?;
        let class = &mut self.classes[i];
        let idx = class.free_head;
        if idx == NO_SLOT {
            return Err(AllocError::OutOfMemory);
        }
        let slot = class.slot(idx);
        // SAFETY: idx came off this class's free list, so it is in bounds.
        let header = unsafe { &mut *slot };
        if header.guard != FREE_GUARD {
            return Err(Corruption::GuardMismatch {
                addr: class.payload(idx),
                found: header.guard,
            }
            .into());
        }
        class.free_head = header.next;
        header.guard = ALLOCATED_GUARD;
        header.next = NO_SLOT;
        class.in_use += 1;
        NonNull::new(class.payload(idx).as_mut_ptr()).ok_or(AllocError::OutOfMemory)
    }

    /// Return an object obtained from [`alloc`](Self::alloc) with the same
    /// `size`.
    ///
    /// # Errors
    /// - [`AllocError::InvalidRange`] if `ptr` is not an object of the class
    ///   `size` maps to.
    /// - [`Corruption::DoubleFree`] / [`Corruption::GuardMismatch`] for a bad
    ///   header; the free list is left as it was.
    pub fn free(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), AllocError> {
        let i = self.class_for(size)?;
        let class = &mut self.classes[i];
        let addr = VirtualAddress::from_nonnull(ptr);
        let idx = class
            .index_of(addr)
            .ok_or(AllocError::InvalidRange("pointer is not an object of this slab class"))?;
        // SAFETY: index_of checked the slot is inside the arena.
        let header = unsafe { &mut *class.slot(idx) };
        match header.guard {
            ALLOCATED_GUARD => {}
            FREE_GUARD => return Err(Corruption::DoubleFree { addr }.into()),
            found => return Err(Corruption::GuardMismatch { addr, found }.into()),
        }
        // SAFETY: the payload belongs to this slot and is no longer handed out.
        unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0, class.object_size) };
        header.guard = FREE_GUARD;
        header.next = class.free_head;
        class.free_head = idx;
        class.in_use -= 1;
        Ok(())
    }

    pub fn stats(&self) -> impl Iterator<Item = SlabClassStats> + '_ {
        self.classes.iter().map(|c| SlabClassStats {
            object_size: c.object_size,
            capacity: c.count,
            in_use: c.in_use,
        })
    }

    pub fn log_stats(&self) {
        for s in self.stats() {
            info!(
                "slab {:>5} B: {:>4}/{:<4} in use",
                s.object_size, s.in_use, s.capacity
            );
        }
    }

    /// Give every arena back to the page allocator.
    ///
    /// # Errors
    /// The first error from freeing an arena; the remaining arenas are still
    /// freed.
    pub fn teardown<M: PhysMapper + Copy>(self, frames: &PageFrames<M>) -> Result<(), AllocError> {
        let mut result = Ok(());
        for class in self.classes {
            if class.in_use > 0 {
                debug!(
                    "slab class {} torn down with {} live object(s)",
                    class.object_size, class.in_use
                );
            }
            let freed = frames.free(class.run);
            if result.is_ok() {
                result = freed;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_alloc::PageFrameAllocator;
    use kernel_memory_addresses::PhysicalAddress;
    use kernel_vmem::sim::SimulatedRam;

    fn frames(ram: &SimulatedRam) -> PageFrames<&SimulatedRam> {
        PageFrames::new(PageFrameAllocator::new(ram, &[ram.memory_map()], &[]).unwrap())
    }

    const SMALL: &[SlabClassConfig] = &[SlabClassConfig::new(16, 4), SlabClassConfig::new(64, 2)];

    #[test]
    fn picks_the_smallest_fitting_class() {
        let ram = SimulatedRam::new(PhysicalAddress::new(0x10_0000), 8);
        let frames = frames(&ram);
        let mut slab = SlabAllocator::new(&frames, SMALL).unwrap();
        slab.alloc(10).unwrap();
        slab.alloc(17).unwrap();
        let stats: Vec<_> = slab.stats().map(|s| s.in_use).collect();
        assert_eq!(stats, [1, 1]);
        assert!(matches!(slab.alloc(0), Err(AllocError::InvalidRange(_))));
        assert!(matches!(slab.alloc(65), Err(AllocError::InvalidRange(_))));
    }

    #[test]
    fn objects_are_distinct_and_writable() {
        let ram = SimulatedRam::new(PhysicalAddress::new(0x10_0000), 8);
        let frames = frames(&ram);
        let mut slab = SlabAllocator::new(&frames, SMALL).unwrap();
        let ptrs: Vec<_> = (0..4).map(|_| slab.alloc(16).unwrap()).collect();
        for (i, p) in ptrs.iter().enumerate() {
            unsafe { core::ptr::write_bytes(p.as_ptr(), i as u8 + 1, 16) };
        }
        for (i, p) in ptrs.iter().enumerate() {
            let bytes = unsafe { core::slice::from_raw_parts(p.as_ptr(), 16) };
            assert!(bytes.iter().all(|&b| b == i as u8 + 1));
        }
        assert_eq!(slab.alloc(16), Err(AllocError::OutOfMemory));
    }

    #[test]
    fn double_free_is_reported_and_the_class_keeps_working() {
        let ram = SimulatedRam::new(PhysicalAddress::new(0x10_0000), 8);
        let frames = frames(&ram);
        let mut slab = SlabAllocator::new(&frames, SMALL).unwrap();
        let p = slab.alloc(16).unwrap();
        slab.free(p, 16).unwrap();
        assert_eq!(
            slab.free(p, 16),
            Err(Corruption::DoubleFree {
                addr: VirtualAddress::from_nonnull(p)
            }
            .into())
        );
        // Exactly four objects are still available.
        let again: Vec<_> = (0..4).map(|_| slab.alloc(16).unwrap()).collect();
        assert!(again.contains(&p));
        assert_eq!(slab.alloc(16), Err(AllocError::OutOfMemory));
    }

    #[test]
    fn overwritten_header_is_a_guard_mismatch() {
        let ram = SimulatedRam::new(PhysicalAddress::new(0x10_0000), 8);
        let frames = frames(&ram);
        let mut slab = SlabAllocator::new(&frames, SMALL).unwrap();
        let p = slab.alloc(64).unwrap();
        unsafe { p.as_ptr().sub(HEADER).cast::<u32>().write(0xdead_beef) };
        assert_eq!(
            slab.free(p, 64),
            Err(Corruption::GuardMismatch {
                addr: VirtualAddress::from_nonnull(p),
                found: 0xdead_beef
            }
            .into())
        );
    }

    #[test]
    fn foreign_pointers_are_rejected() {
        let ram = SimulatedRam::new(PhysicalAddress::new(0x10_0000), 8);
        let frames = frames(&ram);
        let mut slab = SlabAllocator::new(&frames, SMALL).unwrap();
        let p = slab.alloc(16).unwrap();
        let skewed = NonNull::new(p.as_ptr().wrapping_add(4)).unwrap();
        assert!(matches!(slab.free(skewed, 16), Err(AllocError::InvalidRange(_))));
        // Right pointer, wrong class.
        assert!(matches!(slab.free(p, 64), Err(AllocError::InvalidRange(_))));
    }

    #[test]
    fn freed_payloads_are_zeroed() {
        let ram = SimulatedRam::new(PhysicalAddress::new(0x10_0000), 8);
        let frames = frames(&ram);
        let mut slab = SlabAllocator::new(&frames, &[SlabClassConfig::new(32, 1)]).unwrap();
        let p = slab.alloc(32).unwrap();
        unsafe { core::ptr::write_bytes(p.as_ptr(), 0x5A, 32) };
        slab.free(p, 32).unwrap();
        let q = slab.alloc(32).unwrap();
        assert_eq!(p, q);
        let bytes = unsafe { core::slice::from_raw_parts(q.as_ptr(), 32) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn bad_tables_and_teardown() {
        let ram = SimulatedRam::new(PhysicalAddress::new(0x10_0000), 8);
        let frames = frames(&ram);
        let unsorted = [SlabClassConfig::new(64, 1), SlabClassConfig::new(16, 1)];
        assert!(matches!(
            SlabAllocator::new(&frames, &unsorted),
            Err(AllocError::InvalidRange(_))
        ));
        let slab = SlabAllocator::new(&frames, SMALL).unwrap();
        assert!(frames.stats().allocated > 0);
        slab.teardown(&frames).unwrap();
        assert_eq!(frames.stats().allocated, 0);
    }

    #[test]
    fn arena_exhaustion_returns_earlier_arenas() {
        let ram = SimulatedRam::new(PhysicalAddress::new(0x10_0000), 2);
        let frames = frames(&ram);
        let table = [SlabClassConfig::new(16, 64), SlabClassConfig::new(4096, 4)];
        assert_eq!(
            SlabAllocator::new(&frames, &table).err(),
            Some(AllocError::OutOfMemory)
        );
        assert_eq!(frames.stats().allocated, 0);
    }
}
