//! # Kernel memory context
//!
//! [`KernelMemory`] owns one of each allocator plus the kernel root table.
//! Each allocator sits behind its own [`IrqSpinLock`], so unrelated
//! allocations never contend and every critical section also keeps
//! interrupts off.
//!
//! ```text
//!               ┌────────────────────── KernelMemory ──────────────────────┐
//!               │                                                          │
//!  slab_alloc ──┼─► SlabAllocator ─┐                                       │
//!  fast_alloc ──┼─► FastAllocator ─┼─► PageFrames ◄── ProcessMemory (COW)  │
//!  map_mmio ────┼─► MmioWindow ────┘        ▲                              │
//!               │        │                  │                              │
//!               │        └──► kernel root ◄─┴── clone_kernel_half          │
//!               └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Corruption detected by the slab or fast allocator is fatal once it
//! reaches this layer.

use crate::error::AllocError;
use crate::fast_alloc::FastAllocator;
use crate::fatal;
use crate::frame_alloc::{PageFrameAllocator, PageFrames, PageId};
use crate::mmio::{MmioRegion, MmioWindow};
use crate::phys_mapper::HhdmPhysMapper;
use crate::slab::{DEFAULT_SLAB_CLASSES, SlabAllocator, SlabClassConfig};
use alloc::vec::Vec;
use core::marker::PhantomData;
use core::ops::Range;
use core::ptr::NonNull;
use kernel_info::memory::{KERNEL_MMIO_END, KERNEL_MMIO_START, LOW_MEMORY_END};
use kernel_info::memory_map::MemoryRegion;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_sync::{IrqSpinLock, SyncOnceCell};
use kernel_vmem::{AddressSpace, CacheEncoding, CachePolicy, NativeGeometry, PhysMapper, TableGeometry};
use log::info;

/// Runtime tunables of the memory subsystem.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryConfig {
    /// Slab size classes, strictly ascending by object size.
    pub slab_classes: &'static [SlabClassConfig],
    /// Kernel virtual window for device mappings.
    pub mmio_start: VirtualAddress,
    pub mmio_end: VirtualAddress,
    /// The PAT MSR holds [`kernel_vmem::PatMsr::kernel_layout`].
    pub pat: bool,
    /// Adopt these boot page tables as the kernel root instead of starting
    /// from an empty one.
    pub kernel_root: Option<PhysicalAddress>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            slab_classes: DEFAULT_SLAB_CLASSES,
            mmio_start: VirtualAddress::new(KERNEL_MMIO_START),
            mmio_end: VirtualAddress::new(KERNEL_MMIO_END),
            pat: true,
            kernel_root: None,
        }
    }
}

impl MemoryConfig {
    /// Defaults with the MMIO window of `G`'s memory layout.
    #[must_use]
    pub fn for_geometry<G: TableGeometry>() -> Self {
        Self {
            mmio_start: VirtualAddress::new(G::LAYOUT.mmio_start),
            mmio_end: VirtualAddress::new(G::LAYOUT.mmio_end),
            ..Self::default()
        }
    }
}

/// Every kernel-wide allocator, built once from the boot memory map.
pub struct KernelMemory<G: TableGeometry, M: PhysMapper + Copy> {
    frames: PageFrames<M>,
    slab: IrqSpinLock<SlabAllocator>,
    fast: IrqSpinLock<FastAllocator>,
    fast_run: PageId,
    mmio: IrqSpinLock<MmioWindow>,
    kernel_root: PhysicalAddress,
    mapper: M,
    encoding: CacheEncoding,
    _g: PhantomData<G>,
}

impl<G: TableGeometry, M: PhysMapper + Copy> KernelMemory<G, M> {
    /// Seed the page allocator from `memory_map`, then carve the slab arenas,
    /// the fast region and the MMIO window tables from it.
    ///
    /// # Errors
    /// - [`AllocError::InvalidRange`] for an unusable memory map, slab table
    ///   or MMIO window.
    /// - [`AllocError::OutOfMemory`] if RAM is too small for the fixed pools.
    pub fn new(
        mapper: M,
        config: &MemoryConfig,
        memory_map: &[MemoryRegion],
        reserved: &[Range<PhysicalAddress>],
    ) -> Result<Self, AllocError> {
        let frames = PageFrames::new(PageFrameAllocator::new(mapper, memory_map, reserved)?);
        let kernel_root = match config.kernel_root {
            Some(root) => root,
            None => AddressSpace::<G, M>::allocate(&mapper, &mut &frames)?.root(),
        };
        let kernel = AddressSpace::<G, M>::from_root(&mapper, kernel_root);
        let mmio = MmioWindow::init(&kernel, &mut &frames, config.mmio_start, config.mmio_end)?;
        let slab = SlabAllocator::new(&frames, config.slab_classes)?;
        let (fast, fast_run) = FastAllocator::reserve(&frames)?;
        let encoding = if config.pat {
            CacheEncoding::with_pat()
        } else {
            CacheEncoding::without_pat()
        };

        info!(
            "kernel memory ready: {} paging, root {kernel_root}, PAT {}",
            G::NAME,
            if config.pat { "on" } else { "off" }
        );
        Ok(Self {
            frames,
            slab: IrqSpinLock::new(slab),
            fast: IrqSpinLock::new(fast),
            fast_run,
            mmio: IrqSpinLock::new(mmio),
            kernel_root,
            mapper,
            encoding,
            _g: PhantomData,
        })
    }

    #[inline]
    #[must_use]
    pub const fn frames(&self) -> &PageFrames<M> {
        &self.frames
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    #[inline]
    #[must_use]
    pub const fn encoding(&self) -> CacheEncoding {
        self.encoding
    }

    #[must_use]
    pub const fn kernel_root(&self) -> PhysicalAddress {
        self.kernel_root
    }

    #[must_use]
    pub const fn kernel_space(&self) -> AddressSpace<'_, G, M> {
        AddressSpace::from_root(&self.mapper, self.kernel_root)
    }

    /// View of the tree rooted at `root`.
    #[must_use]
    pub const fn address_space(&self, root: PhysicalAddress) -> AddressSpace<'_, G, M> {
        AddressSpace::from_root(&self.mapper, root)
    }

    /// Small kernel object from the slab.
    ///
    /// # Errors
    /// [`AllocError::OutOfMemory`] or [`AllocError::InvalidRange`]; corruption
    /// does not return.
    #[track_caller]
    pub fn slab_alloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        fatal::check(self.slab.with_lock(|s| s.alloc(size)))
    }

    /// # Errors
    /// [`AllocError::InvalidRange`] for a pointer the slab did not hand out;
    /// double frees and overwritten guards do not return.
    #[track_caller]
    pub fn slab_free(&self, ptr: NonNull<u8>, size: usize) -> Result<(), AllocError> {
        fatal::check(self.slab.with_lock(|s| s.free(ptr, size)))
    }

    /// # Errors
    /// As [`FastAllocator::alloc`].
    #[track_caller]
    pub fn fast_alloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        fatal::check(self.fast.with_lock(|f| f.alloc(size)))
    }

    /// # Errors
    /// As [`FastAllocator::free`].
    #[track_caller]
    pub fn fast_free(&self, ptr: NonNull<u8>, size: usize) -> Result<(), AllocError> {
        fatal::check(self.fast.with_lock(|f| f.free(ptr, size)))
    }

    /// Map device memory into the kernel half.
    ///
    /// # Errors
    /// As [`MmioWindow::map`].
    pub fn map_mmio(
        &self,
        pa: PhysicalAddress,
        len: u64,
        policy: CachePolicy,
        name: &'static str,
    ) -> Result<VirtualAddress, AllocError> {
        let kernel = self.kernel_space();
        self.mmio.with_lock(|w| {
            w.map(&kernel, &mut &self.frames, self.encoding, pa, len, policy, name)
        })
    }

    #[must_use]
    pub fn mmio_regions(&self) -> Vec<MmioRegion> {
        self.mmio.with_lock(|w| w.regions().to_vec())
    }

    pub fn log_stats(&self) {
        self.frames.log_stats();
        self.slab.with_lock(|s| s.log_stats());
        self.fast.with_lock(|f| f.log_stats());
        self.mmio.with_lock(|w| w.log_regions());
    }

    /// Return the slab arenas and the fast region to the page allocator and
    /// hand it back.
    ///
    /// # Errors
    /// The first error from freeing a pool.
    pub fn teardown(self) -> Result<PageFrames<M>, AllocError> {
        let Self {
            frames,
            slab,
            fast_run,
            ..
        } = self;
        slab.into_inner().teardown(&frames)?;
        frames.free(fast_run)?;
        Ok(frames)
    }
}

static KERNEL_MEMORY: SyncOnceCell<KernelMemory<NativeGeometry, HhdmPhysMapper>> = SyncOnceCell::new();

/// Build the kernel's memory context over the direct map, once.
///
/// Memory below [`LOW_MEMORY_END`] is reserved in addition to `reserved`.
///
/// # Errors
/// As [`KernelMemory::new`]; a failed attempt leaves the context unset.
pub fn init_global(
    memory_map: &[MemoryRegion],
    reserved: &[Range<PhysicalAddress>],
    pat: bool,
) -> Result<&'static KernelMemory<NativeGeometry, HhdmPhysMapper>, AllocError> {
    KERNEL_MEMORY.get_or_try_init(|| {
        let config = MemoryConfig {
            pat,
            ..MemoryConfig::for_geometry::<NativeGeometry>()
        };
        let mut held = reserved.to_vec();
        held.push(PhysicalAddress::zero()..PhysicalAddress::new(LOW_MEMORY_END));
        let mapper = HhdmPhysMapper::new(<NativeGeometry as TableGeometry>::LAYOUT.direct_map_base);
        KernelMemory::new(mapper, &config, memory_map, &held)
    })
}

/// The context built by [`init_global`], if any.
#[must_use]
pub fn global() -> Option<&'static KernelMemory<NativeGeometry, HhdmPhysMapper>> {
    KERNEL_MEMORY.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_vmem::sim::SimulatedRam;
    use kernel_vmem::{Legacy32, LongMode64, PageTableFlags};

    const CLASSES: &[SlabClassConfig] = &[SlabClassConfig::new(32, 16), SlabClassConfig::new(256, 8)];

    fn config<G: TableGeometry>() -> MemoryConfig {
        MemoryConfig {
            slab_classes: CLASSES,
            ..MemoryConfig::for_geometry::<G>()
        }
    }

    #[test]
    fn builds_every_pool() {
        let ram = SimulatedRam::new(PhysicalAddress::new(0x10_0000), 256);
        let kmem = KernelMemory::<LongMode64, _>::new(&ram, &config::<LongMode64>(), &[ram.memory_map()], &[])
            .unwrap();
        let p = kmem.slab_alloc(20).unwrap();
        kmem.slab_free(p, 20).unwrap();
        let q = kmem.fast_alloc(100).unwrap();
        kmem.fast_free(q, 100).unwrap();

        let before = kmem.frames().stats();
        let frames = kmem.teardown().unwrap();
        let after = frames.stats();
        // Slab arenas and the 64 KiB fast region went back.
        assert_eq!(before.allocated - after.allocated, 1 + 1 + 16);
    }

    #[test]
    fn mmio_mappings_reach_new_roots() {
        let ram = SimulatedRam::new(PhysicalAddress::new(0x10_0000), 256);
        let kmem =
            KernelMemory::<Legacy32, _>::new(&ram, &config::<Legacy32>(), &[ram.memory_map()], &[]).unwrap();
        let process = AddressSpace::<Legacy32, _>::clone_kernel_half(
            kmem.mapper(),
            &mut kmem.frames(),
            &kmem.kernel_space(),
        )
        .unwrap();
        let va = kmem
            .map_mmio(PhysicalAddress::new(0xfec0_0000), 0x20, CachePolicy::Uncached, "ioapic")
            .unwrap();
        assert_eq!(process.translate(va), Some(PhysicalAddress::new(0xfec0_0000)));
        let leaf = process.leaf(va).unwrap();
        assert!(leaf.flags().contains(PageTableFlags::CACHE_DISABLE));
        assert_eq!(kmem.mmio_regions()[0].name, "ioapic");
    }

    #[test]
    fn too_little_ram_is_out_of_memory() {
        let ram = SimulatedRam::new(PhysicalAddress::new(0x10_0000), 24);
        let err = KernelMemory::<LongMode64, _>::new(&ram, &config::<LongMode64>(), &[ram.memory_map()], &[]).err();
        assert_eq!(err, Some(AllocError::OutOfMemory));
    }

    #[test]
    #[should_panic(expected = "memory corruption")]
    fn slab_double_free_is_fatal_here() {
        let ram = SimulatedRam::new(PhysicalAddress::new(0x10_0000), 256);
        let kmem = KernelMemory::<LongMode64, _>::new(&ram, &config::<LongMode64>(), &[ram.memory_map()], &[])
            .unwrap();
        let p = kmem.slab_alloc(32).unwrap();
        kmem.slab_free(p, 32).unwrap();
        let _ = kmem.slab_free(p, 32);
    }
}
