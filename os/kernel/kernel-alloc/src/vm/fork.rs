use super::{ProcessMemory, VmError, VmaList};
use crate::context::KernelMemory;
use crate::fatal;
use crate::frame_alloc::PageFrames;
use core::marker::PhantomData;
use kernel_memory_addresses::PhysicalAddress;
use kernel_sync::IrqGuard;
use kernel_vmem::{AddressSpace, PhysMapper, TableGeometry, tlb};
use log::{debug, warn};

/// Take the reference a newly installed child leaf holds.
fn take_ref<M: PhysMapper + Copy>(frames: &PageFrames<M>, pa: PhysicalAddress) {
    let Some(page) = frames.page_of(pa) else {
        return;
    };
    if let Err(e) = fatal::check(frames.get(page)) {
        warn!("fork: no reference taken on {pa}: {e}");
    }
}

impl<G: TableGeometry> ProcessMemory<G> {
    /// Duplicate this address space.
    ///
    /// Private areas are shared copy-on-write, so both sides lose write
    /// access to every present page until they fault. Shared areas stay
    /// writable in both. Device areas are copied verbatim.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the child's tables cannot be allocated.
    /// The child is torn down again; pages already made copy-on-write in
    /// this space stay so and are resolved by later faults.
    pub fn fork<M: PhysMapper + Copy>(&self, kmem: &KernelMemory<G, M>) -> Result<Self, VmError> {
        let frames = kmem.frames();
        let mut alloc = frames;
        let _irq = IrqGuard::new();

        let parent = kmem.address_space(self.root);
        let child_space = AddressSpace::<G, M>::clone_kernel_half(kmem.mapper(), &mut alloc, &kmem.kernel_space())?;
        let mut child = Self {
            root: child_space.root(),
            areas: VmaList::new(),
            _g: PhantomData,
        };

        let copied = self.areas.iter().try_for_each(|(_, area)| -> Result<(), VmError> {
            child.areas.insert(area.clone())?;
            if area.is_private() {
                parent.share_range_cow(&mut alloc, &child_space, area.start, area.end, |_, pa| {
                    take_ref(frames, pa);
                })?;
            } else if area.is_device() {
                parent.copy_range(&mut alloc, &child_space, area.start, area.end, |_, _| {})?;
            } else {
                parent.copy_range(&mut alloc, &child_space, area.start, area.end, |_, pa| {
                    take_ref(frames, pa);
                })?;
            }
            Ok(())
        });
        tlb::flush_all();

        match copied {
            Ok(()) => {
                debug!(
                    "forked {} -> {} ({} area(s))",
                    self.root,
                    child.root,
                    child.areas.len()
                );
                Ok(child)
            }
            Err(e) => {
                warn!("fork of {} failed: {e}", self.root);
                child.destroy(kmem);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::context::{KernelMemory, MemoryConfig};
    use crate::slab::SlabClassConfig;
    use crate::vm::{Access, FaultResolution, ProcessMemory, VmArea, VmFlags, VmKind};
    use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
    use kernel_vmem::sim::SimulatedRam;
    use kernel_vmem::{Pae32, PageTableFlags};

    const CLASSES: &[SlabClassConfig] = &[SlabClassConfig::new(64, 4)];
    const START: u64 = 0x0040_0000;

    fn write_byte(ram: &SimulatedRam, p: &ProcessMemory<Pae32>, k: &KernelMemory<Pae32, &SimulatedRam>, va: u64, v: u8) {
        let pa = k.address_space(p.root()).translate(VirtualAddress::new(va)).unwrap();
        let ptr = kernel_vmem::PhysMapper::phys_to_virt(ram, pa).as_mut_ptr::<u8>();
        unsafe { ptr.write(v) };
    }

    fn read_byte(ram: &SimulatedRam, p: &ProcessMemory<Pae32>, k: &KernelMemory<Pae32, &SimulatedRam>, va: u64) -> u8 {
        let pa = k.address_space(p.root()).translate(VirtualAddress::new(va)).unwrap();
        ram.bytes(pa, 1)[0]
    }

    #[test]
    fn shared_areas_stay_writable_in_both() {
        let ram = SimulatedRam::new(PhysicalAddress::new(0x10_0000), 256);
        let config = MemoryConfig {
            slab_classes: CLASSES,
            ..MemoryConfig::for_geometry::<Pae32>()
        };
        let k = KernelMemory::<Pae32, _>::new(&ram, &config, &[ram.memory_map()], &[]).unwrap();
        let shared = VmArea::new(
            VirtualAddress::new(START),
            VirtualAddress::new(START + 0x1000),
            VmFlags::READ | VmFlags::WRITE | VmFlags::SHARED,
            VmKind::Mmap,
        );
        let mut parent = ProcessMemory::create(&k, [shared]).unwrap();
        assert_eq!(
            parent.handle_fault(&k, VirtualAddress::new(START), Access::Write),
            Ok(FaultResolution::MappedZero)
        );
        let child = parent.fork(&k).unwrap();

        let leaf = k.address_space(child.root()).leaf(VirtualAddress::new(START)).unwrap();
        assert!(leaf.is_writable());
        assert!(!leaf.flags().contains(PageTableFlags::COPY_ON_WRITE));
        let page = k.frames().page_of(leaf.address().unwrap()).unwrap();
        assert_eq!(k.frames().refcount(page), 2);

        write_byte(&ram, &parent, &k, START + 7, 0xAB);
        assert_eq!(read_byte(&ram, &child, &k, START + 7), 0xAB);

        child.destroy(&k);
        assert_eq!(k.frames().refcount(page), 1);
        parent.destroy(&k);
    }
}
