use kernel_alloc::context::{KernelMemory, MemoryConfig};
use kernel_alloc::slab::SlabClassConfig;
use kernel_alloc::vm::{Access, FaultResolution, ProcessMemory, VmArea, VmFlags, VmKind};
use kernel_vmem::sim::SimulatedRam;
use kernel_vmem::{
    Legacy32, LongMode64, PAGE_SIZE, PageTableFlags, PhysMapper, PhysicalAddress, TableGeometry,
    VirtualAddress,
};

const CLASSES: &[SlabClassConfig] = &[SlabClassConfig::new(64, 8)];
const DATA: u64 = 0x0040_0000;

type Kmem<'r, G> = KernelMemory<G, &'r SimulatedRam>;

fn boot<G: TableGeometry>(ram: &SimulatedRam) -> Kmem<'_, G> {
    let config = MemoryConfig {
        slab_classes: CLASSES,
        ..MemoryConfig::for_geometry::<G>()
    };
    KernelMemory::new(ram, &config, &[ram.memory_map()], &[]).unwrap()
}

fn data_area() -> VmArea {
    VmArea::new(
        VirtualAddress::new(DATA),
        VirtualAddress::new(DATA + 2 * PAGE_SIZE),
        VmFlags::READ | VmFlags::WRITE,
        VmKind::Data,
    )
}

fn phys<G: TableGeometry>(k: &Kmem<'_, G>, p: &ProcessMemory<G>, va: u64) -> PhysicalAddress {
    k.address_space(p.root())
        .translate(VirtualAddress::new(va))
        .expect("page is mapped")
}

fn peek<G: TableGeometry>(ram: &SimulatedRam, k: &Kmem<'_, G>, p: &ProcessMemory<G>, va: u64) -> u8 {
    ram.bytes(phys(k, p, va), 1)[0]
}

fn poke<G: TableGeometry>(ram: &SimulatedRam, k: &Kmem<'_, G>, p: &ProcessMemory<G>, va: u64, value: u8) {
    let leaf = k.address_space(p.root()).leaf(VirtualAddress::new(va)).unwrap();
    assert!(leaf.is_writable(), "poke through a read-only leaf at {va:#x}");
    let ptr = ram.phys_to_virt(phys(k, p, va)).as_mut_ptr::<u8>();
    // SAFETY: the page belongs to simulated RAM and nothing else borrows it.
    unsafe { ptr.write(value) };
}

fn refcount<G: TableGeometry>(k: &Kmem<'_, G>, pa: PhysicalAddress) -> u16 {
    k.frames().refcount(k.frames().page_of(pa).unwrap())
}

fn fork_isolates_writes<G: TableGeometry>() {
    let ram = SimulatedRam::new(PhysicalAddress::new(0x10_0000), 512);
    let k = boot::<G>(&ram);
    let baseline = k.frames().stats().free;

    let mut parent = ProcessMemory::create(&k, [data_area()]).unwrap();
    for (page, value) in [(0, 0x11), (1, 0x22)] {
        let va = DATA + page * PAGE_SIZE;
        assert_eq!(
            parent.handle_fault(&k, VirtualAddress::new(va), Access::Write),
            Ok(FaultResolution::MappedZero)
        );
        poke(&ram, &k, &parent, va + 5, value);
    }

    let mut child = parent.fork(&k).unwrap();
    let first = phys(&k, &parent, DATA);
    let second = phys(&k, &parent, DATA + PAGE_SIZE);
    assert_eq!(phys(&k, &child, DATA), first);
    assert_eq!(peek(&ram, &k, &child, DATA + 5), 0x11);
    assert_eq!(peek(&ram, &k, &child, DATA + PAGE_SIZE + 5), 0x22);
    assert_eq!(refcount(&k, first), 2);
    for p in [&parent, &child] {
        let leaf = k.address_space(p.root()).leaf(VirtualAddress::new(DATA)).unwrap();
        assert!(!leaf.is_writable());
        assert!(leaf.flags().contains(PageTableFlags::COPY_ON_WRITE));
    }

    // Child writes first: it copies, the parent then owns the original alone.
    assert_eq!(
        child.handle_fault(&k, VirtualAddress::new(DATA + 5), Access::Write),
        Ok(FaultResolution::CopiedOnWrite)
    );
    assert_ne!(phys(&k, &child, DATA), first);
    assert_eq!(refcount(&k, first), 1);
    poke(&ram, &k, &child, DATA + 5, 0x99);
    assert_eq!(peek(&ram, &k, &parent, DATA + 5), 0x11);
    assert_eq!(
        parent.handle_fault(&k, VirtualAddress::new(DATA + 5), Access::Write),
        Ok(FaultResolution::ReusedExclusive)
    );
    assert_eq!(phys(&k, &parent, DATA), first);

    // Second page the other way round.
    assert_eq!(
        parent.handle_fault(&k, VirtualAddress::new(DATA + PAGE_SIZE), Access::Write),
        Ok(FaultResolution::CopiedOnWrite)
    );
    poke(&ram, &k, &parent, DATA + PAGE_SIZE + 5, 0x33);
    assert_eq!(peek(&ram, &k, &child, DATA + PAGE_SIZE + 5), 0x22);
    assert_eq!(
        child.handle_fault(&k, VirtualAddress::new(DATA + PAGE_SIZE), Access::Write),
        Ok(FaultResolution::ReusedExclusive)
    );
    assert_eq!(phys(&k, &child, DATA + PAGE_SIZE), second);

    child.destroy(&k);
    parent.destroy(&k);
    assert_eq!(k.frames().stats().free, baseline);
}

#[test]
fn fork_isolates_writes_long_mode() {
    fork_isolates_writes::<LongMode64>();
}

#[test]
fn fork_isolates_writes_legacy() {
    fork_isolates_writes::<Legacy32>();
}

#[test]
fn every_sharer_holds_a_reference() {
    let ram = SimulatedRam::new(PhysicalAddress::new(0x10_0000), 512);
    let k = boot::<LongMode64>(&ram);

    let mut parent = ProcessMemory::create(&k, [data_area()]).unwrap();
    parent
        .handle_fault(&k, VirtualAddress::new(DATA), Access::Write)
        .unwrap();
    poke(&ram, &k, &parent, DATA, 0x42);
    let page = phys(&k, &parent, DATA);

    let child = parent.fork(&k).unwrap();
    let grandchild = child.fork(&k).unwrap();
    assert_eq!(refcount(&k, page), 3);
    assert_eq!(peek(&ram, &k, &grandchild, DATA), 0x42);

    // Unmapping in one space drops only that space's reference.
    parent.unmap(&k, VirtualAddress::new(DATA), 2 * PAGE_SIZE).unwrap();
    assert_eq!(refcount(&k, page), 2);
    assert!(parent.find(VirtualAddress::new(DATA)).is_none());
    assert_eq!(peek(&ram, &k, &child, DATA), 0x42);

    child.destroy(&k);
    assert_eq!(refcount(&k, page), 1);
    grandchild.destroy(&k);
    assert_eq!(refcount(&k, page), 0);
    parent.destroy(&k);
}

#[test]
fn untouched_pages_stay_unmapped_in_the_child() {
    let ram = SimulatedRam::new(PhysicalAddress::new(0x10_0000), 512);
    let k = boot::<LongMode64>(&ram);
    let parent = ProcessMemory::create(&k, [data_area()]).unwrap();

    let mut child = parent.fork(&k).unwrap();
    assert!(child.find(VirtualAddress::new(DATA)).is_some());
    assert_eq!(
        k.address_space(child.root()).translate(VirtualAddress::new(DATA)),
        None
    );
    assert_eq!(
        child.handle_fault(&k, VirtualAddress::new(DATA), Access::Read),
        Ok(FaultResolution::MappedZero)
    );
    assert_eq!(
        k.address_space(parent.root()).translate(VirtualAddress::new(DATA)),
        None
    );

    child.destroy(&k);
    parent.destroy(&k);
}
