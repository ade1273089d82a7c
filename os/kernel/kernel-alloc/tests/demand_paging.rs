use kernel_alloc::context::{KernelMemory, MemoryConfig};
use kernel_alloc::slab::SlabClassConfig;
use kernel_alloc::vm::{
    Access, BackingFile, FaultError, FaultResolution, FsError, ProcessMemory, VmArea, VmError,
    VmFlags, VmKind,
};
use kernel_vmem::sim::SimulatedRam;
use kernel_vmem::{LongMode64, PAGE_SIZE, PhysicalAddress, VirtualAddress};
use std::sync::Arc;

const CLASSES: &[SlabClassConfig] = &[SlabClassConfig::new(64, 8)];
const CODE: u64 = 0x0040_0000;
const MMAP: u64 = 0x1000_0000;
const STACK_TOP: u64 = 0x7fff_0000;

/// An in-memory executable image.
struct Image(Vec<u8>);

impl Image {
    fn new(len: usize) -> Self {
        Self((0..len).map(|i| (i % 251) as u8 + 1).collect())
    }
}

impl BackingFile for Image {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        let start = usize::try_from(offset).map_err(|_| FsError::BadOffset)?;
        let Some(rest) = self.0.get(start..) else {
            return Err(FsError::BadOffset);
        };
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        Ok(n)
    }
}

struct Broken;

impl BackingFile for Broken {
    fn read_at(&self, _offset: u64, _buf: &mut [u8]) -> Result<usize, FsError> {
        Err(FsError::Io)
    }
}

fn boot(ram: &SimulatedRam) -> KernelMemory<LongMode64, &SimulatedRam> {
    let config = MemoryConfig {
        slab_classes: CLASSES,
        ..MemoryConfig::for_geometry::<LongMode64>()
    };
    KernelMemory::new(ram, &config, &[ram.memory_map()], &[]).unwrap()
}

fn page<'r>(
    ram: &'r SimulatedRam,
    k: &KernelMemory<LongMode64, &SimulatedRam>,
    p: &ProcessMemory<LongMode64>,
    va: u64,
) -> &'r [u8] {
    let pa = k
        .address_space(p.root())
        .translate(VirtualAddress::new(va))
        .expect("page is mapped");
    ram.bytes(pa, PAGE_SIZE as usize)
}

#[test]
fn code_pages_come_from_the_image() {
    let ram = SimulatedRam::new(PhysicalAddress::new(0x10_0000), 512);
    let k = boot(&ram);
    let image = Arc::new(Image::new(0x3000));
    let file: Arc<dyn BackingFile> = image.clone();

    // Three pages of text backed by 0x1800 bytes at file offset 0x1000.
    let code = VmArea::new(
        VirtualAddress::new(CODE),
        VirtualAddress::new(CODE + 3 * PAGE_SIZE),
        VmFlags::READ | VmFlags::EXEC,
        VmKind::Code,
    )
    .with_file(file, 0x1000, 0x1800);
    let mut p = ProcessMemory::create(&k, [code]).unwrap();

    assert_eq!(
        p.handle_fault(&k, VirtualAddress::new(CODE + 0x123), Access::Execute),
        Ok(FaultResolution::MappedFile)
    );
    assert_eq!(page(&ram, &k, &p, CODE), &image.0[0x1000..0x2000]);

    assert_eq!(
        p.handle_fault(&k, VirtualAddress::new(CODE + PAGE_SIZE), Access::Read),
        Ok(FaultResolution::MappedFile)
    );
    let second = page(&ram, &k, &p, CODE + PAGE_SIZE);
    assert_eq!(&second[..0x800], &image.0[0x2000..0x2800]);
    assert!(second[0x800..].iter().all(|&b| b == 0));

    assert_eq!(
        p.handle_fault(&k, VirtualAddress::new(CODE + 2 * PAGE_SIZE + 8), Access::Read),
        Ok(FaultResolution::MappedFile)
    );
    assert!(page(&ram, &k, &p, CODE + 2 * PAGE_SIZE).iter().all(|&b| b == 0));

    assert!(matches!(
        p.handle_fault(&k, VirtualAddress::new(CODE), Access::Write),
        Err(FaultError::Segmentation { reason: "area not writable", .. })
    ));
    assert!(matches!(
        p.handle_fault(&k, VirtualAddress::new(CODE), Access::Read),
        Err(FaultError::Segmentation { .. })
    ));
    p.destroy(&k);
}

#[test]
fn stack_and_private_mappings() {
    let ram = SimulatedRam::new(PhysicalAddress::new(0x10_0000), 512);
    let k = boot(&ram);
    let baseline = k.frames().stats().free;
    let image = Arc::new(Image::new(0x2000));
    let file: Arc<dyn BackingFile> = image.clone();

    let stack = VmArea::new(
        VirtualAddress::new(STACK_TOP - 4 * PAGE_SIZE),
        VirtualAddress::new(STACK_TOP),
        VmFlags::READ | VmFlags::WRITE,
        VmKind::Stack,
    );
    let mut p = ProcessMemory::create(&k, [stack]).unwrap();

    // Only 16 bytes of the file are mapped; the page is writable afterwards.
    let mapping = VmArea::new(
        VirtualAddress::new(MMAP),
        VirtualAddress::new(MMAP + PAGE_SIZE),
        VmFlags::READ | VmFlags::WRITE,
        VmKind::Mmap,
    )
    .with_file(file, 0x100, 0x10);
    p.map(&k, mapping).unwrap();

    assert_eq!(
        p.handle_fault(&k, VirtualAddress::new(STACK_TOP - 8), Access::Write),
        Ok(FaultResolution::MappedZero)
    );
    assert!(page(&ram, &k, &p, STACK_TOP - PAGE_SIZE).iter().all(|&b| b == 0));
    let below = VirtualAddress::new(STACK_TOP - 2 * PAGE_SIZE);
    assert_eq!(k.address_space(p.root()).translate(below), None);

    assert_eq!(
        p.handle_fault(&k, VirtualAddress::new(MMAP + 3), Access::Write),
        Ok(FaultResolution::MappedFile)
    );
    let mapped = page(&ram, &k, &p, MMAP);
    assert_eq!(&mapped[..0x10], &image.0[0x100..0x110]);
    assert!(mapped[0x10..].iter().all(|&b| b == 0));
    let leaf = k.address_space(p.root()).leaf(VirtualAddress::new(MMAP)).unwrap();
    assert!(leaf.is_writable());

    assert!(matches!(
        p.handle_fault(&k, VirtualAddress::new(0x2000_0000), Access::Read),
        Err(FaultError::Segmentation { reason: "no mapping", .. })
    ));

    p.destroy(&k);
    assert_eq!(k.frames().stats().free, baseline);
}

#[test]
fn read_errors_leave_nothing_behind() {
    let ram = SimulatedRam::new(PhysicalAddress::new(0x10_0000), 512);
    let k = boot(&ram);
    let area = VmArea::new(
        VirtualAddress::new(CODE),
        VirtualAddress::new(CODE + PAGE_SIZE),
        VmFlags::READ,
        VmKind::Data,
    )
    .with_file(Arc::new(Broken), 0, PAGE_SIZE);
    let mut p = ProcessMemory::create(&k, [area]).unwrap();
    let before = k.frames().stats().free;

    assert_eq!(
        p.handle_fault(&k, VirtualAddress::new(CODE), Access::Read),
        Err(FaultError::Io(FsError::Io))
    );
    assert_eq!(k.frames().stats().free, before);
    assert_eq!(k.address_space(p.root()).translate(VirtualAddress::new(CODE)), None);
    p.destroy(&k);
}

#[test]
fn io_flag_needs_a_device_behind_it() {
    let ram = SimulatedRam::new(PhysicalAddress::new(0x10_0000), 512);
    let k = boot(&ram);
    let baseline = k.frames().stats().free;
    let bogus = || {
        VmArea::new(
            VirtualAddress::new(MMAP),
            VirtualAddress::new(MMAP + PAGE_SIZE),
            VmFlags::READ | VmFlags::WRITE | VmFlags::IO,
            VmKind::Mmap,
        )
    };

    assert_eq!(
        ProcessMemory::create(&k, [bogus()]).err(),
        Some(VmError::InvalidRange("IO flag and backing disagree"))
    );
    let mut p = ProcessMemory::create(&k, Vec::new()).unwrap();
    assert_eq!(
        p.map(&k, bogus()),
        Err(VmError::InvalidRange("IO flag and backing disagree"))
    );

    // A plain anonymous area in the same spot pages in and gives its frame back.
    let plain = VmArea::new(
        VirtualAddress::new(MMAP),
        VirtualAddress::new(MMAP + PAGE_SIZE),
        VmFlags::READ | VmFlags::WRITE,
        VmKind::Mmap,
    );
    p.map(&k, plain).unwrap();
    assert_eq!(
        p.handle_fault(&k, VirtualAddress::new(MMAP), Access::Write),
        Ok(FaultResolution::MappedZero)
    );
    let child = p.fork(&k).unwrap();
    child.destroy(&k);
    p.destroy(&k);
    assert_eq!(k.frames().stats().free, baseline);
}
