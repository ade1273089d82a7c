use kernel_alloc::AllocError;
use kernel_alloc::frame_alloc::{AllocFlags, PageFrameAllocator, PageId, PutOutcome};
use kernel_vmem::sim::SimulatedRam;
use kernel_vmem::{PAGE_SIZE, PhysicalAddress};
use proptest::prelude::*;

const FRAMES: usize = 64;

fn ram() -> SimulatedRam {
    SimulatedRam::new(PhysicalAddress::new(0x20_0000), FRAMES)
}

#[test]
fn split_runs_free_independently() {
    let ram = ram();
    let mut pages = PageFrameAllocator::new(&ram, &[ram.memory_map()], &[]).unwrap();

    let run = pages.allocate(3, AllocFlags::CONTIGUOUS).unwrap();
    let rest = pages.split(run, 1).unwrap();
    assert_eq!(pages.run_len(run), 1);
    assert_eq!(pages.run_len(rest), 2);
    assert_eq!(pages.phys(rest), pages.phys(run) + PAGE_SIZE);

    pages.free(run).unwrap();
    pages.free(rest).unwrap();
    assert_eq!(pages.free_count(), FRAMES);

    // The stretch is whole again.
    let again = pages.allocate(3, AllocFlags::CONTIGUOUS).unwrap();
    assert_eq!(pages.phys(again), pages.phys(run));
}

#[test]
fn freed_run_is_handed_out_again() {
    let ram = ram();
    let mut pages = PageFrameAllocator::new(&ram, &[ram.memory_map()], &[]).unwrap();
    let _pinned = pages.allocate(5, AllocFlags::empty()).unwrap();

    let run = pages.allocate(4, AllocFlags::empty()).unwrap();
    let mut before: Vec<PageId> = pages.run_pages(run).collect();
    pages.free(run).unwrap();

    let again = pages.allocate(4, AllocFlags::empty()).unwrap();
    let mut after: Vec<PageId> = pages.run_pages(again).collect();
    before.sort();
    after.sort();
    assert_eq!(before, after);
}

#[test]
fn merged_runs_free_as_one() {
    let ram = ram();
    let mut pages = PageFrameAllocator::new(&ram, &[ram.memory_map()], &[]).unwrap();
    let a = pages.allocate(2, AllocFlags::empty()).unwrap();
    let b = pages.allocate(3, AllocFlags::empty()).unwrap();
    pages.merge(a, b).unwrap();
    assert_eq!(pages.run_len(a), 5);
    assert_eq!(pages.run_len(b), 0);

    assert_eq!(pages.free(b), Err(AllocError::InvalidRange("not a run head")));
    pages.free(a).unwrap();
    assert_eq!(pages.free_count(), FRAMES);
}

#[test]
fn shared_page_outlives_its_run() {
    let ram = ram();
    let mut pages = PageFrameAllocator::new(&ram, &[ram.memory_map()], &[]).unwrap();
    let run = pages.allocate(2, AllocFlags::empty()).unwrap();
    let second = pages.run_pages(run).nth(1).unwrap();
    assert_eq!(pages.get(second), Ok(2));

    pages.free(run).unwrap();
    assert_eq!(pages.free_count(), FRAMES - 1);
    assert_eq!(pages.refcount(second), 1);
    assert_eq!(pages.put(second), Ok(PutOutcome::Freed));
    assert_eq!(pages.free_count(), FRAMES);
}

#[test]
fn reserved_ranges_are_never_handed_out() {
    let ram = ram();
    let hole = ram.origin() + 4 * PAGE_SIZE..ram.origin() + 8 * PAGE_SIZE;
    let mut pages = PageFrameAllocator::new(&ram, &[ram.memory_map()], &[hole.clone()]).unwrap();
    assert_eq!(pages.stats().reserved, 4);

    let all = pages.allocate(FRAMES - 4, AllocFlags::empty()).unwrap();
    for page in pages.run_pages(all) {
        let pa = pages.phys(page);
        assert!(!hole.contains(&pa), "{pa} is reserved");
    }
    assert_eq!(pages.allocate(1, AllocFlags::empty()), Err(AllocError::OutOfMemory));
    assert_eq!(
        pages.allocate(5, AllocFlags::CONTIGUOUS | AllocFlags::NO_KERNEL_MAP),
        Err(AllocError::OutOfMemory)
    );
}

#[derive(Debug, Clone)]
enum Op {
    Allocate { count: usize, contiguous: bool },
    Free(usize),
    Split(usize, usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1..9usize, any::<bool>()).prop_map(|(count, contiguous)| Op::Allocate { count, contiguous }),
        any::<usize>().prop_map(Op::Free),
        (any::<usize>(), 1..8usize).prop_map(|(i, keep)| Op::Split(i, keep)),
    ]
}

proptest! {
    #[test]
    fn every_usable_frame_is_free_or_in_one_run(ops in prop::collection::vec(op(), 1..64)) {
        let ram = ram();
        let mut pages = PageFrameAllocator::new(&ram, &[ram.memory_map()], &[]).unwrap();
        let mut live: Vec<PageId> = Vec::new();

        for op in ops {
            match op {
                Op::Allocate { count, contiguous } => {
                    let flags = if contiguous { AllocFlags::CONTIGUOUS } else { AllocFlags::empty() };
                    match pages.allocate(count, flags) {
                        Ok(run) => {
                            prop_assert_eq!(pages.run_len(run), count);
                            live.push(run);
                        }
                        Err(e) => prop_assert_eq!(e, AllocError::OutOfMemory),
                    }
                }
                Op::Free(i) if !live.is_empty() => {
                    let run = live.swap_remove(i % live.len());
                    prop_assert_eq!(pages.free(run), Ok(()));
                }
                Op::Split(i, keep) if !live.is_empty() => {
                    let run = live[i % live.len()];
                    if keep < pages.run_len(run) {
                        live.push(pages.split(run, keep).unwrap());
                    } else {
                        prop_assert!(pages.split(run, keep).is_err());
                    }
                }
                Op::Free(_) | Op::Split(..) => {}
            }

            let held: usize = live.iter().map(|&r| pages.run_len(r)).sum();
            let stats = pages.stats();
            prop_assert_eq!(stats.free + held, stats.usable);
            prop_assert_eq!(stats.allocated, held);
        }

        for run in live {
            pages.free(run).unwrap();
        }
        prop_assert_eq!(pages.free_count(), FRAMES);
        prop_assert!(pages.allocate(FRAMES, AllocFlags::CONTIGUOUS).is_ok());
    }
}
