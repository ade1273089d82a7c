use kernel_sync::{IrqSpinLock, SpinLock, SyncOnceCell};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::{panic, thread};

/// Stand-in for allocator state: a free list that must never be observed
/// half-updated.
#[derive(Default)]
struct Pool {
    free: Vec<u32>,
    handed_out: usize,
}

impl Pool {
    fn with_slots(n: u32) -> Self {
        Self {
            free: (0..n).collect(),
            handed_out: 0,
        }
    }

    fn take(&mut self) -> Option<u32> {
        let slot = self.free.pop()?;
        self.handed_out += 1;
        Some(slot)
    }

    fn give(&mut self, slot: u32) {
        self.handed_out -= 1;
        self.free.push(slot);
    }
}

#[test]
fn guard_releases_on_drop() {
    let lock = SpinLock::new(Pool::with_slots(2));
    let slot = {
        let mut g = lock.lock();
        g.take().unwrap()
    };
    assert!(!lock.is_locked());

    let held = lock.try_lock().unwrap();
    assert!(lock.try_lock().is_none());
    drop(held);

    lock.with_lock(|p| p.give(slot));
    let pool = lock.into_inner();
    assert_eq!(pool.free.len(), 2);
    assert_eq!(pool.handed_out, 0);
}

#[test]
fn get_mut_needs_no_locking() {
    let mut lock = IrqSpinLock::new(Pool::default());
    lock.get_mut().free.push(9);
    assert_eq!(lock.with_lock(|p| p.take()), Some(9));
}

#[test]
fn concurrent_take_and_give_keep_the_pool_consistent() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 2_000;

    let lock = Arc::new(IrqSpinLock::new(Pool::with_slots(4)));
    let inside = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let (lock, inside, start) = (lock.clone(), inside.clone(), start.clone());
            thread::spawn(move || {
                start.wait();
                let mut got = 0;
                for _ in 0..ROUNDS {
                    let slot = lock.with_lock(|p| {
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0, "two holders");
                        let s = p.take();
                        inside.fetch_sub(1, Ordering::SeqCst);
                        s
                    });
                    if let Some(s) = slot {
                        got += 1;
                        thread::yield_now();
                        lock.with_lock(|p| p.give(s));
                    }
                }
                got
            })
        })
        .collect();

    let served: usize = workers.into_iter().map(|h| h.join().unwrap()).sum();
    assert!(served > 0);
    lock.with_lock(|p| {
        assert_eq!(p.handed_out, 0);
        let mut free = p.free.clone();
        free.sort_unstable();
        assert_eq!(free, [0, 1, 2, 3]);
    });
}

#[test]
fn a_panicking_holder_does_not_leave_the_lock_taken() {
    let lock = SpinLock::new(Pool::with_slots(1));
    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        lock.with_lock(|p| {
            p.take();
            panic!("holder died");
        });
    }));
    assert!(res.is_err());
    assert_eq!(lock.with_lock(|p| p.handed_out), 1);
}

#[test]
fn once_cell_retries_after_a_failed_init() {
    let cell: SyncOnceCell<Pool> = SyncOnceCell::new();
    assert!(cell.get().is_none());
    assert_eq!(cell.get_or_try_init(|| Err("no memory map")).err(), Some("no memory map"));
    assert!(cell.get().is_none());

    let pool = cell.get_or_try_init(|| Ok::<_, &str>(Pool::with_slots(3))).unwrap();
    assert_eq!(pool.free.len(), 3);
    // Later initializers never run.
    let again = cell.get_or_init(|| unreachable!());
    assert!(std::ptr::eq(pool, again));
}
