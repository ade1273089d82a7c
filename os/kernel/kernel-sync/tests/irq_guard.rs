use kernel_sync::irq::{IrqGuard, disable_interrupts, enable_interrupts, interrupts_enabled};
use kernel_sync::{IrqSpinLock, without_interrupts};

// The hosted interrupt flag is process-global, so every assertion on it lives
// in this single test.
#[test]
fn interrupt_state_is_saved_and_restored() {
    enable_interrupts();
    assert!(interrupts_enabled());

    // plain scope
    {
        let g = IrqGuard::new();
        assert!(g.restores());
        assert!(!interrupts_enabled());
    }
    assert!(interrupts_enabled());

    // nested guards: only the outer one re-enables
    {
        let _outer = IrqGuard::new();
        {
            let inner = IrqGuard::new();
            assert!(!inner.restores());
        }
        assert!(!interrupts_enabled(), "inner guard must not re-enable");
    }
    assert!(interrupts_enabled());

    // early return through `?` restores as well
    fn fallible(fail: bool) -> Result<u32, &'static str> {
        let _g = IrqGuard::new();
        if fail {
            return Err("bail");
        }
        Ok(1)
    }
    assert!(fallible(true).is_err());
    assert!(interrupts_enabled());
    assert_eq!(fallible(false), Ok(1));
    assert!(interrupts_enabled());

    // a guard taken while disabled leaves them disabled
    disable_interrupts();
    {
        let _g = IrqGuard::new();
    }
    assert!(!interrupts_enabled());
    enable_interrupts();

    // the lock guard disables for its lifetime
    let lock = IrqSpinLock::new(5u32);
    {
        let mut g = lock.lock();
        *g += 1;
        assert!(!interrupts_enabled());
        assert!(lock.try_lock().is_none());
    }
    assert!(interrupts_enabled());
    assert_eq!(lock.with_lock(|v| *v), 6);

    let v = without_interrupts(|| {
        assert!(!interrupts_enabled());
        42
    });
    assert_eq!(v, 42);
    assert!(interrupts_enabled());

    // panics unwind through the guard
    let r = std::panic::catch_unwind(|| {
        let _g = IrqGuard::new();
        panic!("boom");
    });
    assert!(r.is_err());
    assert!(interrupts_enabled());
}
