use crate::irq::IrqGuard;
use crate::spin_lock::{SpinLock, SpinLockGuard};
use core::ops::{Deref, DerefMut};

/// A spin lock that also disables interrupts while held.
///
/// Acquisition order is: save and disable interrupts, then take the lock.
/// Release happens in reverse on drop. On a uniprocessor the interrupt guard
/// alone excludes every other mutator; the spin lock makes the same critical
/// section correct on SMP.
///
/// ```
/// use kernel_sync::IrqSpinLock;
///
/// static COUNTER: IrqSpinLock<u64> = IrqSpinLock::new(0);
///
/// {
///     let mut g = COUNTER.lock();
///     *g += 1;
/// } // lock released, interrupts restored
/// assert_eq!(COUNTER.with_lock(|c| *c), 1);
/// ```
pub struct IrqSpinLock<T> {
    inner: SpinLock<T>,
}

impl<T> IrqSpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: SpinLock::new(value),
        }
    }

    /// Disables interrupts, then spins until the lock is acquired.
    #[inline]
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        let irq = IrqGuard::new();
        let guard = self.inner.lock();
        IrqSpinLockGuard { guard, _irq: irq }
    }

    /// Single attempt; interrupts are left untouched on failure.
    #[inline]
    pub fn try_lock(&self) -> Option<IrqSpinLockGuard<'_, T>> {
        let irq = IrqGuard::new();
        let guard = self.inner.try_lock()?;
        Some(IrqSpinLockGuard { guard, _irq: irq })
    }

    #[inline]
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.lock();
        f(&mut g)
    }

    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

/// Guard returned by [`IrqSpinLock::lock`].
///
/// Field order matters: the spin lock is released before interrupts are
/// restored.
pub struct IrqSpinLockGuard<'a, T> {
    guard: SpinLockGuard<'a, T>,
    _irq: IrqGuard,
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
