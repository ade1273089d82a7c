use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    mem::MaybeUninit,
    sync::atomic::{AtomicU8, Ordering},
};

const UNINIT: u8 = 0;
const INITING: u8 = 1;
const READY: u8 = 2;

/// A write-once cell for boot-time singletons.
///
/// Initialization may fail; a failed initializer leaves the cell empty so a
/// later attempt can retry.
pub struct SyncOnceCell<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Default for SyncOnceCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SyncOnceCell<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINIT),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Returns `Some(&T)` if already initialized.
    #[inline]
    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == READY {
            // SAFETY: READY guarantees the write is done
            Some(unsafe { &*(*self.value.get()).as_ptr() })
        } else {
            None
        }
    }

    /// Initialize at most once and return `&T`.
    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> &T {
        match self.get_or_try_init(|| Ok::<T, core::convert::Infallible>(init())) {
            Ok(v) => v,
            Err(never) => match never {},
        }
    }

    /// Like [`get_or_init`](Self::get_or_init), but `init` may fail.
    ///
    /// # Errors
    /// Propagates the initializer's error; the cell stays empty.
    pub fn get_or_try_init<E>(&self, init: impl FnOnce() -> Result<T, E>) -> Result<&T, E> {
        loop {
            if let Some(v) = self.get() {
                return Ok(v);
            }

            if self
                .state
                .compare_exchange(UNINIT, INITING, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return match init() {
                    Ok(v) => {
                        unsafe {
                            (*self.value.get()).write(v);
                        }
                        // Publish value before marking READY
                        self.state.store(READY, Ordering::Release);
                        // SAFETY: just wrote it
                        Ok(unsafe { &*(*self.value.get()).as_ptr() })
                    }
                    Err(e) => {
                        self.state.store(UNINIT, Ordering::Release);
                        Err(e)
                    }
                };
            }

            // Someone else is initializing; wait until it settles.
            while self.state.load(Ordering::Acquire) == INITING {
                spin_loop();
            }
        }
    }
}

impl<T> Drop for SyncOnceCell<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == READY {
            // SAFETY: READY means the value was written and never moved out.
            unsafe { self.value.get_mut().assume_init_drop() }
        }
    }
}

// Safety: shared after READY; initialization is single-writer.
unsafe impl<T: Sync + Send> Sync for SyncOnceCell<T> {}
unsafe impl<T: Send> Send for SyncOnceCell<T> {}
