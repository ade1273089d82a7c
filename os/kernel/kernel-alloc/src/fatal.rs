//! Escalation of detected corruption.
//!
//! Allocators report [`Corruption`] as an ordinary error so the detecting
//! code stays testable. Kernel-facing entry points route it through here,
//! which logs the call site and stops the kernel.

use crate::error::{AllocError, Corruption};
use core::panic::Location;

/// Log `err` with the caller's location and panic.
#[cold]
#[track_caller]
pub fn corruption(err: Corruption) -> ! {
    let at = Location::caller();
    log::error!("memory corruption detected at {}:{}: {err}", at.file(), at.line());
    panic!("memory corruption: {err}");
}

/// Pass `result` through, escalating [`AllocError::Corruption`].
#[inline]
#[track_caller]
pub fn check<T>(result: Result<T, AllocError>) -> Result<T, AllocError> {
    match result {
        Err(AllocError::Corruption(c)) => corruption(c),
        other => other,
    }
}
