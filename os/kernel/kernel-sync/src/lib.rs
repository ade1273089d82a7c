//! # Kernel synchronization primitives
//!
//! Everything the memory subsystem needs to serialize access to shared state:
//!
//! - [`IrqGuard`]: scoped "interrupts off" with restoration of the previous
//!   state on every exit path.
//! - [`SpinLock`]: a plain test-and-test-and-set lock.
//! - [`IrqSpinLock`]: both at once; one per allocator structure.
//! - [`SyncOnceCell`]: boot-time singletons.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod irq_lock;
mod spin_lock;
mod sync_once_cell;

pub use irq::{IrqGuard, without_interrupts};
pub use irq_lock::{IrqSpinLock, IrqSpinLockGuard};
pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
