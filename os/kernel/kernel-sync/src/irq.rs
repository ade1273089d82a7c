//! # Interrupt state
//!
//! Saving, disabling and restoring the local interrupt flag. On bare-metal
//! targets this touches the CPU (`pushf`/`cli`/`sti` on x86, `DAIF.I` on
//! AArch64). Hosted builds (unit tests, tooling) keep a software flag with the
//! same save/restore semantics so critical sections behave identically.

use core::marker::PhantomData;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod arch {
    /// `RFLAGS.IF`.
    const IF: u64 = 1 << 9;

    #[inline]
    pub fn enabled() -> bool {
        let r: u64;
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(preserves_flags)) }
        r & IF != 0
    }

    #[inline]
    pub fn disable() {
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    pub fn enable() {
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod arch {
    /// `EFLAGS.IF`.
    const IF: u32 = 1 << 9;

    #[inline]
    pub fn enabled() -> bool {
        let r: u32;
        unsafe { core::arch::asm!("pushfd; pop {}", out(reg) r, options(preserves_flags)) }
        r & IF != 0
    }

    #[inline]
    pub fn disable() {
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    pub fn enable() {
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
mod arch {
    /// `DAIF.I` (IRQ mask).
    const I: u64 = 1 << 7;

    #[inline]
    pub fn enabled() -> bool {
        let daif: u64;
        unsafe { core::arch::asm!("mrs {}, daif", out(reg) daif, options(nomem, nostack, preserves_flags)) }
        daif & I == 0
    }

    #[inline]
    pub fn disable() {
        unsafe { core::arch::asm!("msr daifset, #2", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    pub fn enable() {
        unsafe { core::arch::asm!("msr daifclr, #2", options(nomem, nostack, preserves_flags)) }
    }
}

#[cfg(not(all(
    target_os = "none",
    any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")
)))]
mod arch {
    use core::sync::atomic::{AtomicBool, Ordering};

    static ENABLED: AtomicBool = AtomicBool::new(true);

    #[inline]
    pub fn enabled() -> bool {
        ENABLED.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn disable() {
        ENABLED.store(false, Ordering::SeqCst);
    }

    #[inline]
    pub fn enable() {
        ENABLED.store(true, Ordering::SeqCst);
    }
}

/// Whether interrupts are currently enabled on this CPU.
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    arch::enabled()
}

/// Disables interrupts on this CPU.
///
/// # Privilege
///
/// Must only be called where masking interrupts is permitted (ring 0 / EL1).
/// Prefer [`IrqGuard`], which restores the previous state.
#[inline]
pub fn disable_interrupts() {
    arch::disable();
}

/// Enables interrupts on this CPU.
///
/// # Privilege
///
/// Same as [`disable_interrupts`].
#[inline]
pub fn enable_interrupts() {
    arch::enable();
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// `IrqGuard::new()` snapshots the interrupt flag. If interrupts were enabled
/// it disables them; on drop it re-enables them **only** if they were enabled
/// before, so guards nest and every early return restores the caller's state.
///
/// The guard is `!Send`: the saved state belongs to the CPU that created it.
///
/// # Examples
///
/// ```
/// use kernel_sync::irq::{IrqGuard, interrupts_enabled};
///
/// let before = interrupts_enabled();
/// {
///     let _g = IrqGuard::new();
///     assert!(!interrupts_enabled());
/// }
/// assert_eq!(interrupts_enabled(), before);
/// ```
pub struct IrqGuard {
    /// Whether interrupts were enabled when the guard was created.
    were_enabled: bool,
    _not_send: PhantomData<*mut ()>,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    /// Disables interrupts if they are currently enabled and remembers the state.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = arch::enabled();
        if enabled {
            arch::disable();
        }
        Self {
            were_enabled: enabled,
            _not_send: PhantomData,
        }
    }

    /// Whether this guard will re-enable interrupts when dropped.
    #[inline]
    #[must_use]
    pub const fn restores(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            arch::enable();
        }
    }
}

/// Runs `f` with interrupts disabled, restoring the previous state afterwards.
#[inline]
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    let _g = IrqGuard::new();
    f()
}
