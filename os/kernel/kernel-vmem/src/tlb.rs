//! TLB maintenance after page-table changes.
//!
//! On bare metal these issue `invlpg` or reload CR3. Hosted builds (tests,
//! the `sim` feature) have no MMU to talk to and the calls do nothing.

use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};

/// Drop any cached translation for the page containing `va`.
#[inline]
pub fn invalidate_page(va: VirtualAddress) {
    #[cfg(all(target_os = "none", any(target_arch = "x86_64", target_arch = "x86")))]
    unsafe {
        #[allow(clippy::cast_possible_truncation)]
        let addr = va.as_u64() as usize;
        core::arch::asm!("invlpg [{}]", in(reg) addr, options(nostack, preserves_flags));
    }
    #[cfg(not(all(target_os = "none", any(target_arch = "x86_64", target_arch = "x86"))))]
    let _ = va;
}

/// Invalidate every page in `[start, end)`.
///
/// Falls back to a full flush when the range is large.
pub fn invalidate_range(start: VirtualAddress, end: VirtualAddress) {
    const FULL_FLUSH_PAGES: u64 = 64;
    let pages = end.as_u64().saturating_sub(start.page_base().as_u64()) / PAGE_SIZE;
    if pages > FULL_FLUSH_PAGES {
        flush_all();
        return;
    }
    let mut va = start.page_base();
    while va < end {
        invalidate_page(va);
        va += PAGE_SIZE;
    }
}

/// Flush all non-global translations by reloading CR3.
#[inline]
pub fn flush_all() {
    #[cfg(all(target_os = "none", any(target_arch = "x86_64", target_arch = "x86")))]
    unsafe {
        core::arch::asm!(
            "mov {tmp}, cr3",
            "mov cr3, {tmp}",
            tmp = out(reg) _,
            options(nostack, preserves_flags)
        );
    }
}
