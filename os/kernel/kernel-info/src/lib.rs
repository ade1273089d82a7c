//! # Kernel Memory Configuration
//!
//! The authoritative source for the constants that shape the memory
//! subsystem, and the data model for the boot-time physical memory map.
//!
//! ## Memory Layout ([`memory`])
//!
//! Virtual layouts for the 64-bit (4-level) and 32-bit (2- and 3-level)
//! page-table formats, the device mapping window, and the size of the fast
//! bitmap allocator's region. All values are `const` and cross-checked by
//! compile-time assertions.
//!
//! ```text
//! Virtual Address Space Layout (64-bit):
//!
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │         User Space              │
//! USERSPACE_END         ├─────────────────────────────────┤ 0x0000_8000_0000_0000
//!                       │     (non-canonical hole)        │
//! kernel_base           ├─────────────────────────────────┤ 0xffff_8000_0000_0000
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │   Higher Half Direct Mapping    │
//! KERNEL_MMIO_START     ├─────────────────────────────────┤ 0xffff_c900_0000_0000
//!                       │   Device mappings (top-down)    │
//! KERNEL_MMIO_END       ├─────────────────────────────────┤
//!                       │                                 │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │       Kernel Text & Data        │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! ## Boot Memory Map ([`memory_map`])
//!
//! Firmware ranges reduced to `(start, end, kind)`; only available ranges
//! seed the page frame allocator.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod memory;
pub mod memory_map;
