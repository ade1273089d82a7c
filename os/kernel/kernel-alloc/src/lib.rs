//! # Kernel Memory Allocation and Virtual Memory Management
//!
//! Physical page management, the kernel's small-object allocators and the
//! per-process view of virtual memory, layered on the paging code in
//! `kernel-vmem`:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │        Process address spaces ([`vm`])              │
//! │    • Ordered VMAs, mmap / munmap / mprotect         │
//! │    • Demand paging, file-backed pages               │
//! │    • fork with copy-on-write                        │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │   Kernel pools ([`slab`], [`fast_alloc`], [`mmio`]) │
//! │    • Fixed size classes with guard words            │
//! │    • 8-byte block bitmap                            │
//! │    • Device mapping window                          │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │         Page Frame Allocator ([`frame_alloc`])      │
//! │    • One record per 4 KiB frame, u32-linked         │
//! │    • Contiguous and scattered runs                  │
//! │    • Saturating reference counts ([`page_ref`])     │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! [`context::KernelMemory`] builds and owns one of each; nothing here is a
//! hidden global. Production code may keep exactly one in
//! [`context::init_global`].
//!
//! ## Errors
//!
//! Allocators return [`AllocError`]: `OutOfMemory` is the caller's to handle,
//! `InvalidRange` is a bug in the caller, and `Corruption` means allocator
//! state can no longer be trusted. The kernel-facing entry points hand the
//! latter to [`fatal::corruption`], which logs and panics.
//!
//! ## Example
//!
//! ```rust
//! use kernel_alloc::context::{KernelMemory, MemoryConfig};
//! use kernel_alloc::vm::{Access, FaultResolution, ProcessMemory, VmArea, VmFlags, VmKind};
//! use kernel_vmem::sim::SimulatedRam;
//! use kernel_vmem::{LongMode64, PhysicalAddress, VirtualAddress};
//!
//! let ram = SimulatedRam::new(PhysicalAddress::new(0x10_0000), 512);
//! let config = MemoryConfig::for_geometry::<LongMode64>();
//! let kmem = KernelMemory::<LongMode64, _>::new(&ram, &config, &[ram.memory_map()], &[]).unwrap();
//!
//! let heap = VmArea::new(
//!     VirtualAddress::new(0x60_0000),
//!     VirtualAddress::new(0x61_0000),
//!     VmFlags::READ | VmFlags::WRITE,
//!     VmKind::Heap,
//! );
//! let mut process = ProcessMemory::create(&kmem, [heap]).unwrap();
//! let fixed = process.handle_fault(&kmem, VirtualAddress::new(0x60_0010), Access::Write);
//! assert_eq!(fixed, Ok(FaultResolution::MappedZero));
//! process.destroy(&kmem);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::cast_possible_truncation)]

extern crate alloc;

pub mod context;
pub mod error;
pub mod fast_alloc;
pub mod fatal;
pub mod frame_alloc;
pub mod mmio;
pub mod page_ref;
pub mod phys_mapper;
pub mod slab;
pub mod vm;

pub use error::{AllocError, Corruption};
