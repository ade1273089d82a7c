//! Allocation errors shared by every allocator in this crate.

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PageTableError;

/// Inconsistent allocator state. Never recoverable; see [`crate::fatal`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Corruption {
    #[error("double free of object {addr}")]
    DoubleFree { addr: VirtualAddress },
    #[error("guard word {found:#010x} on object {addr}")]
    GuardMismatch { addr: VirtualAddress, found: u32 },
    #[error("reference count underflow on page {pa}")]
    RefcountUnderflow { pa: PhysicalAddress },
    #[error("reference taken on free page {pa}")]
    ReferenceToFreePage { pa: PhysicalAddress },
    #[error("free of reserved page {pa}")]
    FreeReserved { pa: PhysicalAddress },
}

/// Failure of an allocation or free request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    /// Nothing suitable is free. The caller may retry after freeing memory.
    #[error("out of memory")]
    OutOfMemory,
    /// The request itself is malformed.
    #[error("invalid range: {0}")]
    InvalidRange(&'static str),
    #[error("memory corruption: {0}")]
    Corruption(#[from] Corruption),
}

impl From<PageTableError> for AllocError {
    fn from(e: PageTableError) -> Self {
        match e {
            PageTableError::OutOfMemory { .. } => Self::OutOfMemory,
            PageTableError::Misaligned(_) => Self::InvalidRange("address not page aligned"),
            PageTableError::NonCanonical(_) => Self::InvalidRange("address outside the paging format"),
        }
    }
}
