//! Virtual memory areas.

use alloc::sync::Arc;
use core::fmt;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::{CacheEncoding, CachePolicy, LeafProtection, PageTableFlags, TableGeometry};

bitflags::bitflags! {
    /// Permissions and sharing mode of a [`VmArea`].
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct VmFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        /// Writes are visible to every address space mapping the pages;
        /// never copy-on-write.
        const SHARED = 1 << 3;
        /// Device memory. Frames are not managed by the page allocator.
        const IO = 1 << 4;
    }
}

/// What an area is used for. Informational; behavior follows [`VmFlags`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VmKind {
    Code,
    Data,
    Heap,
    Stack,
    Mmap,
    Device,
}

/// Failure reported by a [`BackingFile`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FsError {
    #[error("I/O error")]
    Io,
    #[error("read beyond end of file")]
    BadOffset,
    #[error("file does not support mapping")]
    NotMappable,
}

/// File contents a [`VmArea`] can be populated from.
pub trait BackingFile: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`; returns the bytes read.
    ///
    /// # Errors
    /// Whatever the filesystem reports.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, FsError>;
}

/// A file mapping: `len` bytes of `file` starting at `offset`, the rest of
/// the area reads as zero.
#[derive(Clone)]
pub struct FileBacking {
    pub file: Arc<dyn BackingFile>,
    pub offset: u64,
    pub len: u64,
}

impl fmt::Debug for FileBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileBacking")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

/// Where the contents of an area come from.
#[derive(Debug, Clone, Default)]
pub enum Backing {
    /// Zero-filled on first touch.
    #[default]
    Anonymous,
    File(FileBacking),
    /// A fixed physical range, mapped eagerly.
    Device {
        phys: PhysicalAddress,
        cache: CachePolicy,
    },
}

/// Half-open, page-aligned range `[start, end)` with uniform permissions.
#[derive(Debug, Clone)]
pub struct VmArea {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
    pub flags: VmFlags,
    pub kind: VmKind,
    pub backing: Backing,
}

impl VmArea {
    #[must_use]
    pub const fn new(start: VirtualAddress, end: VirtualAddress, flags: VmFlags, kind: VmKind) -> Self {
        Self {
            start,
            end,
            flags,
            kind,
            backing: Backing::Anonymous,
        }
    }

    #[must_use]
    pub fn with_file(mut self, file: Arc<dyn BackingFile>, offset: u64, len: u64) -> Self {
        self.backing = Backing::File(FileBacking { file, offset, len });
        self
    }

    /// Map `phys` with `cache`; implies [`VmFlags::IO`].
    #[must_use]
    pub fn with_device(mut self, phys: PhysicalAddress, cache: CachePolicy) -> Self {
        self.flags |= VmFlags::IO;
        self.kind = VmKind::Device;
        self.backing = Backing::Device { phys, cache };
        self
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, va: VirtualAddress) -> bool {
        self.start <= va && va < self.end
    }

    #[inline]
    #[must_use]
    pub fn overlaps(&self, start: VirtualAddress, end: VirtualAddress) -> bool {
        self.start < end && start < self.end
    }

    /// Whether the pages are a fixed physical range the page allocator
    /// does not own.
    #[inline]
    #[must_use]
    pub const fn is_device(&self) -> bool {
        matches!(self.backing, Backing::Device { .. })
    }

    /// Private pages are shared copy-on-write across fork.
    #[inline]
    #[must_use]
    pub const fn is_private(&self) -> bool {
        !self.flags.intersects(VmFlags::SHARED.union(VmFlags::IO))
    }

    /// Cut the area at `at`, keeping `[start, at)` and returning `[at, end)`.
    ///
    /// File offsets and device addresses of the upper half move along.
    /// `at` must lie strictly inside the area and be page aligned.
    #[must_use]
    pub fn split_off(&mut self, at: VirtualAddress) -> Self {
        debug_assert!(self.start < at && at < self.end && at.is_page_aligned());
        let delta = at - self.start;
        let backing = match &mut self.backing {
            Backing::Anonymous => Backing::Anonymous,
            Backing::File(fb) => {
                let upper = FileBacking {
                    file: fb.file.clone(),
                    offset: fb.offset + delta,
                    len: fb.len.saturating_sub(delta),
                };
                fb.len = fb.len.min(delta);
                Backing::File(upper)
            }
            Backing::Device { phys, cache } => Backing::Device {
                phys: *phys + delta,
                cache: *cache,
            },
        };
        let upper = Self {
            start: at,
            end: self.end,
            flags: self.flags,
            kind: self.kind,
            backing,
        };
        self.end = at;
        upper
    }

    /// Memory type of the area's pages.
    #[must_use]
    pub const fn cache_policy(&self) -> CachePolicy {
        match self.backing {
            Backing::Device { cache, .. } => cache,
            _ => CachePolicy::WriteBack,
        }
    }

    /// User-mode leaf flags for a page of this area.
    #[must_use]
    pub fn leaf_flags<G: TableGeometry>(&self, encoding: CacheEncoding) -> PageTableFlags {
        LeafProtection {
            writable: self.flags.contains(VmFlags::WRITE),
            executable: self.flags.contains(VmFlags::EXEC),
            user: true,
            global: false,
            cache: self.cache_policy(),
        }
        .leaf_flags::<G>(encoding)
    }
}

impl fmt::Display for VmArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bit = |flag, c| if self.flags.contains(flag) { c } else { '-' };
        write!(
            f,
            "{}-{} {}{}{}{} {:?}",
            self.start,
            self.end,
            bit(VmFlags::READ, 'r'),
            bit(VmFlags::WRITE, 'w'),
            bit(VmFlags::EXEC, 'x'),
            if self.flags.contains(VmFlags::SHARED) { 's' } else { 'p' },
            self.kind
        )?;
        match &self.backing {
            Backing::Anonymous => Ok(()),
            Backing::File(fb) => write!(f, " file@{:#x}+{:#x}", fb.offset, fb.len),
            Backing::Device { phys, cache } => write!(f, " dev {phys} {cache}"),
        }
    }
}
