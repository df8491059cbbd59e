//! Address Space Segments and Executable Image
//!
//! A user address space has three regions: code and data (loaded on demand
//! from the executable) and the stack (zero-filled on first touch). The
//! fault handler classifies every faulting address against them.
//!
//! Program-header parsing lives with the loader; the VM subsystem only needs
//! "give me the file bytes of segment S starting at offset O", which is the
//! [`ExecutableImage`] trait.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use crate::types::{round_page, trunc_page, Pid, PAGE_SIZE};

// ============================================================================
// Segment
// ============================================================================

/// Segment kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    /// Text: read-only once loaded, never written to swap
    Code,
    /// Initialized data and bss
    Data,
    /// User stack
    Stack,
}

impl SegmentKind {
    /// Short name for log output
    pub const fn name(self) -> &'static str {
        match self {
            SegmentKind::Code => "code",
            SegmentKind::Data => "data",
            SegmentKind::Stack => "stack",
        }
    }
}

/// One virtual region of a user address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Segment kind
    pub kind: SegmentKind,
    /// First virtual address as recorded by the loader (may be unaligned)
    pub vaddr: u64,
    /// Size in memory
    pub mem_size: u64,
    /// Bytes backed by the executable file; the rest is zero
    pub file_size: u64,
}

impl Segment {
    /// A segment loaded from the executable image
    pub const fn loaded(kind: SegmentKind, vaddr: u64, mem_size: u64, file_size: u64) -> Self {
        Self {
            kind,
            vaddr,
            mem_size,
            file_size,
        }
    }

    /// A stack of `npages` pages ending at `top`
    pub const fn stack(top: u64, npages: usize) -> Self {
        let size = (npages * PAGE_SIZE) as u64;
        Self {
            kind: SegmentKind::Stack,
            vaddr: top - size,
            mem_size: size,
            file_size: 0,
        }
    }

    /// Page-aligned base
    pub const fn base(&self) -> u64 {
        trunc_page(self.vaddr)
    }

    /// Page-aligned end (exclusive)
    pub const fn top(&self) -> u64 {
        round_page(self.vaddr + self.mem_size)
    }

    /// Number of pages spanned
    pub const fn npages(&self) -> usize {
        ((self.top() - self.base()) / PAGE_SIZE as u64) as usize
    }

    /// Check whether an address falls inside the segment's pages
    pub const fn contains(&self, addr: u64) -> bool {
        self.mem_size != 0 && addr >= self.base() && addr < self.top()
    }

    /// File-backed bytes overlapping the page at `page`
    ///
    /// Returns `(offset_in_page, offset_in_file, len)`, or `None` when the
    /// page lies entirely past the file-backed part.
    pub fn file_extent(&self, page: u64) -> Option<(usize, u64, usize)> {
        let file_end = self.vaddr + self.file_size;
        let start = page.max(self.vaddr);
        let end = (page + PAGE_SIZE as u64).min(file_end);
        if start >= end {
            return None;
        }
        Some(((start - page) as usize, start - self.vaddr, (end - start) as usize))
    }
}

// ============================================================================
// Address Space
// ============================================================================

/// Segment layout of one process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    pub code: Segment,
    pub data: Segment,
    pub stack: Segment,
}

impl AddressSpace {
    /// Create an address space from its three segments
    pub const fn new(code: Segment, data: Segment, stack: Segment) -> Self {
        Self { code, data, stack }
    }

    /// Classify an address, `None` if it lies outside every segment
    pub fn classify(&self, addr: u64) -> Option<SegmentKind> {
        [&self.code, &self.data, &self.stack]
            .into_iter()
            .find(|seg| seg.contains(addr))
            .map(|seg| seg.kind)
    }

    /// Segment of the given kind
    pub fn segment(&self, kind: SegmentKind) -> &Segment {
        match kind {
            SegmentKind::Code => &self.code,
            SegmentKind::Data => &self.data,
            SegmentKind::Stack => &self.stack,
        }
    }
}

// ============================================================================
// Executable Image
// ============================================================================

/// Errors reading the executable image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ImageError {
    /// The read failed at the device or file-system level
    #[error("I/O error reading executable")]
    Io,
    /// The request runs past the segment's file-backed bytes
    #[error("read of {len} bytes at offset {offset:#x} past end of {kind:?} segment")]
    OutOfRange {
        /// Segment being read
        kind: SegmentKind,
        /// File offset within the segment
        offset: u64,
        /// Requested length
        len: usize,
    },
    /// The executable has no loadable segment of this kind
    #[error("executable has no {0:?} segment")]
    NoSegment(SegmentKind),
}

/// Source of segment bytes for demand loading
pub trait ExecutableImage: Send + Sync {
    /// Fill `buf` with the segment's file bytes starting at `offset`
    fn read_segment(&self, kind: SegmentKind, offset: u64, buf: &mut [u8]) -> Result<(), ImageError>;
}

/// Executable held in memory (boot images and tests)
#[derive(Debug, Default)]
pub struct MemoryImage {
    code: Vec<u8>,
    data: Vec<u8>,
    reads: AtomicU64,
}

impl MemoryImage {
    /// Create an image from the file bytes of its code and data segments
    pub fn new(code: Vec<u8>, data: Vec<u8>) -> Self {
        Self {
            code,
            data,
            reads: AtomicU64::new(0),
        }
    }

    /// Number of segment reads served
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }
}

impl ExecutableImage for MemoryImage {
    fn read_segment(&self, kind: SegmentKind, offset: u64, buf: &mut [u8]) -> Result<(), ImageError> {
        let bytes = match kind {
            SegmentKind::Code => &self.code,
            SegmentKind::Data => &self.data,
            SegmentKind::Stack => return Err(ImageError::NoSegment(kind)),
        };
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .filter(|&end| end <= bytes.len())
            .ok_or(ImageError::OutOfRange {
                kind,
                offset,
                len: buf.len(),
            })?;
        buf.copy_from_slice(&bytes[start..end]);
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Process
// ============================================================================

/// What the fault handler needs to know about a user process
#[derive(Clone)]
pub struct Process {
    /// Process identifier
    pub pid: Pid,
    /// Segment layout
    pub aspace: AddressSpace,
    /// Executable backing the code and data segments
    pub image: Arc<dyn ExecutableImage>,
}

impl Process {
    pub fn new(pid: Pid, aspace: AddressSpace, image: Arc<dyn ExecutableImage>) -> Self {
        Self { pid, aspace, image }
    }
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("aspace", &self.aspace)
            .finish()
    }
}
