//! Common types used across the VM subsystem
//!
//! Process identifiers and the page/frame address arithmetic shared by
//! every component.

use core::fmt;

// ============================================================================
// Page Constants
// ============================================================================

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

/// Mask selecting the page-aligned part of an address
pub const PAGE_FRAME: u64 = !(PAGE_SIZE as u64 - 1);

// ============================================================================
// Process Identifier
// ============================================================================

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Pid(pub u32);

impl Pid {
    /// Raw value
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Pid {
    fn from(raw: u32) -> Self {
        Pid(raw)
    }
}

// ============================================================================
// Address Helpers
// ============================================================================

/// Round address down to page boundary
pub const fn trunc_page(addr: u64) -> u64 {
    addr & PAGE_FRAME
}

/// Round address up to page boundary
pub const fn round_page(addr: u64) -> u64 {
    (addr + PAGE_SIZE as u64 - 1) & PAGE_FRAME
}

/// Offset of an address inside its page
pub const fn page_offset(addr: u64) -> usize {
    (addr & !PAGE_FRAME) as usize
}

/// Convert physical address to frame index
pub const fn addr_to_frame(addr: u64) -> usize {
    (addr >> PAGE_SHIFT) as usize
}

/// Convert frame index to physical address
pub const fn frame_to_addr(frame: usize) -> u64 {
    (frame as u64) << PAGE_SHIFT
}
