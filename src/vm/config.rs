//! VM subsystem configuration
//!
//! Built once at boot, validated, and consumed by [`Vm::new`](super::Vm::new).

use thiserror::Error;

use crate::console::LogLevel;
use crate::types::PAGE_SIZE;
use crate::vm::segments::Segment;

// ============================================================================
// Defaults
// ============================================================================

/// Swap file size (9 MiB)
pub const DEFAULT_SWAP_BYTES: usize = 9 * 1024 * 1024;

/// Number of swap slots in the default swap file
pub const DEFAULT_SWAP_SLOTS: usize = DEFAULT_SWAP_BYTES / PAGE_SIZE;

/// Hardware translation cache entries (MIPS R3000 TLB)
pub const DEFAULT_TLB_ENTRIES: usize = 64;

/// User stack pages (72K, large enough for ARG_MAX argument blocks)
pub const DEFAULT_STACK_PAGES: usize = 18;

/// Top of the user stack
pub const DEFAULT_USER_STACK_TOP: u64 = 0x8000_0000;

// ============================================================================
// Eviction Scope
// ============================================================================

/// Which frames the allocator may take when physical memory is exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionScope {
    /// Only the faulting process's own frames; running out is fatal
    Process,
    /// The faulting process's own frames first, then any process frame
    /// (never a kernel frame)
    ProcessThenSystem,
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The swap file must hold at least one page
    #[error("swap space must have at least one slot")]
    NoSwapSlots,
    /// The translation cache must have at least one entry
    #[error("translation cache must have at least one entry")]
    NoTlbEntries,
    /// The stack must span at least one page
    #[error("user stack must span at least one page")]
    NoStackPages,
    /// The stack top must be page aligned and above the stack size
    #[error("user stack top {0:#x} is misaligned or too low")]
    BadStackTop(u64),
    /// More never-touched frames than physical frames
    #[error("{untouched} untouched frames exceed {total} physical frames")]
    TooManyUntouched {
        /// Requested untouched frames
        untouched: usize,
        /// Physical frames available
        total: usize,
    },
    /// Physical memory has no frames
    #[error("physical memory has no frames")]
    NoFrames,
}

/// VM subsystem configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Number of page slots in the swap store
    pub swap_slots: usize,
    /// Entries in the software translation cache
    pub tlb_entries: usize,
    /// Pages in each user stack
    pub stack_pages: usize,
    /// Top address of each user stack
    pub user_stack_top: u64,
    /// Frames at the top of RAM left for the bump allocator
    pub untouched_frames: usize,
    /// Eviction policy scope
    pub eviction_scope: EvictionScope,
    /// Console level filter applied at init
    pub log_level: LogLevel,
}

impl VmConfig {
    /// Default configuration
    pub const fn new() -> Self {
        Self {
            swap_slots: DEFAULT_SWAP_SLOTS,
            tlb_entries: DEFAULT_TLB_ENTRIES,
            stack_pages: DEFAULT_STACK_PAGES,
            user_stack_top: DEFAULT_USER_STACK_TOP,
            untouched_frames: 0,
            eviction_scope: EvictionScope::ProcessThenSystem,
            log_level: LogLevel::Info,
        }
    }

    pub const fn with_swap_slots(mut self, slots: usize) -> Self {
        self.swap_slots = slots;
        self
    }

    pub const fn with_tlb_entries(mut self, entries: usize) -> Self {
        self.tlb_entries = entries;
        self
    }

    pub const fn with_stack_pages(mut self, pages: usize) -> Self {
        self.stack_pages = pages;
        self
    }

    pub const fn with_user_stack_top(mut self, top: u64) -> Self {
        self.user_stack_top = top;
        self
    }

    pub const fn with_untouched_frames(mut self, frames: usize) -> Self {
        self.untouched_frames = frames;
        self
    }

    pub const fn with_eviction_scope(mut self, scope: EvictionScope) -> Self {
        self.eviction_scope = scope;
        self
    }

    pub const fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Swap store size in bytes
    pub const fn swap_bytes(&self) -> u64 {
        (self.swap_slots * PAGE_SIZE) as u64
    }

    /// Stack segment for a new process
    pub const fn stack_segment(&self) -> Segment {
        Segment::stack(self.user_stack_top, self.stack_pages)
    }

    /// Check the configuration against the available physical frames
    pub fn validate(&self, total_frames: usize) -> Result<(), ConfigError> {
        if total_frames == 0 {
            return Err(ConfigError::NoFrames);
        }
        if self.swap_slots == 0 {
            return Err(ConfigError::NoSwapSlots);
        }
        if self.tlb_entries == 0 {
            return Err(ConfigError::NoTlbEntries);
        }
        if self.stack_pages == 0 {
            return Err(ConfigError::NoStackPages);
        }
        let stack_bytes = (self.stack_pages * PAGE_SIZE) as u64;
        if self.user_stack_top % PAGE_SIZE as u64 != 0 || self.user_stack_top < stack_bytes {
            return Err(ConfigError::BadStackTop(self.user_stack_top));
        }
        if self.untouched_frames >= total_frames {
            return Err(ConfigError::TooManyUntouched {
                untouched: self.untouched_frames,
                total: total_frames,
            });
        }
        Ok(())
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::new()
    }
}
