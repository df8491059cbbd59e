//! Translation Cache
//!
//! The hardware TLB as seen by the fault handler: a small fully
//! associative cache of virtual-page to frame translations that the kernel
//! refills on every miss. [`SoftTlb`] models the MIPS R3000 refill policy:
//! take a free slot if one exists, otherwise replace round-robin.
//!
//! Entries carry no address-space tag, so the whole cache is flushed on a
//! context switch.

use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::types::trunc_page;

// ============================================================================
// Entry Flags
// ============================================================================

/// Translation entry flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TlbFlags(u32);

impl TlbFlags {
    /// Entry is valid
    pub const VALID: Self = Self(1 << 0);
    /// Writes allowed (the MIPS "dirty" bit)
    pub const DIRTY: Self = Self(1 << 1);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Flags for a valid translation with the given write permission
    pub const fn for_access(writable: bool) -> Self {
        if writable {
            Self::VALID.union(Self::DIRTY)
        } else {
            Self::VALID
        }
    }
}

/// One cached translation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    /// Virtual page address
    pub vpage: u64,
    /// Frame address
    pub paddr: u64,
    pub flags: TlbFlags,
}

impl TlbEntry {
    pub fn is_writable(&self) -> bool {
        self.flags.contains(TlbFlags::DIRTY)
    }
}

/// How an install found its slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbInstall {
    /// An empty slot was used
    Free,
    /// A live translation for another page was replaced
    Replaced,
    /// The page already had a slot; it was rewritten in place
    Refreshed,
}

// ============================================================================
// Translation Cache Interface
// ============================================================================

/// Hardware translation cache operations used by the VM subsystem
pub trait TranslationCache: Send + Sync {
    /// Install or update the translation for the page containing `vaddr`
    fn install(&self, vaddr: u64, paddr: u64, writable: bool) -> TlbInstall;

    /// Drop the translation for the page containing `vaddr`, if cached
    fn invalidate(&self, vaddr: u64) -> bool;

    /// Drop every translation
    fn invalidate_all(&self);

    /// Look up the cached translation for `vaddr`
    fn probe(&self, vaddr: u64) -> Option<TlbEntry>;
}

struct TlbInner {
    entries: Vec<Option<TlbEntry>>,
    next_victim: usize,
}

impl TlbInner {
    fn slot_of(&self, vpage: u64) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| matches!(e, Some(e) if e.vpage == vpage))
    }
}

/// Software translation cache
pub struct SoftTlb {
    inner: Mutex<TlbInner>,
}

impl SoftTlb {
    /// Create a cache with `size` entries
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "translation cache needs at least one entry");
        Self {
            inner: Mutex::new(TlbInner {
                entries: vec![None; size],
                next_victim: 0,
            }),
        }
    }

    /// Number of entries
    pub fn size(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Number of valid entries
    pub fn valid_count(&self) -> usize {
        self.inner.lock().entries.iter().flatten().count()
    }
}

impl TranslationCache for SoftTlb {
    fn install(&self, vaddr: u64, paddr: u64, writable: bool) -> TlbInstall {
        let vpage = trunc_page(vaddr);
        let entry = TlbEntry {
            vpage,
            paddr,
            flags: TlbFlags::for_access(writable),
        };
        let mut inner = self.inner.lock();

        if let Some(slot) = inner.slot_of(vpage) {
            inner.entries[slot] = Some(entry);
            return TlbInstall::Refreshed;
        }
        if let Some(slot) = inner.entries.iter().position(Option::is_none) {
            inner.entries[slot] = Some(entry);
            return TlbInstall::Free;
        }

        let slot = inner.next_victim;
        inner.next_victim = (slot + 1) % inner.entries.len();
        inner.entries[slot] = Some(entry);
        TlbInstall::Replaced
    }

    fn invalidate(&self, vaddr: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.slot_of(trunc_page(vaddr)) {
            Some(slot) => {
                inner.entries[slot] = None;
                true
            }
            None => false,
        }
    }

    fn invalidate_all(&self) {
        self.inner.lock().entries.fill(None);
    }

    fn probe(&self, vaddr: u64) -> Option<TlbEntry> {
        let inner = self.inner.lock();
        inner.slot_of(trunc_page(vaddr)).and_then(|slot| inner.entries[slot])
    }
}
