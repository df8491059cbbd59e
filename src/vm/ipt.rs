//! Inverted Page Table
//!
//! One entry per physical frame recording who owns it and which virtual
//! page it backs. Reverse lookup (pid, page) -> frame goes through a
//! [`HashIndex`] kept under the same lock as the entry array, so an entry
//! and its index node are always published together.
//!
//! ## Entry life cycle
//!
//! ```text
//!   Free ──add──> Loading(pid) ──fill done──> Resident(pid)
//!                      ^                            │ victim selected
//!                      └── add (new owner) ── Loading(Kernel)
//! ```
//!
//! A `Loading` frame is never chosen as an eviction victim and is never
//! mapped; faults that find it wait for the fill to finish.
//!
//! Lock order: page table, then frame allocator, then swap space. The
//! translation cache lock is a leaf and may be taken under any of them.

use alloc::vec;
use alloc::vec::Vec;
use heapless::FnvIndexMap;
use spin::Mutex;

use crate::types::{addr_to_frame, frame_to_addr, trunc_page, Pid};
use crate::vm::coremap::FrameAllocator;
use crate::vm::ipt_hash::HashIndex;
use crate::vm::segments::SegmentKind;
use crate::vm::swapfile::{SlotReservation, SwapSpace};
use crate::vm::tlb::{TlbInstall, TranslationCache};
use crate::{kdebug, kdump, kerr};

/// Processes whose victim cursor is remembered
const MAX_CURSORS: usize = 64;

// ============================================================================
// Entries
// ============================================================================

/// Frame owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Free,
    /// Kernel allocation, or a victim frame in transit
    Kernel,
    Process(Pid),
}

/// Frame status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Free,
    /// Contents being filled or written out; not mappable, not evictable
    Loading,
    Resident,
}

/// Inverted page table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IptEntry {
    pub owner: Owner,
    /// Page-aligned virtual address (process frames only)
    pub vaddr: u64,
    pub status: EntryStatus,
    /// Segment the page belongs to (process frames only)
    pub kind: Option<SegmentKind>,
}

impl IptEntry {
    pub const FREE: IptEntry = IptEntry {
        owner: Owner::Free,
        vaddr: 0,
        status: EntryStatus::Free,
        kind: None,
    };

    const KERNEL: IptEntry = IptEntry {
        owner: Owner::Kernel,
        vaddr: 0,
        status: EntryStatus::Resident,
        kind: None,
    };

    fn is_evictable_by(&self, pid: Option<Pid>) -> bool {
        match (self.owner, pid) {
            (Owner::Process(owner), Some(pid)) => owner == pid && self.status == EntryStatus::Resident,
            (Owner::Process(_), None) => self.status == EntryStatus::Resident,
            _ => false,
        }
    }
}

/// Outcome of a resident-page lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Page resident; its translation was installed
    Mapped { paddr: u64, install: TlbInstall },
    /// Page has a frame whose contents are still being filled
    Loading { frame: usize },
    /// No frame for the page
    Absent,
}

/// A frame taken from its owner for reuse
///
/// The frame's entry is Kernel-owned and Loading; its index node is gone
/// and the owner's translation invalidated. For non-code pages `slot` holds
/// the swap slot reserved for the contents.
#[derive(Debug)]
pub struct Victim {
    pub frame: usize,
    pub paddr: u64,
    pub pid: Pid,
    pub vaddr: u64,
    pub kind: SegmentKind,
    pub slot: Option<SlotReservation>,
}

// ============================================================================
// Inverted Page Table
// ============================================================================

struct IptInner {
    entries: Vec<IptEntry>,
    index: HashIndex,
    cursors: FnvIndexMap<Pid, usize, MAX_CURSORS>,
    global_cursor: usize,
}

impl IptInner {
    fn reset(&mut self, frame: usize) {
        self.entries[frame] = IptEntry::FREE;
    }

    /// Round-robin scan for a victim, starting at `start`
    fn scan(&self, start: usize, pid: Option<Pid>) -> Option<usize> {
        let n = self.entries.len();
        (0..n)
            .map(|i| (start + i) % n)
            .find(|&frame| self.entries[frame].is_evictable_by(pid))
    }

    fn claim(&mut self, frame: usize, swap: &SwapSpace, tlb: &dyn TranslationCache) -> Victim {
        let entry = self.entries[frame];
        let Owner::Process(pid) = entry.owner else {
            unreachable!("victim frame {} not process-owned", frame);
        };
        let kind = entry.kind.unwrap_or(SegmentKind::Data);

        let slot = match kind {
            SegmentKind::Code => None,
            SegmentKind::Data | SegmentKind::Stack => Some(swap.reserve(pid, entry.vaddr)),
        };
        self.index.delete(pid, entry.vaddr);
        self.entries[frame] = IptEntry {
            owner: Owner::Kernel,
            vaddr: entry.vaddr,
            status: EntryStatus::Loading,
            kind: None,
        };
        tlb.invalidate(entry.vaddr);

        kdebug!(
            "ipt: evicting pid {} {} page {:#x} from frame {}",
            pid,
            kind.name(),
            entry.vaddr,
            frame
        );
        Victim {
            frame,
            paddr: frame_to_addr(frame),
            pid,
            vaddr: entry.vaddr,
            kind,
            slot,
        }
    }
}

/// Inverted page table
pub struct InvertedPageTable {
    inner: Mutex<IptInner>,
}

impl InvertedPageTable {
    /// Create a table for `frames` physical frames
    pub fn new(frames: usize) -> Self {
        Self {
            inner: Mutex::new(IptInner {
                entries: vec![IptEntry::FREE; frames],
                index: HashIndex::new(frames),
                cursors: FnvIndexMap::new(),
                global_cursor: 0,
            }),
        }
    }

    /// Number of frames covered
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Physical address of the frame backing (pid, vaddr)
    pub fn lookup(&self, pid: Pid, vaddr: u64) -> Option<u64> {
        self.inner.lock().index.search(pid, vaddr).map(frame_to_addr)
    }

    /// Look up (pid, vaddr) and install its translation if resident
    ///
    /// Code pages are mapped read-only, everything else read-write. The
    /// install happens under the table lock so the frame cannot be evicted
    /// in between.
    pub fn map_resident(&self, pid: Pid, vaddr: u64, tlb: &dyn TranslationCache) -> Lookup {
        let inner = self.inner.lock();
        let Some(frame) = inner.index.search(pid, vaddr) else {
            return Lookup::Absent;
        };
        let entry = &inner.entries[frame];
        if entry.status == EntryStatus::Loading {
            return Lookup::Loading { frame };
        }

        let paddr = frame_to_addr(frame);
        let writable = entry.kind != Some(SegmentKind::Code);
        let install = tlb.install(vaddr, paddr, writable);
        Lookup::Mapped { paddr, install }
    }

    /// Record that the frame at `paddr` now backs (pid, vaddr)
    ///
    /// The entry starts out Loading. If (pid, vaddr) is already mapped
    /// nothing is written and the existing frame's address is returned.
    pub fn add(&self, pid: Pid, paddr: u64, vaddr: u64, kind: SegmentKind) -> Result<(), u64> {
        let frame = addr_to_frame(paddr);
        let vaddr = trunc_page(vaddr);
        let mut inner = self.inner.lock();

        if let Some(existing) = inner.index.search(pid, vaddr) {
            return Err(frame_to_addr(existing));
        }
        assert!(
            !matches!(inner.entries[frame].owner, Owner::Process(_)),
            "frame {} already mapped",
            frame
        );

        inner.entries[frame] = IptEntry {
            owner: Owner::Process(pid),
            vaddr,
            status: EntryStatus::Loading,
            kind: Some(kind),
        };
        inner.index.insert(pid, vaddr, frame);
        Ok(())
    }

    /// Release a frame that lost an `add` race or was never mapped
    pub fn discard(&self, paddr: u64, frames: &FrameAllocator) {
        let frame = addr_to_frame(paddr);
        let mut inner = self.inner.lock();
        inner.reset(frame);
        frames.free(paddr, frame);
    }

    /// Mark `npages` frames starting at `paddr` as kernel-owned
    pub fn add_kernel(&self, paddr: u64, npages: usize) {
        let first = addr_to_frame(paddr);
        let mut inner = self.inner.lock();
        inner.entries[first..first + npages].fill(IptEntry::KERNEL);
    }

    /// Free a kernel run and reset its entries, returning frames freed
    pub fn release_kernel(&self, paddr: u64, frames: &FrameAllocator) -> usize {
        let first = addr_to_frame(paddr);
        let mut inner = self.inner.lock();
        let freed = frames.free(paddr, first);
        inner.entries[first..first + freed].fill(IptEntry::FREE);
        freed
    }

    /// Unmap (pid, vaddr) and free its frame
    pub fn remove(&self, pid: Pid, vaddr: u64, frames: &FrameAllocator) -> bool {
        let mut inner = self.inner.lock();
        let Some(frame) = inner.index.delete(pid, vaddr) else {
            return false;
        };
        inner.reset(frame);
        frames.free(frame_to_addr(frame), frame);
        true
    }

    /// Unmap every page of `pid`, returning how many frames were freed
    pub fn remove_all(&self, pid: Pid, frames: &FrameAllocator) -> usize {
        let mut inner = self.inner.lock();
        let mut removed = 0;
        for frame in 0..inner.entries.len() {
            let entry = inner.entries[frame];
            if entry.owner != Owner::Process(pid) {
                continue;
            }
            inner.index.delete(pid, entry.vaddr);
            inner.reset(frame);
            frames.free(frame_to_addr(frame), frame);
            removed += 1;
        }
        inner.cursors.remove(&pid);
        removed
    }

    /// Take one of `pid`'s resident frames, round-robin
    pub fn try_select_victim(
        &self,
        pid: Pid,
        swap: &SwapSpace,
        tlb: &dyn TranslationCache,
    ) -> Option<Victim> {
        let mut inner = self.inner.lock();
        let start = inner.cursors.get(&pid).copied().unwrap_or(0);
        let frame = inner.scan(start, Some(pid))?;

        let next = (frame + 1) % inner.entries.len();
        if inner.cursors.insert(pid, next).is_err() {
            kdebug!("ipt: cursor table full, pid {} restarts its scan", pid);
        }
        Some(inner.claim(frame, swap, tlb))
    }

    /// Take any process's resident frame, round-robin over all frames
    pub fn try_select_any_victim(
        &self,
        swap: &SwapSpace,
        tlb: &dyn TranslationCache,
    ) -> Option<Victim> {
        let mut inner = self.inner.lock();
        let frame = inner.scan(inner.global_cursor, None)?;
        inner.global_cursor = (frame + 1) % inner.entries.len();
        Some(inner.claim(frame, swap, tlb))
    }

    /// Take one of `pid`'s resident frames
    ///
    /// # Panics
    ///
    /// Panics if `pid` owns no evictable frame.
    pub fn select_victim(&self, pid: Pid, swap: &SwapSpace, tlb: &dyn TranslationCache) -> Victim {
        match self.try_select_victim(pid, swap, tlb) {
            Some(victim) => victim,
            None => {
                kerr!("ipt: pid {} has no resident frame to evict", pid);
                panic!("no evictable victim for this process");
            }
        }
    }

    /// Set or clear the Loading status of a process frame
    pub fn set_loading(&self, frame: usize, loading: bool) {
        let mut inner = self.inner.lock();
        let entry = &mut inner.entries[frame];
        if entry.owner == Owner::Free {
            return;
        }
        entry.status = if loading {
            EntryStatus::Loading
        } else {
            EntryStatus::Resident
        };
    }

    pub fn is_loading(&self, frame: usize) -> bool {
        self.inner.lock().entries[frame].status == EntryStatus::Loading
    }

    /// Check whether any frame is Loading: being filled, or a victim
    /// whose contents are still being written out
    pub fn has_loading(&self) -> bool {
        self.inner
            .lock()
            .entries
            .iter()
            .any(|e| e.status == EntryStatus::Loading)
    }

    /// Snapshot of one entry
    pub fn entry(&self, frame: usize) -> IptEntry {
        self.inner.lock().entries[frame]
    }

    /// Frames owned by `pid`
    pub fn resident_count(&self, pid: Pid) -> usize {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|e| e.owner == Owner::Process(pid))
            .count()
    }

    /// Number of index nodes in use
    pub fn mapped_count(&self) -> usize {
        self.inner.lock().index.len()
    }

    /// Check that the entries, the index and the frame map agree
    ///
    /// Returns the first inconsistent frame.
    pub fn audit(&self, frames: &FrameAllocator) -> Result<(), usize> {
        let inner = self.inner.lock();
        let mut owned = 0;
        for (frame, entry) in inner.entries.iter().enumerate() {
            match entry.owner {
                Owner::Process(pid) => {
                    owned += 1;
                    if frames.is_free(frame) || inner.index.search(pid, entry.vaddr) != Some(frame) {
                        return Err(frame);
                    }
                }
                Owner::Kernel => {
                    if frames.is_free(frame) {
                        return Err(frame);
                    }
                }
                Owner::Free => {}
            }
        }
        if owned != inner.index.len() {
            return Err(inner.entries.len());
        }
        Ok(())
    }

    /// Print every owned entry and the hash index
    pub fn dump(&self) {
        let inner = self.inner.lock();
        kdump!("ipt: {} frames", inner.entries.len());
        for (frame, entry) in inner.entries.iter().enumerate() {
            match entry.owner {
                Owner::Free => {}
                Owner::Kernel => kdump!("  {:5} kernel {:?}", frame, entry.status),
                Owner::Process(pid) => kdump!(
                    "  {:5} pid {} {:#x} {:?} {:?}",
                    frame,
                    pid,
                    entry.vaddr,
                    entry.kind,
                    entry.status
                ),
            }
        }
        inner.index.dump();
    }
}
