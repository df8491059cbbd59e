//! Physical Frame Allocator (core map)
//!
//! Tracks which physical frames are free and serves contiguous runs of
//! frames to the kernel and to the fault handler. Allocation falls through
//! three tiers:
//!
//! 1. **First fit** over the free-frame map (once the allocator is active)
//! 2. **Bump** allocation out of never-touched RAM at the top of memory
//! 3. **Eviction** of a resident user page, for single-frame requests made
//!    on behalf of a process
//!
//! Every frame handed out is zero-filled. The length of each run is
//! recorded at its first frame so `free` can release the whole run.
//!
//! The map and the bump region have separate locks and neither is held
//! while calling the evictor, which takes the page table lock.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use crate::types::{addr_to_frame, frame_to_addr, Pid};
use crate::vm::phys::PhysicalMemory;
use crate::{kdebug, kdump, kerr};

// ============================================================================
// Requests
// ============================================================================

/// Who a frame is being allocated for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requester {
    /// Kernel allocation; never triggers eviction
    Kernel,
    /// Page for a user process; may evict
    Process(Pid),
}

/// Result of an eviction attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eviction {
    /// A frame was freed up; it is still marked allocated (as a single
    /// frame run) and now belongs to the caller
    Frame(usize),
    /// Nothing is evictable right now, but frames are being filled or
    /// written out and will become candidates
    InTransit,
    /// Nothing is evictable and nothing will become so
    NoVictim,
}

/// Last-resort frame source: evicts a resident page
pub trait Evictor {
    /// Free up one frame for `pid`
    fn evict_for(&self, pid: Pid) -> Eviction;
}

// ============================================================================
// Core Map
// ============================================================================

struct CoreMap {
    used: Vec<bool>,
    /// Run length, recorded at the first frame of each allocation
    alloc_size: Vec<usize>,
    free_count: usize,
}

impl CoreMap {
    fn first_fit(&mut self, npages: usize) -> Option<usize> {
        let mut run = 0;
        for i in 0..self.used.len() {
            if self.used[i] {
                run = 0;
                continue;
            }
            run += 1;
            if run == npages {
                let start = i + 1 - npages;
                self.used[start..=i].fill(true);
                self.alloc_size[start] = npages;
                self.free_count -= npages;
                return Some(start);
            }
        }
        None
    }
}

struct BumpRegion {
    next: usize,
    end: usize,
}

/// Physical frame allocator
pub struct FrameAllocator {
    map: Mutex<CoreMap>,
    bump: Mutex<BumpRegion>,
    active: AtomicBool,
    mem: Arc<dyn PhysicalMemory>,
}

impl FrameAllocator {
    /// Create an allocator managing every frame of `mem`, all free
    pub fn new(mem: Arc<dyn PhysicalMemory>) -> Self {
        let total = mem.frame_count();
        Self::with_untouched(mem, total)
    }

    /// Create an allocator whose frames `[managed, total)` are untouched
    /// RAM, reachable only through the bump tier until freed
    pub fn with_untouched(mem: Arc<dyn PhysicalMemory>, managed: usize) -> Self {
        let total = mem.frame_count();
        assert!(managed <= total, "managed frames exceed physical memory");

        let mut used = vec![false; total];
        used[managed..].fill(true);

        Self {
            map: Mutex::new(CoreMap {
                used,
                alloc_size: vec![0; total],
                free_count: managed,
            }),
            bump: Mutex::new(BumpRegion {
                next: managed,
                end: total,
            }),
            active: AtomicBool::new(false),
            mem,
        }
    }

    /// Turn on first-fit reuse, freeing and eviction
    pub fn activate(&self) {
        self.active.store(true, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Total frames of RAM
    pub fn frame_count(&self) -> usize {
        self.map.lock().used.len()
    }

    /// Frames free in the map (excluding the untouched region)
    pub fn free_count(&self) -> usize {
        self.map.lock().free_count
    }

    /// Frames left in the untouched region
    pub fn untouched_count(&self) -> usize {
        let bump = self.bump.lock();
        bump.end - bump.next
    }

    /// Check whether a frame is free in the map
    pub fn is_free(&self, frame: usize) -> bool {
        !self.map.lock().used[frame]
    }

    /// Run length recorded at `frame` (0 if no run starts there)
    pub fn run_length(&self, frame: usize) -> usize {
        self.map.lock().alloc_size[frame]
    }

    /// Allocate `npages` contiguous frames without evicting
    ///
    /// Returns the zero-filled run's physical address.
    pub fn try_allocate(&self, npages: usize) -> Option<u64> {
        assert!(npages > 0, "zero-frame allocation");

        let start = self.first_fit(npages).or_else(|| self.steal(npages))?;
        for frame in start..start + npages {
            self.mem.zero_frame(frame_to_addr(frame));
        }
        Some(frame_to_addr(start))
    }

    fn first_fit(&self, npages: usize) -> Option<usize> {
        if !self.is_active() {
            return None;
        }
        self.map.lock().first_fit(npages)
    }

    fn steal(&self, npages: usize) -> Option<usize> {
        let start = {
            let mut bump = self.bump.lock();
            if bump.end - bump.next < npages {
                return None;
            }
            let start = bump.next;
            bump.next += npages;
            start
        };
        // Untouched frames are already marked used
        self.map.lock().alloc_size[start] = npages;
        Some(start)
    }

    /// Allocate `npages` contiguous zero-filled frames
    ///
    /// Single-frame requests for a process fall back to `evictor` once the
    /// allocator is active, waiting while every candidate victim is in
    /// transit.
    ///
    /// # Panics
    ///
    /// Panics if every tier fails.
    pub fn allocate(
        &self,
        npages: usize,
        requester: Requester,
        evictor: Option<&dyn Evictor>,
    ) -> u64 {
        loop {
            if let Some(paddr) = self.try_allocate(npages) {
                return paddr;
            }

            if npages == 1 && self.is_active() {
                if let (Requester::Process(pid), Some(evictor)) = (requester, evictor) {
                    match self.evict(pid, evictor) {
                        Eviction::Frame(frame) => return frame_to_addr(frame),
                        Eviction::InTransit => {
                            spin_loop();
                            continue;
                        }
                        Eviction::NoVictim => {}
                    }
                }
            }
            self.exhausted(npages, requester);
        }
    }

    /// Allocate one zero-filled frame for a page fault of `pid`
    ///
    /// Returns `None` when memory is full and every candidate victim is in
    /// transit. The page being faulted may have been mapped by another
    /// thread by then, so the caller re-checks it before retrying.
    ///
    /// # Panics
    ///
    /// Panics if memory is full and nothing is evictable.
    pub fn allocate_page(&self, pid: Pid, evictor: &dyn Evictor) -> Option<u64> {
        if let Some(paddr) = self.try_allocate(1) {
            return Some(paddr);
        }
        if !self.is_active() {
            self.exhausted(1, Requester::Process(pid));
        }
        match self.evict(pid, evictor) {
            Eviction::Frame(frame) => Some(frame_to_addr(frame)),
            Eviction::InTransit => None,
            Eviction::NoVictim => self.exhausted(1, Requester::Process(pid)),
        }
    }

    fn evict(&self, pid: Pid, evictor: &dyn Evictor) -> Eviction {
        let eviction = evictor.evict_for(pid);
        if let Eviction::Frame(frame) = eviction {
            self.mem.zero_frame(frame_to_addr(frame));
            kdebug!("coremap: reusing evicted frame {} for pid {}", frame, pid);
        }
        eviction
    }

    fn exhausted(&self, npages: usize, requester: Requester) -> ! {
        kerr!(
            "coremap: cannot allocate {} frame(s) for {:?}, {} free",
            npages,
            requester,
            self.free_count()
        );
        panic!("out of physical memory with no evictable victim");
    }

    /// Release the run that starts at frame `start`
    ///
    /// `paddr` is the run's physical address. Returns the number of frames
    /// freed, which is 0 before the allocator is active (early boot frames
    /// are never reclaimed).
    pub fn free(&self, paddr: u64, start: usize) -> usize {
        if !self.is_active() {
            return 0;
        }
        assert_eq!(
            addr_to_frame(paddr),
            start,
            "free of {:#x} does not match run start {}",
            paddr,
            start
        );

        let mut map = self.map.lock();
        let npages = map.alloc_size[start];
        assert!(npages > 0, "free of unallocated frame {}", start);

        map.alloc_size[start] = 0;
        map.used[start..start + npages].fill(false);
        map.free_count += npages;
        npages
    }

    /// Print the free frame ranges
    pub fn dump(&self) {
        let map = self.map.lock();
        kdump!(
            "coremap: {} of {} frames free",
            map.free_count,
            map.used.len()
        );

        let mut i = 0;
        while i < map.used.len() {
            if map.used[i] {
                i += 1;
                continue;
            }
            let start = i;
            while i < map.used.len() && !map.used[i] {
                i += 1;
            }
            kdump!("  free frames {}..{}", start, i);
        }
    }
}
