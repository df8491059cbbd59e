//! Swap Space
//!
//! A fixed array of page-sized slots on a backing device; slot `i` lives at
//! byte offset `i * PAGE_SIZE`. Each slot records which (pid, page) it
//! holds.
//!
//! Device I/O never happens under the slot table lock. A slot is reserved
//! before its I/O starts and published after it completes:
//!
//! ```text
//!            reserve                write done
//!   Free ──────────────> Writing ──────────────> Occupied
//!    ^                                              │ swap_in claims
//!    └──────────────────── Reading <────────────────┘
//!          read done
//! ```
//!
//! A swap-in that finds its page still `Writing` (or `Reading` by a
//! duplicate) waits for the other side to publish.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::Mutex;
use thiserror::Error;

use crate::types::{trunc_page, Pid, PAGE_SIZE};
use crate::vm::phys::PhysicalMemory;
use crate::{kdump, kerr, kwarn};

// ============================================================================
// Errors
// ============================================================================

/// Swap device errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SwapError {
    /// The device reported a read or write failure
    #[error("swap device I/O error")]
    Io,
    /// The device has not been sized yet
    #[error("swap device not initialized")]
    NotInitialized,
    /// Access past the end of the device
    #[error("swap offset {0:#x} out of range")]
    OutOfRange(u64),
}

pub type SwapResult<T> = Result<T, SwapError>;

// ============================================================================
// Backing Device
// ============================================================================

/// Block store holding the swap slots
pub trait SwapDevice: Send + Sync {
    /// Truncate (or create) the store to exactly `len` bytes
    fn reset(&self, len: u64) -> SwapResult<()>;

    /// Read one page at `offset`
    fn read_page(&self, offset: u64, buf: &mut [u8; PAGE_SIZE]) -> SwapResult<()>;

    /// Write one page at `offset`
    fn write_page(&self, offset: u64, buf: &[u8; PAGE_SIZE]) -> SwapResult<()>;
}

/// Swap device held in kernel memory
#[derive(Debug, Default)]
pub struct MemSwapDevice {
    store: Mutex<Vec<u8>>,
    reads: AtomicU64,
    writes: AtomicU64,
    failing: AtomicBool,
}

impl MemSwapDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent transfer fail with [`SwapError::Io`]
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Pages read so far
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Pages written so far
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Current store size in bytes
    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self, store: &[u8], offset: u64) -> SwapResult<usize> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SwapError::Io);
        }
        if store.is_empty() {
            return Err(SwapError::NotInitialized);
        }
        let start = offset as usize;
        if offset % PAGE_SIZE as u64 != 0 || start + PAGE_SIZE > store.len() {
            return Err(SwapError::OutOfRange(offset));
        }
        Ok(start)
    }
}

impl SwapDevice for MemSwapDevice {
    fn reset(&self, len: u64) -> SwapResult<()> {
        let mut store = self.store.lock();
        store.clear();
        store.resize(len as usize, 0);
        Ok(())
    }

    fn read_page(&self, offset: u64, buf: &mut [u8; PAGE_SIZE]) -> SwapResult<()> {
        let store = self.store.lock();
        let start = self.check(&store, offset)?;
        buf.copy_from_slice(&store[start..start + PAGE_SIZE]);
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn write_page(&self, offset: u64, buf: &[u8; PAGE_SIZE]) -> SwapResult<()> {
        let mut store = self.store.lock();
        let start = self.check(&store, offset)?;
        store[start..start + PAGE_SIZE].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Slot Table
// ============================================================================

/// State of one swap slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    /// Reserved, page write in flight; `orphaned` once the owner has exited
    Writing { pid: Pid, vaddr: u64, orphaned: bool },
    /// Holds a page
    Occupied { pid: Pid, vaddr: u64 },
    /// Claimed by a reader, read in flight; `orphaned` once the owner has
    /// exited
    Reading { pid: Pid, vaddr: u64, orphaned: bool },
}

impl SlotState {
    /// Page held for a live owner
    fn key(&self) -> Option<(Pid, u64)> {
        match *self {
            SlotState::Writing { pid, vaddr, orphaned: false }
            | SlotState::Occupied { pid, vaddr }
            | SlotState::Reading { pid, vaddr, orphaned: false } => Some((pid, vaddr)),
            _ => None,
        }
    }
}

/// A slot reserved for a page write
///
/// Must be handed to [`SwapSpace::write_reserved`].
#[derive(Debug, PartialEq, Eq)]
pub struct SlotReservation {
    slot: usize,
    pid: Pid,
    vaddr: u64,
}

impl SlotReservation {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn vaddr(&self) -> u64 {
        self.vaddr
    }
}

/// Result of a swap-out request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapOut {
    /// Code pages are reloaded from the executable, never swapped
    Skipped,
    /// Page written to the given slot
    Stored { slot: usize },
}

/// Result of a swap-in request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapIn {
    /// The page has never been swapped out
    NotInSwap,
    /// The page was read back and its slot freed
    Loaded,
}

struct SwapTable {
    slots: Vec<SlotState>,
    /// Free slot stack
    free: Vec<usize>,
}

impl SwapTable {
    fn find(&self, pid: Pid, vaddr: u64) -> Option<usize> {
        self.slots.iter().position(|s| s.key() == Some((pid, vaddr)))
    }

    fn release(&mut self, slot: usize) {
        self.slots[slot] = SlotState::Free;
        self.free.push(slot);
    }

    /// End the read of a claimed slot
    ///
    /// The slot is published again if `keep` is set, unless its owner
    /// exited during the read; otherwise it is freed.
    fn finish_read(&mut self, slot: usize, keep: bool) {
        match self.slots[slot] {
            SlotState::Reading {
                pid,
                vaddr,
                orphaned: false,
            } if keep => self.slots[slot] = SlotState::Occupied { pid, vaddr },
            _ => self.release(slot),
        }
    }

    fn has_writes_in_flight(&self, pid: Pid) -> bool {
        self.slots
            .iter()
            .any(|s| matches!(*s, SlotState::Writing { pid: p, .. } if p == pid))
    }
}

/// Swap slot manager
pub struct SwapSpace {
    table: Mutex<SwapTable>,
    device: Arc<dyn SwapDevice>,
    mem: Arc<dyn PhysicalMemory>,
}

const fn slot_offset(slot: usize) -> u64 {
    (slot * PAGE_SIZE) as u64
}

impl SwapSpace {
    /// Create a swap space of `slots` slots, truncating the device to fit
    pub fn new(
        slots: usize,
        device: Arc<dyn SwapDevice>,
        mem: Arc<dyn PhysicalMemory>,
    ) -> SwapResult<Self> {
        device.reset(slot_offset(slots))?;
        Ok(Self {
            table: Mutex::new(SwapTable {
                slots: vec![SlotState::Free; slots],
                free: (0..slots).rev().collect(),
            }),
            device,
            mem,
        })
    }

    /// Reserve a slot for the page (pid, vaddr)
    ///
    /// # Panics
    ///
    /// Panics if every slot is in use.
    pub fn reserve(&self, pid: Pid, vaddr: u64) -> SlotReservation {
        let vaddr = trunc_page(vaddr);
        let mut table = self.table.lock();
        let Some(slot) = table.free.pop() else {
            kerr!("swap: no free slot for pid {} page {:#x}", pid, vaddr);
            panic!("out of swap space");
        };
        table.slots[slot] = SlotState::Writing {
            pid,
            vaddr,
            orphaned: false,
        };
        SlotReservation { slot, pid, vaddr }
    }

    /// Write the frame at `paddr` into a reserved slot and publish it
    ///
    /// On failure the slot is freed again.
    pub fn write_reserved(&self, reservation: SlotReservation, paddr: u64) -> SwapResult<usize> {
        let SlotReservation { slot, .. } = reservation;

        let mut page = [0u8; PAGE_SIZE];
        self.mem.read_frame(paddr, &mut page);
        let result = self.device.write_page(slot_offset(slot), &page);

        let mut table = self.table.lock();
        match (result, table.slots[slot]) {
            (Ok(()), SlotState::Writing { pid, vaddr, orphaned: false }) => {
                table.slots[slot] = SlotState::Occupied { pid, vaddr };
            }
            (Ok(()), _) => table.release(slot),
            (Err(err), _) => {
                table.release(slot);
                kerr!("swap: write of slot {} failed: {}", slot, err);
                return Err(err);
            }
        }
        Ok(slot)
    }

    /// Write a page out to swap
    ///
    /// Code pages are skipped. Panics if no slot is free.
    pub fn swap_out(&self, paddr: u64, vaddr: u64, is_code: bool, owner: Pid) -> SwapResult<SwapOut> {
        if is_code {
            return Ok(SwapOut::Skipped);
        }
        let reservation = self.reserve(owner, vaddr);
        let slot = self.write_reserved(reservation, paddr)?;
        Ok(SwapOut::Stored { slot })
    }

    /// Claim the slot holding (pid, vaddr) for reading
    fn claim(&self, pid: Pid, vaddr: u64) -> Option<usize> {
        loop {
            {
                let mut table = self.table.lock();
                let slot = table.find(pid, vaddr)?;
                if let SlotState::Occupied { pid, vaddr } = table.slots[slot] {
                    table.slots[slot] = SlotState::Reading {
                        pid,
                        vaddr,
                        orphaned: false,
                    };
                    return Some(slot);
                }
            }
            // Writing or Reading: another thread publishes soon
            core::hint::spin_loop();
        }
    }

    /// Read the page (pid, vaddr) back into the frame at `paddr`
    ///
    /// On success the slot is freed. On a device error the page stays in
    /// swap.
    pub fn swap_in(&self, pid: Pid, vaddr: u64, paddr: u64) -> SwapResult<SwapIn> {
        let vaddr = trunc_page(vaddr);
        let Some(slot) = self.claim(pid, vaddr) else {
            return Ok(SwapIn::NotInSwap);
        };

        let mut page = [0u8; PAGE_SIZE];
        let result = self.device.read_page(slot_offset(slot), &mut page);

        let mut table = self.table.lock();
        match result {
            Ok(()) => {
                self.mem.write_frame(paddr, 0, &page);
                table.finish_read(slot, false);
                Ok(SwapIn::Loaded)
            }
            Err(err) => {
                table.finish_read(slot, true);
                kerr!("swap: read of slot {} failed: {}", slot, err);
                Err(err)
            }
        }
    }

    /// Free every slot owned by `pid`, returning how many were freed
    ///
    /// Slots with I/O in flight are orphaned and freed when it completes.
    pub fn free_process(&self, pid: Pid) -> usize {
        let mut table = self.table.lock();
        let mut freed = 0;
        for slot in 0..table.slots.len() {
            match table.slots[slot] {
                SlotState::Occupied { pid: owner, .. } if owner == pid => {
                    table.release(slot);
                    freed += 1;
                }
                SlotState::Writing { pid: owner, vaddr, .. } if owner == pid => {
                    table.slots[slot] = SlotState::Writing {
                        pid,
                        vaddr,
                        orphaned: true,
                    };
                }
                SlotState::Reading { pid: owner, vaddr, .. } if owner == pid => {
                    table.slots[slot] = SlotState::Reading {
                        pid,
                        vaddr,
                        orphaned: true,
                    };
                }
                _ => {}
            }
        }
        freed
    }

    /// Copy every swapped page of `old` into new slots owned by `new`
    ///
    /// Returns the number of pages copied.
    pub fn duplicate(&self, old: Pid, new: Pid) -> SwapResult<usize> {
        // Wait for evictions of the parent's pages to land
        let pages: Vec<u64> = loop {
            {
                let table = self.table.lock();
                if !table.has_writes_in_flight(old) {
                    break table
                        .slots
                        .iter()
                        .filter_map(|s| match *s {
                            SlotState::Occupied { pid, vaddr } if pid == old => Some(vaddr),
                            _ => None,
                        })
                        .collect();
                }
            }
            core::hint::spin_loop();
        };

        let mut page = [0u8; PAGE_SIZE];
        for &vaddr in &pages {
            let Some(src) = self.claim(old, vaddr) else {
                continue;
            };
            let dst = self.reserve(new, vaddr);
            let dst_slot = dst.slot;

            let result = self
                .device
                .read_page(slot_offset(src), &mut page)
                .and_then(|()| self.device.write_page(slot_offset(dst_slot), &page));

            let mut table = self.table.lock();
            table.finish_read(src, true);
            match (result, table.slots[dst_slot]) {
                (Ok(()), SlotState::Writing { orphaned: false, .. }) => {
                    table.slots[dst_slot] = SlotState::Occupied { pid: new, vaddr };
                }
                (Ok(()), _) => table.release(dst_slot),
                (Err(err), _) => {
                    table.release(dst_slot);
                    kwarn!("swap: duplicate of pid {} page {:#x} failed: {}", old, vaddr, err);
                    return Err(err);
                }
            }
        }
        Ok(pages.len())
    }

    /// Slot holding (pid, vaddr), in any non-free state
    pub fn lookup(&self, pid: Pid, vaddr: u64) -> Option<usize> {
        self.table.lock().find(pid, trunc_page(vaddr))
    }

    /// State of one slot
    pub fn slot_state(&self, slot: usize) -> SlotState {
        self.table.lock().slots[slot]
    }

    /// Total slots
    pub fn slot_count(&self) -> usize {
        self.table.lock().slots.len()
    }

    pub fn free_slots(&self) -> usize {
        self.table.lock().free.len()
    }

    /// Slots holding a page
    pub fn occupied_count(&self) -> usize {
        self.table
            .lock()
            .slots
            .iter()
            .filter(|s| matches!(s, SlotState::Occupied { .. }))
            .count()
    }

    /// Slots owned by `pid` in any state
    pub fn occupied_by(&self, pid: Pid) -> usize {
        self.table
            .lock()
            .slots
            .iter()
            .filter(|s| matches!(s.key(), Some((p, _)) if p == pid))
            .count()
    }

    /// Print every non-free slot
    pub fn dump(&self) {
        let table = self.table.lock();
        kdump!(
            "swap: {} of {} slots free",
            table.free.len(),
            table.slots.len()
        );
        for (slot, state) in table.slots.iter().enumerate() {
            if *state != SlotState::Free {
                kdump!("  slot {:4} @ {:#09x}: {:?}", slot, slot_offset(slot), state);
            }
        }
    }
}
