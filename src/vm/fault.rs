//! VM Fault - Page Fault Handling
//!
//! Invoked on every translation cache miss. A miss on a resident page is a
//! plain reload; otherwise a frame is allocated (evicting if memory is
//! full), registered in the page table as Loading, and filled:
//!
//! - **Swap-in**: the page was evicted earlier
//! - **Image load**: first touch of a code or data page; file bytes are
//!   copied in and the rest of the page stays zero
//! - **Zero-fill**: first touch of a stack page
//!
//! Code pages are mapped read-only once loaded. A write to one arrives as
//! a [`FaultType::ReadOnly`] fault and terminates the process.

use core::hint::spin_loop;
use thiserror::Error;

use crate::types::{addr_to_frame, trunc_page, PAGE_SIZE};
use crate::vm::ipt::Lookup;
use crate::vm::segments::{ImageError, Process, SegmentKind};
use crate::vm::stats::VmEvent;
use crate::vm::swapfile::{SwapError, SwapIn};
use crate::vm::tlb::TlbInstall;
use crate::vm::Vm;
use crate::{kerr, ktrace, kwarn};

// ============================================================================
// Fault Types
// ============================================================================

/// Fault type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultType {
    /// Read miss
    Read,
    /// Write miss
    Write,
    /// Write to a page mapped read-only
    ReadOnly,
}

/// How a fault was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Page was resident; translation reloaded
    Reloaded,
    /// New stack page
    ZeroFilled,
    /// Page read from the executable
    ImageLoaded,
    /// Page read back from swap
    SwappedIn,
}

/// Faults the kernel resolves by terminating the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FaultError {
    /// Address outside every segment
    #[error("access violation at {0:#x}")]
    AccessViolation(u64),
    /// Write to a read-only (code) page
    #[error("write to read-only page at {0:#x}")]
    ReadOnly(u64),
    /// The executable could not supply the page
    #[error("cannot load page from executable: {0}")]
    Image(#[from] ImageError),
    /// The page could not be read back from swap
    #[error("cannot read page from swap: {0}")]
    Swap(#[from] SwapError),
}

pub type VmResult<T> = Result<T, FaultError>;

// ============================================================================
// Fault Handler
// ============================================================================

impl Vm {
    /// Resolve a fault at `addr` in `process`
    ///
    /// On `Err` the caller terminates the process; the kernel carries on.
    pub fn fault(&self, process: &Process, fault_type: FaultType, addr: u64) -> VmResult<FaultOutcome> {
        let pid = process.pid;
        if fault_type == FaultType::ReadOnly {
            kwarn!("vm: pid {} wrote read-only page at {:#x}", pid, addr);
            return Err(FaultError::ReadOnly(addr));
        }
        let Some(kind) = process.aspace.classify(addr) else {
            kwarn!("vm: pid {} {:?} fault outside its segments at {:#x}", pid, fault_type, addr);
            return Err(FaultError::AccessViolation(addr));
        };
        let vpage = trunc_page(addr);

        let paddr = loop {
            match self.ipt.map_resident(pid, vpage, &*self.tlb) {
                Lookup::Mapped { install, .. } => {
                    self.record_miss(install);
                    self.stats.record(VmEvent::Reload);
                    return Ok(FaultOutcome::Reloaded);
                }
                Lookup::Loading { frame } => {
                    // Another thread is filling the page
                    while self.ipt.is_loading(frame) {
                        spin_loop();
                    }
                    continue;
                }
                Lookup::Absent => {}
            }

            // Memory full with every victim in transit: another fault may be
            // bringing this very page in, so look it up again
            let Some(paddr) = self.frames.allocate_page(pid, self) else {
                spin_loop();
                continue;
            };
            match self.ipt.add(pid, paddr, vpage, kind) {
                Ok(()) => break paddr,
                // Lost the race to another fault on the same page
                Err(_) => self.ipt.discard(paddr, &self.frames),
            }
        };

        let install = self.tlb.install(vpage, paddr, true);
        let outcome = match self.fill(process, kind, vpage, paddr) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.tlb.invalidate(vpage);
                self.ipt.remove(pid, vpage, &self.frames);
                kerr!("vm: pid {} page {:#x}: {}", pid, vpage, err);
                return Err(err);
            }
        };

        // Downgrade while still Loading so the page cannot be evicted and
        // remapped writable in between
        if kind == SegmentKind::Code {
            self.tlb.install(vpage, paddr, false);
        }
        self.ipt.set_loading(addr_to_frame(paddr), false);

        self.record_miss(install);
        ktrace!("vm: pid {} {} page {:#x} {:?}", pid, kind.name(), vpage, outcome);
        Ok(outcome)
    }

    /// Fill a freshly allocated, zeroed frame with the page's contents
    fn fill(&self, process: &Process, kind: SegmentKind, vpage: u64, paddr: u64) -> VmResult<FaultOutcome> {
        if kind != SegmentKind::Code && self.swap.swap_in(process.pid, vpage, paddr)? == SwapIn::Loaded {
            self.stats.record(VmEvent::SwapLoad);
            self.stats.record(VmEvent::DiskLoad);
            return Ok(FaultOutcome::SwappedIn);
        }

        match kind {
            SegmentKind::Stack => {
                self.stats.record(VmEvent::ZeroFill);
                Ok(FaultOutcome::ZeroFilled)
            }
            SegmentKind::Code | SegmentKind::Data => {
                self.load_from_image(process, kind, vpage, paddr)?;
                self.stats.record(VmEvent::ImageLoad);
                self.stats.record(VmEvent::DiskLoad);
                Ok(FaultOutcome::ImageLoaded)
            }
        }
    }

    /// Copy the file-backed bytes of one page into its frame
    ///
    /// Handles a segment starting mid-page, a partial last page, and pages
    /// wholly past the file-backed part (left zero).
    fn load_from_image(&self, process: &Process, kind: SegmentKind, vpage: u64, paddr: u64) -> VmResult<()> {
        let segment = process.aspace.segment(kind);
        let Some((page_offset, file_offset, len)) = segment.file_extent(vpage) else {
            return Ok(());
        };

        let mut buf = [0u8; PAGE_SIZE];
        process.image.read_segment(kind, file_offset, &mut buf[..len])?;
        self.mem.write_frame(paddr, page_offset, &buf[..len]);
        Ok(())
    }

    fn record_miss(&self, install: TlbInstall) {
        self.stats.record(VmEvent::Miss);
        match install {
            TlbInstall::Free | TlbInstall::Refreshed => self.stats.record(VmEvent::MissFree),
            TlbInstall::Replaced => self.stats.record(VmEvent::MissReplace),
        }
    }
}
