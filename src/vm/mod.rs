//! Virtual Memory Subsystem
//!
//! Demand paging over an inverted page table with swapping. All state
//! lives in one [`Vm`] context built at boot:
//!
//! - [`coremap`]: physical frame allocator
//! - [`ipt`] / [`ipt_hash`]: frame ownership and reverse lookup
//! - [`swapfile`]: swap slots on a backing device
//! - [`tlb`]: the translation cache the fault handler refills
//! - [`fault`]: the page fault handler
//!
//! ## Lock order
//!
//! page table -> frame allocator -> swap space. The translation cache and
//! console locks are leaves. Device I/O never happens under a table lock.

pub mod config;
pub mod coremap;
pub mod fault;
pub mod ipt;
pub mod ipt_hash;
pub mod phys;
pub mod segments;
pub mod stats;
pub mod swapfile;
pub mod tlb;

use alloc::sync::Arc;
use thiserror::Error;

use crate::console;
use crate::types::Pid;
use crate::{kdebug, kfatal, kinfo, ktrace};

pub use config::{ConfigError, EvictionScope, VmConfig};
pub use coremap::{Eviction, Evictor, FrameAllocator, Requester};
pub use fault::{FaultError, FaultOutcome, FaultType, VmResult};
pub use ipt::{EntryStatus, InvertedPageTable, IptEntry, Lookup, Owner, Victim};
pub use ipt_hash::HashIndex;
pub use phys::{PhysicalMemory, RamImage};
pub use segments::{AddressSpace, ExecutableImage, ImageError, MemoryImage, Process, Segment, SegmentKind};
pub use stats::{StatsMismatch, StatsSnapshot, VmEvent, VmStats};
pub use swapfile::{MemSwapDevice, SwapDevice, SwapError, SwapIn, SwapOut, SwapResult, SwapSpace};
pub use tlb::{SoftTlb, TlbEntry, TlbInstall, TranslationCache};

/// Errors bringing up the VM subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InitError {
    #[error("invalid VM configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("swap space initialization failed: {0}")]
    Swap(#[from] SwapError),
}

/// The VM subsystem context
pub struct Vm {
    config: VmConfig,
    mem: Arc<dyn PhysicalMemory>,
    frames: FrameAllocator,
    ipt: InvertedPageTable,
    swap: SwapSpace,
    tlb: Arc<dyn TranslationCache>,
    stats: VmStats,
}

impl Vm {
    /// Boot-time bring-up: register the console sink, apply the
    /// configured log level, then build the VM context
    ///
    /// The console is global, so this is called once by the boot path.
    /// [`Vm::new`] leaves the console untouched.
    pub fn boot(
        config: VmConfig,
        mem: Arc<dyn PhysicalMemory>,
        swap_device: Arc<dyn SwapDevice>,
        sink: Option<console::Sink>,
    ) -> Result<Self, InitError> {
        if let Some(sink) = sink {
            console::set_sink(sink);
        }
        console::set_max_level(config.log_level);
        Self::new(config, mem, swap_device)
    }

    /// Bring up the VM subsystem with a software translation cache
    pub fn new(
        config: VmConfig,
        mem: Arc<dyn PhysicalMemory>,
        swap_device: Arc<dyn SwapDevice>,
    ) -> Result<Self, InitError> {
        config.validate(mem.frame_count())?;
        let tlb = Arc::new(SoftTlb::new(config.tlb_entries));
        Self::with_tlb(config, mem, swap_device, tlb)
    }

    /// Bring up the VM subsystem over a given translation cache
    pub fn with_tlb(
        config: VmConfig,
        mem: Arc<dyn PhysicalMemory>,
        swap_device: Arc<dyn SwapDevice>,
        tlb: Arc<dyn TranslationCache>,
    ) -> Result<Self, InitError> {
        let total = mem.frame_count();
        config.validate(total)?;

        let managed = total - config.untouched_frames;
        let frames = FrameAllocator::with_untouched(mem.clone(), managed);
        let swap = SwapSpace::new(config.swap_slots, swap_device, mem.clone())?;
        let ipt = InvertedPageTable::new(total);
        frames.activate();

        kinfo!(
            "vm: {} frames ({} untouched), {} swap slots ({} KiB), eviction {:?}",
            total,
            config.untouched_frames,
            config.swap_slots,
            config.swap_bytes() / 1024,
            config.eviction_scope
        );

        Ok(Self {
            config,
            mem,
            frames,
            ipt,
            swap,
            tlb,
            stats: VmStats::new(),
        })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn mem(&self) -> &Arc<dyn PhysicalMemory> {
        &self.mem
    }

    pub fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    pub fn ipt(&self) -> &InvertedPageTable {
        &self.ipt
    }

    pub fn swap(&self) -> &SwapSpace {
        &self.swap
    }

    pub fn tlb(&self) -> &dyn TranslationCache {
        &*self.tlb
    }

    pub fn stats(&self) -> &VmStats {
        &self.stats
    }

    /// Address space with the configured user stack
    pub fn address_space(&self, code: Segment, data: Segment) -> AddressSpace {
        AddressSpace::new(code, data, self.config.stack_segment())
    }

    // ========================================================================
    // Process lifecycle
    // ========================================================================

    /// Context switch to `pid`: flush the untagged translation cache
    pub fn activate(&self, pid: Pid) {
        self.tlb.invalidate_all();
        self.stats.record(VmEvent::Invalidation);
        ktrace!("vm: switched to pid {}", pid);
    }

    /// Release every frame and swap slot of an exiting process
    ///
    /// Returns `(frames, slots)` freed.
    pub fn on_process_exit(&self, pid: Pid) -> (usize, usize) {
        let frames = self.ipt.remove_all(pid, &self.frames);
        let slots = self.swap.free_process(pid);
        kdebug!("vm: pid {} exited, freed {} frames and {} swap slots", pid, frames, slots);
        (frames, slots)
    }

    /// Give a forked child its own copy of the parent's swapped pages
    pub fn on_process_fork(&self, parent: Pid, child: Pid) -> Result<usize, SwapError> {
        let copied = self.swap.duplicate(parent, child)?;
        kdebug!("vm: pid {} forked to {}, {} swapped pages copied", parent, child, copied);
        Ok(copied)
    }

    // ========================================================================
    // Kernel pages
    // ========================================================================

    /// Allocate `npages` contiguous zeroed kernel frames
    ///
    /// Kernel allocations never evict; exhaustion is fatal.
    pub fn alloc_kpages(&self, npages: usize) -> u64 {
        let paddr = self.frames.allocate(npages, Requester::Kernel, None);
        self.ipt.add_kernel(paddr, npages);
        paddr
    }

    /// Free a run returned by [`alloc_kpages`](Self::alloc_kpages)
    pub fn free_kpages(&self, paddr: u64) -> usize {
        self.ipt.release_kernel(paddr, &self.frames)
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// Check page table, index and frame map consistency
    pub fn audit(&self) -> Result<(), usize> {
        self.ipt.audit(&self.frames)
    }

    /// Print the event counters
    pub fn report(&self) {
        self.stats.report();
    }

    /// Print every table
    pub fn dump(&self) {
        self.frames.dump();
        self.ipt.dump();
        self.swap.dump();
    }
}

impl Evictor for Vm {
    fn evict_for(&self, pid: Pid) -> Eviction {
        let tlb = &*self.tlb;
        let scope = self.config.eviction_scope;
        let victim = match scope {
            EvictionScope::Process => self.ipt.try_select_victim(pid, &self.swap, tlb),
            EvictionScope::ProcessThenSystem => self
                .ipt
                .try_select_victim(pid, &self.swap, tlb)
                .or_else(|| self.ipt.try_select_any_victim(&self.swap, tlb)),
        };

        let victim = match victim {
            Some(victim) => victim,
            // A frame being filled or written out becomes a candidate
            None if self.ipt.has_loading() => return Eviction::InTransit,
            None if scope == EvictionScope::Process => {
                self.ipt.select_victim(pid, &self.swap, tlb)
            }
            None => return Eviction::NoVictim,
        };

        // The frame is Kernel-owned and Loading now, so the write can run
        // without the page table lock
        if let Some(slot) = victim.slot {
            if let Err(err) = self.swap.write_reserved(slot, victim.paddr) {
                kfatal!(
                    "vm: cannot write pid {} page {:#x} to swap: {}",
                    victim.pid,
                    victim.vaddr,
                    err
                );
                panic!("swap write failed during eviction");
            }
            self.stats.record(VmEvent::SwapStore);
        }

        kdebug!(
            "vm: frame {} taken from pid {} for pid {}",
            victim.frame,
            victim.pid,
            pid
        );
        Eviction::Frame(victim.frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::LogLevel;

    fn vm(frames: usize, config: VmConfig) -> Vm {
        Vm::new(
            config,
            Arc::new(RamImage::new(frames)),
            Arc::new(MemSwapDevice::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_init_rejects_bad_config() {
        let result = Vm::new(
            VmConfig::new().with_tlb_entries(0),
            Arc::new(RamImage::new(4)),
            Arc::new(MemSwapDevice::new()),
        );
        assert!(matches!(result, Err(InitError::Config(ConfigError::NoTlbEntries))));
    }

    #[test]
    fn test_kernel_pages() {
        let vm = vm(8, VmConfig::new().with_swap_slots(4));
        let paddr = vm.alloc_kpages(3);
        assert_eq!(vm.ipt().entry(0).owner, Owner::Kernel);
        assert_eq!(vm.frames().free_count(), 5);
        assert_eq!(vm.audit(), Ok(()));

        assert_eq!(vm.free_kpages(paddr), 3);
        assert_eq!(vm.frames().free_count(), 8);
        assert_eq!(vm.ipt().entry(2), IptEntry::FREE);
    }

    #[test]
    fn test_untouched_frames_served_last() {
        let vm = vm(4, VmConfig::new().with_swap_slots(4).with_untouched_frames(2));
        assert_eq!(vm.alloc_kpages(2), 0);
        assert_eq!(vm.alloc_kpages(1), 0x2000);
        assert_eq!(vm.frames().untouched_count(), 1);
    }

    #[test]
    fn test_activate_flushes_tlb() {
        let vm = vm(2, VmConfig::new().with_swap_slots(2));
        vm.tlb().install(0x1000, 0, true);
        vm.activate(Pid(3));
        assert!(vm.tlb().probe(0x1000).is_none());
        assert_eq!(vm.stats().get(VmEvent::Invalidation), 1);
    }

    #[test]
    fn test_evict_for_writes_victim_to_swap() {
        let vm = vm(2, VmConfig::new().with_swap_slots(4));
        let paddr = vm.frames().allocate(1, Requester::Process(Pid(1)), None);
        vm.ipt().add(Pid(1), paddr, 0x5000, SegmentKind::Data).unwrap();
        vm.ipt().set_loading(0, false);

        assert_eq!(vm.evict_for(Pid(2)), Eviction::Frame(0));
        assert_eq!(vm.swap().occupied_by(Pid(1)), 1);
        assert_eq!(vm.stats().get(VmEvent::SwapStore), 1);
        assert_eq!(vm.ipt().lookup(Pid(1), 0x5000), None);
    }

    #[test]
    fn test_evict_for_without_user_frames() {
        let vm = vm(2, VmConfig::new().with_swap_slots(4));
        assert_eq!(vm.evict_for(Pid(2)), Eviction::NoVictim);
    }

    #[test]
    fn test_evict_for_waits_on_frames_in_transit() {
        let vm = vm(2, VmConfig::new().with_swap_slots(4));
        let paddr = vm.frames().allocate(1, Requester::Process(Pid(1)), None);
        vm.ipt().add(Pid(1), paddr, 0x5000, SegmentKind::Data).unwrap();
        assert_eq!(vm.evict_for(Pid(2)), Eviction::InTransit);

        vm.ipt().set_loading(0, false);
        assert_eq!(vm.evict_for(Pid(2)), Eviction::Frame(0));
        // The victim frame itself is in transit until re-added
        assert_eq!(vm.evict_for(Pid(2)), Eviction::InTransit);
    }

    #[test]
    fn test_new_leaves_console_filter_alone() {
        let _vm = vm(2, VmConfig::new().with_swap_slots(4).with_log_level(LogLevel::Trace));
        assert_ne!(console::max_level(), LogLevel::Trace);
    }

    #[test]
    fn test_boot_applies_log_level() {
        let vm = Vm::boot(
            VmConfig::new().with_swap_slots(4).with_log_level(LogLevel::Debug),
            Arc::new(RamImage::new(2)),
            Arc::new(MemSwapDevice::new()),
            None,
        )
        .unwrap();
        assert_eq!(console::max_level(), LogLevel::Debug);
        assert_eq!(vm.frames().free_count(), 2);
    }

    #[test]
    #[should_panic(expected = "no evictable victim for this process")]
    fn test_strict_scope_is_fatal() {
        let config = VmConfig::new()
            .with_swap_slots(4)
            .with_eviction_scope(EvictionScope::Process);
        let vm = vm(2, config);
        let paddr = vm.frames().allocate(1, Requester::Process(Pid(1)), None);
        vm.ipt().add(Pid(1), paddr, 0x5000, SegmentKind::Data).unwrap();
        vm.ipt().set_loading(0, false);
        vm.evict_for(Pid(2));
    }

    #[test]
    #[should_panic(expected = "swap write failed during eviction")]
    fn test_eviction_write_error_is_fatal() {
        let device = Arc::new(MemSwapDevice::new());
        let vm = Vm::new(
            VmConfig::new().with_swap_slots(4),
            Arc::new(RamImage::new(1)),
            device.clone(),
        )
        .unwrap();
        let paddr = vm.frames().allocate(1, Requester::Process(Pid(1)), None);
        vm.ipt().add(Pid(1), paddr, 0x5000, SegmentKind::Stack).unwrap();
        vm.ipt().set_loading(0, false);

        device.set_failing(true);
        vm.evict_for(Pid(1));
    }
}
