//! VM Event Counters
//!
//! Every translation miss is accounted exactly once as one of three
//! outcomes (reload, zero-fill, disk load), and every disk load is either
//! an image load or a swap load. [`VmStats::check`] verifies those
//! identities over a snapshot, which makes the counters a cheap
//! consistency test for the fault handler.
//!
//! ## Events
//!
//! - **Miss**: translation cache misses handled by the fault path
//! - **MissFree / MissReplace**: whether the new translation took a free
//!   cache slot or replaced a live one
//! - **Reload**: the page was already resident
//! - **ZeroFill / ImageLoad / SwapLoad**: how a new page got its contents
//! - **SwapStore**: pages written to swap by eviction
//! - **Invalidation**: whole-cache flushes on context switch

use core::sync::atomic::{AtomicU64, Ordering};

use crate::kdump;

// ============================================================================
// Counter Type
// ============================================================================

/// Atomically updated event counter
#[derive(Debug)]
pub struct VmCounter {
    value: AtomicU64,
    name: &'static str,
}

impl VmCounter {
    /// Create a new counter
    pub const fn new(name: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
        }
    }

    /// Increment counter by 1
    #[inline]
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current value
    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Reset to zero
    #[inline]
    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }

    /// Get counter name
    pub fn name(&self) -> &'static str {
        self.name
    }
}

// ============================================================================
// Events
// ============================================================================

/// Event reported by the VM subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmEvent {
    Miss,
    MissFree,
    MissReplace,
    Reload,
    ZeroFill,
    ImageLoad,
    SwapLoad,
    SwapStore,
    DiskLoad,
    Invalidation,
}

impl VmEvent {
    /// All events, in report order
    pub const ALL: [VmEvent; 10] = [
        VmEvent::Miss,
        VmEvent::MissFree,
        VmEvent::MissReplace,
        VmEvent::Invalidation,
        VmEvent::Reload,
        VmEvent::ZeroFill,
        VmEvent::DiskLoad,
        VmEvent::ImageLoad,
        VmEvent::SwapLoad,
        VmEvent::SwapStore,
    ];

    /// Counter name used in the report
    pub const fn name(self) -> &'static str {
        match self {
            VmEvent::Miss => "tlb_faults",
            VmEvent::MissFree => "tlb_faults_with_free",
            VmEvent::MissReplace => "tlb_faults_with_replace",
            VmEvent::Invalidation => "tlb_invalidations",
            VmEvent::Reload => "tlb_reloads",
            VmEvent::ZeroFill => "page_faults_zeroed",
            VmEvent::DiskLoad => "page_faults_disk",
            VmEvent::ImageLoad => "page_faults_from_elf",
            VmEvent::SwapLoad => "page_faults_from_swap",
            VmEvent::SwapStore => "swap_writes",
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Counter identity that a snapshot failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsMismatch {
    /// `miss_free + miss_replace != misses`
    MissSplit,
    /// `reloads + disk_loads + zero_fills != misses`
    MissOutcome,
    /// `image_loads + swap_loads != disk_loads`
    DiskSplit,
}

/// Point-in-time copy of all counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub misses: u64,
    pub miss_free: u64,
    pub miss_replace: u64,
    pub invalidations: u64,
    pub reloads: u64,
    pub zero_fills: u64,
    pub disk_loads: u64,
    pub image_loads: u64,
    pub swap_loads: u64,
    pub swap_stores: u64,
}

impl StatsSnapshot {
    /// Value of one event's counter
    pub fn get(&self, event: VmEvent) -> u64 {
        match event {
            VmEvent::Miss => self.misses,
            VmEvent::MissFree => self.miss_free,
            VmEvent::MissReplace => self.miss_replace,
            VmEvent::Invalidation => self.invalidations,
            VmEvent::Reload => self.reloads,
            VmEvent::ZeroFill => self.zero_fills,
            VmEvent::DiskLoad => self.disk_loads,
            VmEvent::ImageLoad => self.image_loads,
            VmEvent::SwapLoad => self.swap_loads,
            VmEvent::SwapStore => self.swap_stores,
        }
    }

    /// Check the counter identities, returning the first that fails
    pub fn check(&self) -> Result<(), StatsMismatch> {
        if self.miss_free + self.miss_replace != self.misses {
            return Err(StatsMismatch::MissSplit);
        }
        if self.reloads + self.disk_loads + self.zero_fills != self.misses {
            return Err(StatsMismatch::MissOutcome);
        }
        if self.image_loads + self.swap_loads != self.disk_loads {
            return Err(StatsMismatch::DiskSplit);
        }
        Ok(())
    }
}

/// VM event counters
#[derive(Debug)]
pub struct VmStats {
    misses: VmCounter,
    miss_free: VmCounter,
    miss_replace: VmCounter,
    invalidations: VmCounter,
    reloads: VmCounter,
    zero_fills: VmCounter,
    disk_loads: VmCounter,
    image_loads: VmCounter,
    swap_loads: VmCounter,
    swap_stores: VmCounter,
}

impl VmStats {
    pub const fn new() -> Self {
        Self {
            misses: VmCounter::new(VmEvent::Miss.name()),
            miss_free: VmCounter::new(VmEvent::MissFree.name()),
            miss_replace: VmCounter::new(VmEvent::MissReplace.name()),
            invalidations: VmCounter::new(VmEvent::Invalidation.name()),
            reloads: VmCounter::new(VmEvent::Reload.name()),
            zero_fills: VmCounter::new(VmEvent::ZeroFill.name()),
            disk_loads: VmCounter::new(VmEvent::DiskLoad.name()),
            image_loads: VmCounter::new(VmEvent::ImageLoad.name()),
            swap_loads: VmCounter::new(VmEvent::SwapLoad.name()),
            swap_stores: VmCounter::new(VmEvent::SwapStore.name()),
        }
    }

    fn counter(&self, event: VmEvent) -> &VmCounter {
        match event {
            VmEvent::Miss => &self.misses,
            VmEvent::MissFree => &self.miss_free,
            VmEvent::MissReplace => &self.miss_replace,
            VmEvent::Invalidation => &self.invalidations,
            VmEvent::Reload => &self.reloads,
            VmEvent::ZeroFill => &self.zero_fills,
            VmEvent::DiskLoad => &self.disk_loads,
            VmEvent::ImageLoad => &self.image_loads,
            VmEvent::SwapLoad => &self.swap_loads,
            VmEvent::SwapStore => &self.swap_stores,
        }
    }

    /// Record one occurrence of an event
    #[inline]
    pub fn record(&self, event: VmEvent) {
        self.counter(event).inc();
    }

    /// Current value of one event's counter
    pub fn get(&self, event: VmEvent) -> u64 {
        self.counter(event).get()
    }

    /// Take a snapshot of all counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            misses: self.misses.get(),
            miss_free: self.miss_free.get(),
            miss_replace: self.miss_replace.get(),
            invalidations: self.invalidations.get(),
            reloads: self.reloads.get(),
            zero_fills: self.zero_fills.get(),
            disk_loads: self.disk_loads.get(),
            image_loads: self.image_loads.get(),
            swap_loads: self.swap_loads.get(),
            swap_stores: self.swap_stores.get(),
        }
    }

    /// Check the counter identities over a fresh snapshot
    ///
    /// Only meaningful while no fault is in flight.
    pub fn check(&self) -> Result<(), StatsMismatch> {
        self.snapshot().check()
    }

    /// Reset every counter to zero
    pub fn reset(&self) {
        for event in VmEvent::ALL {
            self.counter(event).reset();
        }
    }

    /// Print all counters and the identity check to the console
    pub fn report(&self) {
        kdump!("VM statistics:");
        for event in VmEvent::ALL {
            let counter = self.counter(event);
            kdump!("  {:<24} {}", counter.name(), counter.get());
        }
        match self.check() {
            Ok(()) => kdump!("  counters are consistent"),
            Err(mismatch) => kdump!("  WARNING: counter mismatch {:?}", mismatch),
        }
    }
}

impl Default for VmStats {
    fn default() -> Self {
        Self::new()
    }
}
