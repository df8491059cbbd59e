//! End-to-end tests of the VM subsystem
//!
//! Each test builds an independent `Vm` over host RAM and an in-memory
//! swap device, then drives it through the fault handler and the process
//! lifecycle hooks.

mod common;

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use common::*;
use ipt_vm::vm::{
    AddressSpace, EvictionScope, Evictor, FaultError, FaultOutcome, FaultType, FrameAllocator,
    Owner, PhysicalMemory, Process, RamImage, Requester, Segment, SegmentKind, SwapIn, VmConfig,
    VmEvent,
};
use ipt_vm::{Pid, PAGE_SIZE};

fn config() -> VmConfig {
    VmConfig::new().with_swap_slots(32).with_tlb_entries(8)
}

/// Fault `addr` from two threads released together
fn race_faults(t: &TestVm, p: &Process, fault_type: FaultType, addr: u64) -> Vec<FaultOutcome> {
    let barrier = Barrier::new(2);
    thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    t.vm.fault(p, fault_type, addr)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect()
    })
}

// ════════════════════════════════════════════════════════════
// Allocation and Eviction
// ════════════════════════════════════════════════════════════

#[test]
fn first_allocation_takes_frame_zero() {
    let frames = FrameAllocator::new(Arc::new(RamImage::new(4)));
    frames.activate();

    assert_eq!(frames.allocate(1, Requester::Kernel, None), 0);
    assert!(!frames.is_free(0));
    for frame in 1..4 {
        assert!(frames.is_free(frame));
    }
    assert_eq!(frames.free_count(), 3);
}

#[test]
fn single_frame_is_evicted_for_another_process() {
    let t = test_vm(1, config());
    let vm = &t.vm;
    let evictor: &dyn Evictor = vm;

    let paddr = vm.frames().allocate(1, Requester::Process(Pid(7)), Some(evictor));
    t.ram.write_frame(paddr, 0, &[0x5A; PAGE_SIZE]);
    vm.ipt().add(Pid(7), paddr, 0x1000, SegmentKind::Data).unwrap();
    vm.ipt().set_loading(0, false);

    let reused = vm.frames().allocate(1, Requester::Process(Pid(9)), Some(evictor));
    assert_eq!(reused, paddr);
    assert_eq!(vm.swap().occupied_by(Pid(7)), 1);
    assert_eq!(vm.swap().occupied_count(), 1);
    assert_eq!(vm.ipt().lookup(Pid(7), 0x1000), None);
    assert!(t.frame_bytes(reused).iter().all(|&b| b == 0));

    // The evicted contents come back intact
    assert_eq!(vm.swap().swap_in(Pid(7), 0x1000, reused), Ok(SwapIn::Loaded));
    assert!(t.frame_bytes(reused).iter().all(|&b| b == 0x5A));
}

#[test]
fn evicted_page_faults_back_from_swap() {
    let t = test_vm(1, config());
    let owner = t.process(7);
    let other = t.process(9);
    let data = owner.aspace.data.base();

    assert_eq!(
        t.vm.fault(&owner, FaultType::Write, data),
        Ok(FaultOutcome::ImageLoaded)
    );
    let paddr = t.vm.ipt().lookup(Pid(7), data).unwrap();
    t.ram.write_frame(paddr, 100, b"dirty");

    let stack = other.aspace.stack.base();
    assert_eq!(
        t.vm.fault(&other, FaultType::Write, stack),
        Ok(FaultOutcome::ZeroFilled)
    );
    assert_eq!(t.vm.ipt().lookup(Pid(9), stack), Some(paddr));
    assert_eq!(t.vm.swap().occupied_by(Pid(7)), 1);

    t.vm.activate(Pid(7));
    assert_eq!(
        t.vm.fault(&owner, FaultType::Read, data + 100),
        Ok(FaultOutcome::SwappedIn)
    );
    let page = t.frame_bytes(paddr);
    assert_eq!(&page[100..105], b"dirty");
    assert_eq!(page[0], 0xDA);
    assert_eq!(t.vm.swap().occupied_by(Pid(9)), 1);
    assert_eq!(t.vm.audit(), Ok(()));
}

#[test]
fn eviction_prefers_the_faulting_process() {
    let t = test_vm(3, config());
    let a = t.process(1);
    let b = t.process(2);

    t.vm.fault(&a, FaultType::Write, a.aspace.stack.base()).unwrap();
    t.vm.fault(&b, FaultType::Write, b.aspace.stack.base()).unwrap();
    t.vm.fault(&b, FaultType::Write, b.aspace.stack.base() + 0x1000).unwrap();

    // b owns two frames, so its next fault evicts one of its own
    t.vm.fault(&b, FaultType::Write, b.aspace.stack.base() + 0x2000).unwrap();
    assert_eq!(t.vm.ipt().resident_count(Pid(1)), 1);
    assert_eq!(t.vm.ipt().resident_count(Pid(2)), 2);
    assert_eq!(t.vm.swap().occupied_by(Pid(2)), 1);
    assert_eq!(t.vm.swap().occupied_by(Pid(1)), 0);
}

#[test]
fn round_robin_cycles_through_own_frames() {
    let t = test_vm(2, config().with_eviction_scope(EvictionScope::Process));
    let p = t.process(1);
    let base = p.aspace.stack.base();

    for i in 0..4 {
        t.vm.fault(&p, FaultType::Write, base + i * 0x1000).unwrap();
    }
    // Pages 0 and 1 were evicted in turn; 2 and 3 are resident
    assert_eq!(t.vm.ipt().lookup(Pid(1), base), None);
    assert_eq!(t.vm.ipt().lookup(Pid(1), base + 0x1000), None);
    assert!(t.vm.ipt().lookup(Pid(1), base + 0x2000).is_some());
    assert!(t.vm.ipt().lookup(Pid(1), base + 0x3000).is_some());
    assert_eq!(t.vm.swap().occupied_by(Pid(1)), 2);
}

#[test]
#[should_panic(expected = "no evictable victim for this process")]
fn strict_scope_cannot_take_other_process_frames() {
    let t = test_vm(1, config().with_eviction_scope(EvictionScope::Process));
    let a = t.process(1);
    let b = t.process(2);
    t.vm.fault(&a, FaultType::Write, a.aspace.stack.base()).unwrap();
    let _ = t.vm.fault(&b, FaultType::Write, b.aspace.stack.base());
}

#[test]
#[should_panic(expected = "out of physical memory with no evictable victim")]
fn kernel_frames_are_never_evicted() {
    let t = test_vm(1, config());
    t.vm.alloc_kpages(1);
    let p = t.process(1);
    let _ = t.vm.fault(&p, FaultType::Write, p.aspace.stack.base());
}

#[test]
fn code_pages_are_reloaded_not_swapped() {
    let t = test_vm(1, config());
    let p = t.process(1);

    t.vm.fault(&p, FaultType::Read, CODE_BASE).unwrap();
    t.vm.fault(&p, FaultType::Write, p.aspace.stack.base()).unwrap();
    assert_eq!(t.device.writes(), 0);
    assert_eq!(t.vm.swap().occupied_count(), 0);

    assert_eq!(
        t.vm.fault(&p, FaultType::Read, CODE_BASE + 17),
        Ok(FaultOutcome::ImageLoaded)
    );
    assert_eq!(t.image.reads(), 2);
    assert_eq!(t.device.writes(), 1);

    let paddr = t.vm.ipt().lookup(Pid(1), CODE_BASE).unwrap();
    assert_eq!(t.frame_bytes(paddr)[17], 17);
}

// ════════════════════════════════════════════════════════════
// Fault Handling
// ════════════════════════════════════════════════════════════

#[test]
fn stack_fault_zero_fills_without_io() {
    let t = test_vm(4, config());
    let p = t.process(3);
    let addr = p.aspace.stack.base() + 0x123;

    assert_eq!(
        t.vm.fault(&p, FaultType::Write, addr),
        Ok(FaultOutcome::ZeroFilled)
    );
    assert_eq!(t.device.reads(), 0);
    assert_eq!(t.device.writes(), 0);
    assert_eq!(t.image.reads(), 0);

    let paddr = t.vm.ipt().lookup(Pid(3), addr).unwrap();
    assert!(t.frame_bytes(paddr).iter().all(|&b| b == 0));
    let entry = t.vm.ipt().entry(paddr as usize / PAGE_SIZE);
    assert_eq!(entry.owner, Owner::Process(Pid(3)));
    assert_eq!(entry.kind, Some(SegmentKind::Stack));
    assert_eq!(t.vm.stats().get(VmEvent::ZeroFill), 1);
    assert_eq!(t.vm.audit(), Ok(()));
}

#[test]
fn concurrent_code_faults_load_once() {
    for _ in 0..50 {
        let t = test_vm(4, config());
        let p = t.process(5);
        let addr = CODE_BASE + 0x40;

        let outcomes = race_faults(&t, &p, FaultType::Read, addr);

        let loads = outcomes
            .iter()
            .filter(|&&o| o == FaultOutcome::ImageLoaded)
            .count();
        assert_eq!(loads, 1);
        assert!(outcomes.contains(&FaultOutcome::Reloaded));
        assert_eq!(t.image.reads(), 1);

        assert_eq!(t.vm.ipt().resident_count(Pid(5)), 1);
        assert_eq!(t.vm.frames().free_count(), 3);
        assert!(!t.vm.tlb().probe(addr).unwrap().is_writable());
        assert_eq!(t.vm.audit(), Ok(()));
        assert_eq!(t.vm.stats().check(), Ok(()));
    }
}

#[test]
fn concurrent_code_faults_wait_out_a_slow_eviction() {
    for _ in 0..5 {
        let t = slow_test_vm(1, config(), Duration::from_millis(10));
        let p = t.process(5);
        let addr = CODE_BASE + 0x80;

        // The only frame holds a data page that must be written out
        t.vm.fault(&p, FaultType::Write, p.aspace.data.base()).unwrap();
        let outcomes = race_faults(&t, &p, FaultType::Read, addr);

        assert!(outcomes.contains(&FaultOutcome::ImageLoaded));
        assert!(outcomes.contains(&FaultOutcome::Reloaded));
        assert_eq!(t.image.reads(), 2);
        assert_eq!(t.device.writes(), 1);
        assert!(!t.vm.tlb().probe(addr).unwrap().is_writable());
        assert_eq!(t.vm.audit(), Ok(()));
        assert_eq!(t.vm.stats().check(), Ok(()));
    }
}

#[test]
fn racing_faults_wait_for_eviction_in_progress() {
    let t = slow_test_vm(1, config(), Duration::from_millis(20));
    let p = t.process(1);
    let base = p.aspace.stack.base();
    t.vm.fault(&p, FaultType::Write, base).unwrap();

    let outcomes = race_faults(&t, &p, FaultType::Write, base + 0x1000);
    assert!(outcomes.contains(&FaultOutcome::ZeroFilled));
    assert!(outcomes.contains(&FaultOutcome::Reloaded));

    assert_eq!(t.vm.ipt().resident_count(Pid(1)), 1);
    assert!(t.vm.ipt().lookup(Pid(1), base + 0x1000).is_some());
    assert_eq!(t.vm.swap().occupied_by(Pid(1)), 1);
    assert_eq!(t.vm.audit(), Ok(()));
    assert_eq!(t.vm.stats().check(), Ok(()));
}

#[test]
fn terminating_faults_leave_no_state() {
    let t = test_vm(4, config());
    let p = t.process(1);

    assert_eq!(
        t.vm.fault(&p, FaultType::Read, 0x10),
        Err(FaultError::AccessViolation(0x10))
    );
    assert_eq!(
        t.vm.fault(&p, FaultType::ReadOnly, CODE_BASE),
        Err(FaultError::ReadOnly(CODE_BASE))
    );
    assert_eq!(t.vm.frames().free_count(), 4);
    assert_eq!(t.vm.stats().snapshot().misses, 0);
}

#[test]
fn swap_read_error_terminates_process() {
    let t = test_vm(1, config());
    let p = t.process(1);
    let base = p.aspace.stack.base();

    t.vm.fault(&p, FaultType::Write, base).unwrap();
    t.vm.fault(&p, FaultType::Write, base + 0x1000).unwrap();
    t.device.set_failing(true);

    // Free the frame directly so the next fault needs no eviction
    t.vm.ipt().remove(Pid(1), base + 0x1000, t.vm.frames());
    assert!(matches!(
        t.vm.fault(&p, FaultType::Read, base),
        Err(FaultError::Swap(_))
    ));
    assert_eq!(t.vm.ipt().lookup(Pid(1), base), None);
    assert_eq!(t.vm.swap().occupied_by(Pid(1)), 1);

    t.vm.on_process_exit(Pid(1));
    assert_eq!(t.vm.swap().occupied_count(), 0);
}

// ════════════════════════════════════════════════════════════
// Process Lifecycle
// ════════════════════════════════════════════════════════════

#[test]
fn exit_releases_frames_and_slots() {
    let t = test_vm(3, config());
    let p = t.process(4);
    let other = t.process(8);
    let base = p.aspace.stack.base();

    t.vm.fault(&other, FaultType::Read, CODE_BASE).unwrap();
    for i in 0..5 {
        t.vm.fault(&p, FaultType::Write, base + i * 0x1000).unwrap();
    }
    assert!(t.vm.swap().occupied_by(Pid(4)) > 0);

    let (frames, slots) = t.vm.on_process_exit(Pid(4));
    assert!(frames > 0);
    assert!(slots > 0);
    assert_eq!(t.vm.ipt().resident_count(Pid(4)), 0);
    assert_eq!(t.vm.swap().occupied_by(Pid(4)), 0);
    assert_eq!(t.vm.frames().free_count(), 3 - t.vm.ipt().resident_count(Pid(8)));
    assert_eq!(t.vm.audit(), Ok(()));
}

#[test]
fn fork_copies_swapped_pages() {
    let t = test_vm(1, config());
    let parent = t.process(1);
    let data = parent.aspace.data.base();

    t.vm.fault(&parent, FaultType::Write, data).unwrap();
    let paddr = t.vm.ipt().lookup(Pid(1), data).unwrap();
    t.ram.write_frame(paddr, 0, b"parent page");
    t.vm.fault(&parent, FaultType::Write, parent.aspace.stack.base()).unwrap();
    assert_eq!(t.vm.swap().occupied_by(Pid(1)), 1);

    assert_eq!(t.vm.on_process_fork(Pid(1), Pid(2)), Ok(1));
    t.vm.on_process_exit(Pid(1));

    let child = Process::new(Pid(2), parent.aspace, t.image.clone());
    assert_eq!(
        t.vm.fault(&child, FaultType::Read, data),
        Ok(FaultOutcome::SwappedIn)
    );
    let paddr = t.vm.ipt().lookup(Pid(2), data).unwrap();
    assert_eq!(&t.frame_bytes(paddr)[..11], b"parent page");
}

#[test]
fn counters_stay_consistent() {
    let t = test_vm(2, config().with_tlb_entries(2));
    let procs = [t.process(1), t.process(2)];

    for round in 0..3u64 {
        for p in &procs {
            t.vm.activate(p.pid);
            t.vm.fault(p, FaultType::Read, CODE_BASE + round * 0x1000).unwrap();
            t.vm.fault(p, FaultType::Write, p.aspace.data.base()).unwrap();
            t.vm.fault(p, FaultType::Write, p.aspace.stack.base()).unwrap();
            t.vm.fault(p, FaultType::Read, p.aspace.stack.base()).unwrap();
        }
    }

    let snap = t.vm.stats().snapshot();
    assert_eq!(snap.misses, 24);
    assert_eq!(snap.invalidations, 6);
    assert!(snap.swap_stores > 0);
    assert!(snap.swap_loads > 0);
    assert_eq!(snap.check(), Ok(()));
    t.vm.report();
}

#[test]
fn custom_address_space_layout() {
    let t = test_vm(2, config());
    let aspace = AddressSpace::new(
        Segment::loaded(SegmentKind::Code, 0x1000, 0x800, 0x800),
        Segment::loaded(SegmentKind::Data, 0x3000, 0x1000, 0),
        Segment::stack(0x10_0000, 2),
    );
    let p = Process::new(Pid(6), aspace, t.image.clone());

    assert_eq!(
        t.vm.fault(&p, FaultType::Read, 0x17ff),
        Ok(FaultOutcome::ImageLoaded)
    );
    let paddr = t.vm.ipt().lookup(Pid(6), 0x1000).unwrap();
    let page = t.frame_bytes(paddr);
    assert_eq!(page[0x7ff], (0x7ff % 253) as u8);
    assert!(page[0x800..].iter().all(|&b| b == 0));

    assert_eq!(
        t.vm.fault(&p, FaultType::Read, 0x2000),
        Err(FaultError::AccessViolation(0x2000))
    );
    assert_eq!(
        t.vm.fault(&p, FaultType::Write, 0x10_0000 - 1),
        Ok(FaultOutcome::ZeroFilled)
    );
}
