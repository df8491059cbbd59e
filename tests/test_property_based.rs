//! Property-based tests for the VM subsystem
//!
//! These tests use proptest to drive the hash index, the swap space and
//! the whole fault path with random operation sequences, checking them
//! against simple models and the subsystem's own consistency checks.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::*;
use ipt_vm::vm::{
    FaultType, HashIndex, MemSwapDevice, PhysicalMemory, RamImage, SwapIn, SwapOut, SwapSpace,
    VmConfig,
};
use ipt_vm::{Pid, PAGE_SIZE};
use proptest::prelude::*;
use proptest_strategies::*;

// ════════════════════════════════════════════════════════════
// Hash Index Property Tests
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// The index agrees with a map model and never leaks nodes
    #[test]
    fn index_matches_model(
        capacity in 1usize..40,
        ops in prop::collection::vec(index_op(), 0..200)
    ) {
        let mut index = HashIndex::new(capacity);
        let mut model: BTreeMap<(u32, u64), usize> = BTreeMap::new();

        for op in ops {
            match op {
                IndexOp::Insert { pid, vaddr, value } => {
                    // Callers never insert a live key or past capacity
                    if model.contains_key(&(pid, vaddr)) || model.len() == capacity {
                        continue;
                    }
                    index.insert(Pid(pid), vaddr, value);
                    model.insert((pid, vaddr), value);
                }
                IndexOp::Delete { pid, vaddr } => {
                    prop_assert_eq!(index.delete(Pid(pid), vaddr), model.remove(&(pid, vaddr)));
                }
            }
            prop_assert_eq!(index.len(), model.len());
        }

        for (&(pid, vaddr), &value) in &model {
            prop_assert_eq!(index.search(Pid(pid), vaddr), Some(value));
        }
        prop_assert_eq!(index.free_nodes(), capacity - model.len());
    }

    /// A full index accepts exactly its capacity, in any key order
    #[test]
    fn index_fills_to_capacity(keys in prop::collection::btree_set((pid(), page_addr()), 1..60)) {
        let mut index = HashIndex::new(keys.len());
        for (value, &(pid, vaddr)) in keys.iter().enumerate() {
            index.insert(Pid(pid), vaddr, value);
        }
        prop_assert_eq!(index.free_nodes(), 0);
        for (value, &(pid, vaddr)) in keys.iter().enumerate() {
            prop_assert_eq!(index.search(Pid(pid), vaddr + 7), Some(value));
        }
    }
}

// ════════════════════════════════════════════════════════════
// Swap Property Tests
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// A page read back from swap is byte-identical to the page written
    #[test]
    fn swap_round_trip(payload in page_payload(), pid in pid(), vaddr in page_addr()) {
        let ram = Arc::new(RamImage::new(2));
        let swap = SwapSpace::new(4, Arc::new(MemSwapDevice::new()), ram.clone()).unwrap();

        ram.write_frame(0, 0, &payload);
        let out = swap.swap_out(0, vaddr, false, Pid(pid)).unwrap();
        prop_assert!(matches!(out, SwapOut::Stored { .. }), "expected SwapOut::Stored, got {:?}", out);

        // Clobber the source frame before reading back elsewhere
        ram.zero_frame(0);
        prop_assert_eq!(swap.swap_in(Pid(pid), vaddr, 0x1000).unwrap(), SwapIn::Loaded);

        let mut page = vec![0u8; PAGE_SIZE];
        ram.peek(0x1000, 0, &mut page);
        prop_assert_eq!(page, payload);
        prop_assert_eq!(swap.free_slots(), 4);
    }
}

// ════════════════════════════════════════════════════════════
// Fault Path Property Tests
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Random workloads keep the tables and the counters consistent
    #[test]
    fn workload_keeps_tables_consistent(
        frames in 1usize..6,
        steps in prop::collection::vec(step(), 1..80)
    ) {
        let t = test_vm(frames, VmConfig::new().with_swap_slots(64).with_tlb_entries(4));
        let procs: Vec<_> = (1..4).map(|pid| t.process(pid)).collect();

        for step in steps {
            match step {
                Step::Fault { pid, target, page, write } => {
                    let p = &procs[pid as usize - 1];
                    let base = match target {
                        Target::Code => p.aspace.code.base(),
                        Target::Data => p.aspace.data.base(),
                        Target::Stack => p.aspace.stack.base(),
                    };
                    let kind = if write { FaultType::Write } else { FaultType::Read };
                    prop_assert!(t.vm.fault(p, kind, base + page * PAGE_SIZE as u64).is_ok());
                }
                Step::Switch { pid } => t.vm.activate(Pid(pid)),
                Step::Exit { pid } => {
                    t.vm.on_process_exit(Pid(pid));
                    prop_assert_eq!(t.vm.ipt().resident_count(Pid(pid)), 0);
                    prop_assert_eq!(t.vm.swap().occupied_by(Pid(pid)), 0);
                }
            }
            prop_assert_eq!(t.vm.audit(), Ok(()));
        }

        prop_assert_eq!(t.vm.stats().check(), Ok(()));
        let owned: usize = (1..4).map(|pid| t.vm.ipt().resident_count(Pid(pid))).sum();
        prop_assert_eq!(t.vm.frames().free_count(), frames - owned);
    }
}
