//! ipt_vm - Inverted page table virtual memory for a teaching kernel
//!
//! This crate provides the virtual memory subsystem of a small kernel:
//! a physical frame allocator, an inverted page table with hash lookup,
//! swap space on a backing device, and the page fault handler that ties
//! them together. It is `no_std` with `alloc`, so it links into a kernel
//! image and runs its tests on a development host.

#![cfg_attr(not(test), no_std)]
// Kernel-appropriate clippy configuration
// Many kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]

extern crate alloc;

// Core types
pub mod types;

// Console and logging macros
pub mod console;

// Virtual memory subsystem
pub mod vm;

pub use types::{Pid, PAGE_SIZE};
pub use vm::{FaultError, FaultOutcome, FaultType, Process, Vm, VmConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = "ipt_vm";
