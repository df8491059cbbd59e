//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ipt_vm::vm::{
    AddressSpace, MemSwapDevice, MemoryImage, Process, RamImage, Segment, SegmentKind,
    SwapDevice, SwapResult, Vm, VmConfig,
};
use ipt_vm::{Pid, PAGE_SIZE};

/// Base of the code segment in every test process
pub const CODE_BASE: u64 = 0x40_0000;
/// Base of the data segment in every test process
pub const DATA_BASE: u64 = 0x50_0000;
/// Pages of code and data in the test image
pub const IMAGE_PAGES: usize = 4;

/// A VM context over host RAM and an in-memory swap device
pub struct TestVm {
    pub ram: Arc<RamImage>,
    pub device: Arc<MemSwapDevice>,
    pub image: Arc<MemoryImage>,
    pub vm: Vm,
}

pub fn test_vm(frames: usize, config: VmConfig) -> TestVm {
    let device = Arc::new(MemSwapDevice::new());
    build(frames, config, device.clone(), device)
}

/// Like [`test_vm`], but every swap write takes `delay`
pub fn slow_test_vm(frames: usize, config: VmConfig, delay: Duration) -> TestVm {
    let device = Arc::new(MemSwapDevice::new());
    let slow = Arc::new(SlowSwapDevice {
        inner: device.clone(),
        delay,
    });
    build(frames, config, device, slow)
}

fn build(
    frames: usize,
    config: VmConfig,
    device: Arc<MemSwapDevice>,
    swap: Arc<dyn SwapDevice>,
) -> TestVm {
    let ram = Arc::new(RamImage::new(frames));
    let vm = Vm::new(config, ram.clone(), swap).expect("vm init");
    TestVm {
        ram,
        device,
        image: Arc::new(image()),
        vm,
    }
}

/// Image whose code byte at offset `i` is `i % 253` and data bytes are `0xDA`
pub fn image() -> MemoryImage {
    let len = IMAGE_PAGES * PAGE_SIZE;
    let code = (0..len).map(|i| (i % 253) as u8).collect();
    let data = vec![0xDA; len];
    MemoryImage::new(code, data)
}

impl TestVm {
    pub fn process(&self, pid: u32) -> Process {
        let size = (IMAGE_PAGES * PAGE_SIZE) as u64;
        let aspace: AddressSpace = self.vm.address_space(
            Segment::loaded(SegmentKind::Code, CODE_BASE, size, size),
            Segment::loaded(SegmentKind::Data, DATA_BASE, size * 2, size),
        );
        Process::new(Pid(pid), aspace, self.image.clone())
    }

    /// Copy a whole frame out of RAM
    pub fn frame_bytes(&self, paddr: u64) -> Vec<u8> {
        let mut page = vec![0u8; PAGE_SIZE];
        self.ram.peek(paddr, 0, &mut page);
        page
    }
}

/// Swap device whose writes stall, widening the eviction window
pub struct SlowSwapDevice {
    inner: Arc<MemSwapDevice>,
    delay: Duration,
}

impl SwapDevice for SlowSwapDevice {
    fn reset(&self, len: u64) -> SwapResult<()> {
        self.inner.reset(len)
    }

    fn read_page(&self, offset: u64, buf: &mut [u8; PAGE_SIZE]) -> SwapResult<()> {
        self.inner.read_page(offset, buf)
    }

    fn write_page(&self, offset: u64, buf: &[u8; PAGE_SIZE]) -> SwapResult<()> {
        thread::sleep(self.delay);
        self.inner.write_page(offset, buf)
    }
}
