//! Physical Memory Access
//!
//! The VM tables only ever name frames by physical address; the bytes are
//! reached through [`PhysicalMemory`]. On hardware this is the kernel's
//! direct map of RAM; on a development host it is a [`RamImage`].

use alloc::boxed::Box;
use alloc::vec::Vec;
use spin::Mutex;

use crate::types::{addr_to_frame, PAGE_SIZE};

/// Byte access to physical frames
///
/// All addresses passed in are frame-aligned physical addresses except
/// where an explicit offset is given. An address past the end of RAM is a
/// kernel bug and panics.
pub trait PhysicalMemory: Send + Sync {
    /// Number of frames of RAM
    fn frame_count(&self) -> usize;

    /// Fill a frame with zeros
    fn zero_frame(&self, paddr: u64);

    /// Copy a whole frame out
    fn read_frame(&self, paddr: u64, buf: &mut [u8; PAGE_SIZE]);

    /// Copy `bytes` into a frame starting at `offset`
    fn write_frame(&self, paddr: u64, offset: usize, bytes: &[u8]);
}

/// RAM backed by heap pages, one lock per frame
pub struct RamImage {
    frames: Vec<Mutex<Box<[u8; PAGE_SIZE]>>>,
}

impl RamImage {
    /// Create `frames` frames of RAM, filled with a garbage pattern so that
    /// missing zero-fills show up in tests
    pub fn new(frames: usize) -> Self {
        Self {
            frames: (0..frames)
                .map(|_| Mutex::new(Box::new([0xA5; PAGE_SIZE])))
                .collect(),
        }
    }

    fn frame(&self, paddr: u64) -> &Mutex<Box<[u8; PAGE_SIZE]>> {
        let index = addr_to_frame(paddr);
        assert!(
            index < self.frames.len(),
            "physical address {:#x} beyond end of RAM",
            paddr
        );
        &self.frames[index]
    }

    /// Read bytes from a frame (test and debugger helper)
    pub fn peek(&self, paddr: u64, offset: usize, buf: &mut [u8]) {
        let frame = self.frame(paddr).lock();
        buf.copy_from_slice(&frame[offset..offset + buf.len()]);
    }
}

impl PhysicalMemory for RamImage {
    fn frame_count(&self) -> usize {
        self.frames.len()
    }

    fn zero_frame(&self, paddr: u64) {
        self.frame(paddr).lock().fill(0);
    }

    fn read_frame(&self, paddr: u64, buf: &mut [u8; PAGE_SIZE]) {
        buf.copy_from_slice(&self.frame(paddr).lock()[..]);
    }

    fn write_frame(&self, paddr: u64, offset: usize, bytes: &[u8]) {
        assert!(offset + bytes.len() <= PAGE_SIZE, "write crosses frame boundary");
        self.frame(paddr).lock()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}
