//! General-Purpose Heap
//!
//! [`Mm`] is the heap interface of a thread context; [`MmImpl`] implements
//! it on top of the system allocator and keeps a running total of the
//! usable sizes it handed out. The test heap
//! ([`TestMm`](crate::testmm::TestMm)) implements the same interface.

use std::ptr;

use nix::libc;

use crate::error::{Error, Result};
use crate::memblock::MemBlock;

/// Heap interface.
///
/// A request of size 0 yields the free block. On failure the block passed
/// in stays valid and unchanged.
pub trait Mm {
    /// Allocate at least `size` bytes.
    fn malloc(&mut self, size: usize) -> Result<MemBlock>;

    /// Resize `block` to `newsize` bytes, moving it if needed.
    /// A `newsize` of 0 frees the block.
    fn mresize(&mut self, newsize: usize, block: &mut MemBlock) -> Result<()>;

    /// Free `block` and clear it. Freeing the free block does nothing.
    fn mfree(&mut self, block: &mut MemBlock) -> Result<()>;

    /// Bytes currently allocated.
    fn size_allocated(&self) -> usize;
}

/// Heap backed by the system allocator.
#[derive(Debug, Default)]
pub struct MmImpl {
    size_allocated: usize,
}

impl MmImpl {
    /// Create a heap with nothing allocated.
    pub const fn new() -> Self {
        Self { size_allocated: 0 }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn usable_size(addr: *mut u8, _requested: usize) -> usize {
    unsafe { libc::malloc_usable_size(addr.cast()) }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn usable_size(_addr: *mut u8, requested: usize) -> usize {
    requested
}

impl Mm for MmImpl {
    fn malloc(&mut self, size: usize) -> Result<MemBlock> {
        if size == 0 {
            return Ok(MemBlock::FREE);
        }
        let addr: *mut u8 = unsafe { libc::malloc(size) }.cast();
        if addr.is_null() {
            return Err(Error::NoMemory);
        }
        let size = usable_size(addr, size);
        self.size_allocated += size;
        Ok(MemBlock::new(addr, size))
    }

    fn mresize(&mut self, newsize: usize, block: &mut MemBlock) -> Result<()> {
        if newsize == 0 {
            return self.mfree(block);
        }
        let oldsize = if block.is_free() {
            0
        } else {
            usable_size(block.addr(), block.size())
        };
        let addr: *mut u8 = unsafe { libc::realloc(block.addr().cast(), newsize) }.cast();
        if addr.is_null() {
            return Err(Error::NoMemory);
        }
        let newsize = usable_size(addr, newsize);
        self.size_allocated = self.size_allocated - oldsize + newsize;
        *block = MemBlock::new(addr, newsize);
        Ok(())
    }

    fn mfree(&mut self, block: &mut MemBlock) -> Result<()> {
        if block.is_free() {
            return Ok(());
        }
        let size = usable_size(block.addr(), block.size());
        unsafe { libc::free(block.addr().cast()) };
        self.size_allocated -= size;
        *block = MemBlock::FREE;
        Ok(())
    }

    fn size_allocated(&self) -> usize {
        self.size_allocated
    }
}

/// Copy the common prefix of `from` into `to`.
///
/// # Safety
///
/// Both blocks must describe valid, non-overlapping memory.
pub(crate) unsafe fn copy_overlap(from: &MemBlock, to: &MemBlock) {
    let n = from.size().min(to.size());
    if n != 0 {
        ptr::copy_nonoverlapping(from.addr(), to.addr(), n);
    }
}
