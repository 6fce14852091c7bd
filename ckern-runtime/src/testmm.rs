//! # Test Heap
//!
//! A heap for unit tests which detects writes past the end of a block,
//! corrupted bookkeeping and double frees.
//!
//! ## Layout
//!
//! Blocks are packed bottom-up into test pages, each a VM mapping with a
//! guard page on both sides of its data region:
//!
//! ```text
//! ┌───────┬─────────────────────────────────────────┬──────┬───────┐
//! │ guard │ header │ user ... fill │ trailer │ ...   │ free │ guard │
//! └───────┴─────────────────────────────────────────┴──────┴───────┘
//!                                                   ^ free cursor
//! ```
//!
//! - The header stores the user size, the aligned size, the fill value,
//!   the user address and padding words pointing at the trailer.
//! - The bytes between the end of the user data and the aligned size hold
//!   the fill value `(header address / 128) % 256`.
//! - The trailer stores copies of the header address.
//!
//! Every free and resize checks all of this. A freed block is marked by a
//! zero user size and is given back to the free cursor only when it sits
//! directly below it; the walk continues downwards through the trailers of
//! already freed blocks.

use std::mem;
use std::ptr;

use crate::config::TestMmConfig;
use crate::error::{Error, Result};
use crate::errortimer::ErrorTimer;
use crate::memblock::MemBlock;
use crate::mm::{copy_overlap, Mm};
use crate::vm::{align_up, pagesize_vm, protect_range, AccessMode, VmPage};

const WORD: usize = mem::size_of::<usize>();

/// Alignment of user data.
pub const MEMALIGN: usize = if WORD > 16 { WORD } else { 16 };

const fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

/// Header words before the padding.
const HEADER_FIELDS: usize = 4;
/// Padding words of the header; at least one.
const NR_PADDING: usize = round_up((HEADER_FIELDS + 1) * WORD, MEMALIGN) / WORD - HEADER_FIELDS;
/// Header address copies in the trailer; at least two.
const NR_TRAILER: usize = round_up(2 * WORD, MEMALIGN) / WORD;

#[repr(C)]
struct Header {
    datasize: usize,
    alignsize: usize,
    fillvalue: usize,
    userdata: *mut u8,
    padding: [*mut Trailer; NR_PADDING],
}

#[repr(C)]
struct Trailer {
    header: [*mut Header; NR_TRAILER],
}

const HEADER_SIZE: usize = mem::size_of::<Header>();
const TRAILER_SIZE: usize = mem::size_of::<Trailer>();

const _: () = assert!(HEADER_SIZE % MEMALIGN == 0);
const _: () = assert!(TRAILER_SIZE % MEMALIGN == 0);

fn fill_value(header: usize) -> u8 {
    ((header / 128) % 256) as u8
}

/// Write header, fill bytes and trailer of a block of user size `datasize`.
///
/// # Safety
///
/// `header` must be aligned to [`MEMALIGN`] and followed by
/// `HEADER_SIZE + align_up(datasize) + TRAILER_SIZE` writable bytes.
unsafe fn init_block(header: *mut Header, datasize: usize, alignsize: usize) {
    let base = header as *mut u8;
    let userdata = base.add(HEADER_SIZE);
    let trailer = base.add(HEADER_SIZE + alignsize) as *mut Trailer;
    let fill = fill_value(header as usize);
    header.write(Header {
        datasize,
        alignsize,
        fillvalue: fill as usize,
        userdata,
        padding: [trailer; NR_PADDING],
    });
    trailer.write(Trailer {
        header: [header; NR_TRAILER],
    });
    ptr::write_bytes(userdata.add(datasize), fill, alignsize - datasize);
}

/// Check everything of the block at `header` except the fill bytes.
///
/// # Safety
///
/// `[header, limit)` must be readable.
unsafe fn check_bookkeeping(header: *const Header, limit: usize) -> Result<()> {
    let addr = header as usize;
    if addr + HEADER_SIZE > limit {
        return Err(Error::InvalidArgument);
    }
    let h = &*header;
    if h.userdata as usize != addr + HEADER_SIZE
        || h.alignsize % MEMALIGN != 0
        || h.datasize > h.alignsize
        || h.fillvalue != fill_value(addr) as usize
    {
        return Err(Error::Invariant);
    }
    let trailer = (addr + HEADER_SIZE)
        .checked_add(h.alignsize)
        .filter(|t| t.checked_add(TRAILER_SIZE).is_some_and(|end| end <= limit))
        .ok_or(Error::Invariant)?;
    if h.padding.iter().any(|p| *p as usize != trailer) {
        return Err(Error::Invariant);
    }
    let t = &*(trailer as *const Trailer);
    if t.header.iter().any(|p| *p as usize != addr) {
        return Err(Error::Invariant);
    }
    Ok(())
}

/// Whether the fill bytes of a block are intact.
unsafe fn check_fill(header: *const Header) -> bool {
    let h = &*header;
    let fill = h.fillvalue as u8;
    let padding = std::slice::from_raw_parts(h.userdata.add(h.datasize), h.alignsize - h.datasize);
    padding.iter().all(|&b| b == fill)
}

struct TestMmPage {
    /// Whole mapping including the guard pages.
    vmpage: VmPage,
    /// Data region between the guards.
    data: MemBlock,
    /// First unused byte of the data region.
    cursor: usize,
}

impl TestMmPage {
    fn new(datasize: usize) -> Result<TestMmPage> {
        let pagesize = pagesize_vm();
        let datasize = align_up(datasize, pagesize).ok_or(Error::NoMemory)?;
        let total = datasize.checked_add(2 * pagesize).ok_or(Error::NoMemory)?;
        let mut vmpage = VmPage::new(total)?;
        let lower = MemBlock::new(vmpage.addr(), pagesize);
        // SAFETY: both guards lie inside the mapping
        let upper = MemBlock::new(unsafe { vmpage.addr().add(pagesize + datasize) }, pagesize);
        let protected = protect_range(lower, AccessMode::NONE)
            .and_then(|()| protect_range(upper, AccessMode::NONE));
        if let Err(err) = protected {
            let _ = vmpage.free();
            return Err(err);
        }
        // SAFETY: the data region lies inside the mapping
        let data = MemBlock::new(unsafe { vmpage.addr().add(pagesize) }, datasize);
        Ok(TestMmPage {
            vmpage,
            cursor: data.addr_usize(),
            data,
        })
    }

    fn is_empty(&self) -> bool {
        self.cursor == self.data.addr_usize()
    }

    fn free_bytes(&self) -> usize {
        self.data.end() - self.cursor
    }

    fn contains_used(&self, addr: usize) -> bool {
        addr >= self.data.addr_usize() && addr < self.cursor
    }

    /// Carve a block of `datasize` bytes at the cursor.
    fn alloc(&mut self, datasize: usize, alignsize: usize) -> Option<MemBlock> {
        let total = HEADER_SIZE + alignsize + TRAILER_SIZE;
        if total > self.free_bytes() {
            return None;
        }
        let header = self.cursor as *mut Header;
        // SAFETY: [cursor, cursor + total) is unused data region
        unsafe { init_block(header, datasize, alignsize) };
        self.cursor += total;
        Some(MemBlock::new((header as *mut u8).wrapping_add(HEADER_SIZE), datasize))
    }

    /// Move the cursor down over freed blocks directly below it.
    fn coalesce(&mut self) {
        let start = self.data.addr_usize();
        while self.cursor > start {
            // SAFETY: every block below the cursor ends in a valid trailer
            unsafe {
                let trailer = &*((self.cursor - TRAILER_SIZE) as *const Trailer);
                let header = trailer.header[0];
                if (*header).datasize != 0 {
                    break;
                }
                self.cursor = header as usize;
            }
        }
    }
}

/// Heap for tests that validates every block on free and resize.
pub struct TestMm {
    pages: Vec<TestMmPage>,
    page_size: usize,
    max_block_size: usize,
    size_allocated: usize,
    resize_err: ErrorTimer,
    free_err: ErrorTimer,
}

impl TestMm {
    /// Create a test heap and map its first page.
    pub fn new(config: &TestMmConfig) -> Result<TestMm> {
        let first = TestMmPage::new(config.page_size)?;
        Ok(TestMm {
            pages: vec![first],
            page_size: config.page_size,
            max_block_size: config.max_block_size,
            size_allocated: 0,
            resize_err: ErrorTimer::DISARMED,
            free_err: ErrorTimer::DISARMED,
        })
    }

    /// Unmap every page. Live blocks become dangling.
    ///
    /// Keeps going after a failed unmap and returns the first error.
    pub fn free(&mut self) -> Result<()> {
        if self.size_allocated != 0 {
            tracing::warn!(size_allocated = self.size_allocated, "test heap freed with live blocks");
        }
        let mut err = None;
        for page in &mut self.pages {
            crate::error::keep_first(&mut err, page.vmpage.free());
        }
        self.pages.clear();
        self.size_allocated = 0;
        err.map_or(Ok(()), Err)
    }

    /// Make the `timer`-th next resize fail.
    pub fn set_resize_err(&mut self, timer: ErrorTimer) {
        self.resize_err = timer;
    }

    /// Make the `timer`-th next free fail.
    pub fn set_free_err(&mut self, timer: ErrorTimer) {
        self.free_err = timer;
    }

    /// Number of mapped test pages.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Whether no block is live.
    pub fn is_empty(&self) -> bool {
        self.pages.iter().all(TestMmPage::is_empty)
    }

    /// Start of the data region of every page, oldest first.
    pub fn page_addrs(&self) -> Vec<usize> {
        self.pages.iter().map(|p| p.data.addr_usize()).collect()
    }

    fn sizes(&self, datasize: usize) -> Result<(usize, usize)> {
        if datasize > self.max_block_size {
            return Err(Error::NoMemory);
        }
        let alignsize = align_up(datasize, MEMALIGN).ok_or(Error::NoMemory)?;
        let total = alignsize
            .checked_add(HEADER_SIZE + TRAILER_SIZE)
            .ok_or(Error::NoMemory)?;
        Ok((alignsize, total))
    }

    fn alloc(&mut self, datasize: usize) -> Result<MemBlock> {
        let (alignsize, total) = self.sizes(datasize)?;
        if let Some(block) = self.pages.last_mut().and_then(|p| p.alloc(datasize, alignsize)) {
            self.size_allocated += datasize;
            return Ok(block);
        }
        let mut page = TestMmPage::new(self.page_size.max(total))?;
        let block = page.alloc(datasize, alignsize).ok_or(Error::Invariant)?;
        self.pages.push(page);
        self.size_allocated += datasize;
        Ok(block)
    }

    /// Validate `block` and return its page index and header.
    fn validate(&self, block: &MemBlock) -> Result<(usize, *mut Header)> {
        let addr = block.addr_usize();
        if addr % MEMALIGN != 0 || addr < HEADER_SIZE {
            return Err(Error::InvalidArgument);
        }
        let header = addr - HEADER_SIZE;
        let index = self
            .pages
            .iter()
            .rposition(|p| p.contains_used(header))
            .ok_or(Error::InvalidArgument)?;
        let page = &self.pages[index];
        let header = header as *mut Header;
        // SAFETY: [header, cursor) is inside the used part of the data region
        unsafe {
            check_bookkeeping(header, page.cursor)?;
            let datasize = (*header).datasize;
            if datasize == 0 || datasize != block.size() {
                return Err(Error::InvalidArgument);
            }
            if !check_fill(header) {
                return Err(Error::Invariant);
            }
        }
        Ok((index, header))
    }

    fn release(&mut self, block: &mut MemBlock) -> Result<()> {
        let (index, header) = self.validate(block)?;
        // SAFETY: validated above
        unsafe { (*header).datasize = 0 };
        self.size_allocated -= block.size();
        block.clear();

        let page = &mut self.pages[index];
        page.coalesce();
        if page.is_empty() && index != 0 {
            let mut page = self.pages.remove(index);
            page.vmpage.free()?;
        }
        Ok(())
    }

    fn resize(&mut self, newsize: usize, block: &mut MemBlock) -> Result<()> {
        if newsize == 0 {
            return self.release(block);
        }
        if block.is_free() {
            *block = self.alloc(newsize)?;
            return Ok(());
        }
        let (index, header) = self.validate(block)?;
        let (alignsize, total) = self.sizes(newsize)?;

        let page = &mut self.pages[index];
        // SAFETY: validated above
        let (oldsize, oldalign) = unsafe { ((*header).datasize, (*header).alignsize) };
        let at_cursor = header as usize + HEADER_SIZE + oldalign + TRAILER_SIZE == page.cursor;
        if at_cursor && header as usize + total <= page.data.end() {
            // SAFETY: the block is the topmost of its page and the new size fits
            unsafe { init_block(header, newsize, alignsize) };
            page.cursor = header as usize + total;
            self.size_allocated = self.size_allocated - oldsize + newsize;
            *block = MemBlock::new(block.addr(), newsize);
            return Ok(());
        }

        let mut newblock = self.alloc(newsize)?;
        // SAFETY: both blocks are live and distinct
        unsafe { copy_overlap(block, &newblock) };
        if let Err(err) = self.release(block) {
            let _ = self.release(&mut newblock);
            return Err(err);
        }
        *block = newblock;
        Ok(())
    }
}

impl Mm for TestMm {
    fn malloc(&mut self, size: usize) -> Result<MemBlock> {
        if size == 0 {
            return Ok(MemBlock::FREE);
        }
        self.alloc(size)
    }

    fn mresize(&mut self, newsize: usize, block: &mut MemBlock) -> Result<()> {
        self.resize_err.process()?;
        self.resize(newsize, block)
    }

    fn mfree(&mut self, block: &mut MemBlock) -> Result<()> {
        self.free_err.process()?;
        if block.is_free() {
            return Ok(());
        }
        self.release(block)
    }

    fn size_allocated(&self) -> usize {
        self.size_allocated
    }
}

impl std::fmt::Debug for TestMm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestMm")
            .field("pages", &self.pages.len())
            .field("size_allocated", &self.size_allocated)
            .finish()
    }
}
