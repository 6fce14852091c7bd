//! # Page Cache
//!
//! Hands out pages of 13 power-of-two size classes (256 B up to 1 MiB),
//! each aligned to its own size.
//!
//! ## Design
//!
//! Pages are carved from large OS mappings called *cache blocks*. A cache
//! block is split into sub-blocks of [`SUBBLOCKSIZE`] bytes, and a sub-block
//! serves exactly one size class from the moment it is first used until its
//! last page comes back.
//!
//! ```text
//! cache block (subblocks_per_block × 1 MiB, aligned to 1 MiB)
//! ┌──────────┬──────────┬──────────┬─────┬──────────┐
//! │ 4K pages │ 256B pg. │  unused  │ ... │  unused  │
//! └──────────┴──────────┴──────────┴─────┴──────────┘
//! ```
//!
//! Three kinds of lists run through the blocks:
//!
//! - all blocks, used for teardown
//! - blocks with at least one never-used sub-block
//! - one list per size class of sub-blocks with at least one free page
//!
//! A claimed sub-block hands out its pages bump-style; released pages are
//! threaded onto an intrusive free list stored in the pages themselves.
//! Allocation always draws from the most recently listed sub-block.
//!
//! Blocks are returned to the OS only by [`PageCache::empty_cache`] and
//! when the cache itself is freed.

use std::collections::BTreeMap;
use std::fmt;

use crate::config::PageCacheConfig;
use crate::error::{Error, Result};
use crate::list::{Link, List};
use crate::memblock::MemBlock;
use crate::vm::VmPage;

/// Size of a sub-block, the unit of size-class assignment.
pub const SUBBLOCKSIZE: usize = 1 << 20;

/// Number of page size classes.
pub const NR_PAGESIZE: usize = 13;

/// Page size class. The ordinal `p` stands for `256 << p` bytes.
///
/// Ordinals are stable and may be persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PageSize {
    /// 256 bytes.
    Size256 = 0,
    /// 512 bytes.
    Size512 = 1,
    /// 1 KiB.
    Size1K = 2,
    /// 2 KiB.
    Size2K = 3,
    /// 4 KiB.
    Size4K = 4,
    /// 8 KiB.
    Size8K = 5,
    /// 16 KiB.
    Size16K = 6,
    /// 32 KiB.
    Size32K = 7,
    /// 64 KiB.
    Size64K = 8,
    /// 128 KiB.
    Size128K = 9,
    /// 256 KiB.
    Size256K = 10,
    /// 512 KiB.
    Size512K = 11,
    /// 1 MiB.
    Size1M = 12,
}

impl PageSize {
    /// All classes, smallest first.
    pub const ALL: [PageSize; NR_PAGESIZE] = [
        PageSize::Size256,
        PageSize::Size512,
        PageSize::Size1K,
        PageSize::Size2K,
        PageSize::Size4K,
        PageSize::Size8K,
        PageSize::Size16K,
        PageSize::Size32K,
        PageSize::Size64K,
        PageSize::Size128K,
        PageSize::Size256K,
        PageSize::Size512K,
        PageSize::Size1M,
    ];

    /// Ordinal of the class.
    pub const fn ordinal(self) -> usize {
        self as usize
    }

    /// Page size in bytes.
    pub const fn bytes(self) -> usize {
        256 << (self as u32)
    }

    /// Base-2 logarithm of [`bytes`](Self::bytes).
    pub const fn log2(self) -> u32 {
        8 + self as u32
    }

    /// Class of a page of exactly `bytes` bytes.
    pub fn from_bytes(bytes: usize) -> Option<PageSize> {
        if !bytes.is_power_of_two() || bytes < 256 {
            return None;
        }
        let ordinal = bytes.trailing_zeros().checked_sub(8)?;
        PageSize::try_from(ordinal as u8).ok()
    }

    /// Pages of this class in one sub-block.
    pub const fn pages_per_subblock(self) -> usize {
        SUBBLOCKSIZE >> self.log2()
    }
}

impl TryFrom<u8> for PageSize {
    type Error = Error;

    fn try_from(ordinal: u8) -> Result<PageSize> {
        PageSize::ALL
            .get(ordinal as usize)
            .copied()
            .ok_or(Error::InvalidArgument)
    }
}

/// Interface of a page cache.
///
/// All pages handed out are aligned to their own size.
pub trait PageCache {
    /// Allocate one page of class `class`.
    fn alloc_page(&mut self, class: PageSize) -> Result<MemBlock>;

    /// Return a page. A free block is ignored. `page` is cleared on success.
    fn release_page(&mut self, page: &mut MemBlock) -> Result<()>;

    /// Sum of the sizes of all live pages.
    fn size_allocated(&self) -> usize;

    /// Return every cache block without live pages to the OS.
    fn empty_cache(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SubBlockRef {
    block: usize,
    sub: usize,
}

struct SubBlock {
    class: Option<PageSize>,
    /// Address of the first released page, 0 if none. Each released page
    /// stores the address of the next one in its first word.
    free_head: usize,
    /// Pages handed out bump-style since the sub-block was claimed.
    fresh: usize,
    /// Live pages.
    used: usize,
    free_link: Link<SubBlockRef>,
}

impl SubBlock {
    const UNUSED: SubBlock = SubBlock {
        class: None,
        free_head: 0,
        fresh: 0,
        used: 0,
        free_link: Link::new(),
    };

    fn has_free_page(&self, class: PageSize) -> bool {
        self.free_head != 0 || self.fresh < class.pages_per_subblock()
    }
}

struct CacheBlock {
    /// Mapping of the block; free if the arena slot is vacant.
    page: VmPage,
    subblocks: Box<[SubBlock]>,
    /// Never-used sub-blocks.
    unused: usize,
    all_link: Link<usize>,
    unused_link: Link<usize>,
}

impl CacheBlock {
    fn base(&self) -> usize {
        self.page.addr() as usize
    }

    fn is_idle(&self) -> bool {
        self.unused == self.subblocks.len()
    }
}

fn all_link(blocks: &mut Vec<CacheBlock>, id: usize) -> &mut Link<usize> {
    &mut blocks[id].all_link
}

fn unused_link(blocks: &mut Vec<CacheBlock>, id: usize) -> &mut Link<usize> {
    &mut blocks[id].unused_link
}

fn free_link(blocks: &mut Vec<CacheBlock>, r: SubBlockRef) -> &mut Link<SubBlockRef> {
    &mut blocks[r.block].subblocks[r.sub].free_link
}

/// The page cache of one thread.
pub struct PageCacheImpl {
    blocks: Vec<CacheBlock>,
    vacant: Vec<usize>,
    by_base: BTreeMap<usize, usize>,
    all: List<Vec<CacheBlock>, usize>,
    with_unused: List<Vec<CacheBlock>, usize>,
    freelist: [List<Vec<CacheBlock>, SubBlockRef>; NR_PAGESIZE],
    subblocks_per_block: usize,
    size_allocated: usize,
}

impl PageCacheImpl {
    /// Create an empty cache. No memory is mapped until the first page is
    /// requested.
    pub fn new(config: &PageCacheConfig) -> Self {
        Self {
            blocks: Vec::new(),
            vacant: Vec::new(),
            by_base: BTreeMap::new(),
            all: List::new(all_link),
            with_unused: List::new(unused_link),
            freelist: std::array::from_fn(|_| List::new(free_link)),
            subblocks_per_block: config.subblocks_per_block.max(1),
            size_allocated: 0,
        }
    }

    /// Size of one cache block in bytes.
    pub fn block_size(&self) -> usize {
        self.subblocks_per_block * SUBBLOCKSIZE
    }

    /// Number of mapped cache blocks.
    pub fn block_count(&self) -> usize {
        self.all.len()
    }

    /// Unmap every cache block.
    ///
    /// Live pages become dangling; this is reported but not an error.
    /// Keeps going after a failed unmap and returns the first error.
    pub fn free(&mut self) -> Result<()> {
        if self.size_allocated != 0 {
            tracing::warn!(
                size_allocated = self.size_allocated,
                "page cache freed with live pages"
            );
        }
        let mut err = None;
        for block in &mut self.blocks {
            crate::error::keep_first(&mut err, block.page.free());
        }
        self.blocks.clear();
        self.vacant.clear();
        self.by_base.clear();
        self.all.reset();
        self.with_unused.reset();
        for list in &mut self.freelist {
            list.reset();
        }
        self.size_allocated = 0;
        err.map_or(Ok(()), Err)
    }

    fn new_block(&mut self) -> Result<usize> {
        let size = self.block_size();
        let page = VmPage::new_aligned(size, SUBBLOCKSIZE)?;
        let base = page.addr() as usize;
        let block = CacheBlock {
            page,
            subblocks: (0..self.subblocks_per_block)
                .map(|_| SubBlock::UNUSED)
                .collect(),
            unused: self.subblocks_per_block,
            all_link: Link::new(),
            unused_link: Link::new(),
        };
        let id = match self.vacant.pop() {
            Some(id) => {
                self.blocks[id] = block;
                id
            }
            None => {
                self.blocks.push(block);
                self.blocks.len() - 1
            }
        };
        self.by_base.insert(base, id);
        self.all.push_back(&mut self.blocks, id);
        self.with_unused.push_back(&mut self.blocks, id);
        tracing::debug!(base = format_args!("{:#x}", base), size, "cache block mapped");
        Ok(id)
    }

    fn free_block(&mut self, id: usize) -> Result<()> {
        self.all.remove(&mut self.blocks, id);
        self.with_unused.remove(&mut self.blocks, id);
        let block = &mut self.blocks[id];
        let base = block.base();
        let size = block.page.size();
        self.by_base.remove(&base);
        block.subblocks = Box::default();
        block.unused = 0;
        self.vacant.push(id);
        block.page.free()?;
        tracing::debug!(base = format_args!("{:#x}", base), size, "cache block unmapped");
        Ok(())
    }

    /// Dedicate a never-used sub-block to `class` and list it as having free pages.
    fn claim_subblock(&mut self, class: PageSize) -> Result<SubBlockRef> {
        let id = match self.with_unused.last() {
            Some(id) => id,
            None => self.new_block()?,
        };
        let block = &mut self.blocks[id];
        let sub = block
            .subblocks
            .iter()
            .position(|sb| sb.class.is_none())
            .ok_or(Error::Invariant)?;
        let subblock = &mut block.subblocks[sub];
        *subblock = SubBlock::UNUSED;
        subblock.class = Some(class);
        block.unused -= 1;
        if block.unused == 0 {
            self.with_unused.remove(&mut self.blocks, id);
        }
        let r = SubBlockRef { block: id, sub };
        self.freelist[class.ordinal()].push_back(&mut self.blocks, r);
        Ok(r)
    }

    fn take_page(&mut self, r: SubBlockRef, class: PageSize) -> MemBlock {
        let block = &mut self.blocks[r.block];
        let subbase = block.base() + r.sub * SUBBLOCKSIZE;
        let subblock = &mut block.subblocks[r.sub];
        let addr = if subblock.free_head != 0 {
            let addr = subblock.free_head;
            // SAFETY: released pages of this sub-block hold the next link in their first word
            subblock.free_head = unsafe { (addr as *const usize).read() };
            addr
        } else {
            let addr = subbase + subblock.fresh * class.bytes();
            subblock.fresh += 1;
            addr
        };
        subblock.used += 1;
        if !subblock.has_free_page(class) {
            self.freelist[class.ordinal()].remove(&mut self.blocks, r);
        }
        MemBlock::new(addr as *mut u8, class.bytes())
    }

    fn locate(&self, addr: usize) -> Option<SubBlockRef> {
        let (&base, &id) = self.by_base.range(..=addr).next_back()?;
        let offset = addr - base;
        if offset >= self.blocks[id].page.size() {
            return None;
        }
        Some(SubBlockRef {
            block: id,
            sub: offset / SUBBLOCKSIZE,
        })
    }

    #[cfg(test)]
    fn check_invariants(&mut self) {
        let mut live = 0;
        for id in self.all.to_vec(&mut self.blocks) {
            let block = &self.blocks[id];
            let unused = block.subblocks.iter().filter(|sb| sb.class.is_none()).count();
            assert_eq!(unused, block.unused);
            assert_eq!(block.unused_link.is_linked(), unused != 0);
            for sb in block.subblocks.iter() {
                if let Some(class) = sb.class {
                    live += sb.used * class.bytes();
                    assert_eq!(sb.free_link.is_linked(), sb.has_free_page(class));
                    assert!(sb.used > 0 || sb.fresh == 0);
                }
            }
        }
        assert_eq!(live, self.size_allocated);
    }
}

impl PageCache for PageCacheImpl {
    fn alloc_page(&mut self, class: PageSize) -> Result<MemBlock> {
        let r = match self.freelist[class.ordinal()].last() {
            Some(r) => r,
            None => self.claim_subblock(class)?,
        };
        let page = self.take_page(r, class);
        self.size_allocated += class.bytes();
        Ok(page)
    }

    fn release_page(&mut self, page: &mut MemBlock) -> Result<()> {
        if page.is_free() {
            return Ok(());
        }
        let class = PageSize::from_bytes(page.size()).ok_or(Error::InvalidArgument)?;
        let addr = page.addr_usize();
        if addr % class.bytes() != 0 {
            return Err(Error::InvalidArgument);
        }
        let r = self.locate(addr).ok_or(Error::InvalidArgument)?;
        let subblock = &mut self.blocks[r.block].subblocks[r.sub];
        if subblock.class != Some(class) || subblock.used == 0 {
            return Err(Error::InvalidArgument);
        }

        let was_full = !subblock.has_free_page(class);
        // SAFETY: the page is a live page of this sub-block and at least a word long
        unsafe { (addr as *mut usize).write(subblock.free_head) };
        subblock.free_head = addr;
        subblock.used -= 1;

        let now_empty = subblock.used == 0;
        let freelist = &mut self.freelist[class.ordinal()];
        if now_empty {
            freelist.remove(&mut self.blocks, r);
            let block = &mut self.blocks[r.block];
            block.subblocks[r.sub] = SubBlock::UNUSED;
            block.unused += 1;
            self.with_unused.push_back(&mut self.blocks, r.block);
        } else if was_full {
            freelist.push_back(&mut self.blocks, r);
        }

        self.size_allocated -= class.bytes();
        page.clear();
        Ok(())
    }

    fn size_allocated(&self) -> usize {
        self.size_allocated
    }

    fn empty_cache(&mut self) -> Result<()> {
        let mut err = None;
        for id in self.all.to_vec(&mut self.blocks) {
            if self.blocks[id].is_idle() {
                crate::error::keep_first(&mut err, self.free_block(id));
            }
        }
        err.map_or(Ok(()), Err)
    }
}

impl fmt::Debug for PageCacheImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageCacheImpl")
            .field("blocks", &self.all.len())
            .field("subblocks_per_block", &self.subblocks_per_block)
            .field("size_allocated", &self.size_allocated)
            .finish()
    }
}
